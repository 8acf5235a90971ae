//! Time-to-live decorator for chunk factories

use super::{Chunk, ChunkFactory};
use crate::kv::ChunkMetadata;
use crate::{now_millis, AccessMode, ConnectionPath, Result, Timestamp};
use std::sync::Arc;
use tracing::debug;

/// Source of the current time, in the same unit as the TTL
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Wraps a factory so that expired chunks read as empty
///
/// Every write acquisition sets `birth:<caller>` on the path to the current
/// time, so a chunk lives for `ttl` after its most recent write. Read
/// acquisitions return `None` (after pruning any cached handle) unless at
/// least one birth stamp on the path is younger than `ttl`.
pub struct TtlChunkFactory<F> {
    inner: F,
    metadata: ChunkMetadata,
    ttl: i64,
    clock: Clock,
}

impl<F: ChunkFactory> TtlChunkFactory<F> {
    pub fn new(inner: F, metadata: ChunkMetadata, ttl: i64) -> Self {
        Self::with_clock(inner, metadata, ttl, Arc::new(now_millis))
    }

    pub fn with_clock(inner: F, metadata: ChunkMetadata, ttl: i64, clock: Clock) -> Self {
        Self {
            inner,
            metadata,
            ttl,
            clock,
        }
    }

    fn is_alive(&self, path: &ConnectionPath, now: Timestamp) -> Result<bool> {
        let births = self.metadata.births(path)?;
        Ok(births.iter().any(|&birth| now - birth <= self.ttl))
    }
}

impl<F: ChunkFactory> ChunkFactory for TtlChunkFactory<F> {
    fn get_chunk(
        &mut self,
        path: &ConnectionPath,
        mode: AccessMode,
        caller: &str,
    ) -> Result<Option<Arc<dyn Chunk>>> {
        let now = (self.clock)();
        match mode {
            AccessMode::Write => {
                let handle = self.inner.get_chunk(path, mode, caller)?;
                if handle.is_some() {
                    self.metadata.refresh_birth(path, caller, now)?;
                }
                Ok(handle)
            }
            AccessMode::Read => {
                if !self.is_alive(path, now)? {
                    debug!("Chunk {} expired, reading as empty", path);
                    self.inner.prune_chunk(path, mode)?;
                    return Ok(None);
                }
                self.inner.get_chunk(path, mode, caller)
            }
        }
    }

    fn prune_chunk(&mut self, path: &ConnectionPath, mode: AccessMode) -> Result<bool> {
        self.inner.prune_chunk(path, mode)
    }

    fn cached(&self) -> usize {
        self.inner.cached()
    }

    fn dispose(&mut self) -> Result<()> {
        self.inner.dispose()
    }
}
