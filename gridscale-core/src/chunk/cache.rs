//! Bounded chunk handle cache
//!
//! Handles are keyed by `(path, mode)`, so a worker never holds two handles
//! for the same pair. When a miss finds the cache full, up to
//! `bulk_drop_limit` disposable handles are evicted, least recently used
//! first. If none are disposable the miss fails with `CacheFull`, which the
//! caller treats as backpressure.

use super::{Chunk, ChunkBackend, ChunkFactory};
use crate::{AccessMode, ConnectionPath, GridError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cache sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum number of cached handles
    pub cache_limit: usize,
    /// Maximum number of handles evicted by one miss
    pub bulk_drop_limit: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_limit: crate::defaults::CACHE_LIMIT,
            bulk_drop_limit: crate::defaults::BULK_DROP_LIMIT,
        }
    }
}

struct CacheEntry {
    handle: Arc<dyn Chunk>,
    /// Generation of the last access; lower is older
    generation: u64,
}

/// Chunk factory caching handles opened through a back-end
pub struct CachedChunkFactory {
    backend: Arc<dyn ChunkBackend>,
    settings: CacheSettings,
    entries: HashMap<(ConnectionPath, AccessMode), CacheEntry>,
    generation: u64,
}

impl CachedChunkFactory {
    pub fn new(backend: Arc<dyn ChunkBackend>, settings: CacheSettings) -> Result<Self> {
        if settings.cache_limit == 0 {
            return Err(GridError::Config("cache_limit must be positive".into()));
        }
        if settings.bulk_drop_limit == 0 {
            return Err(GridError::Config("bulk_drop_limit must be positive".into()));
        }
        Ok(Self {
            backend,
            settings,
            entries: HashMap::new(),
            generation: 0,
        })
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Evict up to the bulk drop limit of disposable handles, oldest first
    fn evict(&mut self) -> usize {
        let budget = self
            .settings
            .bulk_drop_limit
            .min(self.entries.len())
            .min(self.settings.cache_limit);

        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.handle.can_be_disposed())
            .map(|(key, entry)| (entry.generation, key.clone()))
            .collect();
        candidates.sort_by_key(|(generation, _)| *generation);

        let mut evicted = 0;
        for (_, key) in candidates.into_iter().take(budget) {
            if let Some(entry) = self.entries.remove(&key) {
                if let Err(e) = entry.handle.dispose() {
                    warn!("Failed to dispose evicted chunk {} ({}): {}", key.0, key.1, e);
                }
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!("Evicted {} chunk handles, {} remain", evicted, self.entries.len());
        }
        evicted
    }
}

impl ChunkFactory for CachedChunkFactory {
    fn get_chunk(
        &mut self,
        path: &ConnectionPath,
        mode: AccessMode,
        _caller: &str,
    ) -> Result<Option<Arc<dyn Chunk>>> {
        let key = (path.clone(), mode);
        let generation = self.next_generation();

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.generation = generation;
            return Ok(Some(Arc::clone(&entry.handle)));
        }

        if self.entries.len() >= self.settings.cache_limit && self.evict() == 0 {
            warn!("Chunk cache full ({} handles busy), refusing {}", self.entries.len(), path);
            return Err(GridError::CacheFull {
                cached: self.entries.len(),
                limit: self.settings.cache_limit,
            });
        }

        let handle = self.backend.open(path, mode)?;
        self.entries.insert(
            key,
            CacheEntry {
                handle: Arc::clone(&handle),
                generation,
            },
        );
        Ok(Some(handle))
    }

    fn prune_chunk(&mut self, path: &ConnectionPath, mode: AccessMode) -> Result<bool> {
        let key = (path.clone(), mode);
        let disposable = match self.entries.get(&key) {
            Some(entry) => entry.handle.can_be_disposed(),
            None => return Ok(false),
        };
        if !disposable {
            return Ok(false);
        }

        if let Some(entry) = self.entries.remove(&key) {
            entry.handle.dispose()?;
        }
        Ok(true)
    }

    fn cached(&self) -> usize {
        self.entries.len()
    }

    fn dispose(&mut self) -> Result<()> {
        let count = self.entries.len();
        let mut failures = 0;
        for ((path, mode), entry) in self.entries.drain() {
            if let Err(e) = entry.handle.dispose() {
                warn!("Failed to dispose chunk {} ({}): {}", path, mode, e);
                failures += 1;
            }
        }
        info!(
            "Disposed {} chunk handles from {} cache ({} failures)",
            count,
            self.backend.name(),
            failures
        );
        Ok(())
    }
}
