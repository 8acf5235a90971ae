//! Physical chunks and the handle cache
//!
//! A chunk is the storage unit behind one connection path. Back-ends open
//! chunk handles; factories own and cache them per worker:
//!
//! - **Chunk**: bulk upsert and sorted range cursors over one path
//! - **ChunkBackend**: opens handles (in-memory skip lists or block files)
//! - **CachedChunkFactory**: bounded `(path, mode)` cache with bulk eviction
//! - **TtlChunkFactory**: decorator adding birth stamps and expiry on read

mod block;
mod cache;
mod file;
mod memory;
mod ttl;

pub use block::{decode_blocks, encode_block, BlockScan};
pub use cache::{CacheSettings, CachedChunkFactory};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use ttl::TtlChunkFactory;

use crate::merge::RowCursor;
use crate::{AccessMode, ConnectionPath, Result, Row, Sample, TimeRange};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Open handle on one physical chunk
pub trait Chunk: Send + Sync {
    /// Upsert rows grouped by tag; last write wins per `(tag, sample_time)`
    fn bulk_set(&self, rows: &BTreeMap<String, Vec<Sample>>) -> Result<usize>;

    /// Cursor over `tags` within `range`, ordered by `(tag, sample_time)`
    fn bulk_iterator(&self, tags: &BTreeSet<String>, range: TimeRange) -> Result<RowCursor>;

    /// True when no write is in flight and no cursor is open
    fn can_be_disposed(&self) -> bool;

    /// Release backing resources
    fn dispose(&self) -> Result<()>;
}

/// Opens chunk handles for a storage back-end
pub trait ChunkBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open or create the chunk at `path`
    ///
    /// Opening a missing chunk for reading fails with `ChunkNotFound`.
    fn open(&self, path: &ConnectionPath, mode: AccessMode) -> Result<Arc<dyn Chunk>>;
}

/// Owns chunk handles on behalf of one worker
pub trait ChunkFactory: Send {
    /// Cached or freshly opened handle; `None` when the chunk holds no live data
    fn get_chunk(
        &mut self,
        path: &ConnectionPath,
        mode: AccessMode,
        caller: &str,
    ) -> Result<Option<Arc<dyn Chunk>>>;

    /// Drop one cached handle if it is disposable
    fn prune_chunk(&mut self, path: &ConnectionPath, mode: AccessMode) -> Result<bool>;

    /// Number of cached handles
    fn cached(&self) -> usize;

    /// Dispose every cached handle and clear the cache
    fn dispose(&mut self) -> Result<()>;
}

/// In-flight bookkeeping shared by a handle and its cursors
#[derive(Debug, Default)]
pub(crate) struct HandleState {
    open_cursors: Arc<AtomicUsize>,
    writing: AtomicBool,
}

impl HandleState {
    pub(crate) fn is_idle(&self) -> bool {
        self.open_cursors.load(Ordering::Acquire) == 0 && !self.writing.load(Ordering::Acquire)
    }

    /// Mark a write in flight until the guard drops
    pub(crate) fn begin_write(&self) -> WriteGuard<'_> {
        self.writing.store(true, Ordering::Release);
        WriteGuard { state: self }
    }

    /// Wrap rows in a cursor that holds the handle busy until dropped
    pub(crate) fn cursor<I>(&self, rows: I) -> RowCursor
    where
        I: Iterator<Item = Result<Row>> + Send + 'static,
    {
        self.open_cursors.fetch_add(1, Ordering::AcqRel);
        Box::new(GuardedCursor {
            inner: rows,
            open_cursors: Arc::clone(&self.open_cursors),
        })
    }
}

pub(crate) struct WriteGuard<'a> {
    state: &'a HandleState,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.state.writing.store(false, Ordering::Release);
    }
}

struct GuardedCursor<I> {
    inner: I,
    open_cursors: Arc<AtomicUsize>,
}

impl<I: Iterator<Item = Result<Row>>> Iterator for GuardedCursor<I> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl<I> Drop for GuardedCursor<I> {
    fn drop(&mut self) {
        self.open_cursors.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keep the most recently inserted copy of each `(tag, sample_time)`
pub(crate) fn upsert_latest(rows: &mut BTreeMap<(String, i64), Row>, row: Row) {
    let key = (row.tag.clone(), row.sample_time);
    match rows.get(&key) {
        Some(existing) if existing.insert_time > row.insert_time => {}
        _ => {
            rows.insert(key, row);
        }
    }
}
