//! GridScale Core - Chunked, Horizontally Sharded Time-Series Store
//!
//! Samples keyed by a tag and a sample time are bucketed into logical chunks
//! and placed across shard sets of independent disks. This crate holds the
//! layer that turns reads and writes over tags and time ranges into parallel
//! work against many physical chunks:
//!
//! # Architecture
//!
//! - **Planner**: bucketing, displacement detection for late and early
//!   writes, affinity distribution and range decomposition
//! - **Chunk cache**: bounded per-worker handle cache with bulk eviction and
//!   an optional time-to-live decorator
//! - **Merge**: k-way merge of sorted cursors with last-write-wins
//!   de-duplication
//! - **Workers**: long-lived threads each owning a handle cache and the merge
//!   state of the iterations they serve
//! - **Grid**: the orchestrator driving store and iterate across the worker
//!   pool, including per-plan query-result caching

pub mod bucketing;
pub mod chunk;
pub mod grid;
pub mod kv;
pub mod merge;
pub mod planner;
pub mod worker;

mod error;
mod types;

pub use error::{GridError, Result};
pub use types::*;

/// GridScale version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Width of a tag bucket in hashed-id space (2^48)
    pub const TAG_BUCKET_WIDTH: u64 = 1 << 48;

    /// Width of a time bucket (one day in milliseconds)
    pub const TIME_BUCKET_WIDTH: i64 = 24 * 60 * 60 * 1000;

    /// Time buckets either side of the insert bucket that need no displacement entry
    pub const TIME_BUCKET_TOLERANCE: i64 = 1;

    pub const CHUNK_PREFIX: &str = "D";

    pub const CHUNK_SEPARATOR: &str = "-";

    /// Requested worker threads, capped by hardware parallelism
    pub const WORKER_COUNT: usize = 4;

    /// Chunk handles cached per worker
    pub const CACHE_LIMIT: usize = 256;

    /// Handles evicted at most by one cache miss
    pub const BULK_DROP_LIMIT: usize = 16;

    /// Rows per iteration page
    pub const PAGE_SIZE: usize = 1000;

    pub const TAG_HASHER: &str = "multiplicative";

    /// Time pages one query may span
    pub const MAX_TIME_PAGES: usize = 100_000;

    /// Query results kept by the query cache
    pub const QUERY_CACHE_ENTRIES: usize = 1024;

    /// Hash map log records written before the snapshot is rewritten
    pub const KV_COMPACT_AFTER: usize = 4096;
}
