//! Chunk planner
//!
//! Turns writes and reads expressed over tags and time into per-worker work
//! against physical chunk paths:
//!
//! - **plan_upserts**: every row goes to the chunk of its tag's insert-time
//!   bucket; rows whose own time bucket falls outside the tolerance window
//!   are linked through the displacement registry
//! - **decompose_by_time_pages / decompose_by_tag_pages**: split a request
//!   into bucket-aligned time pages and tag-bucket groups
//! - **plan_range**: expand one page/group pair into every path that may hold
//!   matching rows and assign it to a worker slot

mod range;
mod upsert;

use crate::bucketing::{bucket_tag, logical_chunk_id, TagHasher};
use crate::kv::DisplacementRegistry;
use crate::{ConnectionPath, GridError, Result, TagId, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// Static layout knobs the planner works from
#[derive(Debug, Clone)]
pub struct PlannerSettings {
    /// Width of a tag bucket in hashed-id space
    pub tag_bucket_width: TagId,
    /// Width of a time bucket
    pub time_bucket_width: i64,
    /// Tolerance window, in time buckets either side of the insert bucket
    pub time_bucket_tolerance: i64,
    /// Leading component of every logical chunk id
    pub chunk_prefix: String,
    /// Separator between chunk id components
    pub chunk_separator: String,
    /// Shard set new writes land on
    pub writer_shard_set: String,
    /// Shard set root to its ordered disks
    pub shard_sets: BTreeMap<String, Vec<String>>,
}

impl PlannerSettings {
    /// Reject layouts the planner cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.tag_bucket_width == 0 {
            return Err(GridError::Config("tag_bucket_width must be positive".into()));
        }
        if self.time_bucket_width <= 0 {
            return Err(GridError::Config("time_bucket_width must be positive".into()));
        }
        if self.time_bucket_tolerance < 0 {
            return Err(GridError::Config("time_bucket_tolerance must not be negative".into()));
        }
        if self.shard_sets.values().any(|disks| disks.is_empty()) {
            return Err(GridError::Config("every shard set needs at least one disk".into()));
        }
        if !self.shard_sets.contains_key(&self.writer_shard_set) {
            return Err(GridError::Config(format!(
                "writer shard set {} is not configured",
                self.writer_shard_set
            )));
        }
        Ok(())
    }
}

/// Tags sharing one tag bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagGroup {
    pub tag_bucket: TagId,
    pub tags: BTreeSet<String>,
}

/// Plans writes and reads against the chunk grid
pub struct ChunkPlanner {
    settings: PlannerSettings,
    hasher: Arc<dyn TagHasher>,
    registry: DisplacementRegistry,
    round_robin: AtomicUsize,
}

impl ChunkPlanner {
    /// Create a planner over a validated layout
    pub fn new(
        settings: PlannerSettings,
        hasher: Arc<dyn TagHasher>,
        registry: DisplacementRegistry,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            hasher,
            registry,
            round_robin: AtomicUsize::new(0),
        })
    }

    /// Hashed and bucketed id of a tag
    pub fn tag_bucket(&self, tag: &str) -> TagId {
        bucket_tag(self.hasher.hash_tag(tag), self.settings.tag_bucket_width)
    }

    /// Logical chunk id for a tag bucket and a time bucket
    pub fn chunk_id(&self, tag_bucket: TagId, time_bucket: Timestamp) -> String {
        logical_chunk_id(
            &[tag_bucket.to_string(), time_bucket.to_string()],
            &self.settings.chunk_prefix,
            &self.settings.chunk_separator,
        )
    }

    /// Disk a tag bucket maps to within an ordered disk list
    fn disk_for<'a>(disks: &'a [String], tag_bucket: TagId) -> &'a str {
        &disks[(tag_bucket % disks.len() as TagId) as usize]
    }

    /// Physical path of a chunk on one shard set
    pub fn connection_path(
        &self,
        shard_set: &str,
        disks: &[String],
        tag_bucket: TagId,
        chunk_id: &str,
    ) -> ConnectionPath {
        ConnectionPath::new(shard_set, Self::disk_for(disks, tag_bucket), chunk_id)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::bucketing::NumericTagHasher;
    use crate::kv::MemoryHashMap;

    pub const WIDTH: i64 = 1000;

    pub fn settings() -> PlannerSettings {
        let mut shard_sets = BTreeMap::new();
        shard_sets.insert("gen-a".to_string(), vec!["d0".to_string(), "d1".to_string()]);
        shard_sets.insert("gen-b".to_string(), vec!["d0".to_string()]);
        PlannerSettings {
            tag_bucket_width: 10,
            time_bucket_width: WIDTH,
            time_bucket_tolerance: 1,
            chunk_prefix: "D".to_string(),
            chunk_separator: "-".to_string(),
            writer_shard_set: "gen-a".to_string(),
            shard_sets,
        }
    }

    pub fn planner() -> ChunkPlanner {
        let registry = DisplacementRegistry::new(Arc::new(MemoryHashMap::new()));
        ChunkPlanner::new(settings(), Arc::new(NumericTagHasher), registry).unwrap()
    }

    pub fn planner_with(registry: DisplacementRegistry) -> ChunkPlanner {
        ChunkPlanner::new(settings(), Arc::new(NumericTagHasher), registry).unwrap()
    }
}
