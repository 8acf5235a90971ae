//! Core types for GridScale

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// Sample and insert times, in caller-defined units (milliseconds by convention)
pub type Timestamp = i64;

/// Numeric identity of a tag after hashing, used only for bucketing
pub type TagId = u128;

/// Samples to write, grouped by tag name
pub type RecordBatch = HashMap<String, Vec<Sample>>;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// A single observation for one tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Logical time of the observation
    pub sample_time: Timestamp,
    /// Wall-clock time of the write, stamped by the planner
    #[serde(default)]
    pub insert_time: Timestamp,
    /// Numeric value
    pub numeric: f64,
    /// Free-form value carried alongside the number
    pub other: Option<String>,
}

impl Sample {
    /// Create a sample with a numeric value only
    pub fn new(sample_time: Timestamp, numeric: f64) -> Self {
        Self {
            sample_time,
            insert_time: 0,
            numeric,
            other: None,
        }
    }

    /// Attach a textual value
    pub fn with_other(mut self, other: impl Into<String>) -> Self {
        self.other = Some(other.into());
        self
    }

    /// Override the insert time
    pub fn with_insert_time(mut self, insert_time: Timestamp) -> Self {
        self.insert_time = insert_time;
        self
    }
}

/// A stored row as produced by chunk cursors
///
/// Cursors yield rows ordered by `(tag, sample_time)`; `insert_time` only
/// breaks ties between physical copies of the same sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub sample_time: Timestamp,
    pub insert_time: Timestamp,
    pub numeric: f64,
    pub other: Option<String>,
    pub tag: String,
}

impl Row {
    /// Build a row from a sample written under `tag`
    pub fn from_sample(tag: impl Into<String>, sample: &Sample) -> Self {
        Self {
            sample_time: sample.sample_time,
            insert_time: sample.insert_time,
            numeric: sample.numeric,
            other: sample.other.clone(),
            tag: tag.into(),
        }
    }

    /// Ordering key used by cursors and the merge engine
    pub fn key(&self) -> (&str, Timestamp) {
        (self.tag.as_str(), self.sample_time)
    }

    /// Compare two rows by `(tag, sample_time)`
    pub fn cmp_key(&self, other: &Row) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check if the range holds no timestamps
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Width of the range
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}

/// Access mode a chunk handle is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("read"),
            AccessMode::Write => f.write_str("write"),
        }
    }
}

/// Physical location of a chunk: `shard_set_root/disk/logical_chunk_id`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionPath(String);

impl ConnectionPath {
    /// Compose a path from its three components
    pub fn new(shard_set_root: &str, disk: &str, chunk_id: &str) -> Self {
        let path: PathBuf = [shard_set_root, disk, chunk_id].iter().collect();
        Self(path.to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl From<&str> for ConnectionPath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionPath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ConnectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rows destined for one worker, grouped by chunk path then tag
pub type ChunkAllocation = BTreeMap<ConnectionPath, BTreeMap<String, Vec<Sample>>>;

/// Where samples whose own time bucket fell outside tolerance actually landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Displacement {
    /// Insert-time bucket of the chunks the data was written to
    pub insert_time_bucket: Timestamp,
    /// Logical chunk ids (by insert time) holding the displaced rows
    pub targets: BTreeSet<String>,
}

/// Output of `ChunkPlanner::plan_upserts`
#[derive(Debug, Clone, Default)]
pub struct DistributedUpsertPlan {
    /// One allocation per worker slot
    pub chunk_allocations: Vec<ChunkAllocation>,
    /// Record-time chunk id to the insert-time chunks holding its rows
    pub chunk_displacements: BTreeMap<String, Displacement>,
}

impl DistributedUpsertPlan {
    /// Total number of rows across every worker slot
    pub fn row_count(&self) -> usize {
        self.chunk_allocations
            .iter()
            .flat_map(|a| a.values())
            .flat_map(|tags| tags.values())
            .map(|rows| rows.len())
            .sum()
    }
}

/// One unit of read work: every candidate path for a set of tags over a range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationPlan {
    pub paths: BTreeSet<ConnectionPath>,
    pub tags: BTreeSet<String>,
    pub range: TimeRange,
}

/// Output of `ChunkPlanner::plan_range`: one list of plans per worker slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributedIterationPlan {
    pub slots: Vec<Vec<IterationPlan>>,
}

impl DistributedIterationPlan {
    /// Worker slots that have at least one plan
    pub fn active_slots(&self) -> impl Iterator<Item = (usize, &Vec<IterationPlan>)> {
        self.slots.iter().enumerate().filter(|(_, plans)| !plans.is_empty())
    }
}
