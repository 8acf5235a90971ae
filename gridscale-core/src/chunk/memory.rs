//! In-memory chunk back-end
//!
//! Every connection path maps to one skip list keyed by `(tag, sample_time)`.
//! The directory of skip lists is shared by every clone of the back-end, so
//! workers holding clones see each other's writes.

use super::{Chunk, ChunkBackend, HandleState};
use crate::merge::RowCursor;
use crate::{AccessMode, ConnectionPath, GridError, Result, Row, Sample, TimeRange};
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

type Table = SkipMap<(String, i64), Row>;

/// Shared in-memory store of chunk tables
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<RwLock<HashMap<ConnectionPath, Arc<Table>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunk tables created so far
    pub fn chunk_count(&self) -> usize {
        self.tables.read().len()
    }
}

impl ChunkBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, path: &ConnectionPath, mode: AccessMode) -> Result<Arc<dyn Chunk>> {
        let table = match mode {
            AccessMode::Read => self
                .tables
                .read()
                .get(path)
                .cloned()
                .ok_or_else(|| GridError::ChunkNotFound(path.to_string()))?,
            AccessMode::Write => self.tables.write().entry(path.clone()).or_default().clone(),
        };

        Ok(Arc::new(MemoryChunk {
            path: path.clone(),
            mode,
            table,
            state: HandleState::default(),
        }))
    }
}

struct MemoryChunk {
    path: ConnectionPath,
    mode: AccessMode,
    table: Arc<Table>,
    state: HandleState,
}

impl Chunk for MemoryChunk {
    fn bulk_set(&self, rows: &BTreeMap<String, Vec<Sample>>) -> Result<usize> {
        if self.mode == AccessMode::Read {
            return Err(GridError::ReadOnlyChunk(self.path.to_string()));
        }
        let _write = self.state.begin_write();

        let mut written = 0;
        for (tag, samples) in rows {
            for sample in samples {
                let key = (tag.clone(), sample.sample_time);
                let newer = self
                    .table
                    .get(&key)
                    .map_or(true, |e| e.value().insert_time <= sample.insert_time);
                if newer {
                    self.table.insert(key, Row::from_sample(tag.as_str(), sample));
                }
                written += 1;
            }
        }
        Ok(written)
    }

    fn bulk_iterator(&self, tags: &BTreeSet<String>, range: TimeRange) -> Result<RowCursor> {
        let mut rows = Vec::new();
        if !range.is_empty() {
            for tag in tags {
                let lower = (tag.clone(), range.start);
                let upper = (tag.clone(), range.end);
                rows.extend(self.table.range(lower..upper).map(|e| e.value().clone()));
            }
        }
        Ok(self.state.cursor(rows.into_iter().map(Ok)))
    }

    fn can_be_disposed(&self) -> bool {
        self.state.is_idle()
    }

    fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(tag: &str, samples: Vec<Sample>) -> BTreeMap<String, Vec<Sample>> {
        BTreeMap::from([(tag.to_string(), samples)])
    }

    #[test]
    fn test_read_missing_chunk() {
        let backend = MemoryBackend::new();
        let path = ConnectionPath::from("a/b/c");
        assert!(matches!(
            backend.open(&path, AccessMode::Read),
            Err(GridError::ChunkNotFound(_))
        ));
    }

    #[test]
    fn test_write_then_read_sorted() {
        let backend = MemoryBackend::new();
        let path = ConnectionPath::from("a/b/c");
        let writer = backend.open(&path, AccessMode::Write).unwrap();
        writer
            .bulk_set(&rows("t2", vec![Sample::new(5, 5.0), Sample::new(1, 1.0)]))
            .unwrap();
        writer.bulk_set(&rows("t1", vec![Sample::new(9, 9.0)])).unwrap();

        let reader = backend.open(&path, AccessMode::Read).unwrap();
        let tags = BTreeSet::from(["t1".to_string(), "t2".to_string()]);
        let found: Vec<Row> = reader
            .bulk_iterator(&tags, TimeRange::new(0, 9))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let keys: Vec<_> = found.iter().map(|r| (r.tag.as_str(), r.sample_time)).collect();
        // t1@9 falls outside the exclusive end
        assert_eq!(keys, vec![("t2", 1), ("t2", 5)]);
    }

    #[test]
    fn test_last_write_wins_and_read_only() {
        let backend = MemoryBackend::new();
        let path = ConnectionPath::from("p");
        let writer = backend.open(&path, AccessMode::Write).unwrap();
        writer
            .bulk_set(&rows("t", vec![Sample::new(1, 2.0).with_insert_time(20)]))
            .unwrap();
        writer
            .bulk_set(&rows("t", vec![Sample::new(1, 1.0).with_insert_time(10)]))
            .unwrap();

        let reader = backend.open(&path, AccessMode::Read).unwrap();
        assert!(matches!(
            reader.bulk_set(&rows("t", vec![Sample::new(2, 0.0)])),
            Err(GridError::ReadOnlyChunk(_))
        ));

        let cursor = reader
            .bulk_iterator(&BTreeSet::from(["t".to_string()]), TimeRange::new(0, 10))
            .unwrap();
        assert!(!reader.can_be_disposed());
        let found: Vec<Row> = cursor.collect::<Result<_>>().unwrap();
        assert!(reader.can_be_disposed());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].numeric, 2.0);
    }
}
