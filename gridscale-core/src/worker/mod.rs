//! Worker runtime and execution fabric
//!
//! Each worker owns a chunk factory (handle cache) and the merge state of
//! the iterations it is serving. Workers run on dedicated threads behind a
//! `WorkerPool`; requests to one worker are processed strictly one at a
//! time, so the runtime itself needs no locking.
//!
//! Methods:
//! - `bulkWrite`: upsert a chunk allocation through write handles
//! - `bulkIterate`: pull the next page of a merged iteration step
//! - `clearIteration`: drop every merge state of a query
//! - `stats`: cache and iteration counters

mod aggregate;
mod pool;

pub use aggregate::{AggregatorRegistry, PageAggregator, TagSum};
pub use pool::{effective_worker_count, WorkerPool};

use crate::chunk::ChunkFactory;
use crate::merge::{MergeCursor, RowCursor};
use crate::{AccessMode, ChunkAllocation, GridError, IterationPlan, Result, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Position of an iteration step: `(time page, tag group)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub time_step: usize,
    pub tag_step: usize,
}

impl StepKey {
    pub fn new(time_step: usize, tag_step: usize) -> Self {
        Self { time_step, tag_step }
    }
}

/// Arguments of `bulkIterate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterateArgs {
    pub query_id: String,
    pub step: StepKey,
    pub plans: Vec<IterationPlan>,
    pub page_size: usize,
    /// Name of a registered aggregator to fold pages through
    #[serde(default)]
    pub aggregate: Option<String>,
}

/// Request understood by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum WorkerRequest {
    BulkWrite { allocation: ChunkAllocation },
    BulkIterate(IterateArgs),
    ClearIteration { query_id: String },
    Stats,
}

impl WorkerRequest {
    /// Wire names of every method
    pub const METHODS: [&'static str; 4] = ["bulkWrite", "bulkIterate", "clearIteration", "stats"];

    pub fn method(&self) -> &'static str {
        match self {
            WorkerRequest::BulkWrite { .. } => "bulkWrite",
            WorkerRequest::BulkIterate(_) => "bulkIterate",
            WorkerRequest::ClearIteration { .. } => "clearIteration",
            WorkerRequest::Stats => "stats",
        }
    }
}

/// One page of an iteration step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub rows: Vec<Row>,
    /// No further page will follow for this step
    pub done: bool,
}

/// Worker counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub index: usize,
    pub cached_handles: usize,
    pub open_iterations: usize,
    pub iterations_cleared: u64,
    pub rows_written: u64,
}

/// Reply to a `WorkerRequest`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum WorkerResponse {
    Written { rows: usize, chunks: usize },
    Page(PageResult),
    Cleared { released: usize },
    Stats(WorkerStats),
}

struct IterationState {
    merge: MergeCursor,
    aggregator: Option<Box<dyn PageAggregator>>,
}

/// State and request handling of one worker
pub struct WorkerRuntime {
    index: usize,
    signature: String,
    factory: Box<dyn ChunkFactory>,
    aggregators: AggregatorRegistry,
    iterations: HashMap<String, HashMap<StepKey, IterationState>>,
    iterations_cleared: u64,
    rows_written: u64,
}

impl WorkerRuntime {
    pub fn new(
        index: usize,
        factory: Box<dyn ChunkFactory>,
        aggregators: AggregatorRegistry,
    ) -> Self {
        Self {
            index,
            signature: format!("worker-{}", index),
            factory,
            aggregators,
            iterations: HashMap::new(),
            iterations_cleared: 0,
            rows_written: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Dispatch one request
    pub fn handle(&mut self, request: WorkerRequest) -> Result<WorkerResponse> {
        match request {
            WorkerRequest::BulkWrite { allocation } => self.bulk_write(&allocation),
            WorkerRequest::BulkIterate(args) => self.bulk_iterate(args).map(WorkerResponse::Page),
            WorkerRequest::ClearIteration { query_id } => Ok(WorkerResponse::Cleared {
                released: self.clear_iteration(&query_id),
            }),
            WorkerRequest::Stats => Ok(WorkerResponse::Stats(self.stats())),
        }
    }

    /// Upsert every chunk of an allocation
    pub fn bulk_write(&mut self, allocation: &ChunkAllocation) -> Result<WorkerResponse> {
        let mut rows = 0;
        let mut chunks = 0;
        for (path, tags) in allocation {
            let chunk = self.factory.get_chunk(path, AccessMode::Write, &self.signature)?;
            let Some(chunk) = chunk else {
                warn!("Worker {} got no write handle for {}", self.index, path);
                continue;
            };
            rows += chunk.bulk_set(tags)?;
            chunks += 1;
        }
        self.rows_written += rows as u64;
        debug!("Worker {} wrote {} rows to {} chunks", self.index, rows, chunks);
        Ok(WorkerResponse::Written { rows, chunks })
    }

    /// Next page of a step, opening its merge on the first call
    pub fn bulk_iterate(&mut self, args: IterateArgs) -> Result<PageResult> {
        let IterateArgs {
            query_id,
            step,
            plans,
            page_size,
            aggregate,
        } = args;
        let page_size = page_size.max(1);

        let exists = self
            .iterations
            .get(&query_id)
            .map_or(false, |steps| steps.contains_key(&step));
        if !exists {
            let aggregator = match aggregate.as_deref() {
                Some(name) => Some(self.aggregators.create(name)?),
                None => None,
            };
            let cursors = self.open_cursors(&plans)?;
            debug!(
                "Worker {} opened {} cursors for {} step ({}, {})",
                self.index,
                cursors.len(),
                query_id,
                step.time_step,
                step.tag_step
            );
            self.iterations.entry(query_id.clone()).or_default().insert(
                step,
                IterationState {
                    merge: MergeCursor::new(cursors),
                    aggregator,
                },
            );
        }

        let outcome = match self
            .iterations
            .get_mut(&query_id)
            .and_then(|steps| steps.get_mut(&step))
        {
            Some(state) => Self::pull(state, page_size),
            None => Err(GridError::Internal(format!("iteration state lost for {}", query_id))),
        };

        let finished = outcome.as_ref().map_or(true, |page| page.done);
        if finished {
            self.release_step(&query_id, &step);
        }
        outcome
    }

    fn pull(state: &mut IterationState, page_size: usize) -> Result<PageResult> {
        let Some(aggregator) = state.aggregator.as_mut() else {
            let rows = state.merge.next_page(page_size)?;
            let done = rows.len() < page_size;
            return Ok(PageResult { rows, done });
        };

        loop {
            let page = state.merge.next_page(page_size)?;
            if page.is_empty() {
                return Ok(PageResult {
                    rows: aggregator.finish().unwrap_or_default(),
                    done: true,
                });
            }
            if let Some(rows) = aggregator.fold(page) {
                return Ok(PageResult { rows, done: false });
            }
        }
    }

    /// Cursors for every candidate path that currently holds data
    fn open_cursors(&mut self, plans: &[IterationPlan]) -> Result<Vec<RowCursor>> {
        let mut cursors = Vec::new();
        for plan in plans {
            for path in &plan.paths {
                let chunk = match self.factory.get_chunk(path, AccessMode::Read, &self.signature) {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => continue,
                    Err(GridError::ChunkNotFound(_)) => {
                        debug!("Worker {} skipping missing chunk {}", self.index, path);
                        continue;
                    }
                    Err(e @ GridError::CacheFull { .. }) => return Err(e),
                    Err(e) => {
                        warn!("Worker {} could not open {}: {}", self.index, path, e);
                        continue;
                    }
                };
                match chunk.bulk_iterator(&plan.tags, plan.range) {
                    Ok(cursor) => cursors.push(cursor),
                    Err(e) => warn!("Worker {} could not read {}: {}", self.index, path, e),
                }
            }
        }
        Ok(cursors)
    }

    fn release_step(&mut self, query_id: &str, step: &StepKey) {
        if let Some(steps) = self.iterations.get_mut(query_id) {
            steps.remove(step);
            if steps.is_empty() {
                self.iterations.remove(query_id);
            }
        }
    }

    /// Drop every open step of a query; returns how many were open
    pub fn clear_iteration(&mut self, query_id: &str) -> usize {
        self.iterations_cleared += 1;
        self.iterations.remove(query_id).map_or(0, |steps| steps.len())
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            index: self.index,
            cached_handles: self.factory.cached(),
            open_iterations: self.iterations.values().map(|s| s.len()).sum(),
            iterations_cleared: self.iterations_cleared,
            rows_written: self.rows_written,
        }
    }

    /// Release merge state and every cached handle
    pub fn dispose(&mut self) -> Result<()> {
        self.iterations.clear();
        self.factory.dispose()?;
        info!("Worker {} disposed", self.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{CacheSettings, CachedChunkFactory, MemoryBackend};
    use crate::{ConnectionPath, Sample, TimeRange};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn runtime(backend: &MemoryBackend, limit: usize) -> WorkerRuntime {
        let factory = CachedChunkFactory::new(
            Arc::new(backend.clone()),
            CacheSettings {
                cache_limit: limit,
                bulk_drop_limit: 1,
            },
        )
        .unwrap();
        WorkerRuntime::new(0, Box::new(factory), AggregatorRegistry::default())
    }

    fn allocation(path: &str, tag: &str, samples: Vec<Sample>) -> ChunkAllocation {
        BTreeMap::from([(
            ConnectionPath::from(path),
            BTreeMap::from([(tag.to_string(), samples)]),
        )])
    }

    fn iterate(
        paths: &[&str],
        tags: &[&str],
        page_size: usize,
        aggregate: Option<&str>,
    ) -> IterateArgs {
        IterateArgs {
            query_id: "q1".into(),
            step: StepKey::new(0, 0),
            plans: vec![IterationPlan {
                paths: paths.iter().map(|p| ConnectionPath::from(*p)).collect(),
                tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
                range: TimeRange::new(0, 1_000),
            }],
            page_size,
            aggregate: aggregate.map(String::from),
        }
    }

    #[test]
    fn test_write_then_iterate_pages() {
        let backend = MemoryBackend::new();
        let mut worker = runtime(&backend, 8);
        let samples: Vec<Sample> = (0..5).map(|i| Sample::new(i, i as f64)).collect();
        let written = worker.bulk_write(&allocation("a", "t", samples)).unwrap();
        assert_eq!(written, WorkerResponse::Written { rows: 5, chunks: 1 });

        // "missing" never received data and contributes nothing
        let first = worker.bulk_iterate(iterate(&["a", "missing"], &["t"], 2, None)).unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(!first.done);
        assert_eq!(worker.stats().open_iterations, 1);

        let second = worker.bulk_iterate(iterate(&["a"], &["t"], 2, None)).unwrap();
        let third = worker.bulk_iterate(iterate(&["a"], &["t"], 2, None)).unwrap();
        assert_eq!(second.rows.len(), 2);
        assert_eq!(third.rows.len(), 1);
        assert!(third.done);
        assert_eq!(worker.stats().open_iterations, 0);
    }

    #[test]
    fn test_duplicates_across_paths_are_merged() {
        let backend = MemoryBackend::new();
        let mut worker = runtime(&backend, 8);
        worker
            .bulk_write(&allocation("a", "t", vec![Sample::new(1, 1.0).with_insert_time(1)]))
            .unwrap();
        worker
            .bulk_write(&allocation("b", "t", vec![Sample::new(1, 2.0).with_insert_time(2)]))
            .unwrap();

        let page = worker.bulk_iterate(iterate(&["a", "b"], &["t"], 10, None)).unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].numeric, 2.0);
    }

    #[test]
    fn test_aggregate_and_clear() {
        let backend = MemoryBackend::new();
        let mut worker = runtime(&backend, 8);
        worker
            .bulk_write(&allocation("a", "t", (0..4).map(|i| Sample::new(i, 1.5)).collect()))
            .unwrap();

        let page = worker
            .bulk_iterate(iterate(&["a"], &["t"], 1, Some(TagSum::NAME)))
            .unwrap();
        assert!(page.done);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].numeric, 6.0);

        worker.bulk_iterate(iterate(&["a"], &["t"], 1, None)).unwrap();
        assert_eq!(worker.clear_iteration("q1"), 1);
        assert_eq!(worker.clear_iteration("q1"), 0);
        assert_eq!(worker.stats().iterations_cleared, 2);
    }

    #[test]
    fn test_cache_full_propagates_on_read() {
        let backend = MemoryBackend::new();
        let mut worker = runtime(&backend, 1);
        worker
            .bulk_write(&allocation("a", "t", vec![Sample::new(1, 1.0)]))
            .unwrap();

        // the write handle is idle and gets evicted for the read handle
        let page = worker.bulk_iterate(iterate(&["a"], &["t"], 10, None)).unwrap();
        assert_eq!(page.rows.len(), 1);

        // an open step of q2 pins the only cache slot
        worker
            .bulk_write(&allocation("b", "t", (0..3).map(|i| Sample::new(i, 0.0)).collect()))
            .unwrap();
        let mut args = iterate(&["b"], &["t"], 1, None);
        args.query_id = "q2".into();
        worker.bulk_iterate(args).unwrap();

        let mut blocked = iterate(&["a"], &["t"], 1, None);
        blocked.query_id = "q3".into();
        assert!(matches!(
            worker.bulk_iterate(blocked),
            Err(GridError::CacheFull { .. })
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let request = WorkerRequest::ClearIteration {
            query_id: "q".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "clearIteration");
        assert_eq!(json["args"]["query_id"], "q");
        assert!(WorkerRequest::METHODS.contains(&request.method()));

        let stats: WorkerRequest =
            serde_json::from_value(serde_json::json!({"method": "stats"})).unwrap();
        assert_eq!(stats, WorkerRequest::Stats);
    }
}
