//! GridScale orchestrator
//!
//! Owns the planner, the worker pool and the shared hash map behind the
//! displacement registry, chunk metadata and the query-result cache.
//!
//! - **store**: plan a batch, fan the per-worker allocations out in
//!   parallel, then record displacements and chunk metadata
//! - **iterator**: walk (time page, tag group) steps chosen by a step
//!   director, racing the page streams of every worker with a plan

mod diagnostics;
mod iterator;
mod query_cache;

pub use diagnostics::{Diagnostics, PhaseTiming, WorkerSummary};
pub use iterator::{default_step_director, GridIterator, Page, StepDirector, StepSpace};
pub use query_cache::{plan_signature, QueryCache};

use crate::bucketing::tag_hasher_by_name;
use crate::chunk::{
    CacheSettings, CachedChunkFactory, ChunkBackend, ChunkFactory, FileBackend, MemoryBackend,
    TtlChunkFactory,
};
use crate::kv::{
    ChunkMetadata, DisplacementRegistry, FileHashMap, MemoryHashMap, NonVolatileHashMap,
};
use crate::planner::{ChunkPlanner, PlannerSettings};
use crate::worker::{
    effective_worker_count, AggregatorRegistry, WorkerPool, WorkerRequest, WorkerResponse,
    WorkerRuntime, WorkerStats,
};
use crate::{now_millis, GridError, RecordBatch, Result, TagId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const LAYOUT_KEY: &str = "grid:layout";
const CARDINALITY_FIELD: &str = "cardinality";

/// Chunk storage back-end selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    File,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Tag bucket width in hashed-id space
    pub tag_bucket_width: u64,
    /// Time bucket width
    pub time_bucket_width: i64,
    /// Tolerance window in time buckets
    pub time_bucket_tolerance: i64,
    pub chunk_prefix: String,
    pub chunk_separator: String,
    /// Requested workers; capped by hardware parallelism
    pub worker_count: usize,
    /// Shard set root to its ordered disk names
    pub shard_sets: BTreeMap<String, Vec<String>>,
    /// Shard set new writes land on
    pub writer_active_shard: String,
    /// Chunk handles cached per worker
    pub cache_limit: usize,
    /// Handles evicted at most by one cache miss
    pub bulk_drop_limit: usize,
    /// Expire chunks whose newest birth stamp is older than this
    pub time_to_live_ms: Option<i64>,
    /// Default rows per iteration page
    pub page_size: usize,
    /// `multiplicative`, `numeric` or `lanes`
    pub tag_hasher: String,
    pub backend: BackendKind,
    /// Persist the registry, metadata and query cache to this file
    pub metadata_path: Option<PathBuf>,
    /// fsync block files after every bulk write and the metadata log after every mutation
    pub sync_writes: bool,
    /// Query results kept before the oldest are evicted
    pub query_cache_entries: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        let root = "data/gen-0".to_string();
        let mut shard_sets = BTreeMap::new();
        shard_sets.insert(root.clone(), vec!["disk-0".to_string(), "disk-1".to_string()]);
        Self {
            tag_bucket_width: crate::defaults::TAG_BUCKET_WIDTH,
            time_bucket_width: crate::defaults::TIME_BUCKET_WIDTH,
            time_bucket_tolerance: crate::defaults::TIME_BUCKET_TOLERANCE,
            chunk_prefix: crate::defaults::CHUNK_PREFIX.to_string(),
            chunk_separator: crate::defaults::CHUNK_SEPARATOR.to_string(),
            worker_count: crate::defaults::WORKER_COUNT,
            shard_sets,
            writer_active_shard: root,
            cache_limit: crate::defaults::CACHE_LIMIT,
            bulk_drop_limit: crate::defaults::BULK_DROP_LIMIT,
            time_to_live_ms: None,
            page_size: crate::defaults::PAGE_SIZE,
            tag_hasher: crate::defaults::TAG_HASHER.to_string(),
            backend: BackendKind::File,
            metadata_path: None,
            sync_writes: false,
            query_cache_entries: crate::defaults::QUERY_CACHE_ENTRIES,
        }
    }
}

impl GridConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: GridConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn planner_settings(&self) -> PlannerSettings {
        PlannerSettings {
            tag_bucket_width: self.tag_bucket_width as TagId,
            time_bucket_width: self.time_bucket_width,
            time_bucket_tolerance: self.time_bucket_tolerance,
            chunk_prefix: self.chunk_prefix.clone(),
            chunk_separator: self.chunk_separator.clone(),
            writer_shard_set: self.writer_active_shard.clone(),
            shard_sets: self.shard_sets.clone(),
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            cache_limit: self.cache_limit,
            bulk_drop_limit: self.bulk_drop_limit,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.planner_settings().validate()?;
        if self.worker_count == 0 {
            return Err(GridError::Config("worker_count must be positive".into()));
        }
        if self.cache_limit == 0 || self.bulk_drop_limit == 0 {
            return Err(GridError::Config(
                "cache_limit and bulk_drop_limit must be positive".into(),
            ));
        }
        if self.query_cache_entries == 0 {
            return Err(GridError::Config("query_cache_entries must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(GridError::Config("page_size must be positive".into()));
        }
        if matches!(self.time_to_live_ms, Some(ttl) if ttl <= 0) {
            return Err(GridError::Config("time_to_live_ms must be positive".into()));
        }
        if tag_hasher_by_name(&self.tag_hasher).is_none() {
            return Err(GridError::Config(format!("unknown tag hasher: {}", self.tag_hasher)));
        }
        Ok(())
    }
}

/// Outcome of one `store` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub rows: usize,
    pub chunks: usize,
    pub displacements: usize,
}

/// A read request over tags and a time range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterateRequest {
    pub tags: Vec<String>,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Identifies worker-side iteration state; generated when absent
    #[serde(default)]
    pub query_id: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Route plans by affinity instead of round-robin
    #[serde(default = "default_affinity_based")]
    pub affinity_based: bool,
    /// Registered worker aggregator to fold pages through
    #[serde(default)]
    pub aggregate: Option<String>,
}

fn default_affinity_based() -> bool {
    true
}

impl IterateRequest {
    pub fn new(tags: Vec<String>, start: Timestamp, end: Timestamp) -> Self {
        Self {
            tags,
            start,
            end,
            query_id: None,
            page_size: None,
            affinity_based: true,
            aggregate: None,
        }
    }
}

/// Shared by the orchestrator and its iterators
pub(crate) struct GridContext {
    pub(crate) planner: ChunkPlanner,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) metadata: ChunkMetadata,
    pub(crate) query_cache: QueryCache,
    pub(crate) cardinality: usize,
}

/// The orchestrator
pub struct GridScale {
    config: GridConfig,
    registry: DisplacementRegistry,
    context: Arc<GridContext>,
}

impl GridScale {
    /// Open with the back-end and hash map named by the configuration
    pub fn open(config: GridConfig) -> Result<Self> {
        config.validate()?;
        let map: Arc<dyn NonVolatileHashMap> = match &config.metadata_path {
            Some(path) => Arc::new(FileHashMap::open_with(
                path,
                config.sync_writes,
                crate::defaults::KV_COMPACT_AFTER,
            )?),
            None => Arc::new(MemoryHashMap::new()),
        };
        let backend: Arc<dyn ChunkBackend> = match config.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::File => Arc::new(FileBackend::new(config.sync_writes)?),
        };
        Self::open_with(config, map, backend)
    }

    /// Open over an explicit hash map and chunk back-end
    pub fn open_with(
        config: GridConfig,
        map: Arc<dyn NonVolatileHashMap>,
        backend: Arc<dyn ChunkBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let hasher = tag_hasher_by_name(&config.tag_hasher)
            .ok_or_else(|| {
                GridError::Config(format!("unknown tag hasher: {}", config.tag_hasher))
            })?;

        let registry = DisplacementRegistry::new(map.clone());
        let metadata = ChunkMetadata::new(map.clone());
        let query_cache = QueryCache::new(map.clone(), metadata.clone())
            .with_ttl(config.time_to_live_ms)
            .with_capacity(config.query_cache_entries);
        let planner =
            ChunkPlanner::new(config.planner_settings(), Arc::from(hasher), registry.clone())?;

        let cardinality = effective_worker_count(config.worker_count);
        Self::pin_cardinality(map.as_ref(), cardinality)?;

        let aggregators = AggregatorRegistry::default();
        let mut runtimes = Vec::with_capacity(cardinality);
        for index in 0..cardinality {
            let cached = CachedChunkFactory::new(backend.clone(), config.cache_settings())?;
            let factory: Box<dyn ChunkFactory> = match config.time_to_live_ms {
                Some(ttl) => Box::new(TtlChunkFactory::new(cached, metadata.clone(), ttl)),
                None => Box::new(cached),
            };
            runtimes.push(WorkerRuntime::new(index, factory, aggregators.clone()));
        }
        let pool = Arc::new(WorkerPool::start(runtimes)?);

        info!(
            "GridScale opened: {} workers, {} back-end, {} shard sets, writer {}",
            cardinality,
            backend.name(),
            config.shard_sets.len(),
            config.writer_active_shard
        );

        Ok(Self {
            config,
            registry,
            context: Arc::new(GridContext {
                planner,
                pool,
                metadata,
                query_cache,
                cardinality,
            }),
        })
    }

    /// Record the worker count the affinity layout was built with
    ///
    /// Reopening with a different count keeps working, since reads expand to
    /// every candidate path on whichever worker they land on, but chunk
    /// locality is lost for data written under the old count.
    fn pin_cardinality(map: &dyn NonVolatileHashMap, cardinality: usize) -> Result<()> {
        let value = cardinality.to_string();
        if !map.set_if_absent(LAYOUT_KEY, CARDINALITY_FIELD, &value)? {
            let stored = map.get_field_values(LAYOUT_KEY, &[CARDINALITY_FIELD.to_string()])?;
            if let Some(previous) = stored.get(CARDINALITY_FIELD).filter(|v| **v != value) {
                warn!(
                    "Worker cardinality changed from {} to {}, existing chunks lose affinity",
                    previous, cardinality
                );
                map.set(LAYOUT_KEY, &[(CARDINALITY_FIELD.to_string(), value)])?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn cardinality(&self) -> usize {
        self.context.cardinality
    }

    pub fn planner(&self) -> &ChunkPlanner {
        &self.context.planner
    }

    pub fn registry(&self) -> &DisplacementRegistry {
        &self.registry
    }

    pub fn metadata(&self) -> &ChunkMetadata {
        &self.context.metadata
    }

    /// Write a batch of samples stamped with `insert_time`
    pub async fn store(
        &self,
        records: &RecordBatch,
        insert_time: Timestamp,
        diagnostics: &mut Diagnostics,
    ) -> Result<StoreSummary> {
        let ctx = &self.context;

        let started = Instant::now();
        let plan = ctx.planner.plan_upserts(records, insert_time, ctx.cardinality)?;
        diagnostics.record_phase("plan", started.elapsed());

        let started = Instant::now();
        let mut writes = JoinSet::new();
        let mut touched = BTreeSet::new();
        for (worker, allocation) in plan.chunk_allocations.into_iter().enumerate() {
            if allocation.is_empty() {
                continue;
            }
            let tags: BTreeSet<&String> = allocation.values().flat_map(|t| t.keys()).collect();
            diagnostics.record_worker(WorkerSummary {
                worker,
                paths: allocation.len(),
                tags: tags.len(),
                rows: allocation.values().flat_map(|t| t.values()).map(Vec::len).sum(),
            });
            touched.extend(allocation.keys().cloned());

            let pool = Arc::clone(&ctx.pool);
            writes.spawn(async move {
                pool.invoke(worker, WorkerRequest::BulkWrite { allocation })
                    .await
            });
        }

        let mut summary = StoreSummary::default();
        while let Some(joined) = writes.join_next().await {
            let response = match joined {
                Ok(response) => response,
                Err(e) => Err(GridError::Internal(e.to_string())),
            };
            match response {
                Ok(WorkerResponse::Written { rows, chunks }) => {
                    summary.rows += rows;
                    summary.chunks += chunks;
                }
                Ok(other) => {
                    writes.abort_all();
                    return Err(GridError::Internal(format!(
                        "unexpected write response {:?}",
                        other
                    )));
                }
                Err(e) => {
                    writes.abort_all();
                    return Err(e);
                }
            }
        }
        diagnostics.record_phase("write", started.elapsed());

        let started = Instant::now();
        summary.displacements = self.registry.record(&plan.chunk_displacements)?;
        diagnostics.record_phase("displacement", started.elapsed());

        let started = Instant::now();
        let now = now_millis();
        for path in &touched {
            ctx.metadata.touch_write(path, now)?;
        }
        diagnostics.record_phase("metadata", started.elapsed());

        debug!(
            "Stored {} rows in {} chunks with {} displacements",
            summary.rows, summary.chunks, summary.displacements
        );
        Ok(summary)
    }

    /// Iterate with the default step director
    pub fn iterator(&self, request: IterateRequest) -> Result<GridIterator> {
        self.iterator_with(request, Box::new(default_step_director))
    }

    /// Iterate with a caller-supplied step director
    pub fn iterator_with(
        &self,
        request: IterateRequest,
        director: StepDirector,
    ) -> Result<GridIterator> {
        let page_size = request.page_size.unwrap_or(self.config.page_size);
        GridIterator::new(Arc::clone(&self.context), request, page_size, director)
    }

    /// Counters of every worker
    pub async fn stats(&self) -> Result<Vec<WorkerStats>> {
        let mut stats = Vec::with_capacity(self.context.cardinality);
        for index in 0..self.context.cardinality {
            match self.context.pool.invoke(index, WorkerRequest::Stats).await? {
                WorkerResponse::Stats(s) => stats.push(s),
                other => {
                    return Err(GridError::Internal(format!(
                        "unexpected stats response {:?}",
                        other
                    )));
                }
            }
        }
        Ok(stats)
    }

    /// Stop every worker, disposing its cached chunk handles
    pub async fn shutdown(&self) -> Result<()> {
        self.context.pool.shutdown().await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::{Row, Sample};
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn collect(iter: &mut GridIterator) -> Vec<Row> {
        let mut rows = Vec::new();
        while let Some(page) = iter.next().await.unwrap() {
            rows.extend(page.rows);
        }
        rows
    }

    #[test]
    fn test_config_validation() {
        assert!(GridConfig::default().validate().is_ok());

        let mut bad = GridConfig::default();
        bad.tag_hasher = "sha1".into();
        assert!(matches!(bad.validate(), Err(GridError::Config(_))));

        let mut bad = GridConfig::default();
        bad.time_to_live_ms = Some(0);
        assert!(bad.validate().is_err());

        let mut bad = GridConfig::default();
        bad.query_cache_entries = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("grid.json");
        std::fs::write(
            &path,
            r#"{
                "time_bucket_width": 60000,
                "backend": "memory",
                "shard_sets": {"s": ["a"]},
                "writer_active_shard": "s"
            }"#,
        )
        .unwrap();

        let config = GridConfig::from_file(&path).unwrap();
        assert_eq!(config.time_bucket_width, 60_000);
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.page_size, crate::defaults::PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_store_records_phases_and_metadata() {
        let grid = grid(2);
        let records: RecordBatch = HashMap::from([
            ("7".to_string(), vec![Sample::new(10, 1.0), Sample::new(20, 2.0)]),
            ("25".to_string(), vec![Sample::new(10, 3.0)]),
        ]);

        let mut diag = Diagnostics::new();
        let summary = grid.store(&records, 0, &mut diag).await.unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.displacements, 0);
        for phase in ["plan", "write", "displacement", "metadata"] {
            assert!(diag.phase(phase).is_some(), "missing phase {}", phase);
        }
        assert_eq!(diag.workers().iter().map(|w| w.rows).sum::<usize>(), 3);

        let home = grid.planner().connection_path(
            "gen-a",
            &grid.config().shard_sets["gen-a"],
            0,
            &grid.planner().chunk_id(0, 0),
        );
        assert!(grid.metadata().last_write(&home).unwrap().is_some());
        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_displaced_sample_is_found() {
        let grid = grid(2);
        let records: RecordBatch = HashMap::from([(
            "42".to_string(),
            vec![Sample::new(0, 1.0), Sample::new(WIDTH * 3, 2.0)],
        )]);
        let summary = grid.store(&records, 0, &mut Diagnostics::new()).await.unwrap();
        assert_eq!(summary.displacements, 1);

        let tag_bucket = grid.planner().tag_bucket("42");
        let record_chunk = grid.planner().chunk_id(tag_bucket, WIDTH * 3);
        assert_eq!(
            grid.registry().displaced(&record_chunk).unwrap(),
            vec![grid.planner().chunk_id(tag_bucket, 0)]
        );

        let mut iter = grid
            .iterator(IterateRequest::new(vec!["42".into()], WIDTH * 3, WIDTH * 4))
            .unwrap();
        let rows = collect(&mut iter).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample_time, WIDTH * 3);
        assert_eq!(rows[0].numeric, 2.0);
        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_write_wins_across_batches() {
        let grid = grid(2);
        let first: RecordBatch = HashMap::from([("3".to_string(), vec![Sample::new(500, 1.0)])]);
        let second: RecordBatch = HashMap::from([("3".to_string(), vec![Sample::new(500, 9.0)])]);
        grid.store(&first, 0, &mut Diagnostics::new()).await.unwrap();
        // later insert bucket, so the second copy lands in another chunk
        grid.store(&second, WIDTH, &mut Diagnostics::new()).await.unwrap();

        let mut iter = grid
            .iterator(IterateRequest::new(vec!["3".into()], 0, WIDTH))
            .unwrap();
        let rows = collect(&mut iter).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].numeric, 9.0);
        assert_eq!(rows[0].insert_time, WIDTH);
        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_range_is_rejected() {
        let grid = grid(1);
        let err = grid
            .iterator(IterateRequest::new(vec!["1".into()], 10, 10))
            .err()
            .unwrap();
        assert!(matches!(err, GridError::InvalidTimeRange { .. }));

        // too many time pages to plan
        let err = grid
            .iterator(IterateRequest::new(vec!["1".into()], 1, i64::MAX))
            .err()
            .unwrap();
        assert!(matches!(err, GridError::InvalidTimeRange { .. }));
        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_backed_grid_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("gen-0").to_string_lossy().to_string();
        let mut config = config(2);
        config.backend = BackendKind::File;
        config.shard_sets = BTreeMap::from([(root.clone(), vec!["d0".to_string()])]);
        config.writer_active_shard = root;
        config.metadata_path = Some(temp_dir.path().join("meta.gskv"));

        let records: RecordBatch = HashMap::from([(
            "5".to_string(),
            vec![Sample::new(1, 1.0), Sample::new(WIDTH * 5, 5.0)],
        )]);
        {
            let grid = GridScale::open(config.clone()).unwrap();
            grid.store(&records, 0, &mut Diagnostics::new()).await.unwrap();
            grid.shutdown().await.unwrap();
        }

        let grid = GridScale::open(config).unwrap();
        let mut iter = grid
            .iterator(IterateRequest::new(vec!["5".into()], WIDTH * 5, WIDTH * 6))
            .unwrap();
        let rows = collect(&mut iter).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].numeric, 5.0);
        grid.shutdown().await.unwrap();
    }
}
