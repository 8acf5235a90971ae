//! Paged iteration across the worker pool
//!
//! A request is split into time pages and tag groups. A step director picks
//! which `(time page, tag group)` pair to visit next; each visited step is
//! planned, and every worker slot with plans streams pages back through
//! repeated `bulkIterate` calls. Pending calls are raced: whichever worker
//! answers first has its page yielded and is immediately asked for the next
//! one. Pages of one worker keep their order, pages of different workers
//! interleave freely.
//!
//! Once an iterator is exhausted, fails, is closed or is dropped, every
//! worker that received a plan is sent `clearIteration`, once every call still
//! in flight has settled.

use super::query_cache::plan_signature;
use super::{GridContext, IterateRequest};
use crate::planner::TagGroup;
use crate::worker::{IterateArgs, PageResult, StepKey, WorkerPool, WorkerRequest, WorkerResponse};
use crate::{now_millis, GridError, IterationPlan, Result, Row, TimeRange, Timestamp};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Everything a step director can choose from
#[derive(Debug, Clone)]
pub struct StepSpace {
    pub pages: Vec<TimeRange>,
    pub groups: Vec<TagGroup>,
}

/// Picks the step after `previous`; `None` ends the iteration
pub type StepDirector = Box<dyn FnMut(&StepSpace, Option<StepKey>) -> Option<StepKey> + Send>;

/// Every time page of tag group 0, then every time page of group 1, ...
pub fn default_step_director(space: &StepSpace, previous: Option<StepKey>) -> Option<StepKey> {
    if space.pages.is_empty() || space.groups.is_empty() {
        return None;
    }
    match previous {
        None => Some(StepKey::new(0, 0)),
        Some(p) if p.time_step + 1 < space.pages.len() => {
            Some(StepKey::new(p.time_step + 1, p.tag_step))
        }
        Some(p) if p.tag_step + 1 < space.groups.len() => Some(StepKey::new(0, p.tag_step + 1)),
        Some(_) => None,
    }
}

/// Rows produced by one worker for one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub time_step: usize,
    pub tag_step: usize,
    pub worker: usize,
    pub rows: Vec<Row>,
    /// Replayed from the query-result cache
    pub cached: bool,
}

type Race = JoinSet<(usize, Result<WorkerResponse>)>;

/// Pages collected from one worker, stored once its stream completes
struct PendingPlan {
    signature: String,
    pages: Vec<Vec<Row>>,
}

struct StepRun {
    key: StepKey,
    started_at: Timestamp,
    race: Race,
    replay: VecDeque<Page>,
    pending: HashMap<usize, PendingPlan>,
}

/// Async page stream over a read request
pub struct GridIterator {
    ctx: Arc<GridContext>,
    query_id: String,
    page_size: usize,
    affinity_based: bool,
    aggregate: Option<String>,
    space: StepSpace,
    director: StepDirector,
    previous: Option<StepKey>,
    step: Option<StepRun>,
    /// Workers that received a plan and may hold iteration state
    touched: BTreeSet<usize>,
    finished: bool,
}

fn iterate_request(
    query_id: &str,
    step: StepKey,
    plans: Vec<IterationPlan>,
    page_size: usize,
    aggregate: &Option<String>,
) -> WorkerRequest {
    WorkerRequest::BulkIterate(IterateArgs {
        query_id: query_id.to_string(),
        step,
        plans,
        page_size,
        aggregate: aggregate.clone(),
    })
}

fn arm(race: &mut Race, pool: Arc<WorkerPool>, worker: usize, request: WorkerRequest) {
    race.spawn(async move { (worker, pool.invoke(worker, request).await) });
}

/// Abort pending calls and wait until none of them can still reach a worker
async fn settle(mut race: Race) {
    race.abort_all();
    while race.join_next().await.is_some() {}
}

async fn clear_workers(pool: &WorkerPool, query_id: &str, workers: BTreeSet<usize>) {
    for worker in workers {
        let request = WorkerRequest::ClearIteration {
            query_id: query_id.to_string(),
        };
        if let Err(e) = pool.invoke(worker, request).await {
            warn!("Failed to clear iteration {} on worker {}: {}", query_id, worker, e);
        }
    }
}

impl GridIterator {
    pub(crate) fn new(
        ctx: Arc<GridContext>,
        request: IterateRequest,
        page_size: usize,
        director: StepDirector,
    ) -> Result<Self> {
        let pages = ctx.planner.decompose_by_time_pages(request.start, request.end)?;
        let groups = ctx.planner.decompose_by_tag_pages(&request.tags);
        let query_id = request
            .query_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            ctx,
            query_id,
            page_size: page_size.max(1),
            affinity_based: request.affinity_based,
            aggregate: request.aggregate,
            space: StepSpace { pages, groups },
            director,
            previous: None,
            step: None,
            touched: BTreeSet::new(),
            finished: false,
        })
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn space(&self) -> &StepSpace {
        &self.space
    }

    /// Workers currently holding a plan of this iterator
    pub fn active_workers(&self) -> Vec<usize> {
        self.touched.iter().copied().collect()
    }

    /// Next non-empty page; `None` once every step is done
    pub async fn next(&mut self) -> Result<Option<Page>> {
        match self.advance().await {
            Ok(Some(page)) => Ok(Some(page)),
            Ok(None) => {
                self.cleanup().await;
                Ok(None)
            }
            Err(e) => {
                self.cleanup().await;
                Err(e)
            }
        }
    }

    /// Stop early and release worker-side state
    pub async fn close(&mut self) {
        self.cleanup().await;
    }

    async fn cleanup(&mut self) {
        self.finished = true;
        if let Some(run) = self.step.take() {
            settle(run.race).await;
        }
        let workers = std::mem::take(&mut self.touched);
        if !workers.is_empty() {
            clear_workers(&self.ctx.pool, &self.query_id, workers).await;
        }
    }

    async fn advance(&mut self) -> Result<Option<Page>> {
        loop {
            if self.finished {
                return Ok(None);
            }

            let Some(run) = self.step.as_mut() else {
                match (self.director)(&self.space, self.previous) {
                    Some(key) => self.start_step(key)?,
                    None => {
                        self.finished = true;
                        return Ok(None);
                    }
                }
                continue;
            };

            if let Some(page) = run.replay.pop_front() {
                return Ok(Some(page));
            }

            let Some(joined) = run.race.join_next().await else {
                let key = run.key;
                debug!(
                    "Query {} finished step ({}, {})",
                    self.query_id, key.time_step, key.tag_step
                );
                self.previous = Some(key);
                self.step = None;
                continue;
            };

            let (worker, response) = joined.map_err(|e| GridError::Internal(e.to_string()))?;
            let PageResult { rows, done } = match response? {
                WorkerResponse::Page(page) => page,
                other => {
                    return Err(GridError::Internal(format!(
                        "unexpected iterate response {:?}",
                        other
                    )));
                }
            };

            if let Some(pending) = run.pending.get_mut(&worker) {
                if !rows.is_empty() {
                    pending.pages.push(rows.clone());
                }
            }
            if done {
                if let Some(pending) = run.pending.remove(&worker) {
                    let stored =
                        self.ctx
                            .query_cache
                            .store(&pending.signature, &pending.pages, run.started_at);
                    if let Err(e) = stored {
                        warn!("Failed to cache result of query {}: {}", self.query_id, e);
                    }
                }
            } else {
                let request = iterate_request(
                    &self.query_id,
                    run.key,
                    Vec::new(),
                    self.page_size,
                    &self.aggregate,
                );
                arm(&mut run.race, Arc::clone(&self.ctx.pool), worker, request);
            }

            if !rows.is_empty() {
                return Ok(Some(Page {
                    time_step: run.key.time_step,
                    tag_step: run.key.tag_step,
                    worker,
                    rows,
                    cached: false,
                }));
            }
        }
    }

    fn start_step(&mut self, key: StepKey) -> Result<()> {
        let page = self.space.pages.get(key.time_step).copied();
        let group = self.space.groups.get(key.tag_step);
        let (Some(page), Some(group)) = (page, group) else {
            return Err(GridError::Internal(format!(
                "step ({}, {}) outside {} time pages and {} tag groups",
                key.time_step,
                key.tag_step,
                self.space.pages.len(),
                self.space.groups.len()
            )));
        };

        let tags: Vec<&str> = group.tags.iter().map(String::as_str).collect();
        let plan = self.ctx.planner.plan_range(
            &tags,
            page.start,
            page.end,
            self.ctx.cardinality,
            self.affinity_based,
        )?;

        let mut run = StepRun {
            key,
            started_at: now_millis(),
            race: JoinSet::new(),
            replay: VecDeque::new(),
            pending: HashMap::new(),
        };

        for (worker, plans) in plan.active_slots() {
            let signature = plan_signature(plans, self.page_size, self.aggregate.as_deref());
            let sources: Vec<_> = plans.iter().flat_map(|p| p.paths.iter()).collect();
            match self.ctx.query_cache.lookup(&signature, &sources) {
                Ok(Some(pages)) => {
                    run.replay.extend(pages.into_iter().map(|rows| Page {
                        time_step: key.time_step,
                        tag_step: key.tag_step,
                        worker,
                        rows,
                        cached: true,
                    }));
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("Query cache lookup failed for {}: {}", self.query_id, e),
            }

            self.touched.insert(worker);
            run.pending.insert(
                worker,
                PendingPlan {
                    signature,
                    pages: Vec::new(),
                },
            );
            let request = iterate_request(
                &self.query_id,
                key,
                plans.clone(),
                self.page_size,
                &self.aggregate,
            );
            arm(&mut run.race, Arc::clone(&self.ctx.pool), worker, request);
        }

        debug!(
            "Query {} step ({}, {}): {} workers live, {} cached pages",
            self.query_id,
            key.time_step,
            key.tag_step,
            run.pending.len(),
            run.replay.len()
        );
        self.step = Some(run);
        Ok(())
    }
}

impl Drop for GridIterator {
    fn drop(&mut self) {
        if self.touched.is_empty() {
            return;
        }
        let workers = std::mem::take(&mut self.touched);
        let race = self.step.take().map(|run| run.race);
        let pool = Arc::clone(&self.ctx.pool);
        let query_id = self.query_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(race) = race {
                        settle(race).await;
                    }
                    clear_workers(&pool, &query_id, workers).await;
                });
            }
            Err(_) => warn!(
                "Iterator {} dropped outside a runtime; {} workers keep its state",
                query_id,
                workers.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::test_support::{grid, WIDTH};
    use crate::grid::{Diagnostics, GridScale};
    use crate::worker::TagSum;
    use crate::{RecordBatch, Sample};
    use std::time::Duration;

    fn space(pages: usize, groups: usize) -> StepSpace {
        StepSpace {
            pages: (0..pages as i64).map(|i| TimeRange::new(i, i + 1)).collect(),
            groups: (0..groups)
                .map(|i| TagGroup {
                    tag_bucket: i as u128,
                    tags: BTreeSet::new(),
                })
                .collect(),
        }
    }

    async fn seed(grid: &GridScale, tag: &str, count: i64) {
        let records: RecordBatch =
            HashMap::from([(tag.to_string(), (0..count).map(|t| Sample::new(t, 1.0)).collect())]);
        grid.store(&records, 0, &mut Diagnostics::new()).await.unwrap();
    }

    fn request(tags: &[&str], page_size: usize) -> IterateRequest {
        let tags = tags.iter().map(|t| t.to_string()).collect();
        let mut request = IterateRequest::new(tags, 0, WIDTH);
        request.page_size = Some(page_size);
        request
    }

    #[test]
    fn test_default_director_is_time_major_per_group() {
        let space = space(2, 2);
        let mut visited = Vec::new();
        let mut previous = None;
        while let Some(step) = default_step_director(&space, previous) {
            visited.push((step.time_step, step.tag_step));
            previous = Some(step);
        }
        assert_eq!(visited, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
        assert_eq!(default_step_director(&self::space(0, 3), None), None);
    }

    #[tokio::test]
    async fn test_pages_cover_every_group() {
        let grid = grid(2);
        seed(&grid, "1", 5).await;
        seed(&grid, "15", 3).await;

        let mut iter = grid.iterator(request(&["1", "15"], 2)).unwrap();
        assert_eq!(iter.space().groups.len(), 2);
        let mut per_step: HashMap<usize, usize> = HashMap::new();
        while let Some(page) = iter.next().await.unwrap() {
            assert!(page.rows.len() <= 2);
            *per_step.entry(page.tag_step).or_default() += page.rows.len();
        }
        assert_eq!(per_step[&0], 5);
        assert_eq!(per_step[&1], 3);
        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_clears_every_worker_with_a_plan() {
        let grid = grid(2);
        seed(&grid, "1", 10).await;

        let mut iter = grid.iterator(request(&["1"], 1)).unwrap();
        assert!(iter.next().await.unwrap().is_some());
        let workers = iter.active_workers();
        assert_eq!(workers.len(), 1);

        iter.close().await;
        let stats = grid.stats().await.unwrap();
        for worker in workers {
            assert_eq!(stats[worker].iterations_cleared, 1);
        }
        assert!(stats.iter().all(|s| s.open_iterations == 0));
        assert!(iter.next().await.unwrap().is_none());
        grid.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_waits_for_in_flight_calls() {
        let grid = grid(2);
        seed(&grid, "1", 50).await;
        seed(&grid, "2", 50).await;

        for _ in 0..20 {
            let mut iter = grid.iterator(request(&["1", "2"], 1)).unwrap();
            assert!(iter.next().await.unwrap().is_some());
            // the follow-up call for the next page is still in flight here
            iter.close().await;

            let stats = grid.stats().await.unwrap();
            assert!(stats.iter().all(|s| s.open_iterations == 0));
        }
        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_error_still_clears() {
        let grid = grid(2);
        seed(&grid, "1", 3).await;

        let mut req = request(&["1"], 1);
        req.aggregate = Some("no-such-aggregator".into());
        let mut iter = grid.iterator(req).unwrap();
        assert!(matches!(iter.next().await, Err(GridError::Config(_))));

        let cleared: u64 = grid.stats().await.unwrap().iter().map(|s| s.iterations_cleared).sum();
        assert_eq!(cleared, 1);
        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_schedules_cleanup() {
        let grid = grid(2);
        seed(&grid, "1", 10).await;

        let mut iter = grid.iterator(request(&["1"], 1)).unwrap();
        assert!(iter.next().await.unwrap().is_some());
        drop(iter);

        let mut cleared = 0;
        for _ in 0..50 {
            let stats = grid.stats().await.unwrap();
            cleared = stats.iter().map(|s| s.iterations_cleared).sum::<u64>();
            if cleared > 0 && stats.iter().all(|s| s.open_iterations == 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cleared, 1);
        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeat_query_replays_cache() {
        let grid = grid(2);
        seed(&grid, "1", 4).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut first = grid.iterator(request(&["1"], 3)).unwrap();
        let mut fresh = Vec::new();
        while let Some(page) = first.next().await.unwrap() {
            assert!(!page.cached);
            fresh.push(page.rows);
        }

        let mut second = grid.iterator(request(&["1"], 3)).unwrap();
        let mut replayed = Vec::new();
        while let Some(page) = second.next().await.unwrap() {
            assert!(page.cached);
            replayed.push(page.rows);
        }
        assert_eq!(fresh, replayed);

        // new data after the cache was built forces a recompute
        tokio::time::sleep(Duration::from_millis(5)).await;
        seed(&grid, "1", 6).await;
        let mut third = grid.iterator(request(&["1"], 3)).unwrap();
        let mut rows = 0;
        while let Some(page) = third.next().await.unwrap() {
            assert!(!page.cached);
            rows += page.rows.len();
        }
        assert_eq!(rows, 6);
        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_aggregate_and_custom_director() {
        let grid = grid(2);
        let records: RecordBatch = HashMap::from([(
            "1".to_string(),
            vec![Sample::new(10, 1.0), Sample::new(WIDTH + 10, 2.0), Sample::new(WIDTH + 20, 3.0)],
        )]);
        grid.store(&records, WIDTH, &mut Diagnostics::new()).await.unwrap();

        let mut req = IterateRequest::new(vec!["1".into()], 0, 2 * WIDTH);
        req.aggregate = Some(TagSum::NAME.into());
        // visit only the second time page
        let director: StepDirector =
            Box::new(|_: &StepSpace, previous: Option<StepKey>| match previous {
                None => Some(StepKey::new(1, 0)),
                Some(_) => None,
            });
        let mut iter = grid.iterator_with(req, director).unwrap();

        let page = iter.next().await.unwrap().unwrap();
        assert_eq!(page.time_step, 1);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].numeric, 5.0);
        assert!(iter.next().await.unwrap().is_none());
        grid.shutdown().await.unwrap();
    }
}
