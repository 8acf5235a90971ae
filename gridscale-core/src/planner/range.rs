//! Read planning

use super::{ChunkPlanner, TagGroup};
use crate::bucketing::{affinity, bucket_time};
use crate::defaults::MAX_TIME_PAGES;
use crate::{DistributedIterationPlan, GridError, IterationPlan, Result, TimeRange, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use tracing::debug;

impl ChunkPlanner {
    /// Split `[start, end)` into pages aligned to time bucket boundaries
    ///
    /// Pages are left-inclusive, right-exclusive and cover the range exactly.
    /// Ranges spanning more than `MAX_TIME_PAGES` buckets are rejected.
    pub fn decompose_by_time_pages(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<TimeRange>> {
        if start >= end || start < 0 || end <= 0 {
            return Err(GridError::InvalidTimeRange { start, end });
        }

        let width = self.settings.time_bucket_width;
        // both buckets are non-negative, so the difference cannot overflow
        let span = (bucket_time(end - 1, width) - bucket_time(start, width)) / width;
        if span >= MAX_TIME_PAGES as i64 {
            return Err(GridError::InvalidTimeRange { start, end });
        }

        let mut pages = Vec::with_capacity(span as usize + 1);
        let mut cursor = start;
        while cursor < end {
            // a bucket ending past i64::MAX ends at `end`
            let next = bucket_time(cursor, width)
                .checked_add(width)
                .map_or(end, |bucket_end| bucket_end.min(end));
            pages.push(TimeRange::new(cursor, next));
            cursor = next;
        }
        Ok(pages)
    }

    /// Group tags by tag bucket, ordered by bucket value
    pub fn decompose_by_tag_pages<S: AsRef<str>>(&self, tags: &[S]) -> Vec<TagGroup> {
        let mut groups: BTreeMap<_, BTreeSet<String>> = BTreeMap::new();
        for tag in tags {
            let tag = tag.as_ref();
            groups
                .entry(self.tag_bucket(tag))
                .or_default()
                .insert(tag.to_string());
        }
        groups
            .into_iter()
            .map(|(tag_bucket, tags)| TagGroup { tag_bucket, tags })
            .collect()
    }

    /// Plan a read of `tags` over `[start, end)` across `cardinality` slots
    ///
    /// Each (time page, tag group) pair becomes one `IterationPlan` naming
    /// every path that may hold matching rows: the chunk itself, its
    /// tolerance-window neighbours and every chunk the displacement registry
    /// links to it, expanded over every shard set.
    pub fn plan_range<S: AsRef<str>>(
        &self,
        tags: &[S],
        start: Timestamp,
        end: Timestamp,
        cardinality: usize,
        affinity_based: bool,
    ) -> Result<DistributedIterationPlan> {
        let pages = self.decompose_by_time_pages(start, end)?;
        let groups = self.decompose_by_tag_pages(tags);
        let slots = cardinality.max(1);
        let mut plan = DistributedIterationPlan {
            slots: vec![Vec::new(); slots],
        };

        for page in &pages {
            for group in &groups {
                let (representative, entry) = self.plan_page(page, group)?;
                let slot = if affinity_based {
                    affinity(&representative, slots)
                } else {
                    self.round_robin.fetch_add(1, Ordering::Relaxed) % slots
                };
                debug!(
                    "Planned {} over {} with {} candidate paths on slot {}",
                    representative,
                    page,
                    entry.paths.len(),
                    slot
                );
                plan.slots[slot].push(entry);
            }
        }

        Ok(plan)
    }

    fn plan_page(&self, page: &TimeRange, group: &TagGroup) -> Result<(String, IterationPlan)> {
        let width = self.settings.time_bucket_width;
        let time_bucket = bucket_time(page.start, width);
        let representative = self.chunk_id(group.tag_bucket, time_bucket);

        let mut candidates: BTreeSet<String> =
            self.registry.displaced(&representative)?.into_iter().collect();
        candidates.insert(representative.clone());
        for step in 1..=self.settings.time_bucket_tolerance {
            // neighbours beyond the i64 range cannot hold data
            let Some(offset) = step.checked_mul(width) else {
                break;
            };
            let neighbours = [time_bucket.checked_sub(offset), time_bucket.checked_add(offset)];
            for neighbour in neighbours.into_iter().flatten() {
                candidates.insert(self.chunk_id(group.tag_bucket, neighbour));
            }
        }

        let mut paths = BTreeSet::new();
        for (shard_set, disks) in &self.settings.shard_sets {
            for candidate in &candidates {
                paths.insert(self.connection_path(shard_set, disks, group.tag_bucket, candidate));
            }
        }

        Ok((
            representative,
            IterationPlan {
                paths,
                tags: group.tags.clone(),
                range: *page,
            },
        ))
    }
}
