//! Write planning

use super::ChunkPlanner;
use crate::bucketing::{affinity, bucket_time};
use crate::{
    ChunkAllocation, Displacement, DistributedUpsertPlan, GridError, RecordBatch, Result,
    Timestamp,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};

impl ChunkPlanner {
    /// Plan a batch of writes across `cardinality` worker slots
    ///
    /// Every row lands exactly once, in the chunk selected by its tag bucket
    /// and the insert-time bucket. Rows whose own time bucket lies outside
    /// `insert_bucket ± tolerance * width` additionally produce a displacement
    /// link from their record-time chunk id to the insert-time chunk id.
    pub fn plan_upserts(
        &self,
        records: &RecordBatch,
        insert_time: Timestamp,
        cardinality: usize,
    ) -> Result<DistributedUpsertPlan> {
        let settings = &self.settings;
        let disks = settings
            .shard_sets
            .get(&settings.writer_shard_set)
            .ok_or_else(|| {
                GridError::Config(format!("unknown shard set {}", settings.writer_shard_set))
            })?;

        let width = settings.time_bucket_width;
        let insert_bucket = bucket_time(insert_time, width);
        let window = settings.time_bucket_tolerance.saturating_mul(width);
        let (lower, upper) = (
            insert_bucket.saturating_sub(window),
            insert_bucket.saturating_add(window),
        );

        let mut by_path: ChunkAllocation = BTreeMap::new();
        let mut displacements: BTreeMap<String, Displacement> = BTreeMap::new();

        for (tag, samples) in records {
            if samples.is_empty() {
                continue;
            }
            let tag_bucket = self.tag_bucket(tag);
            let home_chunk = self.chunk_id(tag_bucket, insert_bucket);
            let path =
                self.connection_path(&settings.writer_shard_set, disks, tag_bucket, &home_chunk);

            let mut registered: HashSet<Timestamp> = HashSet::new();
            let rows = by_path.entry(path).or_default().entry(tag.clone()).or_default();

            for sample in samples {
                rows.push(sample.clone().with_insert_time(insert_time));

                let record_bucket = bucket_time(sample.sample_time, width);
                let outside = record_bucket < lower || record_bucket > upper;
                if record_bucket != insert_bucket && outside && registered.insert(record_bucket) {
                    displacements
                        .entry(self.chunk_id(tag_bucket, record_bucket))
                        .or_insert_with(|| Displacement {
                            insert_time_bucket: insert_bucket,
                            targets: BTreeSet::new(),
                        })
                        .targets
                        .insert(home_chunk.clone());
                }
            }
        }

        let slots = cardinality.max(1);
        let mut chunk_allocations: Vec<ChunkAllocation> = vec![BTreeMap::new(); slots];
        for (path, tags) in by_path {
            let slot = affinity(path.as_str(), slots);
            chunk_allocations[slot].insert(path, tags);
        }

        Ok(DistributedUpsertPlan {
            chunk_allocations,
            chunk_displacements: displacements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::{ConnectionPath, RecordBatch, Sample};

    fn batch(items: &[(&str, &[i64])]) -> RecordBatch {
        items
            .iter()
            .map(|(tag, times)| {
                let samples = times.iter().map(|t| Sample::new(*t, *t as f64)).collect();
                (tag.to_string(), samples)
            })
            .collect()
    }

    #[test]
    fn test_every_row_written_once() {
        let planner = planner();
        let records = batch(&[("42", &[0, 10, 5000, -7000]), ("7", &[1, 2]), ("99", &[3])]);
        let plan = planner.plan_upserts(&records, 500, 3).unwrap();

        assert_eq!(plan.chunk_allocations.len(), 3);
        assert_eq!(plan.row_count(), 7);

        // Each tag appears under exactly one path, stamped with the insert time
        for tag in ["42", "7", "99"] {
            let homes: Vec<_> = plan
                .chunk_allocations
                .iter()
                .flat_map(|a| a.iter())
                .filter(|(_, tags)| tags.contains_key(tag))
                .collect();
            assert_eq!(homes.len(), 1, "tag {} written to several chunks", tag);
            assert!(homes[0].1[tag].iter().all(|s| s.insert_time == 500));
        }

        let home = ConnectionPath::new("gen-a", "d0", "D-40-0");
        let rows = plan
            .chunk_allocations
            .iter()
            .find_map(|a| a.get(&home))
            .expect("tag 42 home chunk");
        assert_eq!(rows["42"].len(), 4);
    }

    #[test]
    fn test_displacement_outside_tolerance_only() {
        let planner = planner();
        // insert bucket 0, tolerance 1 => [-1000, 1000] stays home silently
        let records = batch(&[("42", &[0, 999, 1500, -900, 3000, 3500, -5000])]);
        let plan = planner.plan_upserts(&records, 0, 2).unwrap();

        let ids: Vec<_> = plan.chunk_displacements.keys().cloned().collect();
        assert_eq!(ids, vec!["D-40--5000", "D-40-3000"]);
        for displacement in plan.chunk_displacements.values() {
            assert_eq!(displacement.insert_time_bucket, 0);
            assert_eq!(displacement.targets.len(), 1);
            assert!(displacement.targets.contains("D-40-0"));
        }
    }

    #[test]
    fn test_inside_tolerance_registers_nothing() {
        let planner = planner();
        let records = batch(&[("42", &[2000, 2999, 4000])]);
        let plan = planner.plan_upserts(&records, 3000, 1).unwrap();
        assert!(plan.chunk_displacements.is_empty());
        assert_eq!(plan.row_count(), 3);
    }

    #[test]
    fn test_window_saturates_at_the_i64_bounds() {
        let planner = planner();
        let records = batch(&[("42", &[i64::MAX - 1, i64::MIN + 1, 0])]);

        let plan = planner.plan_upserts(&records, i64::MAX, 2).unwrap();
        assert_eq!(plan.row_count(), 3);
        let ids: Vec<_> = plan.chunk_displacements.keys().cloned().collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&format!("D-40-{}", i64::MAX - i64::MAX % 1000)));

        let plan = planner.plan_upserts(&records, i64::MIN, 2).unwrap();
        assert_eq!(plan.row_count(), 3);
        assert!(!plan.chunk_displacements.contains_key(&format!("D-40-{}", i64::MIN)));
        assert_eq!(plan.chunk_displacements.len(), 2);
    }

    #[test]
    fn test_same_path_same_slot() {
        let planner = planner();
        let records = batch(&[("41", &[1]), ("42", &[2])]);
        let plan = planner.plan_upserts(&records, 0, 4).unwrap();
        let occupied: Vec<_> = plan
            .chunk_allocations
            .iter()
            .filter(|a| !a.is_empty())
            .collect();
        assert_eq!(occupied.len(), 1);
        assert_eq!(occupied[0].values().next().unwrap().len(), 2);
    }
}
