//! Worker-side page aggregators
//!
//! An aggregator folds the pages of one iteration step into an accumulator.
//! After each page it may hand back rows to emit right away; whatever is
//! still held when the step's cursor runs dry is emitted by `finish`.

use crate::{GridError, Result, Row};
use std::collections::HashMap;
use std::sync::Arc;

/// Streaming fold over merged pages
pub trait PageAggregator: Send {
    /// Fold one page; `Some` emits rows now
    fn fold(&mut self, page: Vec<Row>) -> Option<Vec<Row>>;

    /// Emit whatever is left once the cursor is exhausted
    fn finish(&mut self) -> Option<Vec<Row>>;
}

type AggregatorFactory = Arc<dyn Fn() -> Box<dyn PageAggregator> + Send + Sync>;

/// Aggregators available to workers, by name
#[derive(Clone)]
pub struct AggregatorRegistry {
    factories: HashMap<String, AggregatorFactory>,
}

impl AggregatorRegistry {
    /// Registry without any aggregator
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn PageAggregator> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Fresh aggregator instance for one iteration step
    pub fn create(&self, name: &str) -> Result<Box<dyn PageAggregator>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| GridError::Config(format!("unknown aggregator: {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(TagSum::NAME, || Box::new(TagSum::default()));
        registry
    }
}

/// Sums numeric values per tag
///
/// Pages arrive ordered by tag, so a tag is complete as soon as a later tag
/// shows up; its summary row is emitted at that point. The summary carries
/// the first sample time of the tag, the latest insert time, the sum as the
/// numeric value and the row count as the other value.
#[derive(Debug, Default)]
pub struct TagSum {
    current: Option<Summary>,
}

#[derive(Debug)]
struct Summary {
    tag: String,
    first_sample: i64,
    latest_insert: i64,
    sum: f64,
    count: u64,
}

impl Summary {
    fn start(row: &Row) -> Self {
        Self {
            tag: row.tag.clone(),
            first_sample: row.sample_time,
            latest_insert: row.insert_time,
            sum: 0.0,
            count: 0,
        }
    }

    fn into_row(self) -> Row {
        Row {
            sample_time: self.first_sample,
            insert_time: self.latest_insert,
            numeric: self.sum,
            other: Some(self.count.to_string()),
            tag: self.tag,
        }
    }
}

impl TagSum {
    pub const NAME: &'static str = "tag-sum";
}

impl PageAggregator for TagSum {
    fn fold(&mut self, page: Vec<Row>) -> Option<Vec<Row>> {
        let mut completed = Vec::new();
        for row in page {
            let same_tag = self.current.as_ref().map_or(false, |s| s.tag == row.tag);
            if !same_tag {
                if let Some(done) = self.current.replace(Summary::start(&row)) {
                    completed.push(done.into_row());
                }
            }
            if let Some(summary) = self.current.as_mut() {
                summary.sum += row.numeric;
                summary.count += 1;
                summary.latest_insert = summary.latest_insert.max(row.insert_time);
            }
        }
        (!completed.is_empty()).then_some(completed)
    }

    fn finish(&mut self) -> Option<Vec<Row>> {
        self.current.take().map(|s| vec![s.into_row()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sample;

    fn row(tag: &str, t: i64, v: f64) -> Row {
        Row::from_sample(tag, &Sample::new(t, v).with_insert_time(t * 10))
    }

    #[test]
    fn test_tag_sum_emits_completed_tags() {
        let registry = AggregatorRegistry::default();
        let mut agg = registry.create(TagSum::NAME).unwrap();

        assert!(agg.fold(vec![row("a", 1, 1.0), row("a", 2, 2.0)]).is_none());
        let emitted = agg.fold(vec![row("a", 3, 3.0), row("b", 1, 10.0)]).unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].tag, "a");
        assert_eq!(emitted[0].numeric, 6.0);
        assert_eq!(emitted[0].sample_time, 1);
        assert_eq!(emitted[0].insert_time, 30);
        assert_eq!(emitted[0].other.as_deref(), Some("3"));

        let rest = agg.finish().unwrap();
        assert_eq!(rest[0].tag, "b");
        assert_eq!(rest[0].numeric, 10.0);
        assert!(agg.finish().is_none());
    }

    #[test]
    fn test_unknown_aggregator() {
        let registry = AggregatorRegistry::default();
        assert!(registry.contains("tag-sum"));
        assert!(matches!(registry.create("median"), Err(GridError::Config(_))));
        assert_eq!(AggregatorRegistry::empty().names(), Vec::<String>::new());
    }
}
