//! K-way merge of sorted row cursors
//!
//! Every input cursor yields rows ordered by `(tag, sample_time)`. The merge
//! keeps one buffered row per cursor (the frame) and on each step picks the
//! smallest key to yield. Rows with an identical key are MVCC duplicates: the
//! one with the greatest `insert_time` wins, the others are discarded without
//! being yielded. Equal insert times keep the copy from the lowest cursor.
//!
//! Memory use is the frame itself; nothing beyond one row per cursor is
//! buffered.

use crate::{GridError, Result, Row};
use std::cmp::Ordering;
use tracing::warn;

/// Pull-based cursor over sorted rows
pub type RowCursor = Box<dyn Iterator<Item = Result<Row>> + Send>;

enum Slot {
    /// Cursor has no more rows
    Exhausted,
    /// Cursor produced an item that cannot take part in comparison
    Malformed,
    Row(Row),
}

/// Outcome of comparing the frame
#[derive(Debug, Default, PartialEq, Eq)]
struct Step {
    yield_index: Option<usize>,
    discard: Vec<usize>,
}

/// Merges N sorted cursors into one sorted, de-duplicated cursor
pub struct MergeCursor {
    cursors: Vec<RowCursor>,
    frame: Vec<Slot>,
    primed: bool,
    failed: bool,
    yielded: u64,
    discarded: u64,
}

impl MergeCursor {
    /// Create a merge over the given cursors
    pub fn new(cursors: Vec<RowCursor>) -> Self {
        let frame = cursors.iter().map(|_| Slot::Exhausted).collect();
        Self {
            cursors,
            frame,
            primed: false,
            failed: false,
            yielded: 0,
            discarded: 0,
        }
    }

    /// Rows yielded so far
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    /// Duplicate or malformed rows dropped so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Pull up to `page_size` rows
    pub fn next_page(&mut self, page_size: usize) -> Result<Vec<Row>> {
        let mut page = Vec::with_capacity(page_size.min(1024));
        while page.len() < page_size {
            match self.next() {
                Some(Ok(row)) => page.push(row),
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(page)
    }

    fn advance(&mut self, index: usize) {
        self.frame[index] = match self.cursors[index].next() {
            None => Slot::Exhausted,
            Some(Ok(row)) => Slot::Row(row),
            Some(Err(e)) => {
                warn!("Discarding malformed row from cursor {}: {}", index, e);
                Slot::Malformed
            }
        };
    }

    fn select(&self) -> Step {
        let mut step = Step::default();
        let mut tied: Vec<usize> = Vec::new();

        for (i, slot) in self.frame.iter().enumerate() {
            let row = match slot {
                Slot::Exhausted => continue,
                Slot::Malformed => {
                    step.discard.push(i);
                    continue;
                }
                Slot::Row(row) => row,
            };

            let Some(best) = step.yield_index else {
                step.yield_index = Some(i);
                continue;
            };
            let Slot::Row(best_row) = &self.frame[best] else {
                continue;
            };

            match row.cmp_key(best_row) {
                Ordering::Less => {
                    tied.clear();
                    step.yield_index = Some(i);
                }
                Ordering::Equal if row.insert_time > best_row.insert_time => {
                    tied.push(best);
                    step.yield_index = Some(i);
                }
                Ordering::Equal => tied.push(i),
                Ordering::Greater => {}
            }
        }

        step.discard.extend(tied);
        step
    }

    fn active(&self) -> usize {
        self.frame
            .iter()
            .filter(|s| !matches!(s, Slot::Exhausted))
            .count()
    }
}

impl Iterator for MergeCursor {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            for i in 0..self.cursors.len() {
                self.advance(i);
            }
            self.primed = true;
        }

        loop {
            let active = self.active();
            if active == 0 {
                return None;
            }

            let step = self.select();
            if step.yield_index.is_none() && step.discard.is_empty() {
                self.failed = true;
                return Some(Err(GridError::MergeStalled { active }));
            }

            for &i in &step.discard {
                self.discarded += 1;
                self.advance(i);
            }

            if let Some(i) = step.yield_index {
                let slot = std::mem::replace(&mut self.frame[i], Slot::Exhausted);
                self.advance(i);
                if let Slot::Row(row) = slot {
                    self.yielded += 1;
                    return Some(Ok(row));
                }
            }
        }
    }
}
