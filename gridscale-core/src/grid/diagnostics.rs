//! Per-call diagnostics for `GridScale::store`

use serde::Serialize;
use std::fmt::Write;
use std::time::Duration;

/// Wall-clock time spent in one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub micros: u64,
}

/// What one worker was asked to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub worker: usize,
    pub paths: usize,
    pub tags: usize,
    pub rows: usize,
}

/// Collected phase timings and worker summaries
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    phases: Vec<PhaseTiming>,
    workers: Vec<WorkerSummary>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_phase(&mut self, phase: &str, elapsed: Duration) {
        self.phases.push(PhaseTiming {
            phase: phase.to_string(),
            micros: elapsed.as_micros() as u64,
        });
    }

    pub fn record_worker(&mut self, summary: WorkerSummary) {
        self.workers.push(summary);
    }

    /// Total time recorded for a phase
    pub fn phase(&self, phase: &str) -> Option<Duration> {
        let mut matching = self.phases.iter().filter(|p| p.phase == phase).peekable();
        matching.peek()?;
        Some(Duration::from_micros(matching.map(|p| p.micros).sum()))
    }

    pub fn workers(&self) -> &[WorkerSummary] {
        &self.workers
    }

    /// Human-readable report, one line per phase and per worker
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for p in &self.phases {
            let _ = writeln!(out, "{}: {}us", p.phase, p.micros);
        }
        for w in &self.workers {
            let _ = writeln!(
                out,
                "worker {}: {} paths, {} tags, {} rows",
                w.worker, w.paths, w.tags, w.rows
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary() {
        let mut diag = Diagnostics::new();
        diag.record_phase("plan", Duration::from_micros(40));
        diag.record_phase("write", Duration::from_micros(900));
        diag.record_worker(WorkerSummary {
            worker: 1,
            paths: 2,
            tags: 3,
            rows: 4,
        });

        assert_eq!(diag.phase("write"), Some(Duration::from_micros(900)));
        assert_eq!(diag.phase("metadata"), None);
        let text = diag.summary();
        assert!(text.contains("plan: 40us"));
        assert!(text.contains("worker 1: 2 paths, 3 tags, 4 rows"));
    }
}
