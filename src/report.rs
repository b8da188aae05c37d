//! Run counters and the end-of-run summary.

use std::fmt;
use std::time::{Duration, Instant};

/// Accumulates counts for one backup run.
///
/// Only the engine's collecting loop mutates it.
#[derive(Debug)]
pub struct RunReporter {
    started: Instant,
    repositories: usize,
    errors: usize,
}

/// Final counts of a run, produced by [`RunReporter::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub repositories: usize,
    pub errors: usize,
    pub duration: Duration,
}

impl RunReporter {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            repositories: 0,
            errors: 0,
        }
    }

    /// A clone attempt finished successfully.
    pub fn record_success(&mut self) {
        self.repositories += 1;
    }

    /// A clone attempt failed. It still counts as processed.
    pub fn record_failure(&mut self) {
        self.repositories += 1;
        self.errors += 1;
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn finish(&self) -> RunSummary {
        RunSummary {
            repositories: self.repositories,
            errors: self.errors,
            duration: self.started.elapsed(),
        }
    }
}

impl RunSummary {
    /// A run with any failed clone is a failure, whatever else succeeded.
    pub fn failed(&self) -> bool {
        self.errors > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Backed up {} repositories in {:.2?}, encountered {} errors",
            self.repositories, self.duration, self.errors
        )
    }
}
