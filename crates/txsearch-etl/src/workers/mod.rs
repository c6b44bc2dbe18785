//! Extraction and load workers
//!
//! ```text
//! pending ──► extract ──► ready ──► load ──► search cluster
//! ```
//!
//! Both queues are bounded channels of [`JobMessage`](crate::job::JobMessage).
//! The extraction worker ends the ready queue with a single sentinel once
//! the pending queue is drained.

pub mod extract;
pub mod load;

pub use extract::{run_extract, ExtractSettings};
pub use load::{run_load, JobSummary, LoadSettings};

/// Result of a worker that ran to completion
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Extracted { jobs: usize },
    Loaded { jobs: Vec<JobSummary> },
}

impl WorkerOutcome {
    /// Jobs loaded, when this is the load worker's outcome
    pub fn loaded(&self) -> Option<&[JobSummary]> {
        match self {
            WorkerOutcome::Loaded { jobs } => Some(jobs),
            WorkerOutcome::Extracted { .. } => None,
        }
    }
}
