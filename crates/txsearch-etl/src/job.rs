//! Job descriptors passed between the extraction and load workers

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One fiscal-year partition to export and load
///
/// Descriptors are moved through the queues, never shared. The extraction
/// worker fills in `expected_count` once the count query has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub target_index: String,
    pub fiscal_year: i32,
    pub export_path: PathBuf,
    pub expected_count: Option<i64>,
}

impl JobDescriptor {
    pub fn new(
        name: impl Into<String>,
        target_index: impl Into<String>,
        fiscal_year: i32,
        export_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            target_index: target_index.into(),
            fiscal_year,
            export_path: export_path.into(),
            expected_count: None,
        }
    }

    /// Standard job for a fiscal year: `{fy}_transactions`, exported to
    /// `{working_dir}/{fy}_transactions.csv`
    pub fn for_fiscal_year(fiscal_year: i32, target_index: &str, working_dir: &Path) -> Self {
        let name = format!("{}_transactions", fiscal_year);
        let export_path = working_dir.join(format!("{}.csv", name));
        Self::new(name, target_index, fiscal_year, export_path)
    }

    pub fn with_expected_count(mut self, count: Option<i64>) -> Self {
        self.expected_count = count;
        self
    }
}

/// Message carried by the job queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMessage {
    Job(JobDescriptor),
    /// Sent exactly once, after every real job, to stop the load worker
    Sentinel,
}

impl JobMessage {
    pub fn is_sentinel(&self) -> bool {
        matches!(self, JobMessage::Sentinel)
    }
}

impl From<JobDescriptor> for JobMessage {
    fn from(job: JobDescriptor) -> Self {
        JobMessage::Job(job)
    }
}

/// Build one job per fiscal year, in the order given
pub fn plan_jobs(fiscal_years: &[i32], target_index: &str, working_dir: &Path) -> Vec<JobDescriptor> {
    fiscal_years
        .iter()
        .map(|fy| JobDescriptor::for_fiscal_year(*fy, target_index, working_dir))
        .collect()
}
