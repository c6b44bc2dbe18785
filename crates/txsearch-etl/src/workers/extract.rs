//! Extraction worker: export each pending job and hand it to the loader

use chrono::NaiveDate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use txsearch_common::Stage;

use super::WorkerOutcome;
use crate::config::EtlConfig;
use crate::error::{EtlError, Result};
use crate::export::RowSource;
use crate::job::{JobDescriptor, JobMessage};
use crate::sql::ExportFilter;
use crate::transform::count_rows;

/// Extraction behaviour taken from the pipeline configuration
#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub updated_since: Option<NaiveDate>,
    pub skip_counts: bool,
    pub backpressure_poll: Duration,
}

impl ExtractSettings {
    pub fn from_config(config: &EtlConfig) -> Self {
        Self {
            updated_since: config.pipeline.starting_date,
            skip_counts: config.pipeline.skip_counts,
            backpressure_poll: config.pipeline.backpressure_poll,
        }
    }
}

/// Drain `pending`, exporting each job and forwarding it on `ready`
///
/// While `ready` is full the worker sleeps for the backpressure interval
/// before taking the next job, so a completed job is only ever sent when a
/// slot is free. One sentinel follows the last job.
pub async fn run_extract(
    source: Arc<dyn RowSource>,
    mut pending: mpsc::Receiver<JobMessage>,
    ready: mpsc::Sender<JobMessage>,
    settings: ExtractSettings,
) -> Result<WorkerOutcome> {
    let mut jobs = 0;

    loop {
        if ready.capacity() == 0 {
            debug!(stage = %Stage::Download, "Ready queue full, pausing {:?}", settings.backpressure_poll);
            tokio::time::sleep(settings.backpressure_poll).await;
            continue;
        }

        let job = match pending.recv().await {
            Some(JobMessage::Job(job)) => job,
            Some(JobMessage::Sentinel) | None => break,
        };

        let job = match extract_job(source.as_ref(), job, &settings).await {
            Ok(job) => job,
            Err(e) => {
                error!(stage = %Stage::Download, error = %e, "Extraction failed");
                return Err(e);
            }
        };

        ready
            .send(JobMessage::Job(job))
            .await
            .map_err(|_| EtlError::QueueClosed("ready queue".to_string()))?;
        jobs += 1;
    }

    ready
        .send(JobMessage::Sentinel)
        .await
        .map_err(|_| EtlError::QueueClosed("ready queue".to_string()))?;
    info!(stage = %Stage::Download, jobs, "All downloads complete");

    Ok(WorkerOutcome::Extracted { jobs })
}

/// Count, export and validate one job
pub async fn extract_job(
    source: &dyn RowSource,
    job: JobDescriptor,
    settings: &ExtractSettings,
) -> Result<JobDescriptor> {
    let start = Instant::now();
    let filter = ExportFilter::new(job.fiscal_year, settings.updated_since);
    let path = job.export_path.clone();

    info!(
        stage = %Stage::Download,
        job = %job.name,
        "Preparing to download '{}'",
        path.display()
    );

    let expected = if settings.skip_counts {
        info!(stage = %Stage::Download, job = %job.name, "Skipping counting DB rows");
        None
    } else {
        let count = source.count(&filter).await?;
        info!(stage = %Stage::Download, job = %job.name, "{} SQL rows to export", count);
        Some(count)
    };

    if tokio::fs::try_exists(&path).await? {
        info!(stage = %Stage::Download, job = %job.name, "Removing existing file '{}'", path.display());
        tokio::fs::remove_file(&path).await?;
    }

    source.export(&filter, &path).await?;

    if let Some(expected) = expected {
        let counted = path.clone();
        let actual = tokio::task::spawn_blocking(move || count_rows(counted))
            .await
            .map_err(|e| EtlError::WorkerCrash {
                worker: "extract".to_string(),
                reason: e.to_string(),
            })??;
        let actual = actual as i64;

        if actual != expected {
            error!(
                stage = %Stage::Download,
                job = %job.name,
                expected,
                actual,
                "Mismatch between CSV and DB rows"
            );
            return Err(EtlError::ValidationMismatch {
                job: job.name.clone(),
                expected,
                actual,
                path,
            });
        }
        info!(stage = %Stage::Download, job = %job.name, "Count validated: {} rows", actual);
    }

    info!(
        stage = %Stage::Download,
        job = %job.name,
        "Downloading took {:.2}s",
        start.elapsed().as_secs_f64()
    );

    Ok(job.with_expected_count(expected))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::export::InMemoryRowSource;
    use crate::job::plan_jobs;

    const THREE_ROWS: &str = "generated_unique_transaction_id,business_categories\n\
                              CONT_TX_1,\"{a,b}\"\n\
                              CONT_TX_2,{}\n\
                              CONT_TX_3,\n";

    fn settings() -> ExtractSettings {
        ExtractSettings {
            updated_since: NaiveDate::from_ymd_opt(2019, 10, 1),
            skip_counts: false,
            backpressure_poll: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_extract_job_validates_count() {
        let dir = tempfile::tempdir().unwrap();
        let source = InMemoryRowSource::new().with_export(2020, THREE_ROWS);
        let job = JobDescriptor::for_fiscal_year(2020, "transaction-1", dir.path());

        let job = extract_job(&source, job, &settings()).await.unwrap();

        assert_eq!(job.expected_count, Some(3));
        assert!(job.export_path.exists());
        assert_eq!(
            source.exported_filters(),
            vec![ExportFilter::new(2020, NaiveDate::from_ymd_opt(2019, 10, 1))]
        );
    }

    #[tokio::test]
    async fn test_extract_job_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = InMemoryRowSource::new()
            .with_export(2020, THREE_ROWS)
            .with_count(2020, 4);
        let job = JobDescriptor::for_fiscal_year(2020, "transaction-1", dir.path());

        match extract_job(&source, job, &settings()).await {
            Err(EtlError::ValidationMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extract_job_skip_counts_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobDescriptor::for_fiscal_year(2020, "transaction-1", dir.path());
        std::fs::write(&job.export_path, "stale\n1\n2\n3\n4\n5\n").unwrap();

        let source = InMemoryRowSource::new()
            .with_export(2020, THREE_ROWS)
            .with_count(2020, 99);
        let mut settings = settings();
        settings.skip_counts = true;

        let job = extract_job(&source, job, &settings).await.unwrap();
        assert_eq!(job.expected_count, None);
        assert_eq!(count_rows(&job.export_path).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_run_extract_ends_with_one_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            InMemoryRowSource::new()
                .with_export(2019, THREE_ROWS)
                .with_export(2020, THREE_ROWS),
        );

        let jobs = plan_jobs(&[2019, 2020], "transaction-1", dir.path());
        let (pending_tx, pending_rx) = mpsc::channel(jobs.len());
        for job in jobs {
            pending_tx.send(job.into()).await.unwrap();
        }
        drop(pending_tx);

        let (ready_tx, mut ready_rx) = mpsc::channel(10);
        let outcome = run_extract(source, pending_rx, ready_tx, settings())
            .await
            .unwrap();
        assert_eq!(outcome, WorkerOutcome::Extracted { jobs: 2 });

        let mut messages = Vec::new();
        while let Some(message) = ready_rx.recv().await {
            messages.push(message);
        }
        assert_eq!(messages.len(), 3);
        assert!(messages[2].is_sentinel());
        assert_eq!(messages.iter().filter(|m| m.is_sentinel()).count(), 1);
    }
}
