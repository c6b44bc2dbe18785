//! Load worker: stream exported files into the search cluster

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use txsearch_common::Stage;

use super::WorkerOutcome;
use crate::config::EtlConfig;
use crate::error::{EtlError, Result};
use crate::job::{JobDescriptor, JobMessage};
use crate::reconcile::delete_scoped;
use crate::search::{BulkOutcome, SearchEngine};
use crate::transform::{Document, DocumentBatches};

/// Load behaviour taken from the pipeline configuration
#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub batch_size: usize,
    pub delete_batch_size: usize,
    /// Delete each batch's previous versions from the target index first
    pub process_deletes: bool,
    /// `(name, body)` of a template to install before the first job
    pub index_template: Option<(String, Value)>,
}

impl LoadSettings {
    pub fn from_config(config: &EtlConfig) -> Self {
        let index_template = if config.pipeline.create_new_index {
            config
                .search
                .index_template
                .clone()
                .map(|template| (format!("{}_template", config.search.root_index), template))
        } else {
            None
        };

        Self {
            batch_size: config.pipeline.load_batch_size,
            delete_batch_size: config.pipeline.delete_batch_size,
            process_deletes: config.pipeline.process_deletes,
            index_template,
        }
    }
}

/// Totals for one loaded job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub name: String,
    pub target_index: String,
    pub rows: u64,
    pub outcome: BulkOutcome,
}

/// Load ready jobs until the sentinel arrives
///
/// A closed queue without a sentinel means the extraction side died and is
/// reported as [`EtlError::QueueClosed`].
pub async fn run_load(
    engine: Arc<dyn SearchEngine>,
    mut ready: mpsc::Receiver<JobMessage>,
    settings: LoadSettings,
) -> Result<WorkerOutcome> {
    if let Some((name, template)) = &settings.index_template {
        info!(stage = %Stage::Load, template = %name, "Installing index template");
        engine.put_template(name, template).await?;
    }

    let mut jobs = Vec::new();

    loop {
        let job = match ready.recv().await {
            Some(JobMessage::Job(job)) => job,
            Some(JobMessage::Sentinel) => break,
            None => {
                return Err(EtlError::QueueClosed(
                    "ready queue closed before all jobs were loaded".to_string(),
                ))
            }
        };

        match load_job(engine.as_ref(), &job, &settings).await {
            Ok(summary) => jobs.push(summary),
            Err(e) => {
                error!(stage = %Stage::Load, job = %job.name, error = %e, "Load failed");
                return Err(e);
            }
        }
    }

    info!(stage = %Stage::Load, jobs = jobs.len(), "All loads complete");
    Ok(WorkerOutcome::Loaded { jobs })
}

async fn ensure_index(engine: &dyn SearchEngine, job: &JobDescriptor) -> Result<()> {
    if !engine.index_exists(&job.target_index).await? {
        info!(stage = %Stage::Load, job = %job.name, "Creating index '{}'", job.target_index);
        engine.create_index(&job.target_index).await?;
        engine.refresh(&job.target_index).await?;
    }
    Ok(())
}

/// Pull the next batch off the blocking reader
async fn next_batch(
    batches: DocumentBatches,
) -> Result<(DocumentBatches, Option<Result<Vec<Document>>>)> {
    tokio::task::spawn_blocking(move || {
        let mut batches = batches;
        let next = batches.next();
        (batches, next)
    })
    .await
    .map_err(|e| EtlError::WorkerCrash {
        worker: "load".to_string(),
        reason: e.to_string(),
    })
}

/// Load one exported file, then delete it
pub async fn load_job(
    engine: &dyn SearchEngine,
    job: &JobDescriptor,
    settings: &LoadSettings,
) -> Result<JobSummary> {
    let start = Instant::now();
    info!(
        stage = %Stage::Load,
        job = %job.name,
        "Starting ETL for '{}' into '{}'",
        job.export_path.display(),
        job.target_index
    );

    ensure_index(engine, job).await?;

    let expected = job
        .expected_count
        .map(|c| c.to_string())
        .unwrap_or_else(|| "?".to_string());
    let mut batches = DocumentBatches::open(&job.export_path, settings.batch_size)?;
    let mut totals = BulkOutcome::default();
    let mut rows: u64 = 0;

    loop {
        let (returned, next) = next_batch(batches).await?;
        batches = returned;
        let batch = match next {
            Some(batch) => batch?,
            None => break,
        };

        let batch_start = Instant::now();
        let first_row = rows + 1;
        rows += batch.len() as u64;
        info!(
            stage = %Stage::Load,
            job = %job.name,
            "Running row {}-{}/{}",
            first_row,
            rows,
            expected
        );

        if settings.process_deletes {
            delete_scoped(
                engine,
                &job.target_index,
                &batch,
                settings.delete_batch_size,
                &job.name,
            )
            .await?;
        }

        let outcome = engine.bulk_upsert(&job.target_index, &batch).await?;
        if outcome.failed > 0 {
            warn!(
                stage = %Stage::Load,
                job = %job.name,
                failed = outcome.failed,
                "Documents rejected by the cluster"
            );
        }
        info!(
            stage = %Stage::Load,
            job = %job.name,
            "Successes: {}, Fails: {}. Batch took {:.2}s",
            outcome.succeeded,
            outcome.failed,
            batch_start.elapsed().as_secs_f64()
        );
        totals.merge(outcome);
    }

    tokio::fs::remove_file(&job.export_path).await?;

    info!(
        stage = %Stage::Load,
        job = %job.name,
        "Loaded {} rows ({} succeeded, {} failed) in {:.2}s",
        rows,
        totals.succeeded,
        totals.failed,
        start.elapsed().as_secs_f64()
    );

    Ok(JobSummary {
        name: job.name.clone(),
        target_index: job.target_index.clone(),
        rows,
        outcome: totals,
    })
}
