//! Pipeline orchestration
//!
//! One run loads a set of fiscal years into either a fresh index generation
//! (full rebuild) or whatever the write alias points at (incremental).
//!
//! 1. Incremental runs with deletes enabled reconcile the deletion
//!    manifests first.
//! 2. The extraction and load workers run under the supervisor.
//! 3. A full rebuild then gets its final settings, takes over every alias
//!    and is optionally snapshotted.

use chrono::{DateTime, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;
use txsearch_common::Stage;

use crate::config::EtlConfig;
use crate::error::{EtlError, Result};
use crate::export::RowSource;
use crate::job::{plan_jobs, JobMessage};
use crate::lifecycle::IndexLifecycle;
use crate::reconcile::{reconcile_deleted_manifests, DeleteSummary};
use crate::search::SearchEngine;
use crate::storage::ManifestStore;
use crate::supervisor::Supervisor;
use crate::workers::{run_extract, run_load, ExtractSettings, JobSummary, LoadSettings};

/// What a pipeline run did
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub target_index: String,
    pub jobs: Vec<JobSummary>,
    pub deletes: Option<DeleteSummary>,
    pub retired_indices: Vec<String>,
    pub snapshot: Option<String>,
}

impl PipelineReport {
    pub fn rows(&self) -> u64 {
        self.jobs.iter().map(|job| job.rows).sum()
    }

    pub fn failed_documents(&self) -> u64 {
        self.jobs.iter().map(|job| job.outcome.failed).sum()
    }
}

/// Start of the manifest cutover day, or the beginning of time
pub fn cutover(config: &EtlConfig) -> DateTime<Utc> {
    config
        .pipeline
        .starting_date
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A configured pipeline and the services it runs against
pub struct Pipeline {
    config: EtlConfig,
    source: Arc<dyn RowSource>,
    engine: Arc<dyn SearchEngine>,
    manifests: Option<Arc<dyn ManifestStore>>,
}

impl Pipeline {
    pub fn new(config: EtlConfig, source: Arc<dyn RowSource>, engine: Arc<dyn SearchEngine>) -> Self {
        Self {
            config,
            source,
            engine,
            manifests: None,
        }
    }

    /// Manifest store used when deletes are reconciled
    pub fn with_manifests(mut self, store: Arc<dyn ManifestStore>) -> Self {
        self.manifests = Some(store);
        self
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<PipelineReport> {
        let start = Instant::now();
        let config = &self.config;
        let target_index = config.target_index();
        let full_rebuild = config.pipeline.create_new_index;

        info!(
            stage = %Stage::Main,
            "Loading fiscal years {:?} into '{}' ({})",
            config.pipeline.fiscal_years,
            target_index,
            if full_rebuild { "full rebuild" } else { "incremental" }
        );

        let mut report = PipelineReport {
            target_index: target_index.clone(),
            ..PipelineReport::default()
        };

        if !full_rebuild && config.pipeline.process_deletes {
            let store = self.manifests.as_ref().ok_or_else(|| {
                EtlError::config("Deletes requested but no manifest store is configured")
            })?;
            report.deletes = Some(
                reconcile_deleted_manifests(
                    self.engine.as_ref(),
                    store.as_ref(),
                    &config.index_pattern(),
                    cutover(config),
                    config.pipeline.delete_batch_size,
                )
                .await?,
            );
        }

        report.jobs = self.load(&target_index).await?;

        if full_rebuild {
            let lifecycle = IndexLifecycle::from_config(self.engine.clone(), &config.search);
            lifecycle.finalize_settings(&target_index).await?;
            report.retired_indices = lifecycle.swap_aliases(&target_index).await?;

            if config.pipeline.take_snapshot {
                let repository = config.search.snapshot_repository.as_deref().ok_or_else(|| {
                    EtlError::config("Snapshots requested but ES_SNAPSHOT_REPOSITORY is not set")
                })?;
                report.snapshot = Some(lifecycle.take_snapshot(&target_index, repository).await?);
            }
        }

        info!(
            stage = %Stage::Main,
            rows = report.rows(),
            failed = report.failed_documents(),
            "Pipeline finished in {:.2}s",
            start.elapsed().as_secs_f64()
        );

        Ok(report)
    }

    /// Run the supervised extraction and load workers
    async fn load(&self, target_index: &str) -> Result<Vec<JobSummary>> {
        let config = &self.config;
        tokio::fs::create_dir_all(&config.pipeline.working_dir).await?;

        let jobs = plan_jobs(
            &config.pipeline.fiscal_years,
            target_index,
            &config.pipeline.working_dir,
        );

        let (pending_tx, pending_rx) = mpsc::channel(jobs.len().max(1));
        for job in jobs {
            pending_tx
                .send(JobMessage::Job(job))
                .await
                .map_err(|_| EtlError::QueueClosed("pending queue".to_string()))?;
        }
        drop(pending_tx);

        let (ready_tx, ready_rx) = mpsc::channel(config.pipeline.ready_queue_capacity);

        let mut supervisor = Supervisor::new(config.pipeline.supervisor_poll);
        supervisor.spawn(
            "extract",
            run_extract(
                self.source.clone(),
                pending_rx,
                ready_tx,
                ExtractSettings::from_config(config),
            ),
        );
        supervisor.spawn(
            "load",
            run_load(self.engine.clone(), ready_rx, LoadSettings::from_config(config)),
        );

        let outcomes = supervisor.wait().await?;
        Ok(outcomes
            .into_iter()
            .find_map(|(_, outcome)| outcome.loaded().map(<[JobSummary]>::to_vec))
            .unwrap_or_default())
    }
}
