//! Transaction Search ETL - loads transactions into the search cluster

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use txsearch_common::logging::{init_logging, LogConfig, LogLevel};
use txsearch_common::Stage;
use txsearch_etl::config::{parse_fiscal_years, EtlConfig};
use txsearch_etl::export::PgRowSource;
use txsearch_etl::lifecycle::IndexLifecycle;
use txsearch_etl::pipeline::{cutover, Pipeline};
use txsearch_etl::reconcile::reconcile_deleted_manifests;
use txsearch_etl::search::{HttpSearchClient, SearchEngine};
use txsearch_etl::storage::{ManifestStore, S3ManifestStore, StorageConfig};

#[derive(Parser, Debug)]
#[command(name = "txsearch-etl")]
#[command(author, version, about = "Transaction search index loader")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export fiscal years from the database and load them into the cluster
    Load(LoadArgs),

    /// Delete transactions listed in the deletion manifests from every index
    ReconcileDeletes {
        /// Only read manifests modified on or after this date (YYYY-MM-DD)
        #[arg(long)]
        starting_date: Option<NaiveDate>,
    },

    /// Move every alias onto an index and retire the previous generation
    SwapAliases {
        #[arg(long)]
        index: String,
    },

    /// Apply the post-load settings to an index
    FinalizeSettings {
        #[arg(long)]
        index: String,
    },

    /// Snapshot an index
    Snapshot {
        #[arg(long)]
        index: String,

        /// Snapshot repository, overrides ES_SNAPSHOT_REPOSITORY
        #[arg(long)]
        repository: Option<String>,
    },
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Fiscal years to load: "all" or a comma separated list
    #[arg(long)]
    fiscal_years: Option<String>,

    /// Only load records updated on or after this date (YYYY-MM-DD)
    #[arg(long)]
    starting_date: Option<NaiveDate>,

    /// Build a new index generation instead of writing through the write alias
    #[arg(long)]
    create_new_index: bool,

    /// Name of the new index generation
    #[arg(long, requires = "create_new_index")]
    index_name: Option<String>,

    /// Delete stale copies before reinserting, and reconcile deletion manifests
    #[arg(long)]
    process_deletes: bool,

    /// Skip validating exported row counts
    #[arg(long)]
    skip_counts: bool,

    /// Snapshot the new index after the alias swap
    #[arg(long, requires = "create_new_index")]
    snapshot: bool,

    /// Directory for export files
    #[arg(long)]
    working_dir: Option<PathBuf>,
}

impl LoadArgs {
    fn apply(self, config: &mut EtlConfig) -> Result<()> {
        if let Some(years) = self.fiscal_years {
            config.pipeline.fiscal_years = parse_fiscal_years(&years)?;
        }
        if self.starting_date.is_some() {
            config.pipeline.starting_date = self.starting_date;
        }
        if let Some(dir) = self.working_dir {
            config.pipeline.working_dir = dir;
        }
        if self.index_name.is_some() {
            config.pipeline.index_name = self.index_name;
        }
        config.pipeline.create_new_index |= self.create_new_index;
        config.pipeline.process_deletes |= self.process_deletes;
        config.pipeline.skip_counts |= self.skip_counts;
        config.pipeline.take_snapshot |= self.snapshot;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("txsearch-etl")
        .filter_directives("sqlx=warn,aws_config=warn,aws_smithy_runtime=warn")
        .build()
        // Environment variables take precedence
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    if let Err(e) = run(cli.command).await {
        error!(stage = %Stage::Main, error = %e, "Fatal error, exiting");
        return Err(e);
    }

    info!(stage = %Stage::Main, "Done");
    Ok(())
}

async fn run(command: Command) -> Result<()> {
    let mut config = EtlConfig::from_env().context("Failed to load configuration")?;

    match command {
        Command::Load(args) => {
            args.apply(&mut config)?;
            config.validate()?;

            let source = Arc::new(PgRowSource::connect(&config.database).await?);
            let engine = Arc::new(HttpSearchClient::from_config(&config.search)?);

            let mut pipeline = Pipeline::new(config, source, engine);
            let config = pipeline.config();
            if config.pipeline.process_deletes && !config.pipeline.create_new_index {
                pipeline = pipeline.with_manifests(manifest_store().await?);
            }

            let report = pipeline.run().await?;
            info!(
                stage = %Stage::Main,
                index = %report.target_index,
                jobs = report.jobs.len(),
                rows = report.rows(),
                failed = report.failed_documents(),
                "Load complete"
            );
        }
        Command::ReconcileDeletes { starting_date } => {
            if starting_date.is_some() {
                config.pipeline.starting_date = starting_date;
            }
            config.validate()?;

            let store = manifest_store().await?;
            let engine = HttpSearchClient::from_config(&config.search)?;
            let summary = reconcile_deleted_manifests(
                &engine,
                store.as_ref(),
                &config.index_pattern(),
                cutover(&config),
                config.pipeline.delete_batch_size,
            )
            .await?;
            info!(
                stage = %Stage::Delete,
                requested = summary.requested,
                removed = summary.removed(),
                failed_batches = summary.failed_batches,
                "Reconciliation complete"
            );
        }
        Command::SwapAliases { index } => {
            let retired = lifecycle(&config)?.swap_aliases(&index).await?;
            info!(stage = %Stage::AliasPut, "Aliases moved to {}; retired {:?}", index, retired);
        }
        Command::FinalizeSettings { index } => {
            lifecycle(&config)?.finalize_settings(&index).await?;
        }
        Command::Snapshot { index, repository } => {
            let repository = repository
                .or_else(|| config.search.snapshot_repository.clone())
                .context("No snapshot repository given and ES_SNAPSHOT_REPOSITORY is not set")?;
            lifecycle(&config)?.take_snapshot(&index, &repository).await?;
        }
    }

    Ok(())
}

fn lifecycle(config: &EtlConfig) -> Result<IndexLifecycle> {
    let engine: Arc<dyn SearchEngine> = Arc::new(HttpSearchClient::from_config(&config.search)?);
    Ok(IndexLifecycle::from_config(engine, &config.search))
}

async fn manifest_store() -> Result<Arc<dyn ManifestStore>> {
    let storage = StorageConfig::from_env()?;
    Ok(Arc::new(S3ManifestStore::new(storage).await?))
}
