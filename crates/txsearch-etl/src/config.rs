//! Configuration management

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EtlError, Result};

// ============================================================================
// Loader Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/data_store_api";

/// Default maximum database connections. Only the extraction worker uses the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 2;

/// Default relational view the export reads from.
pub const DEFAULT_VIEW_NAME: &str = "transaction_delta_view";

/// Default search cluster URL.
pub const DEFAULT_SEARCH_URL: &str = "http://localhost:9200";

/// Default search request timeout in seconds. Bulk batches are large.
pub const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_ROOT_INDEX: &str = "transaction";
pub const DEFAULT_QUERY_ALIAS_PREFIX: &str = "transaction-query";
pub const DEFAULT_WRITE_ALIAS: &str = "transaction-load-alias";

/// Rows per bulk batch.
pub const DEFAULT_LOAD_BATCH_SIZE: usize = 250_000;

/// Identifiers per delete-by-query request.
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 1_000;

/// Exported files allowed to wait for the load worker.
pub const DEFAULT_READY_QUEUE_CAPACITY: usize = 10;

/// Extraction pause while the ready queue is full.
pub const DEFAULT_BACKPRESSURE_POLL_SECS: u64 = 60;

/// Supervisor polling interval.
pub const DEFAULT_SUPERVISOR_POLL_SECS: u64 = 10;

/// First fiscal year with transaction data.
pub const DEFAULT_FIRST_FISCAL_YEAR: i32 = 2001;

/// Loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub database: DatabaseConfig,
    pub search: SearchConfig,
    pub pipeline: PipelineConfig,
}

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// View the count and export statements read from
    pub view_name: String,
}

/// Search cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub url: String,
    pub timeout_secs: u64,
    /// Every index generation is named `{root_index}-...`
    pub root_index: String,
    pub query_alias_prefix: String,
    pub write_alias: String,
    pub snapshot_repository: Option<String>,
    /// Settings applied once a full rebuild is loaded
    pub final_index_settings: serde_json::Map<String, serde_json::Value>,
    /// Index template installed before a full rebuild
    pub index_template: Option<serde_json::Value>,
}

/// Pipeline behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub working_dir: PathBuf,
    pub fiscal_years: Vec<i32>,
    /// Lower bound on `update_date` and cutover date for deletion manifests
    pub starting_date: Option<NaiveDate>,
    pub process_deletes: bool,
    pub skip_counts: bool,
    /// Full rebuild into a fresh index generation instead of the write alias
    pub create_new_index: bool,
    pub index_name: Option<String>,
    pub take_snapshot: bool,
    pub load_batch_size: usize,
    pub delete_batch_size: usize,
    pub ready_queue_capacity: usize,
    pub backpressure_poll: Duration,
    pub supervisor_poll: Duration,
}

impl EtlConfig {
    /// Load configuration from environment and defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let final_index_settings = match std::env::var("ETL_FINAL_SETTINGS_FILE") {
            Ok(path) => load_final_settings(&PathBuf::from(path))?,
            Err(_) => default_final_settings(),
        };

        let index_template = match std::env::var("ETL_INDEX_TEMPLATE_FILE") {
            Ok(path) => Some(read_json(&PathBuf::from(path))?),
            Err(_) => None,
        };

        let fiscal_years = match std::env::var("ETL_FISCAL_YEARS") {
            Ok(raw) => parse_fiscal_years(&raw)?,
            Err(_) => all_fiscal_years(),
        };

        let starting_date = match std::env::var("ETL_STARTING_DATE") {
            Ok(raw) => Some(NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
                EtlError::config(format!("ETL_STARTING_DATE '{}' is not YYYY-MM-DD: {}", raw, e))
            })?),
            Err(_) => None,
        };

        let config = EtlConfig {
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                view_name: env_string("ES_TRANSACTIONS_ETL_VIEW_NAME", DEFAULT_VIEW_NAME),
            },
            search: SearchConfig {
                url: env_string("ES_HOSTNAME", DEFAULT_SEARCH_URL),
                timeout_secs: env_or("ES_TIMEOUT_SECS", DEFAULT_SEARCH_TIMEOUT_SECS),
                root_index: env_string("ES_ROOT_INDEX", DEFAULT_ROOT_INDEX),
                query_alias_prefix: env_string(
                    "ES_TRANSACTIONS_QUERY_ALIAS_PREFIX",
                    DEFAULT_QUERY_ALIAS_PREFIX,
                ),
                write_alias: env_string("ES_TRANSACTIONS_WRITE_ALIAS", DEFAULT_WRITE_ALIAS),
                snapshot_repository: std::env::var("ES_SNAPSHOT_REPOSITORY").ok(),
                final_index_settings,
                index_template,
            },
            pipeline: PipelineConfig {
                working_dir: std::env::var("ETL_WORKING_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| std::env::temp_dir()),
                fiscal_years,
                starting_date,
                process_deletes: env_or("ETL_PROCESS_DELETES", false),
                skip_counts: env_or("ETL_SKIP_COUNTS", false),
                create_new_index: env_or("ETL_CREATE_NEW_INDEX", false),
                index_name: std::env::var("ETL_INDEX_NAME").ok(),
                take_snapshot: env_or("ETL_TAKE_SNAPSHOT", false),
                load_batch_size: env_or("ETL_LOAD_BATCH_SIZE", DEFAULT_LOAD_BATCH_SIZE),
                delete_batch_size: env_or("ETL_DELETE_BATCH_SIZE", DEFAULT_DELETE_BATCH_SIZE),
                ready_queue_capacity: env_or(
                    "ETL_READY_QUEUE_CAPACITY",
                    DEFAULT_READY_QUEUE_CAPACITY,
                ),
                backpressure_poll: Duration::from_secs(env_or(
                    "ETL_BACKPRESSURE_POLL_SECS",
                    DEFAULT_BACKPRESSURE_POLL_SECS,
                )),
                supervisor_poll: Duration::from_secs(env_or(
                    "ETL_SUPERVISOR_POLL_SECS",
                    DEFAULT_SUPERVISOR_POLL_SECS,
                )),
            },
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(EtlError::config("Database URL cannot be empty"));
        }

        if !crate::sql::is_valid_view_name(&self.database.view_name) {
            return Err(EtlError::config(format!(
                "Invalid export view name '{}'",
                self.database.view_name
            )));
        }

        if self.search.url.is_empty() {
            return Err(EtlError::config("Search cluster URL cannot be empty"));
        }

        if self.pipeline.load_batch_size == 0 || self.pipeline.delete_batch_size == 0 {
            return Err(EtlError::config("Batch sizes must be greater than 0"));
        }

        if self.pipeline.ready_queue_capacity == 0 {
            return Err(EtlError::config("Ready queue capacity must be greater than 0"));
        }

        if self.pipeline.fiscal_years.is_empty() {
            return Err(EtlError::config("At least one fiscal year is required"));
        }

        if let Some(ref name) = self.pipeline.index_name {
            let prefix = format!("{}-", self.search.root_index);
            if !name.starts_with(&prefix) {
                return Err(EtlError::config(format!(
                    "Index name '{}' must start with '{}' so reconciliation can reach it",
                    name, prefix
                )));
            }
        }

        if self.pipeline.take_snapshot && self.search.snapshot_repository.is_none() {
            return Err(EtlError::config(
                "Snapshots requested but ES_SNAPSHOT_REPOSITORY is not set",
            ));
        }

        Ok(())
    }

    /// Index every job writes to: a new generation on a full rebuild,
    /// otherwise whatever the write alias points at.
    pub fn target_index(&self) -> String {
        if self.pipeline.create_new_index {
            self.pipeline.index_name.clone().unwrap_or_else(|| {
                format!(
                    "{}-{}",
                    self.search.root_index,
                    Utc::now().format("%Y%m%d%H%M%S")
                )
            })
        } else {
            self.search.write_alias.clone()
        }
    }

    /// Wildcard pattern matching every index generation
    pub fn index_pattern(&self) -> String {
        format!("{}-*", self.search.root_index)
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                view_name: DEFAULT_VIEW_NAME.to_string(),
            },
            search: SearchConfig {
                url: DEFAULT_SEARCH_URL.to_string(),
                timeout_secs: DEFAULT_SEARCH_TIMEOUT_SECS,
                root_index: DEFAULT_ROOT_INDEX.to_string(),
                query_alias_prefix: DEFAULT_QUERY_ALIAS_PREFIX.to_string(),
                write_alias: DEFAULT_WRITE_ALIAS.to_string(),
                snapshot_repository: None,
                final_index_settings: default_final_settings(),
                index_template: None,
            },
            pipeline: PipelineConfig {
                working_dir: std::env::temp_dir(),
                fiscal_years: all_fiscal_years(),
                starting_date: None,
                process_deletes: false,
                skip_counts: false,
                create_new_index: false,
                index_name: None,
                take_snapshot: false,
                load_batch_size: DEFAULT_LOAD_BATCH_SIZE,
                delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
                ready_queue_capacity: DEFAULT_READY_QUEUE_CAPACITY,
                backpressure_poll: Duration::from_secs(DEFAULT_BACKPRESSURE_POLL_SECS),
                supervisor_poll: Duration::from_secs(DEFAULT_SUPERVISOR_POLL_SECS),
            },
        }
    }
}

/// Settings applied after a full rebuild. Indices are built without
/// replicas and with refresh disabled.
pub fn default_final_settings() -> serde_json::Map<String, serde_json::Value> {
    let mut settings = serde_json::Map::new();
    settings.insert("number_of_replicas".to_string(), serde_json::json!(1));
    settings.insert("refresh_interval".to_string(), serde_json::json!("1s"));
    settings
}

/// Fiscal years from the first year with data through the current one.
/// The federal fiscal year starts on October 1st.
pub fn all_fiscal_years() -> Vec<i32> {
    let today = Utc::now().date_naive();
    let current = if today.month() >= 10 {
        today.year() + 1
    } else {
        today.year()
    };
    (DEFAULT_FIRST_FISCAL_YEAR..=current).collect()
}

/// Parse `"all"` or a comma separated list such as `"2019,2020"`
pub fn parse_fiscal_years(raw: &str) -> Result<Vec<i32>> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return Ok(all_fiscal_years());
    }

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i32>()
                .map_err(|_| EtlError::config(format!("Invalid fiscal year '{}'", s)))
        })
        .collect()
}

fn load_final_settings(path: &PathBuf) -> Result<serde_json::Map<String, serde_json::Value>> {
    let value = read_json(path)?;
    let settings = value.get("final_index_settings").cloned().unwrap_or(value);

    match settings {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(EtlError::config(format!(
            "{} does not contain a settings object",
            path.display()
        ))),
    }
}

fn read_json(path: &PathBuf) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        EtlError::config(format!("Unable to read {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
