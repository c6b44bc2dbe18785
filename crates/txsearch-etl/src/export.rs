//! Relational export
//!
//! The extraction worker reads rows through [`RowSource`]. The Postgres
//! implementation streams `COPY ... TO STDOUT` straight into the export file.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{EtlError, Result};
use crate::sql::{self, ExportFilter};

/// Source of exported rows for one fiscal-year partition
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Rows the export for `filter` is expected to write
    async fn count(&self, filter: &ExportFilter) -> Result<i64>;

    /// Write the rows for `filter` to `path` as comma delimited text with a
    /// header row
    async fn export(&self, filter: &ExportFilter, path: &Path) -> Result<()>;
}

/// Rows read from a Postgres view
pub struct PgRowSource {
    pool: PgPool,
    view: String,
}

impl PgRowSource {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if !sql::is_valid_view_name(&config.view_name) {
            return Err(EtlError::config(format!(
                "Invalid export view name '{}'",
                config.view_name
            )));
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await?;

        info!(view = %config.view_name, "Connected to relational store");

        Ok(Self {
            pool,
            view: config.view_name.clone(),
        })
    }
}

#[async_trait]
impl RowSource for PgRowSource {
    async fn count(&self, filter: &ExportFilter) -> Result<i64> {
        let statement = sql::count_statement(&self.view, filter);
        debug!(%statement, "Running count query");

        let count = sqlx::query_scalar::<_, i64>(&statement)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn export(&self, filter: &ExportFilter, path: &Path) -> Result<()> {
        let statement = sql::export_statement(&self.view, filter);
        debug!(%statement, path = %path.display(), "Running export");

        let mut stream = self.pool.copy_out_raw(&statement).await?;
        let mut file = File::create(path).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(bytes = written, path = %path.display(), "Export written");
        Ok(())
    }
}

/// Rows held in memory, keyed by fiscal year
///
/// Each entry is the complete export text, header included. A count
/// override makes the count query disagree with the file.
#[derive(Debug, Default)]
pub struct InMemoryRowSource {
    exports: Mutex<BTreeMap<i32, String>>,
    count_overrides: Mutex<BTreeMap<i32, i64>>,
    failing: Mutex<BTreeSet<i32>>,
    filters: Mutex<Vec<ExportFilter>>,
}

impl InMemoryRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_export(self, fiscal_year: i32, contents: impl Into<String>) -> Self {
        self.exports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fiscal_year, contents.into());
        self
    }

    /// Make the count query for `fiscal_year` report `count`
    pub fn with_count(self, fiscal_year: i32, count: i64) -> Self {
        self.count_overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fiscal_year, count);
        self
    }

    /// Make the export for `fiscal_year` fail
    pub fn failing(self, fiscal_year: i32) -> Self {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fiscal_year);
        self
    }

    /// Filters passed to `export`, in call order
    pub fn exported_filters(&self) -> Vec<ExportFilter> {
        self.filters.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn contents(&self, fiscal_year: i32) -> String {
        self.exports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&fiscal_year)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RowSource for InMemoryRowSource {
    async fn count(&self, filter: &ExportFilter) -> Result<i64> {
        if let Some(count) = self
            .count_overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&filter.fiscal_year)
        {
            return Ok(*count);
        }

        let contents = self.contents(filter.fiscal_year);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(contents.as_bytes());
        let mut count = 0;
        for record in reader.byte_records() {
            record?;
            count += 1;
        }
        Ok(count)
    }

    async fn export(&self, filter: &ExportFilter, path: &Path) -> Result<()> {
        self.filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(*filter);

        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&filter.fiscal_year)
        {
            return Err(EtlError::Io(std::io::Error::other(format!(
                "export for fiscal year {} failed",
                filter.fiscal_year
            ))));
        }

        tokio::fs::write(path, self.contents(filter.fiscal_year)).await?;
        Ok(())
    }
}
