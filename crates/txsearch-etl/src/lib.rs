//! Transaction Search ETL Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads transaction records from the relational store into the search
//! cluster, one fiscal year per job.
//!
//! - **Extraction**: count and export each fiscal year to a CSV file
//! - **Load**: decode the file in batches and bulk upsert the documents
//! - **Reconciliation**: delete identifiers listed in deletion manifests
//! - **Lifecycle**: category aliases, write alias, final settings, snapshots
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use txsearch_etl::config::EtlConfig;
//! use txsearch_etl::export::PgRowSource;
//! use txsearch_etl::pipeline::Pipeline;
//! use txsearch_etl::search::HttpSearchClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EtlConfig::from_env()?;
//!     config.validate()?;
//!
//!     let source = Arc::new(PgRowSource::connect(&config.database).await?);
//!     let engine = Arc::new(HttpSearchClient::from_config(&config.search)?);
//!     let report = Pipeline::new(config, source, engine).run().await?;
//!     println!("{} rows loaded", report.rows());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod job;
pub mod lifecycle;
pub mod manifest;
pub mod pipeline;
pub mod reconcile;
pub mod search;
pub mod sql;
pub mod storage;
pub mod supervisor;
pub mod transform;
pub mod workers;

pub use error::{EtlError, Result};
