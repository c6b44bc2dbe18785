//! Delete reconciliation
//!
//! Two entry points share the same batched delete-by-query routine:
//!
//! - [`delete_scoped`] runs inside the load worker before each batch is
//!   reinserted and touches only the job's target index.
//! - [`reconcile_deleted_manifests`] gathers identifiers from the deletion
//!   manifests in blob storage and removes them from every index generation.
//!
//! Scoped deletes only look at one index. Duplicates of the same record in
//! a different index generation are not found and are left in place.
//!
//! A failed delete batch is logged and skipped. Deletes are idempotent, so
//! rerunning the pass picks up whatever was missed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use txsearch_common::Stage;

use crate::error::Result;
use crate::manifest::{self, DeletedIds};
use crate::search::SearchEngine;
use crate::sql::TRANSACTION_ID_COLUMN;
use crate::storage::ManifestStore;
use crate::transform::Document;

/// Document field a delete has to match on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeleteColumn {
    /// `generated_unique_transaction_id`, e.g. `CONT_TX_9700_...`
    GeneratedUniqueTransactionId,
    /// Numeric `transaction_id`, for rows without a generated id
    TransactionId,
}

impl DeleteColumn {
    pub fn field(self) -> &'static str {
        match self {
            DeleteColumn::GeneratedUniqueTransactionId => TRANSACTION_ID_COLUMN,
            DeleteColumn::TransactionId => "transaction_id",
        }
    }

    /// Query clause matching any of `values` exactly
    pub fn filter(self, values: &[String]) -> Value {
        match self {
            DeleteColumn::GeneratedUniqueTransactionId => {
                json!({ "terms": { TRANSACTION_ID_COLUMN: values } })
            }
            DeleteColumn::TransactionId => json!({ "terms": { "transaction_id": values } }),
        }
    }
}

/// One identifier to delete and the field it is matched against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: String,
    pub column: DeleteColumn,
}

impl DeleteRequest {
    pub fn new(key: impl Into<String>, column: DeleteColumn) -> Self {
        Self {
            key: key.into(),
            column,
        }
    }
}

/// Totals reported by a delete pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub requested: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub before: u64,
    pub after: u64,
}

impl DeleteSummary {
    pub fn removed(&self) -> u64 {
        self.before.saturating_sub(self.after)
    }
}

/// Split `items` into consecutive slices of at most `size` items
pub fn chunks<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.max(1))
}

/// Group identifiers by column, keeping input order within a column
pub fn group_by_column(requests: &[DeleteRequest]) -> BTreeMap<DeleteColumn, Vec<String>> {
    let mut grouped: BTreeMap<DeleteColumn, Vec<String>> = BTreeMap::new();
    for request in requests {
        grouped
            .entry(request.column)
            .or_default()
            .push(request.key.clone());
    }
    grouped
}

/// Delete requests for every document in a batch
///
/// Documents are matched on their generated id, or on `transaction_id`
/// when the generated id is missing. Documents with neither are skipped.
pub fn requests_for_batch(batch: &[Document]) -> Vec<DeleteRequest> {
    batch
        .iter()
        .filter_map(|doc| {
            let by = |column: DeleteColumn| {
                doc.get(column.field())
                    .and_then(Value::as_str)
                    .map(|key| DeleteRequest::new(key, column))
            };
            by(DeleteColumn::GeneratedUniqueTransactionId)
                .or_else(|| by(DeleteColumn::TransactionId))
        })
        .collect()
}

/// Issue batched deletes for `requests` against `index`
///
/// Batch failures are logged and counted, never returned. Only the
/// before/after document counts can fail the call.
pub async fn delete_documents(
    engine: &dyn SearchEngine,
    index: &str,
    requests: &[DeleteRequest],
    batch_size: usize,
    job: Option<&str>,
) -> Result<DeleteSummary> {
    let start = Instant::now();
    let job = job.unwrap_or("");

    info!(stage = %Stage::Delete, job, "Deleting up to {} document(s)", requests.len());

    let mut summary = DeleteSummary {
        requested: requests.len(),
        before: engine.count(index).await?,
        ..DeleteSummary::default()
    };
    info!(stage = %Stage::Delete, job, index, "Starting document count {}", summary.before);

    for (column, values) in group_by_column(requests) {
        info!(stage = %Stage::Delete, job, "Deleting {} of \"{}\"", values.len(), column.field());

        for batch in chunks(&values, batch_size) {
            summary.batches += 1;
            match engine.delete_by_query(index, column, batch).await {
                Ok(deleted) => {
                    debug!(stage = %Stage::Delete, job, deleted, "Delete batch complete")
                }
                Err(e) => {
                    summary.failed_batches += 1;
                    error!(
                        stage = %Stage::Delete,
                        job,
                        error = %e,
                        batch_size = batch.len(),
                        "Delete batch failed, continuing"
                    );
                }
            }
        }
    }

    summary.after = engine.count(index).await?;
    info!(
        stage = %Stage::Delete,
        job,
        "ES Deletes took {:.2}s. Deleted {} records",
        start.elapsed().as_secs_f64(),
        summary.removed()
    );

    Ok(summary)
}

/// Remove a batch's previous versions from the job's own index
pub async fn delete_scoped(
    engine: &dyn SearchEngine,
    index: &str,
    batch: &[Document],
    batch_size: usize,
    job: &str,
) -> Result<DeleteSummary> {
    let requests = requests_for_batch(batch);
    delete_documents(engine, index, &requests, batch_size, Some(job)).await
}

/// Full reconciliation pass over the deletion manifests
///
/// Lists manifests modified on or after `cutover`, merges their identifiers
/// and deletes them from every index matching `index_pattern`.
pub async fn reconcile_deleted_manifests(
    engine: &dyn SearchEngine,
    store: &dyn ManifestStore,
    index_pattern: &str,
    cutover: DateTime<Utc>,
    batch_size: usize,
) -> Result<DeleteSummary> {
    let deleted = gather_deleted_ids(store, cutover).await?;
    let requests: Vec<DeleteRequest> = deleted
        .keys()
        .map(|id| DeleteRequest::new(id.clone(), DeleteColumn::GeneratedUniqueTransactionId))
        .collect();

    if requests.is_empty() {
        info!(stage = %Stage::Delete, "No deleted transactions to reconcile");
        return Ok(DeleteSummary::default());
    }

    delete_documents(engine, index_pattern, &requests, batch_size, None).await
}

/// Download and merge every eligible manifest
pub async fn gather_deleted_ids(
    store: &dyn ManifestStore,
    cutover: DateTime<Utc>,
) -> Result<DeletedIds> {
    let start = Instant::now();
    info!(stage = %Stage::Delete, %cutover, "Gathering deleted transactions from blob storage");

    let objects = store.list().await?;
    let eligible: Vec<_> = objects
        .into_iter()
        .filter(|object| manifest::is_eligible(object, cutover))
        .collect();
    info!(stage = %Stage::Delete, "Found {} manifest file(s)", eligible.len());

    let mut deleted = DeletedIds::new();
    for object in eligible {
        let contents = store.download(&object.key).await?;
        match manifest::parse(&contents) {
            Ok(Some(ids)) => manifest::merge(&mut deleted, ids, object.last_modified),
            Ok(None) => {
                warn!(stage = %Stage::Delete, key = %object.key, "[Missing valid col] in manifest, skipping")
            }
            Err(e) => {
                warn!(stage = %Stage::Delete, key = %object.key, error = %e, "Unreadable manifest, skipping")
            }
        }
    }

    for (id, last_modified) in &deleted {
        debug!(stage = %Stage::Delete, id = %id, %last_modified, "Deleted transaction");
    }

    info!(
        stage = %Stage::Delete,
        "Gathering {} deleted transactions took {:.2}s",
        deleted.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(deleted)
}
