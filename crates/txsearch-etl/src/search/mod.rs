//! Search cluster access
//!
//! The loader talks to the cluster only through [`SearchEngine`]. The HTTP
//! implementation speaks the Elasticsearch REST API; the in-memory one keeps
//! the same semantics for local runs and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::reconcile::DeleteColumn;
use crate::transform::Document;

pub mod endpoints;
pub mod http;
pub mod memory;

pub use http::HttpSearchClient;
pub use memory::InMemorySearchEngine;

/// An alias pointing at one concrete index, optionally filtered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasBinding {
    pub alias: String,
    pub filter: Option<Value>,
    pub index: String,
}

/// Per-document results of one bulk request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub succeeded: u64,
    pub failed: u64,
}

impl BulkOutcome {
    pub fn merge(&mut self, other: BulkOutcome) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

/// Operations the loader needs from the search cluster
///
/// `index` arguments accept a concrete index, an alias, or a `*` pattern
/// wherever the cluster does.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Create an empty index; mappings come from installed templates
    async fn create_index(&self, index: &str) -> Result<()>;

    async fn refresh(&self, index: &str) -> Result<()>;

    async fn delete_indices(&self, indices: &[String]) -> Result<()>;

    /// Aliases on indices matching `index` whose names match `alias_pattern`.
    /// Matching nothing is an empty list, not an error.
    async fn get_aliases(&self, index: &str, alias_pattern: &str) -> Result<Vec<AliasBinding>>;

    async fn put_alias(&self, binding: &AliasBinding) -> Result<()>;

    /// Remove one alias from `index`
    async fn delete_alias(&self, index: &str, alias: &str) -> Result<()>;

    /// Remove every alias from `index`
    async fn delete_aliases(&self, index: &str) -> Result<()>;

    /// Flat `index.*` settings of a concrete index
    async fn get_settings(&self, index: &str) -> Result<serde_json::Map<String, Value>>;

    async fn put_settings(&self, index: &str, settings: &serde_json::Map<String, Value>)
        -> Result<()>;

    async fn put_template(&self, name: &str, template: &Value) -> Result<()>;

    /// Index or replace documents. Documents carrying a
    /// `generated_unique_transaction_id` use it as their document id.
    async fn bulk_upsert(&self, index: &str, documents: &[Document]) -> Result<BulkOutcome>;

    /// Delete documents whose `column` matches one of `values`; returns the
    /// number deleted
    async fn delete_by_query(&self, index: &str, column: DeleteColumn, values: &[String])
        -> Result<u64>;

    async fn count(&self, index: &str) -> Result<u64>;

    async fn create_snapshot(&self, repository: &str, snapshot: &str, index: &str) -> Result<()>;
}

/// Document id used for idempotent reinserts
pub fn document_id(document: &Document) -> Option<&str> {
    document
        .get(crate::sql::TRANSACTION_ID_COLUMN)
        .and_then(Value::as_str)
}
