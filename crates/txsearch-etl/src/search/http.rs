//! HTTP client for an Elasticsearch-compatible cluster

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{document_id, endpoints, AliasBinding, BulkOutcome, SearchEngine};
use crate::config::SearchConfig;
use crate::error::{EtlError, Result};
use crate::reconcile::DeleteColumn;
use crate::transform::Document;

/// Most documents sent in one `_bulk` request
pub const DEFAULT_BULK_CHUNK_DOCUMENTS: usize = 500;

/// Largest `_bulk` body sent in one request, kept under the cluster's
/// default `http.max_content_length`
pub const DEFAULT_BULK_CHUNK_BYTES: usize = 100 * 1024 * 1024;

/// Search cluster client over the REST API
pub struct HttpSearchClient {
    client: Client,
    base_url: String,
    chunk_documents: usize,
    chunk_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryResponse {
    #[serde(default)]
    deleted: u64,
}

#[derive(Debug, Deserialize)]
struct IndexAliases {
    #[serde(default)]
    aliases: Map<String, Value>,
}

impl HttpSearchClient {
    /// Create a new client
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            chunk_documents: DEFAULT_BULK_CHUNK_DOCUMENTS,
            chunk_bytes: DEFAULT_BULK_CHUNK_BYTES,
        })
    }

    /// Override the per-request caps used to split bulk uploads
    pub fn with_bulk_limits(mut self, documents: usize, bytes: usize) -> Self {
        self.chunk_documents = documents.max(1);
        self.chunk_bytes = bytes.max(1);
        self
    }

    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(config.url.clone(), Duration::from_secs(config.timeout_secs))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a request; transport failures and non-success statuses become
    /// [`EtlError::Transport`]
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| EtlError::transport(operation, e))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(EtlError::transport(
            operation,
            format!("{}: {}", status, body),
        ))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(operation, request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| EtlError::transport(operation, format!("unreadable response: {}", e)))
    }
}

/// Newline-delimited bulk body: one action line and one source line per document
/// Action and source lines for one document
fn bulk_entry(document: &Document) -> Result<String> {
    let action = match document_id(document) {
        Some(id) => json!({ "index": { "_id": id } }),
        None => json!({ "index": {} }),
    };
    let mut entry = serde_json::to_string(&action)?;
    entry.push('\n');
    entry.push_str(&serde_json::to_string(document)?);
    entry.push('\n');
    Ok(entry)
}

/// NDJSON bodies holding at most `max_documents` documents and, unless a
/// single document is larger, at most `max_bytes` bytes each
fn bulk_chunks(
    documents: &[Document],
    max_documents: usize,
    max_bytes: usize,
) -> Result<Vec<(usize, String)>> {
    let mut chunks = Vec::new();
    let mut body = String::new();
    let mut count = 0;

    for document in documents {
        let entry = bulk_entry(document)?;
        if count > 0 && (count >= max_documents || body.len() + entry.len() > max_bytes) {
            chunks.push((count, std::mem::take(&mut body)));
            count = 0;
        }
        body.push_str(&entry);
        count += 1;
    }

    if count > 0 {
        chunks.push((count, body));
    }
    Ok(chunks)
}

fn bulk_outcome(response: &BulkResponse) -> BulkOutcome {
    let mut outcome = BulkOutcome::default();
    for item in response.items.iter().flat_map(|entry| entry.values()) {
        if (200..300).contains(&item.status) && item.error.is_none() {
            outcome.succeeded += 1;
        } else {
            outcome.failed += 1;
        }
    }
    outcome
}

#[async_trait]
impl SearchEngine for HttpSearchClient {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        let url = endpoints::index_url(&self.base_url, index);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| EtlError::transport("index exists", e))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(EtlError::transport("index exists", status)),
        }
    }

    async fn create_index(&self, index: &str) -> Result<()> {
        let url = endpoints::index_url(&self.base_url, index);
        self.send("create index", self.client.put(&url)).await?;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let url = endpoints::refresh_url(&self.base_url, index);
        self.send("refresh", self.client.post(&url)).await?;
        Ok(())
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let url = endpoints::index_url(&self.base_url, &indices.join(","));
        self.send("delete indices", self.client.delete(&url)).await?;
        Ok(())
    }

    async fn get_aliases(&self, index: &str, alias_pattern: &str) -> Result<Vec<AliasBinding>> {
        let url = endpoints::aliases_url(&self.base_url, index, alias_pattern);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EtlError::transport("get aliases", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(EtlError::transport("get aliases", response.status()));
        }

        let body: HashMap<String, IndexAliases> = response
            .json()
            .await
            .map_err(|e| EtlError::transport("get aliases", e))?;

        let mut bindings: Vec<AliasBinding> = body
            .into_iter()
            .flat_map(|(index, entry)| {
                entry.aliases.into_iter().map(move |(alias, definition)| AliasBinding {
                    alias,
                    filter: definition.get("filter").cloned(),
                    index: index.clone(),
                })
            })
            .collect();
        bindings.sort_by(|a, b| (&a.index, &a.alias).cmp(&(&b.index, &b.alias)));

        Ok(bindings)
    }

    async fn put_alias(&self, binding: &AliasBinding) -> Result<()> {
        let url = endpoints::alias_url(&self.base_url, &binding.index, &binding.alias);
        let body = match &binding.filter {
            Some(filter) => json!({ "filter": filter }),
            None => json!({}),
        };
        self.send("put alias", self.client.put(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_alias(&self, index: &str, alias: &str) -> Result<()> {
        let url = endpoints::alias_url(&self.base_url, index, alias);
        self.send("delete alias", self.client.delete(&url)).await?;
        Ok(())
    }

    async fn delete_aliases(&self, index: &str) -> Result<()> {
        let url = endpoints::alias_url(&self.base_url, index, "_all");
        self.send("delete aliases", self.client.delete(&url)).await?;
        Ok(())
    }

    async fn get_settings(&self, index: &str) -> Result<Map<String, Value>> {
        let url = endpoints::settings_url(&self.base_url, index);
        let body: Map<String, Value> = self.send_json("get settings", self.client.get(&url)).await?;

        let settings = body
            .into_iter()
            .next()
            .and_then(|(_, entry)| entry.get("settings")?.get("index")?.as_object().cloned())
            .ok_or_else(|| EtlError::transport("get settings", format!("no settings for {}", index)))?;

        Ok(settings)
    }

    async fn put_settings(&self, index: &str, settings: &Map<String, Value>) -> Result<()> {
        let url = endpoints::settings_url(&self.base_url, index);
        let body = json!({ "index": settings });
        self.send("put settings", self.client.put(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn put_template(&self, name: &str, template: &Value) -> Result<()> {
        let url = endpoints::template_url(&self.base_url, name);
        self.send("put template", self.client.put(&url).json(template))
            .await?;
        Ok(())
    }

    async fn bulk_upsert(&self, index: &str, documents: &[Document]) -> Result<BulkOutcome> {
        if documents.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let url = endpoints::bulk_url(&self.base_url, index);
        let mut outcome = BulkOutcome::default();

        for (count, body) in bulk_chunks(documents, self.chunk_documents, self.chunk_bytes)? {
            debug!(index, documents = count, bytes = body.len(), "Sending bulk request");

            let request = self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(body);
            let response: BulkResponse = self.send_json("bulk", request).await?;
            outcome.merge(bulk_outcome(&response));
        }

        Ok(outcome)
    }

    async fn delete_by_query(
        &self,
        index: &str,
        column: DeleteColumn,
        values: &[String],
    ) -> Result<u64> {
        let url = endpoints::delete_by_query_url(&self.base_url, index);
        let body = json!({ "query": column.filter(values) });
        let response: DeleteByQueryResponse = self
            .send_json("delete by query", self.client.post(&url).json(&body))
            .await?;
        Ok(response.deleted)
    }

    async fn count(&self, index: &str) -> Result<u64> {
        let url = endpoints::count_url(&self.base_url, index);
        let response: CountResponse = self.send_json("count", self.client.get(&url)).await?;
        Ok(response.count)
    }

    async fn create_snapshot(&self, repository: &str, snapshot: &str, index: &str) -> Result<()> {
        let url = endpoints::snapshot_url(&self.base_url, repository, snapshot);
        let body = json!({ "indices": index });
        self.send("snapshot", self.client.put(&url).json(&body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpSearchClient {
        HttpSearchClient::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn document(id: &str) -> Document {
        let mut doc = Document::new();
        doc.insert("generated_unique_transaction_id".to_string(), json!(id));
        doc.insert("piid".to_string(), json!("0001"));
        doc
    }

    #[test]
    fn test_bulk_body_uses_transaction_id() {
        let mut anonymous = Document::new();
        anonymous.insert("piid".to_string(), json!("9"));

        let chunks = bulk_chunks(
            &[document("CONT_TX_1"), anonymous],
            DEFAULT_BULK_CHUNK_DOCUMENTS,
            DEFAULT_BULK_CHUNK_BYTES,
        )
        .unwrap();
        assert_eq!(chunks.len(), 1);
        let (count, body) = &chunks[0];
        assert_eq!(*count, 2);
        let lines: Vec<&str> = body.lines().collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], r#"{"index":{"_id":"CONT_TX_1"}}"#);
        assert_eq!(lines[2], r#"{"index":{}}"#);
        assert!(body.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_bulk_counts_item_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction-1/_bulk"))
            .and(body_string_contains("CONT_TX_2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "took": 3,
                "errors": true,
                "items": [
                    {"index": {"_id": "CONT_TX_1", "status": 201}},
                    {"index": {"_id": "CONT_TX_2", "status": 400, "error": {"type": "mapper_parsing_exception"}}}
                ]
            })))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .bulk_upsert("transaction-1", &[document("CONT_TX_1"), document("CONT_TX_2")])
            .await
            .unwrap();

        assert_eq!(outcome, BulkOutcome { succeeded: 1, failed: 1 });
    }

    /// Acknowledge every document in a bulk body as created
    fn acknowledge_all(request: &wiremock::Request) -> ResponseTemplate {
        let lines = request
            .body
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .count();
        let documents = lines / 2;
        let items: Vec<Value> = (0..documents)
            .map(|_| json!({"index": {"status": 201}}))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": items}))
    }

    #[tokio::test]
    async fn test_large_batch_is_split_by_document_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction-1/_bulk"))
            .respond_with(acknowledge_all)
            .mount(&server)
            .await;

        let documents: Vec<Document> = (0..1_200)
            .map(|i| document(&format!("CONT_TX_{}", i)))
            .collect();
        let outcome = client(&server)
            .bulk_upsert("transaction-1", &documents)
            .await
            .unwrap();

        assert_eq!(outcome, BulkOutcome { succeeded: 1_200, failed: 0 });
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.body.split(|b| *b == b'\n').count() <= 2 * 500 + 1));
    }

    #[tokio::test]
    async fn test_large_batch_is_split_by_size() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction-1/_bulk"))
            .respond_with(acknowledge_all)
            .mount(&server)
            .await;

        let documents: Vec<Document> = (0..10)
            .map(|i| document(&format!("CONT_TX_{}", i)))
            .collect();
        let entry_bytes = bulk_entry(&documents[0]).unwrap().len();
        let outcome = client(&server)
            .with_bulk_limits(500, entry_bytes * 4)
            .bulk_upsert("transaction-1", &documents)
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, 10);
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.body.len() <= entry_bytes * 4));
    }

    #[test]
    fn test_oversized_document_is_sent_alone() {
        let documents = vec![document("CONT_TX_1"), document("CONT_TX_2")];
        let chunks = bulk_chunks(&documents, 500, 1).unwrap();

        let counts: Vec<usize> = chunks.iter().map(|(count, _)| *count).collect();
        assert_eq!(counts, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_error_status_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/transaction-*/_count"))
            .respond_with(ResponseTemplate::new(503).set_body_string("cluster unavailable"))
            .mount(&server)
            .await;

        let err = client(&server).count("transaction-*").await.unwrap_err();
        match err {
            EtlError::Transport { operation, message } => {
                assert_eq!(operation, "count");
                assert!(message.contains("503"));
                assert!(message.contains("cluster unavailable"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_by_query_sends_terms_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction-*/_delete_by_query"))
            .and(query_param("refresh", "true"))
            .and(query_param("conflicts", "proceed"))
            .and(body_json(json!({
                "query": {"terms": {"generated_unique_transaction_id": ["A", "B"]}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deleted": 2})))
            .mount(&server)
            .await;

        let deleted = client(&server)
            .delete_by_query(
                "transaction-*",
                DeleteColumn::GeneratedUniqueTransactionId,
                &["A".to_string(), "B".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn test_get_aliases() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/transaction-*/_alias/transaction-query-*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transaction-1": {"aliases": {
                    "transaction-query-loans": {"filter": {"terms": {"type": ["07", "08"]}}},
                    "transaction-query-contracts": {}
                }}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/transaction-*/_alias/nothing-*"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"status": 404})))
            .mount(&server)
            .await;

        let client = client(&server);
        let bindings = client
            .get_aliases("transaction-*", "transaction-query-*")
            .await
            .unwrap();

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].alias, "transaction-query-contracts");
        assert_eq!(bindings[0].filter, None);
        assert_eq!(bindings[1].index, "transaction-1");
        assert_eq!(
            bindings[1].filter,
            Some(json!({"terms": {"type": ["07", "08"]}}))
        );

        assert!(client
            .get_aliases("transaction-*", "nothing-*")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_get_settings_reads_index_block() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/transaction-1/_settings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transaction-1": {"settings": {"index": {
                    "number_of_replicas": "0",
                    "refresh_interval": "-1"
                }}}
            })))
            .mount(&server)
            .await;

        let settings = client(&server).get_settings("transaction-1").await.unwrap();
        assert_eq!(settings.get("number_of_replicas"), Some(&json!("0")));
        assert_eq!(settings.get("refresh_interval"), Some(&json!("-1")));
    }

    #[tokio::test]
    async fn test_index_exists() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/transaction-1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/transaction-2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(client.index_exists("transaction-1").await.unwrap());
        assert!(!client.index_exists("transaction-2").await.unwrap());
    }
}
