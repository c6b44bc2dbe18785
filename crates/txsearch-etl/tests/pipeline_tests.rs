//! End-to-end pipeline runs against the in-memory row source and cluster
//!
//! Nothing here needs a database or a search cluster:
//! ```bash
//! cargo test -p txsearch-etl --test pipeline_tests
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use txsearch_etl::config::EtlConfig;
use txsearch_etl::export::InMemoryRowSource;
use txsearch_etl::job::{plan_jobs, JobMessage};
use txsearch_etl::lifecycle::{IndexLifecycle, AWARD_CATEGORIES};
use txsearch_etl::pipeline::Pipeline;
use txsearch_etl::search::{InMemorySearchEngine, SearchEngine};
use txsearch_etl::storage::InMemoryManifestStore;
use txsearch_etl::transform::Document;
use txsearch_etl::workers::{run_extract, ExtractSettings};
use txsearch_etl::EtlError;

// ============================================================================
// Test Helpers
// ============================================================================

const HEADER: &str = "generated_unique_transaction_id,type,business_categories,piid\n";

fn export(rows: &[(&str, &str, &str)]) -> String {
    let mut contents = HEADER.to_string();
    for (id, award_type, piid) in rows {
        contents.push_str(&format!("{},{},\"{{small_business}}\",{}\n", id, award_type, piid));
    }
    contents
}

fn test_config(working_dir: &Path, fiscal_years: Vec<i32>) -> EtlConfig {
    let mut config = EtlConfig::default();
    config.pipeline.working_dir = working_dir.to_path_buf();
    config.pipeline.fiscal_years = fiscal_years;
    config.pipeline.supervisor_poll = Duration::from_millis(10);
    config.pipeline.backpressure_poll = Duration::from_millis(10);
    config.pipeline.load_batch_size = 2;
    config
}

fn document(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

// ============================================================================
// Full rebuild
// ============================================================================

#[tokio::test]
async fn test_full_rebuild_takes_over_aliases() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(InMemorySearchEngine::new());

    let mut config = test_config(dir.path(), vec![2019, 2020]);
    config.pipeline.create_new_index = true;
    config.pipeline.index_name = Some("transaction-new".to_string());
    config.pipeline.take_snapshot = true;
    config.search.snapshot_repository = Some("backups".to_string());
    config.search.index_template = Some(json!({
        "index_patterns": ["transaction-*"],
        "settings": {"index": {"number_of_replicas": "0", "refresh_interval": "-1"}}
    }));

    engine.insert_index("transaction-old");
    IndexLifecycle::from_config(engine.clone(), &config.search)
        .create_aliases("transaction-old")
        .await
        .unwrap();

    let source = Arc::new(
        InMemoryRowSource::new()
            .with_export(2019, export(&[("CONT_TX_1", "A", "p1"), ("ASST_TX_2", "02", "")]))
            .with_export(2020, export(&[("CONT_TX_3", "IDV_A", "p3")])),
    );

    let report = Pipeline::new(config, source, engine.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.target_index, "transaction-new");
    assert_eq!(report.rows(), 3);
    assert_eq!(report.failed_documents(), 0);
    assert_eq!(report.retired_indices, vec!["transaction-old"]);
    assert!(report.deletes.is_none());

    assert_eq!(engine.index_names(), vec!["transaction-new"]);
    assert_eq!(engine.aliases_of("transaction-new").len(), AWARD_CATEGORIES.len() + 1);
    assert_eq!(
        engine.indices_with_alias("transaction-load-alias"),
        vec!["transaction-new"]
    );

    let contracts = engine.search_alias("transaction-query-contracts");
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0]["business_categories"], json!(["small_business"]));
    assert_eq!(engine.search_alias("transaction-query-grants").len(), 1);
    assert_eq!(engine.search_alias("transaction-query-idvs").len(), 1);

    let grant = engine.document("transaction-new", "ASST_TX_2").unwrap();
    assert_eq!(grant["piid"], json!(null));

    let settings = engine.settings("transaction-new").unwrap();
    assert_eq!(settings["number_of_replicas"], json!(1));
    assert_eq!(settings["refresh_interval"], json!("1s"));

    let snapshot = report.snapshot.unwrap();
    assert_eq!(
        engine.snapshots(),
        vec![("backups".to_string(), snapshot, "transaction-new".to_string())]
    );

    assert!(engine.template("transaction_template").is_some());
    assert!(!dir.path().join("2019_transactions.csv").exists());
    assert!(!dir.path().join("2020_transactions.csv").exists());
}

#[tokio::test]
async fn test_settings_are_finalized_before_aliases_move() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(InMemorySearchEngine::new());

    let mut config = test_config(dir.path(), vec![2020]);
    config.pipeline.create_new_index = true;
    config.pipeline.index_name = Some("transaction-new".to_string());

    let source = Arc::new(InMemoryRowSource::new().with_export(2020, export(&[("CONT_TX_1", "A", "p")])));
    Pipeline::new(config, source, engine.clone()).run().await.unwrap();

    let operations = engine.operations();
    let settings = operations
        .iter()
        .position(|op| op.starts_with("put_settings"))
        .unwrap();
    let first_alias = operations
        .iter()
        .position(|op| op.starts_with("put_alias"))
        .unwrap();
    assert!(settings < first_alias);
    assert!(!operations.iter().any(|op| op.starts_with("snapshot")));
}

// ============================================================================
// Incremental load
// ============================================================================

#[tokio::test]
async fn test_incremental_load_with_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(InMemorySearchEngine::new());
    engine.insert_index("transaction-2020");
    engine.insert_alias("transaction-2020", "transaction-load-alias", None);
    engine
        .bulk_upsert(
            "transaction-2020",
            &[
                document(json!({"generated_unique_transaction_id": "CONT_TX_A", "type": "A", "piid": "old"})),
                document(json!({"generated_unique_transaction_id": "CONT_TX_GONE", "type": "A", "piid": "x"})),
                document(json!({"generated_unique_transaction_id": "CONT_TX_KEEP", "type": "A", "piid": "y"})),
            ],
        )
        .await
        .unwrap();

    let manifests = Arc::new(InMemoryManifestStore::new());
    manifests.insert(
        "2024-01-05_deleted_transactions.csv",
        Utc.with_ymd_and_hms(2024, 1, 5, 3, 0, 0).unwrap(),
        "detached_award_proc_unique\ngone\n",
    );
    manifests.insert(
        "2023-12-01_deleted_transactions.csv",
        Utc.with_ymd_and_hms(2023, 12, 1, 3, 0, 0).unwrap(),
        "detached_award_proc_unique\nkeep\n",
    );

    let mut config = test_config(dir.path(), vec![2020]);
    config.pipeline.process_deletes = true;
    config.pipeline.starting_date = NaiveDate::from_ymd_opt(2024, 1, 1);

    let source = Arc::new(InMemoryRowSource::new().with_export(2020, export(&[("CONT_TX_A", "A", "new")])));
    let report = Pipeline::new(config, source.clone(), engine.clone())
        .with_manifests(manifests)
        .run()
        .await
        .unwrap();

    assert_eq!(report.target_index, "transaction-load-alias");
    assert_eq!(report.rows(), 1);
    let deletes = report.deletes.unwrap();
    assert_eq!(deletes.requested, 1);
    assert_eq!(deletes.removed(), 1);

    assert_eq!(
        engine.document_ids("transaction-2020"),
        vec!["CONT_TX_A", "CONT_TX_KEEP"]
    );
    assert_eq!(
        engine.document("transaction-2020", "CONT_TX_A").unwrap()["piid"],
        json!("new")
    );
    assert_eq!(engine.index_names(), vec!["transaction-2020"]);

    let filters = source.exported_filters();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].updated_since, NaiveDate::from_ymd_opt(2024, 1, 1));
}

#[tokio::test]
async fn test_deletes_without_manifest_store_fail() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), vec![2020]);
    config.pipeline.process_deletes = true;

    let err = Pipeline::new(
        config,
        Arc::new(InMemoryRowSource::new()),
        Arc::new(InMemorySearchEngine::new()),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, EtlError::Config(_)));
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_count_mismatch_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(InMemorySearchEngine::new());

    let mut config = test_config(dir.path(), vec![2020, 2021]);
    config.pipeline.create_new_index = true;
    config.pipeline.index_name = Some("transaction-new".to_string());

    let source = Arc::new(
        InMemoryRowSource::new()
            .with_export(2020, export(&[("CONT_TX_1", "A", "p")]))
            .with_count(2020, 5)
            .with_export(2021, export(&[("CONT_TX_2", "A", "p")])),
    );

    let err = Pipeline::new(config, source.clone(), engine.clone())
        .run()
        .await
        .unwrap_err();

    match err {
        EtlError::WorkerCrash { worker, reason } => {
            assert_eq!(worker, "extract");
            assert!(reason.contains("Expected: 5"), "reason: {}", reason);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(source.exported_filters().len(), 1);
    assert!(engine.indices_with_alias("transaction-load-alias").is_empty());
}

#[tokio::test]
async fn test_export_failure_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(InMemorySearchEngine::new());
    let config = test_config(dir.path(), vec![2020]);

    let source = Arc::new(InMemoryRowSource::new().failing(2020));
    let err = Pipeline::new(config, source, engine.clone())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, EtlError::WorkerCrash { .. }));
    assert!(engine.operations().iter().all(|op| !op.starts_with("bulk")));
}

// ============================================================================
// Backpressure
// ============================================================================

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_extraction_pauses_while_ready_queue_is_full() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(
        InMemoryRowSource::new()
            .with_export(2019, export(&[("CONT_TX_1", "A", "p")]))
            .with_export(2020, export(&[("CONT_TX_2", "A", "p")])),
    );

    let (pending_tx, pending_rx) = mpsc::channel(2);
    for job in plan_jobs(&[2019, 2020], "transaction-new", dir.path()) {
        pending_tx.send(JobMessage::Job(job)).await.unwrap();
    }
    drop(pending_tx);

    let (ready_tx, mut ready_rx) = mpsc::channel(1);
    let settings = ExtractSettings {
        updated_since: None,
        skip_counts: false,
        backpressure_poll: Duration::from_millis(20),
    };
    let worker = tokio::spawn(run_extract(source.clone(), pending_rx, ready_tx, settings));

    wait_for(|| source.exported_filters().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.exported_filters().len(), 1);

    match ready_rx.recv().await.unwrap() {
        JobMessage::Job(job) => assert_eq!(job.name, "2019_transactions"),
        JobMessage::Sentinel => panic!("sentinel before jobs"),
    }

    wait_for(|| source.exported_filters().len() == 2).await;
    match ready_rx.recv().await.unwrap() {
        JobMessage::Job(job) => {
            assert_eq!(job.name, "2020_transactions");
            assert_eq!(job.expected_count, Some(1));
        }
        JobMessage::Sentinel => panic!("sentinel before jobs"),
    }
    assert!(matches!(ready_rx.recv().await, Some(JobMessage::Sentinel)));
    assert!(ready_rx.recv().await.is_none());

    worker.await.unwrap().unwrap();
}
