//! Index lifecycle: aliases, post-load settings and snapshots
//!
//! Every index generation is named `{root}-...`. Readers go through one
//! filtered query alias per award category, and incremental loads write
//! through a single write alias. A full rebuild loads a fresh generation,
//! finalizes its settings, then moves every alias onto it and drops the
//! generations left without aliases.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use txsearch_common::Stage;

use crate::config::SearchConfig;
use crate::error::Result;
use crate::search::{AliasBinding, SearchEngine};

/// A group of award type codes exposed through one query alias
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwardCategory {
    pub name: &'static str,
    pub type_codes: &'static [&'static str],
}

pub const AWARD_CATEGORIES: [AwardCategory; 6] = [
    AwardCategory {
        name: "contracts",
        type_codes: &["A", "B", "C", "D"],
    },
    AwardCategory {
        name: "idvs",
        type_codes: &[
            "IDV_A", "IDV_B", "IDV_B_A", "IDV_B_B", "IDV_B_C", "IDV_C", "IDV_D", "IDV_E",
        ],
    },
    AwardCategory {
        name: "grants",
        type_codes: &["02", "03", "04", "05"],
    },
    AwardCategory {
        name: "directpayments",
        type_codes: &["06", "10"],
    },
    AwardCategory {
        name: "loans",
        type_codes: &["07", "08"],
    },
    AwardCategory {
        name: "other",
        type_codes: &["09", "11"],
    },
];

impl AwardCategory {
    /// Alias filter matching this category's type codes on `type`
    pub fn filter(&self) -> Value {
        json!({ "terms": { "type": self.type_codes } })
    }
}

/// Alias and settings operations against one search cluster
pub struct IndexLifecycle {
    engine: Arc<dyn SearchEngine>,
    query_alias_prefix: String,
    write_alias: String,
    final_settings: Map<String, Value>,
}

impl IndexLifecycle {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        query_alias_prefix: impl Into<String>,
        write_alias: impl Into<String>,
        final_settings: Map<String, Value>,
    ) -> Self {
        Self {
            engine,
            query_alias_prefix: query_alias_prefix.into(),
            write_alias: write_alias.into(),
            final_settings,
        }
    }

    pub fn from_config(engine: Arc<dyn SearchEngine>, config: &SearchConfig) -> Self {
        Self::new(
            engine,
            config.query_alias_prefix.clone(),
            config.write_alias.clone(),
            config.final_index_settings.clone(),
        )
    }

    pub fn query_alias(&self, category: &AwardCategory) -> String {
        format!("{}-{}", self.query_alias_prefix, category.name)
    }

    pub fn write_alias(&self) -> &str {
        &self.write_alias
    }

    /// Point every category alias and the write alias at `index`
    ///
    /// The write alias is first removed from any other index so it never
    /// resolves to more than one.
    pub async fn create_aliases(&self, index: &str) -> Result<()> {
        for category in &AWARD_CATEGORIES {
            let alias = self.query_alias(category);
            info!(
                stage = %Stage::AliasPut,
                "Putting alias '{}' on {} with award codes {:?}",
                alias,
                index,
                category.type_codes
            );
            self.engine
                .put_alias(&AliasBinding {
                    alias,
                    filter: Some(category.filter()),
                    index: index.to_string(),
                })
                .await?;
        }

        let stale = self.engine.get_aliases("*", &self.write_alias).await?;
        for binding in stale.iter().filter(|b| b.index != index) {
            info!(
                stage = %Stage::AliasDrop,
                "Removing write alias '{}' from {}",
                binding.alias,
                binding.index
            );
            self.engine.delete_alias(&binding.index, &binding.alias).await?;
        }

        info!(stage = %Stage::AliasPut, "Putting alias '{}' on {}", self.write_alias, index);
        self.engine
            .put_alias(&AliasBinding {
                alias: self.write_alias.clone(),
                filter: None,
                index: index.to_string(),
            })
            .await
    }

    /// Move every alias onto `new_index` and retire the old generations
    ///
    /// Finding old indices, stripping their aliases and deleting them are
    /// best-effort. Returns the indices that were retired.
    pub async fn swap_aliases(&self, new_index: &str) -> Result<Vec<String>> {
        if !self.engine.get_aliases(new_index, "*").await?.is_empty() {
            info!(stage = %Stage::AliasDrop, "Removing existing aliases from {}", new_index);
            self.engine.delete_aliases(new_index).await?;
        }

        let pattern = format!("{}*", self.query_alias_prefix);
        let old_indices: BTreeSet<String> = match self.engine.get_aliases("*", &pattern).await {
            Ok(bindings) => bindings
                .into_iter()
                .map(|binding| binding.index)
                .filter(|index| index != new_index)
                .collect(),
            Err(e) => {
                warn!(stage = %Stage::AliasDrop, error = %e, "Unable to list aliases on old indices");
                BTreeSet::new()
            }
        };

        let mut retired = Vec::new();
        for index in old_indices {
            info!(stage = %Stage::AliasDrop, "Removing aliases from {}", index);
            match self.engine.delete_aliases(&index).await {
                Ok(()) => retired.push(index),
                Err(e) => {
                    warn!(stage = %Stage::AliasDrop, index = %index, error = %e, "Unable to remove aliases")
                }
            }
        }

        self.create_aliases(new_index).await?;

        if !retired.is_empty() {
            info!(stage = %Stage::AliasDrop, "Deleting retired indices {:?}", retired);
            if let Err(e) = self.engine.delete_indices(&retired).await {
                error!(stage = %Stage::AliasDrop, error = %e, "Unable to delete retired indices");
            }
        }

        Ok(retired)
    }

    /// Apply the post-load settings to `index` and refresh it
    pub async fn finalize_settings(&self, index: &str) -> Result<()> {
        let current = self.engine.get_settings(index).await?;

        for (key, value) in &self.final_settings {
            let before = current
                .get(key)
                .map(setting_text)
                .unwrap_or_else(|| "unset".to_string());
            let after = setting_text(value);
            if before != after {
                info!(
                    stage = %Stage::Settings,
                    "Changing {} from {} to {}",
                    key,
                    before,
                    after
                );
            }
        }

        self.engine.put_settings(index, &self.final_settings).await?;
        self.engine.refresh(index).await?;
        info!(stage = %Stage::Settings, "Final settings applied to {}", index);
        Ok(())
    }

    /// Snapshot `index` into `repository` as `{index}-{YYYY-MM-DD}`
    pub async fn take_snapshot(&self, index: &str, repository: &str) -> Result<String> {
        let snapshot = snapshot_name(index, Utc::now().date_naive());
        info!(stage = %Stage::Snapshot, "Taking snapshot {} in {}", snapshot, repository);

        if let Err(e) = self
            .engine
            .create_snapshot(repository, &snapshot, index)
            .await
        {
            error!(stage = %Stage::Snapshot, error = %e, "Unable to take snapshot");
            return Err(e);
        }

        info!(stage = %Stage::Snapshot, "Snapshot {} started", snapshot);
        Ok(snapshot)
    }
}

pub fn snapshot_name(index: &str, date: chrono::NaiveDate) -> String {
    format!("{}-{}", index, date.format("%Y-%m-%d"))
}

/// Settings come back from the cluster as strings; compare as text
fn setting_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::default_final_settings;
    use crate::search::InMemorySearchEngine;
    use chrono::NaiveDate;

    fn lifecycle(engine: Arc<InMemorySearchEngine>) -> IndexLifecycle {
        IndexLifecycle::new(
            engine,
            "transaction-query",
            "transaction-load-alias",
            default_final_settings(),
        )
    }

    #[test]
    fn test_categories_do_not_overlap() {
        let mut codes: Vec<&str> = AWARD_CATEGORIES
            .iter()
            .flat_map(|c| c.type_codes.iter().copied())
            .collect();
        let total = codes.len();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), total);
    }

    #[test]
    fn test_snapshot_name() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(snapshot_name("transaction-1", date), "transaction-1-2024-03-09");
    }

    #[tokio::test]
    async fn test_create_aliases_moves_write_alias() {
        let engine = Arc::new(InMemorySearchEngine::new());
        engine.insert_alias("transaction-old", "transaction-load-alias", None);
        engine.insert_index("transaction-new");

        lifecycle(engine.clone())
            .create_aliases("transaction-new")
            .await
            .unwrap();

        assert_eq!(
            engine.indices_with_alias("transaction-load-alias"),
            vec!["transaction-new"]
        );
        assert_eq!(engine.aliases_of("transaction-new").len(), 7);
        assert_eq!(
            engine.indices_with_alias("transaction-query-grants"),
            vec!["transaction-new"]
        );
    }

    #[tokio::test]
    async fn test_swap_aliases() {
        let engine = Arc::new(InMemorySearchEngine::new());
        let manager = lifecycle(engine.clone());
        engine.insert_index("transaction-old");
        manager.create_aliases("transaction-old").await.unwrap();
        engine.insert_alias("transaction-new", "stray", None);

        let retired = manager.swap_aliases("transaction-new").await.unwrap();

        assert_eq!(retired, vec!["transaction-old"]);
        assert_eq!(
            engine.indices_with_alias("transaction-load-alias"),
            vec!["transaction-new"]
        );
        for category in &AWARD_CATEGORIES {
            assert_eq!(
                engine.indices_with_alias(&manager.query_alias(category)),
                vec!["transaction-new"]
            );
        }
        assert!(!engine.aliases_of("transaction-new").contains(&"stray".to_string()));
        assert_eq!(engine.index_names(), vec!["transaction-new"]);
    }

    #[tokio::test]
    async fn test_swap_survives_failed_index_deletion() {
        let engine = Arc::new(InMemorySearchEngine::new());
        let manager = lifecycle(engine.clone());
        engine.insert_index("transaction-old");
        manager.create_aliases("transaction-old").await.unwrap();
        engine.insert_index("transaction-new");
        engine.fail_index_deletion(true);

        manager.swap_aliases("transaction-new").await.unwrap();

        assert!(engine.aliases_of("transaction-old").is_empty());
        assert!(engine.index_names().contains(&"transaction-old".to_string()));
    }

    #[tokio::test]
    async fn test_swap_survives_failed_alias_listing() {
        let engine = Arc::new(InMemorySearchEngine::new());
        let manager = lifecycle(engine.clone());
        engine.insert_index("transaction-old");
        manager.create_aliases("transaction-old").await.unwrap();
        engine.insert_index("transaction-new");
        engine.fail_alias_listing("transaction-query*");

        let retired = manager.swap_aliases("transaction-new").await.unwrap();

        assert!(retired.is_empty());
        assert_eq!(engine.aliases_of("transaction-new").len(), 7);
        assert_eq!(
            engine.indices_with_alias("transaction-load-alias"),
            vec!["transaction-new"]
        );
        assert!(engine.index_names().contains(&"transaction-old".to_string()));
    }

    #[tokio::test]
    async fn test_alias_put_failure_is_fatal() {
        let engine = Arc::new(InMemorySearchEngine::new());
        engine.insert_index("transaction-new");
        engine.fail_alias_put("transaction-query-loans");

        let err = lifecycle(engine.clone())
            .create_aliases("transaction-new")
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::EtlError::Transport { .. }));
        assert!(engine.indices_with_alias("transaction-load-alias").is_empty());
    }

    #[tokio::test]
    async fn test_finalize_settings() {
        let engine = Arc::new(InMemorySearchEngine::new());
        engine
            .put_template(
                "transaction_template",
                &json!({
                    "index_patterns": ["transaction-*"],
                    "settings": {"index": {"number_of_replicas": "0", "refresh_interval": "-1"}}
                }),
            )
            .await
            .unwrap();
        engine.create_index("transaction-new").await.unwrap();

        lifecycle(engine.clone())
            .finalize_settings("transaction-new")
            .await
            .unwrap();

        let settings = engine.settings("transaction-new").unwrap();
        assert_eq!(settings["number_of_replicas"], json!(1));
        assert_eq!(settings["refresh_interval"], json!("1s"));
    }

    #[tokio::test]
    async fn test_take_snapshot() {
        let engine = Arc::new(InMemorySearchEngine::new());
        engine.insert_index("transaction-new");

        let name = lifecycle(engine.clone())
            .take_snapshot("transaction-new", "backups")
            .await
            .unwrap();

        assert!(name.starts_with("transaction-new-"));
        assert_eq!(
            engine.snapshots(),
            vec![("backups".to_string(), name, "transaction-new".to_string())]
        );
    }
}
