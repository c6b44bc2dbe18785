//! In-memory search engine
//!
//! Mirrors the cluster behaviour the loader relies on: alias and wildcard
//! resolution, id-keyed upserts, filtered aliases, and settings. Failure
//! hooks let tests break individual calls.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use super::{document_id, AliasBinding, BulkOutcome, SearchEngine};
use crate::error::{EtlError, Result};
use crate::reconcile::DeleteColumn;
use crate::transform::Document;

#[derive(Debug, Default, Clone)]
struct IndexState {
    documents: BTreeMap<String, Document>,
    aliases: BTreeMap<String, Option<Value>>,
    settings: Map<String, Value>,
}

#[derive(Debug, Default)]
struct EngineState {
    indices: BTreeMap<String, IndexState>,
    templates: BTreeMap<String, Value>,
    snapshots: Vec<(String, String, String)>,
    operations: Vec<String>,
    next_auto_id: u64,
    delete_calls: usize,
    fail_bulk: bool,
    fail_create_index: bool,
    fail_index_deletion: bool,
    fail_delete_calls: BTreeSet<usize>,
    fail_alias_puts: BTreeSet<String>,
    fail_alias_listings: BTreeSet<String>,
    rejected_ids: BTreeSet<String>,
}

/// Search engine held entirely in memory
#[derive(Debug, Default)]
pub struct InMemorySearchEngine {
    state: Mutex<EngineState>,
}

/// `*` matches any run of characters; everything else is literal
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first) || name.len() < first.len() + last.len() || !name.ends_with(last) {
        return false;
    }

    let mut rest = &name[first.len()..name.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

fn default_settings() -> Map<String, Value> {
    let mut settings = Map::new();
    settings.insert("number_of_replicas".to_string(), Value::String("1".to_string()));
    settings.insert("refresh_interval".to_string(), Value::String("1s".to_string()));
    settings
}

fn matches_filter(document: &Document, filter: &Value) -> bool {
    let Some(terms) = filter.get("terms").and_then(Value::as_object) else {
        return true;
    };
    terms.iter().all(|(field, allowed)| {
        let allowed = allowed.as_array().map(Vec::as_slice).unwrap_or_default();
        document
            .get(field)
            .is_some_and(|value| allowed.iter().any(|a| a == value))
    })
}

fn field_matches(document: &Document, field: &str, values: &[String]) -> bool {
    match document.get(field) {
        Some(Value::String(s)) => values.iter().any(|v| v == s),
        Some(Value::Number(n)) => {
            let n = n.to_string();
            values.iter().any(|v| *v == n)
        }
        _ => false,
    }
}

impl EngineState {
    /// Concrete indices addressed by a name, alias, pattern, or comma list
    fn resolve(&self, target: &str) -> Vec<String> {
        let mut resolved = BTreeSet::new();
        for part in target.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part.contains('*') {
                resolved.extend(
                    self.indices
                        .keys()
                        .filter(|name| wildcard_match(part, name))
                        .cloned(),
                );
            } else if self.indices.contains_key(part) {
                resolved.insert(part.to_string());
            } else {
                resolved.extend(
                    self.indices
                        .iter()
                        .filter(|(_, state)| state.aliases.contains_key(part))
                        .map(|(name, _)| name.clone()),
                );
            }
        }
        resolved.into_iter().collect()
    }

    /// Resolve a read target; a missing concrete name is an error, an empty
    /// pattern match is not
    fn resolve_read(&self, operation: &str, target: &str) -> Result<Vec<String>> {
        let indices = self.resolve(target);
        if indices.is_empty() && !target.contains('*') {
            return Err(EtlError::transport(
                operation,
                format!("404: no such index [{}]", target),
            ));
        }
        Ok(indices)
    }

    /// Resolve a write target to exactly one index, creating it when the
    /// name is neither an index nor an alias
    fn resolve_write(&mut self, target: &str) -> Result<String> {
        let mut indices = self.resolve(target);
        match indices.len() {
            0 if !target.contains('*') => {
                self.create(target);
                Ok(target.to_string())
            }
            0 => Err(EtlError::transport(
                "bulk",
                format!("404: no index matches [{}]", target),
            )),
            1 => Ok(indices.remove(0)),
            _ => Err(EtlError::transport(
                "bulk",
                format!(
                    "400: alias [{}] has more than one index associated with it {:?}",
                    target, indices
                ),
            )),
        }
    }

    fn create(&mut self, index: &str) {
        let mut settings = default_settings();
        for template in self.templates.values() {
            let applies = template
                .get("index_patterns")
                .and_then(Value::as_array)
                .is_some_and(|patterns| {
                    patterns
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|p| wildcard_match(p, index))
                });
            if !applies {
                continue;
            }
            let template_settings = template
                .get("settings")
                .map(|s| s.get("index").unwrap_or(s))
                .and_then(Value::as_object);
            if let Some(template_settings) = template_settings {
                for (key, value) in template_settings {
                    settings.insert(key.clone(), value.clone());
                }
            }
        }

        self.indices.insert(
            index.to_string(),
            IndexState {
                settings,
                ..IndexState::default()
            },
        );
    }

    fn record(&mut self, operation: String) {
        self.operations.push(operation);
    }
}

impl InMemorySearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an index directly, bypassing failure hooks
    pub fn insert_index(&self, index: &str) {
        self.state().create(index);
    }

    /// Attach an alias directly, bypassing failure hooks
    pub fn insert_alias(&self, index: &str, alias: &str, filter: Option<Value>) {
        let mut state = self.state();
        if !state.indices.contains_key(index) {
            state.create(index);
        }
        if let Some(entry) = state.indices.get_mut(index) {
            entry.aliases.insert(alias.to_string(), filter);
        }
    }

    /// Make every bulk request fail
    pub fn fail_bulk(&self, fail: bool) {
        self.state().fail_bulk = fail;
    }

    /// Make index creation fail
    pub fn fail_create_index(&self, fail: bool) {
        self.state().fail_create_index = fail;
    }

    /// Make index deletion fail
    pub fn fail_index_deletion(&self, fail: bool) {
        self.state().fail_index_deletion = fail;
    }

    /// Make the `call`-th delete-by-query request (1-based) fail
    pub fn fail_delete_call(&self, call: usize) {
        self.state().fail_delete_calls.insert(call);
    }

    /// Make putting `alias` on any index fail
    pub fn fail_alias_put(&self, alias: &str) {
        self.state().fail_alias_puts.insert(alias.to_string());
    }

    /// Make listing aliases by exactly this pattern fail
    pub fn fail_alias_listing(&self, alias_pattern: &str) {
        self.state().fail_alias_listings.insert(alias_pattern.to_string());
    }

    /// Report the document with this id as failed in bulk responses
    pub fn reject_document(&self, id: &str) {
        self.state().rejected_ids.insert(id.to_string());
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state().indices.keys().cloned().collect()
    }

    /// Document ids stored in a concrete index
    pub fn document_ids(&self, index: &str) -> Vec<String> {
        self.state()
            .indices
            .get(index)
            .map(|state| state.documents.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Document> {
        self.state()
            .indices
            .get(index)
            .and_then(|state| state.documents.get(id).cloned())
    }

    /// Documents visible through an alias, applying its filter
    pub fn search_alias(&self, alias: &str) -> Vec<Document> {
        let state = self.state();
        state
            .indices
            .values()
            .filter_map(|index| index.aliases.get(alias).map(|filter| (index, filter)))
            .flat_map(|(index, filter)| {
                index
                    .documents
                    .values()
                    .filter(move |doc| filter.as_ref().map_or(true, |f| matches_filter(doc, f)))
                    .cloned()
            })
            .collect()
    }

    pub fn aliases_of(&self, index: &str) -> Vec<String> {
        self.state()
            .indices
            .get(index)
            .map(|state| state.aliases.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn indices_with_alias(&self, alias: &str) -> Vec<String> {
        self.state()
            .indices
            .iter()
            .filter(|(_, state)| state.aliases.contains_key(alias))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn settings(&self, index: &str) -> Option<Map<String, Value>> {
        self.state().indices.get(index).map(|state| state.settings.clone())
    }

    pub fn template(&self, name: &str) -> Option<Value> {
        self.state().templates.get(name).cloned()
    }

    /// `(repository, snapshot, index)` for every snapshot taken
    pub fn snapshots(&self) -> Vec<(String, String, String)> {
        self.state().snapshots.clone()
    }

    /// Mutating calls in the order they were made, e.g. `put_alias transaction-1 transaction-query-loans`
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }
}

#[async_trait]
impl SearchEngine for InMemorySearchEngine {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(!self.state().resolve(index).is_empty())
    }

    async fn create_index(&self, index: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_create_index {
            return Err(EtlError::transport("create index", "500: injected failure"));
        }
        if state.indices.contains_key(index) {
            return Err(EtlError::transport(
                "create index",
                format!("400: index [{}] already exists", index),
            ));
        }
        state.create(index);
        state.record(format!("create_index {}", index));
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        self.state().resolve_read("refresh", index)?;
        Ok(())
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<()> {
        let mut state = self.state();
        if state.fail_index_deletion {
            return Err(EtlError::transport("delete indices", "500: injected failure"));
        }
        for index in indices {
            if state.indices.remove(index).is_some() {
                state.record(format!("delete_index {}", index));
            }
        }
        Ok(())
    }

    async fn get_aliases(&self, index: &str, alias_pattern: &str) -> Result<Vec<AliasBinding>> {
        let state = self.state();
        if state.fail_alias_listings.contains(alias_pattern) {
            return Err(EtlError::transport("get aliases", "500: injected failure"));
        }
        let bindings = state
            .resolve(index)
            .into_iter()
            .filter_map(|name| state.indices.get(&name).map(|entry| (name, entry)))
            .flat_map(|(name, entry)| {
                entry
                    .aliases
                    .iter()
                    .filter(|(alias, _)| wildcard_match(alias_pattern, alias))
                    .map(move |(alias, filter)| AliasBinding {
                        alias: alias.clone(),
                        filter: filter.clone(),
                        index: name.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(bindings)
    }

    async fn put_alias(&self, binding: &AliasBinding) -> Result<()> {
        let mut state = self.state();
        if state.fail_alias_puts.contains(&binding.alias) {
            return Err(EtlError::transport("put alias", "500: injected failure"));
        }
        let entry = state.indices.get_mut(&binding.index).ok_or_else(|| {
            EtlError::transport("put alias", format!("404: no such index [{}]", binding.index))
        })?;
        entry
            .aliases
            .insert(binding.alias.clone(), binding.filter.clone());
        state.record(format!("put_alias {} {}", binding.index, binding.alias));
        Ok(())
    }

    async fn delete_alias(&self, index: &str, alias: &str) -> Result<()> {
        let mut state = self.state();
        let removed = state
            .indices
            .get_mut(index)
            .and_then(|entry| entry.aliases.remove(alias));
        if removed.is_none() {
            return Err(EtlError::transport(
                "delete alias",
                format!("404: alias [{}] missing on [{}]", alias, index),
            ));
        }
        state.record(format!("delete_alias {} {}", index, alias));
        Ok(())
    }

    async fn delete_aliases(&self, index: &str) -> Result<()> {
        let mut state = self.state();
        let names = state.resolve_read("delete aliases", index)?;
        for name in names {
            if let Some(entry) = state.indices.get_mut(&name) {
                entry.aliases.clear();
            }
            state.record(format!("delete_aliases {}", name));
        }
        Ok(())
    }

    async fn get_settings(&self, index: &str) -> Result<Map<String, Value>> {
        let state = self.state();
        let name = state
            .resolve_read("get settings", index)?
            .into_iter()
            .next()
            .ok_or_else(|| EtlError::transport("get settings", format!("no settings for {}", index)))?;
        Ok(state
            .indices
            .get(&name)
            .map(|entry| entry.settings.clone())
            .unwrap_or_default())
    }

    async fn put_settings(&self, index: &str, settings: &Map<String, Value>) -> Result<()> {
        let mut state = self.state();
        let names = state.resolve_read("put settings", index)?;
        for name in names {
            if let Some(entry) = state.indices.get_mut(&name) {
                for (key, value) in settings {
                    entry.settings.insert(key.clone(), value.clone());
                }
            }
            state.record(format!("put_settings {}", name));
        }
        Ok(())
    }

    async fn put_template(&self, name: &str, template: &Value) -> Result<()> {
        let mut state = self.state();
        state.templates.insert(name.to_string(), template.clone());
        state.record(format!("put_template {}", name));
        Ok(())
    }

    async fn bulk_upsert(&self, index: &str, documents: &[Document]) -> Result<BulkOutcome> {
        let mut state = self.state();
        if state.fail_bulk {
            return Err(EtlError::transport("bulk", "503: injected failure"));
        }

        let name = state.resolve_write(index)?;
        let mut outcome = BulkOutcome::default();

        for document in documents {
            let id = match document_id(document) {
                Some(id) => id.to_string(),
                None => {
                    state.next_auto_id += 1;
                    format!("auto-{}", state.next_auto_id)
                }
            };
            if state.rejected_ids.contains(&id) {
                outcome.failed += 1;
                continue;
            }
            if let Some(entry) = state.indices.get_mut(&name) {
                entry.documents.insert(id, document.clone());
                outcome.succeeded += 1;
            }
        }

        state.record(format!("bulk {} {}", name, documents.len()));
        Ok(outcome)
    }

    async fn delete_by_query(
        &self,
        index: &str,
        column: DeleteColumn,
        values: &[String],
    ) -> Result<u64> {
        let mut state = self.state();
        state.delete_calls += 1;
        let call = state.delete_calls;
        if state.fail_delete_calls.contains(&call) {
            return Err(EtlError::transport("delete by query", "500: injected failure"));
        }

        let mut deleted = 0;
        let names = state.resolve_read("delete by query", index)?;
        for name in names {
            if let Some(entry) = state.indices.get_mut(&name) {
                let before = entry.documents.len();
                entry
                    .documents
                    .retain(|_, doc| !field_matches(doc, column.field(), values));
                deleted += (before - entry.documents.len()) as u64;
            }
        }

        state.record(format!("delete_by_query {} {}", index, values.len()));
        Ok(deleted)
    }

    async fn count(&self, index: &str) -> Result<u64> {
        let state = self.state();
        Ok(state
            .resolve_read("count", index)?
            .iter()
            .filter_map(|name| state.indices.get(name))
            .map(|entry| entry.documents.len() as u64)
            .sum())
    }

    async fn create_snapshot(&self, repository: &str, snapshot: &str, index: &str) -> Result<()> {
        let mut state = self.state();
        state.resolve_read("snapshot", index)?;
        state
            .snapshots
            .push((repository.to_string(), snapshot.to_string(), index.to_string()));
        state.record(format!("snapshot {} {}", repository, snapshot));
        Ok(())
    }
}
