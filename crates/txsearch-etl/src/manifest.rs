//! Deletion manifests
//!
//! Each manifest is a CSV file listing source-system identifiers of deleted
//! records. The schema decides the document id prefix:
//!
//! | column | document id |
//! |---|---|
//! | `detached_award_proc_unique` | `CONT_TX_` + upper-cased value |
//! | `afa_generated_unique` | `ASST_TX_` + upper-cased value |

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::storage::ManifestObject;

/// Deleted document id -> latest manifest modification time that listed it
pub type DeletedIds = BTreeMap<String, DateTime<Utc>>;

/// Known manifest schemas as `(column, id prefix)`
pub const MANIFEST_SCHEMAS: [(&str, &str); 2] = [
    ("detached_award_proc_unique", "CONT_TX_"),
    ("afa_generated_unique", "ASST_TX_"),
];

/// A manifest is read when it is a `.csv` file outside the staging area
/// and was modified on or after the cutover
pub fn is_eligible(object: &ManifestObject, cutover: DateTime<Utc>) -> bool {
    object.key.ends_with(".csv")
        && !object.key.starts_with("staging")
        && object.last_modified >= cutover
}

/// Document ids listed in a manifest, or `None` when no known identifier
/// column is present. Blank cells are skipped.
pub fn parse(contents: &[u8]) -> Result<Option<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(contents);

    let headers = reader.headers()?.clone();
    let Some((position, prefix)) = MANIFEST_SCHEMAS.iter().find_map(|(column, prefix)| {
        headers
            .iter()
            .position(|h| h.trim() == *column)
            .map(|position| (position, *prefix))
    }) else {
        return Ok(None);
    };

    let mut ids = Vec::new();
    for record in reader.records() {
        let record = record?;
        match record.get(position).map(str::trim) {
            Some(value) if !value.is_empty() => {
                ids.push(format!("{}{}", prefix, value.to_uppercase()))
            }
            _ => {}
        }
    }

    Ok(Some(ids))
}

/// Add ids to the map, keeping the latest modification time per id
pub fn merge(deleted: &mut DeletedIds, ids: Vec<String>, last_modified: DateTime<Utc>) {
    for id in ids {
        deleted
            .entry(id)
            .and_modify(|seen| {
                if last_modified > *seen {
                    *seen = last_modified;
                }
            })
            .or_insert(last_modified);
    }
}
