//! Streaming decoder from export files to document batches
//!
//! Every cell arrives as text. Three columns carry encoded values that the
//! index stores as structured data; everything else stays a string so that
//! identifier-like values (`"0012"`, `"1E5"`) are never reinterpreted.
//!
//! | column | stored as | decoded to |
//! |---|---|---|
//! | `business_categories` | `{a,b,c}` | `["a","b","c"]`, or null for `{}` |
//! | `treasury_accounts`, `federal_accounts` | JSON text | JSON value, or null for `""` |
//! | anything else | text | string, or null when blank |

use serde_json::Value;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{EtlError, Result};

/// One search document, keyed by export column
pub type Document = serde_json::Map<String, Value>;

/// Columns holding a brace-delimited array
pub const ARRAY_COLUMNS: [&str; 1] = ["business_categories"];

/// Columns holding JSON text
pub const JSON_COLUMNS: [&str; 2] = ["treasury_accounts", "federal_accounts"];

/// How a column's cells are decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Array,
    Json,
    Text,
}

impl ColumnKind {
    pub fn of(column: &str) -> Self {
        if ARRAY_COLUMNS.contains(&column) {
            ColumnKind::Array
        } else if JSON_COLUMNS.contains(&column) {
            ColumnKind::Json
        } else {
            ColumnKind::Text
        }
    }

    /// Decode one cell. Blank cells are always null.
    pub fn decode(self, raw: &str) -> std::result::Result<Value, serde_json::Error> {
        match self {
            ColumnKind::Array => Ok(decode_array(raw)),
            ColumnKind::Json => decode_json(raw),
            ColumnKind::Text if raw.is_empty() => Ok(Value::Null),
            ColumnKind::Text => Ok(Value::String(raw.to_string())),
        }
    }
}

/// `"{a,b,c}"` -> `["a","b","c"]`; anything of two characters or fewer
/// (`"{}"`, `""`) -> null
pub fn decode_array(raw: &str) -> Value {
    if raw.chars().count() <= 2 {
        return Value::Null;
    }

    let mut chars = raw.chars();
    chars.next();
    chars.next_back();

    Value::Array(
        chars
            .as_str()
            .split(',')
            .map(|item| Value::String(item.to_string()))
            .collect(),
    )
}

/// JSON text -> value; empty text -> null
pub fn decode_json(raw: &str) -> std::result::Result<Value, serde_json::Error> {
    if raw.is_empty() {
        Ok(Value::Null)
    } else {
        serde_json::from_str(raw)
    }
}

/// Lazy, single-pass sequence of document batches read from an export file
///
/// Each item is at most `batch_size` documents. After an error the sequence
/// ends.
pub struct DocumentBatches {
    reader: csv::Reader<File>,
    columns: Vec<(String, ColumnKind)>,
    batch_size: usize,
    path: PathBuf,
    rows_read: u64,
    finished: bool,
}

impl DocumentBatches {
    /// Open an export file; the first line must be the header row
    pub fn open(path: impl AsRef<Path>, batch_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)?;

        let columns = reader
            .headers()?
            .iter()
            .map(|name| (name.to_string(), ColumnKind::of(name)))
            .collect();

        Ok(Self {
            reader,
            columns,
            batch_size: batch_size.max(1),
            path,
            rows_read: 0,
            finished: false,
        })
    }

    /// Data rows consumed so far
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Short rows pad with null; rows longer than the header are rejected
    fn decode_record(&self, record: &csv::StringRecord) -> Result<Document> {
        if record.len() > self.columns.len() {
            return Err(EtlError::Decode {
                path: self.path.clone(),
                row: self.rows_read,
                message: format!(
                    "row has {} cells but the header has {}",
                    record.len(),
                    self.columns.len()
                ),
            });
        }

        let mut document = Document::with_capacity(self.columns.len());

        for (position, (name, kind)) in self.columns.iter().enumerate() {
            let value = match record.get(position) {
                Some(raw) => kind.decode(raw).map_err(|e| EtlError::Decode {
                    path: self.path.clone(),
                    row: self.rows_read,
                    message: format!("column {}: {}", name, e),
                })?,
                None => Value::Null,
            };
            document.insert(name.clone(), value);
        }

        Ok(document)
    }

    fn read_batch(&mut self) -> Result<Vec<Document>> {
        let mut batch = Vec::with_capacity(self.batch_size.min(4096));
        let mut record = csv::StringRecord::new();

        while batch.len() < self.batch_size {
            if !self.reader.read_record(&mut record)? {
                self.finished = true;
                break;
            }
            self.rows_read += 1;
            batch.push(self.decode_record(&record)?);
        }

        Ok(batch)
    }
}

impl Iterator for DocumentBatches {
    type Item = Result<Vec<Document>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_batch() {
            Ok(batch) if batch.is_empty() => None,
            Ok(batch) => Some(Ok(batch)),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Number of data rows in a delimited file with a header row
///
/// Counts records rather than lines, so quoted cells containing newlines
/// are handled.
pub fn count_rows(path: impl AsRef<Path>) -> Result<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut record = csv::ByteRecord::new();
    let mut count = 0;
    while reader.read_byte_record(&mut record)? {
        count += 1;
    }
    Ok(count)
}
