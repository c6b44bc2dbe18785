//! Pipeline event vocabulary
//!
//! Every event emitted by the loader carries a `stage` field naming the
//! part of the pipeline that produced it and, when one applies, a `job`
//! field naming the fiscal-year job. Timestamps come from the subscriber.
//!
//! ```no_run
//! use txsearch_common::event::Stage;
//! use tracing::info;
//!
//! info!(stage = %Stage::Load, job = "2020_transactions", "Starting new job");
//! ```

use serde::{Deserialize, Serialize};

/// The pipeline stage an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Relational export into delimited files
    Download,
    /// Streaming documents into the search index
    Load,
    /// Delete-by-query reconciliation
    Delete,
    /// Binding aliases to an index
    AliasPut,
    /// Removing aliases and retired indices
    AliasDrop,
    /// Post-load index settings
    Settings,
    /// Snapshot creation
    Snapshot,
    /// Worker supervision
    Supervisor,
    /// Top-level driver
    Main,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "Download",
            Stage::Load => "ES Ingest",
            Stage::Delete => "ES Delete",
            Stage::AliasPut => "ES Alias Put",
            Stage::AliasDrop => "ES Alias Drop",
            Stage::Settings => "ES Settings Put",
            Stage::Snapshot => "ES Snapshot",
            Stage::Supervisor => "Supervisor",
            Stage::Main => "main",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
