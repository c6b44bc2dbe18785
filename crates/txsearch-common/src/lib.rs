//! Transaction Search Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared logging setup and event vocabulary for the transaction search
//! workspace.
//!
//! - **Logging**: `tracing` subscriber initialization (console, file, JSON)
//! - **Events**: the [`Stage`](event::Stage) tag recorded on every pipeline event
//!
//! # Example
//!
//! ```no_run
//! use txsearch_common::event::Stage;
//! use txsearch_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     info!(stage = %Stage::Main, "Loader started");
//!     Ok(())
//! }
//! ```

pub mod event;
pub mod logging;

pub use event::Stage;
