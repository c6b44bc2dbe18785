//! Fail-fast supervision of the pipeline workers
//!
//! Workers run as independent tokio tasks. The supervisor polls them on a
//! fixed interval; as soon as one has failed (error or panic) every other
//! worker is aborted and the run fails. There is no partial success.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use txsearch_common::Stage;

use crate::error::{EtlError, Result};

struct Supervised<T> {
    name: String,
    handle: Option<JoinHandle<Result<T>>>,
    output: Option<T>,
}

/// Owns the worker tasks of one pipeline run
pub struct Supervisor<T> {
    workers: Vec<Supervised<T>>,
    poll: Duration,
}

impl<T: Send + 'static> Supervisor<T> {
    pub fn new(poll: Duration) -> Self {
        Self {
            workers: Vec::new(),
            poll,
        }
    }

    /// Start a worker task
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let name = name.into();
        debug!(stage = %Stage::Supervisor, worker = %name, "Spawning worker");
        self.workers.push(Supervised {
            name,
            handle: Some(tokio::spawn(future)),
            output: None,
        });
    }

    /// Wait for every worker, failing fast
    ///
    /// Returns each worker's output in spawn order. On the first failure all
    /// remaining workers are aborted before [`EtlError::WorkerCrash`] is
    /// returned.
    pub async fn wait(mut self) -> Result<Vec<(String, T)>> {
        loop {
            if let Some((worker, reason)) = self.collect_finished().await {
                error!(
                    stage = %Stage::Supervisor,
                    worker = %worker,
                    reason = %reason,
                    "Worker failed, terminating remaining workers"
                );
                self.abort_all().await;
                return Err(EtlError::WorkerCrash { worker, reason });
            }

            if self.workers.iter().all(|w| w.handle.is_none()) {
                info!(stage = %Stage::Supervisor, "All workers finished");
                let outputs = std::mem::take(&mut self.workers)
                    .into_iter()
                    .filter_map(|w| w.output.map(|output| (w.name, output)))
                    .collect();
                return Ok(outputs);
            }

            tokio::time::sleep(self.poll).await;
        }
    }

    /// Reap finished workers; returns the first failure found
    async fn collect_finished(&mut self) -> Option<(String, String)> {
        for worker in &mut self.workers {
            let finished = worker.handle.as_ref().is_some_and(|h| h.is_finished());
            if !finished {
                continue;
            }
            let Some(handle) = worker.handle.take() else {
                continue;
            };

            match handle.await {
                Ok(Ok(output)) => {
                    debug!(stage = %Stage::Supervisor, worker = %worker.name, "Worker exited cleanly");
                    worker.output = Some(output);
                }
                Ok(Err(e)) => return Some((worker.name.clone(), e.to_string())),
                Err(join_err) if join_err.is_panic() => {
                    return Some((worker.name.clone(), "worker panicked".to_string()))
                }
                Err(join_err) => return Some((worker.name.clone(), join_err.to_string())),
            }
        }
        None
    }

    async fn abort_all(&mut self) {
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                debug!(stage = %Stage::Supervisor, worker = %worker.name, "Aborting worker");
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

impl<T> Drop for Supervisor<T> {
    fn drop(&mut self) {
        for worker in &self.workers {
            if let Some(handle) = &worker.handle {
                handle.abort();
            }
        }
    }
}
