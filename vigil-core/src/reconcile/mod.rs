//! Background workers that repair divergence between the durable store and
//! the mirror.
//!
//! Queue-driven workers implement [`QueueWorker`]; the task compensator runs
//! on a fixed interval. [`ReconcileSupervisor`] owns all of them.

mod deletes;
mod findings;
mod targets;
mod tasks;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::database::{DurableStore, FastStore};
use crate::error::Result;

pub use deletes::{TargetDeleteWorker, TaskDeleteWorker};
pub use findings::FindingReplayWorker;
pub use targets::TargetCompensator;
pub use tasks::{SyncReport, TaskCompensator};

/// What happened to one queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Done,
    /// Nothing was committed; safe to retry later.
    Requeue(String),
    /// Needs manual attention.
    DeadLetter(String),
}

/// A consumer of one repair queue.
#[async_trait]
pub trait QueueWorker: Send + Sync {
    fn name(&self) -> &'static str;
    fn queue(&self) -> &'static str;
    fn dead_letter(&self) -> &'static str;
    fn fast(&self) -> &Arc<dyn FastStore>;
    fn config(&self) -> &ReconcileConfig;

    async fn process(&self, payload: &str) -> Disposition;

    /// Pop at most one item, process it and settle it. Returns `None` when
    /// the queue stayed empty for the configured wait.
    async fn run_once(&self) -> Result<Option<Disposition>> {
        let Some(payload) = self.next_item().await? else {
            return Ok(None);
        };
        Ok(Some(self.settle(&payload).await))
    }

    async fn next_item(&self) -> Result<Option<String>> {
        self.fast()
            .pop(self.queue(), self.config().pop_wait())
            .await
    }

    /// Process a popped item and move it to wherever its disposition says.
    async fn settle(&self, payload: &str) -> Disposition {
        let disposition = self.process(payload).await;
        match &disposition {
            Disposition::Done => {
                debug!(target: "vigil::reconcile", worker = self.name(), %payload, "item processed");
            }
            Disposition::Requeue(reason) => {
                warn!(target: "vigil::reconcile", worker = self.name(), %payload, %reason, "requeueing item");
                tokio::time::sleep(self.config().failure_backoff()).await;
                if let Err(err) =
                    self.fast().rpush(self.queue(), &[payload.to_string()]).await
                {
                    error!(target: "vigil::reconcile", worker = self.name(), %payload, error = %err, "requeue failed");
                    self.bury(payload).await;
                }
            }
            Disposition::DeadLetter(reason) => {
                warn!(target: "vigil::reconcile", worker = self.name(), %payload, %reason, "dead-lettering item");
                self.bury(payload).await;
            }
        }
        disposition
    }

    async fn bury(&self, payload: &str) {
        if let Err(err) = self
            .fast()
            .rpush(self.dead_letter(), &[payload.to_string()])
            .await
        {
            error!(
                target: "vigil::reconcile",
                worker = self.name(),
                %payload,
                error = %err,
                "dead-letter write failed"
            );
        }
    }

    /// Consume until `shutdown` fires. Shutdown only interrupts the wait for
    /// an item; a popped item gets the drain grace to settle and is
    /// dead-lettered if it cannot.
    async fn run(&self, shutdown: CancellationToken) {
        info!(target: "vigil::reconcile", worker = self.name(), "worker started");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.next_item() => next,
            };
            let payload = match next {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(err) => {
                    warn!(target: "vigil::reconcile", worker = self.name(), error = %err, "queue unavailable");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config().failure_backoff()) => {}
                    }
                    continue;
                }
            };

            let settle = self.settle(&payload);
            tokio::pin!(settle);
            tokio::select! {
                _ = &mut settle => continue,
                _ = shutdown.cancelled() => {}
            }
            let grace = self.config().drain_grace();
            if tokio::time::timeout(grace, &mut settle).await.is_err() {
                warn!(
                    target: "vigil::reconcile",
                    worker = self.name(),
                    %payload,
                    "item did not settle before shutdown; dead-lettering"
                );
                self.bury(&payload).await;
            }
            break;
        }
        info!(target: "vigil::reconcile", worker = self.name(), "worker stopped");
    }
}

/// Owns the reconciliation workers and their shutdown.
#[derive(Debug)]
pub struct ReconcileSupervisor {
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReconcileSupervisor {
    /// Spawn every worker under a child of `shutdown`.
    pub fn spawn(
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
        config: ReconcileConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        let shutdown_token = shutdown.child_token();
        let queue_workers: Vec<Arc<dyn QueueWorker>> = vec![
            Arc::new(TargetCompensator::new(
                Arc::clone(&durable),
                Arc::clone(&fast),
                config.clone(),
            )),
            Arc::new(TargetDeleteWorker::new(
                Arc::clone(&durable),
                Arc::clone(&fast),
                config.clone(),
            )),
            Arc::new(TaskDeleteWorker::new(
                Arc::clone(&durable),
                Arc::clone(&fast),
                config.clone(),
            )),
            Arc::new(FindingReplayWorker::new(
                Arc::clone(&durable),
                Arc::clone(&fast),
                config.clone(),
            )),
        ];

        let mut handles = Vec::with_capacity(queue_workers.len() + 1);
        for worker in queue_workers {
            let token = shutdown_token.clone();
            handles.push(tokio::spawn(async move { worker.run(token).await }));
        }

        let compensator = TaskCompensator::new(durable, fast, config);
        let token = shutdown_token.clone();
        handles.push(tokio::spawn(async move { compensator.run(token).await }));

        Self {
            shutdown_token,
            worker_handles: Mutex::new(handles),
        }
    }

    /// Cancel every worker and wait for it to exit.
    pub async fn shutdown(&self) {
        info!(target: "vigil::reconcile", "stopping reconciliation workers");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(target: "vigil::reconcile", error = %err, "worker task failed");
                }
                Err(_) => {
                    warn!(target: "vigil::reconcile", "worker task timed out during shutdown");
                }
            }
        }
    }
}
