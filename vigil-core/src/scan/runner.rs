use std::{fmt, sync::Arc};

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use vigil_model::TaskId;

use crate::scan::{
    cancellation::RegistrationGuard,
    orchestrator::{ScanOrchestrator, ScanOutcome},
};

/// Runs scan executions on the tokio runtime and keeps them observable.
///
/// Each submission spawns the pipeline plus a supervisor that turns a panic
/// or abort into a recorded terminal status.
#[derive(Clone)]
pub struct ScanRunner {
    orchestrator: Arc<ScanOrchestrator>,
    tracker: TaskTracker,
}

impl fmt::Debug for ScanRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRunner")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl ScanRunner {
    pub fn new(orchestrator: Arc<ScanOrchestrator>) -> Self {
        Self {
            orchestrator,
            tracker: TaskTracker::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<ScanOrchestrator> {
        &self.orchestrator
    }

    /// Spawned tasks still alive, supervisors included.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Launch one execution. `guard` moves into the execution so the
    /// cancellation handle is released whenever it ends.
    pub fn submit(
        &self,
        task_id: TaskId,
        targets: Vec<String>,
        guard: RegistrationGuard,
    ) -> ScanHandle {
        let orchestrator = Arc::clone(&self.orchestrator);
        let execution_id = task_id.clone();
        let execution = self.tracker.spawn(async move {
            let cancel = guard.token().clone();
            let outcome =
                orchestrator.execute(&execution_id, targets, &cancel).await;
            drop(guard);
            outcome
        });

        let orchestrator = Arc::clone(&self.orchestrator);
        let supervised_id = task_id.clone();
        let supervisor = self.tracker.spawn(async move {
            match execution.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let outcome = if err.is_panic() {
                        error!(target: "vigil::pipeline", task_id = %supervised_id, "scan execution panicked");
                        ScanOutcome::Panicked
                    } else {
                        info!(target: "vigil::pipeline", task_id = %supervised_id, "scan execution aborted");
                        ScanOutcome::Stopped
                    };
                    orchestrator.record_outcome(&supervised_id, &outcome).await;
                    outcome
                }
            }
        });

        ScanHandle {
            task_id,
            supervisor,
        }
    }

    /// Stop accepting work and wait for every execution to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Observes one submitted execution.
pub struct ScanHandle {
    task_id: TaskId,
    supervisor: JoinHandle<ScanOutcome>,
}

impl fmt::Debug for ScanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanHandle")
            .field("task_id", &self.task_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl ScanHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    pub async fn join(self) -> ScanOutcome {
        self.supervisor.await.unwrap_or(ScanOutcome::Panicked)
    }
}
