//! One task's scan pipeline.
//!
//! Stages run strictly in order: split targets, port discovery, liveness
//! probe, vulnerability scan. The cancellation token is checked on both
//! sides of every stage; once it fires no further stage runs and the task
//! ends `stopped`.

use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_model::{NewTaskLog, TaskId, TaskStatus};

use crate::config::LifecycleConfig;
use crate::database::{DurableStore, FastStore, StatusGuard, TaskMirror};
use crate::scan::{
    engines::{EngineError, PortDiscovery, VulnerabilityEngine},
    probe::LivenessProber,
    sink::ResultSink,
    targets::split_targets,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SplitTargets,
    PortDiscovery,
    LivenessProbe,
    VulnScan,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::SplitTargets => "split targets",
            Stage::PortDiscovery => "port discovery",
            Stage::LivenessProbe => "liveness probe",
            Stage::VulnScan => "vulnerability scan",
        };
        f.write_str(name)
    }
}

/// How one execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Finished,
    Stopped,
    Failed(String),
    /// The execution panicked; only reported by the runner.
    Panicked,
}

impl ScanOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            ScanOutcome::Finished => TaskStatus::Finished,
            ScanOutcome::Stopped => TaskStatus::Stopped,
            ScanOutcome::Failed(_) | ScanOutcome::Panicked => TaskStatus::Error,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ScanOutcome::Failed(message) => Some(message),
            ScanOutcome::Panicked => Some("scan execution panicked"),
            _ => None,
        }
    }
}

enum Interrupt {
    Cancelled(Stage),
    Failed(String),
}

impl Interrupt {
    /// A fired token wins over whatever error the collaborator reported.
    fn from_engine(
        stage: Stage,
        label: &str,
        err: EngineError,
        cancel: &CancellationToken,
    ) -> Self {
        if cancel.is_cancelled() {
            return Interrupt::Cancelled(stage);
        }
        match err {
            EngineError::Cancelled => Interrupt::Cancelled(stage),
            EngineError::Failed(message) => {
                Interrupt::Failed(format!("{label}: {message}"))
            }
        }
    }
}

#[derive(Clone)]
pub struct ScanOrchestrator {
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    mirror: TaskMirror,
    discovery: Arc<dyn PortDiscovery>,
    prober: Arc<LivenessProber>,
    engine: Arc<dyn VulnerabilityEngine>,
    config: LifecycleConfig,
}

impl fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("prober", &self.prober)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ScanOrchestrator {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
        discovery: Arc<dyn PortDiscovery>,
        prober: Arc<LivenessProber>,
        engine: Arc<dyn VulnerabilityEngine>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            mirror: TaskMirror::new(Arc::clone(&fast)),
            durable,
            fast,
            discovery,
            prober,
            engine,
            config,
        }
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn mirror(&self) -> &TaskMirror {
        &self.mirror
    }

    /// Run the pipeline to completion and record the terminal status.
    pub async fn execute(
        &self,
        task_id: &TaskId,
        targets: Vec<String>,
        cancel: &CancellationToken,
    ) -> ScanOutcome {
        info!(target: "vigil::pipeline", %task_id, targets = targets.len(), "scan started");

        let outcome = match self.pipeline(task_id, &targets, cancel).await {
            Ok(()) => ScanOutcome::Finished,
            Err(Interrupt::Cancelled(stage)) => {
                info!(target: "vigil::pipeline", %task_id, %stage, "scan cancelled");
                ScanOutcome::Stopped
            }
            Err(Interrupt::Failed(message)) => {
                warn!(target: "vigil::pipeline", %task_id, error = %message, "scan failed");
                ScanOutcome::Failed(message)
            }
        };

        self.record_outcome(task_id, &outcome).await;
        outcome
    }

    async fn pipeline(
        &self,
        task_id: &TaskId,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), Interrupt> {
        checkpoint(cancel, Stage::SplitTargets)?;
        let split = split_targets(targets);
        debug!(
            target: "vigil::pipeline",
            %task_id,
            with_port = split.with_port.len(),
            host_only = split.host_only.len(),
            "targets split"
        );
        checkpoint(cancel, Stage::SplitTargets)?;

        let mut endpoints = split.with_port;
        if !split.host_only.is_empty() {
            checkpoint(cancel, Stage::PortDiscovery)?;
            self.live_log(task_id, "port discovery started").await;
            let discovered = self
                .discovery
                .discover(&split.host_only, cancel)
                .await
                .map_err(|e| {
                    Interrupt::from_engine(
                        Stage::PortDiscovery,
                        "port scan error",
                        e,
                        cancel,
                    )
                })?;
            checkpoint(cancel, Stage::PortDiscovery)?;
            info!(target: "vigil::pipeline", %task_id, discovered = discovered.len(), "port discovery finished");
            endpoints.extend(discovered);
        }

        if endpoints.is_empty() {
            info!(target: "vigil::pipeline", %task_id, "no endpoints to scan");
            self.live_log(task_id, "no endpoints to scan").await;
            return Ok(());
        }

        checkpoint(cancel, Stage::LivenessProbe)?;
        self.live_log(task_id, "liveness probe started").await;
        let alive = self.prober.probe(&endpoints, cancel).await.map_err(|e| {
            Interrupt::from_engine(
                Stage::LivenessProbe,
                "http probe error",
                e,
                cancel,
            )
        })?;
        checkpoint(cancel, Stage::LivenessProbe)?;
        info!(
            target: "vigil::pipeline",
            %task_id,
            endpoints = endpoints.len(),
            alive = alive.len(),
            "liveness probe finished"
        );

        let final_targets: Vec<String> = endpoints
            .iter()
            .map(|endpoint| {
                alive
                    .get(endpoint)
                    .map(|found| found.address.clone())
                    .unwrap_or_else(|| endpoint.clone())
            })
            .collect();

        checkpoint(cancel, Stage::VulnScan)?;
        let started =
            format!("vulnerability scan started on {} targets", final_targets.len());
        self.live_log(task_id, &started).await;
        let sink = ResultSink::new(
            task_id.clone(),
            Arc::clone(&self.durable),
            Arc::clone(&self.fast),
            self.config.response_cap_bytes,
        )
        .with_write_retry(
            self.config.finding_write_attempts,
            self.config.finding_retry(),
        );
        self.engine
            .run(&final_targets, &sink, cancel)
            .await
            .map_err(|e| {
                Interrupt::from_engine(
                    Stage::VulnScan,
                    "vulnerability engine error",
                    e,
                    cancel,
                )
            })?;
        checkpoint(cancel, Stage::VulnScan)?;
        info!(target: "vigil::pipeline", %task_id, findings = sink.recorded(), "vulnerability scan finished");
        Ok(())
    }

    /// Move `running` to the outcome's status and mirror whatever the
    /// durable row ends up holding.
    pub(crate) async fn record_outcome(
        &self,
        task_id: &TaskId,
        outcome: &ScanOutcome,
    ) {
        let next = outcome.status();
        let message = outcome.message();
        let mirrored = match self
            .durable
            .transition_status(
                task_id,
                StatusGuard::Is(TaskStatus::Running),
                next,
                message,
            )
            .await
        {
            Ok(0) => {
                // Stop or delete already moved the row on.
                match self.durable.get_task(task_id).await {
                    Ok(task) => task.map(|task| task.status),
                    Err(err) => {
                        warn!(target: "vigil::pipeline", %task_id, error = %err, "failed to re-read task status");
                        None
                    }
                }
            }
            Ok(_) => Some(next),
            Err(err) => {
                warn!(
                    target: "vigil::pipeline",
                    %task_id,
                    status = %next,
                    error = %err,
                    "failed to record scan outcome"
                );
                None
            }
        };

        if let Some(status) = mirrored
            && status != TaskStatus::Deleted
        {
            let message = (status == next).then_some(message).flatten();
            if let Err(err) =
                self.mirror.set_status(task_id, status, message).await
            {
                warn!(target: "vigil::pipeline", %task_id, error = %err, "failed to mirror scan outcome");
            }
            self.live_log(task_id, &format!("scan ended: {status}")).await;
        }

        // Audit what the row holds, not what this execution wanted.
        let recorded = mirrored.unwrap_or(next);
        let entry = NewTaskLog::for_task(
            task_id,
            "scan_finished",
            match message.filter(|_| recorded == next) {
                Some(message) => format!("{recorded}: {message}"),
                None => recorded.to_string(),
            },
        );
        if let Err(err) = self.durable.append_log(&entry).await {
            warn!(target: "vigil::pipeline", %task_id, error = %err, "failed to append audit log");
        }
    }

    async fn live_log(&self, task_id: &TaskId, line: &str) {
        if let Err(err) = self.mirror.log_line(task_id, line).await {
            debug!(target: "vigil::pipeline", %task_id, error = %err, "live log write failed");
        }
    }
}

fn checkpoint(cancel: &CancellationToken, stage: Stage) -> Result<(), Interrupt> {
    if cancel.is_cancelled() {
        return Err(Interrupt::Cancelled(stage));
    }
    Ok(())
}
