use std::{fmt, process::Stdio};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::scan::engines::{
    EngineError, MatchEvent, MatchHandler, VulnerabilityEngine,
};

/// Drives the `nuclei` CLI in JSONL mode.
#[derive(Clone)]
pub struct NucleiCliEngine {
    config: EngineConfig,
}

impl fmt::Debug for NucleiCliEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NucleiCliEngine")
            .field("binary", &self.config.binary)
            .field("templates_dir", &self.config.templates_dir)
            .finish()
    }
}

impl NucleiCliEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-jsonl")
            .arg("-silent")
            .arg("-disable-update-check")
            .arg("-no-color");
        if let Some(dir) = &self.config.templates_dir {
            cmd.arg("-t").arg(dir);
        }
        cmd.args(&self.config.extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl VulnerabilityEngine for NucleiCliEngine {
    async fn run(
        &self,
        targets: &[String],
        handler: &dyn MatchHandler,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if targets.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut child = self.command().spawn().map_err(|e| {
            EngineError::Failed(format!(
                "failed to spawn {}: {e}",
                self.config.binary.display()
            ))
        })?;
        info!(target: "vigil::pipeline", targets = targets.len(), "vulnerability engine started");

        if let Some(mut stdin) = child.stdin.take() {
            let input = targets.join("\n") + "\n";
            stdin.write_all(input.as_bytes()).await.map_err(|e| {
                EngineError::Failed(format!("failed to write targets: {e}"))
            })?;
            // Dropping stdin closes the pipe so the engine sees EOF.
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Failed("engine stdout unavailable".into())
        })?;
        let stderr = child.stderr.take();
        let stderr_tail = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut output).await;
            }
            output
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!(target: "vigil::pipeline", error = %err, "failed to kill engine process");
                    }
                    return Err(EngineError::Cancelled);
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let Ok(raw) = serde_json::from_str::<Value>(&line) else {
                        debug!(target: "vigil::pipeline", "skipping non-json engine output");
                        continue;
                    };
                    if let Some(event) = MatchEvent::from_json(raw)
                        && event.matcher_status
                    {
                        handler.on_match(event).await;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    return Err(EngineError::Failed(format!(
                        "failed to read engine output: {err}"
                    )));
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(EngineError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| {
                EngineError::Failed(format!("failed to wait for engine: {e}"))
            })?,
        };

        if !status.success() {
            let output = stderr_tail.await.unwrap_or_default();
            let exit_code = status.code().unwrap_or(-1);
            return Err(EngineError::Failed(format!(
                "engine exited with status {exit_code}: {}",
                output.lines().take(10).collect::<Vec<_>>().join("\n")
            )));
        }
        Ok(())
    }
}
