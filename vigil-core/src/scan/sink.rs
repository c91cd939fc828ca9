use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};
use vigil_model::{NewFinding, TaskId};

use crate::database::{DurableStore, FastKeys, FastStore};
use crate::scan::engines::{MatchEvent, MatchHandler};

/// Persists confirmed matches for one task.
///
/// Each match becomes a durable finding row and is appended to the task's
/// mirror result and live-log lists. Mirror failures are logged and the scan
/// carries on; the durable row is authoritative. A finding whose durable
/// write keeps failing is queued for the replay worker and not counted.
pub struct ResultSink {
    task_id: TaskId,
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastStore>,
    response_cap: usize,
    write_attempts: u32,
    write_backoff: Duration,
    recorded: AtomicU64,
}

impl fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSink")
            .field("task_id", &self.task_id)
            .field("response_cap", &self.response_cap)
            .field("recorded", &self.recorded())
            .finish_non_exhaustive()
    }
}

impl ResultSink {
    pub fn new(
        task_id: TaskId,
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
        response_cap: usize,
    ) -> Self {
        Self {
            task_id,
            durable,
            fast,
            response_cap,
            write_attempts: 3,
            write_backoff: Duration::from_millis(250),
            recorded: AtomicU64::new(0),
        }
    }

    pub fn with_write_retry(
        mut self,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        self.write_attempts = attempts.max(1);
        self.write_backoff = backoff;
        self
    }

    /// Matches accepted so far.
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    fn cap_response(&self, event: &mut MatchEvent) {
        if let Some(response) = event.response.as_mut() {
            truncate_at_boundary(response, self.response_cap);
        }
        if let Some(Value::String(response)) = event.raw.get_mut("response") {
            truncate_at_boundary(response, self.response_cap);
        }
    }

    /// Try the durable insert up to the configured attempts.
    async fn persist(&self, finding: &NewFinding) -> bool {
        for attempt in 1..=self.write_attempts {
            match self.durable.insert_finding(finding).await {
                Ok(_) => return true,
                Err(err) => {
                    warn!(
                        target: "vigil::pipeline",
                        task_id = %self.task_id,
                        template = %finding.template_id,
                        attempt,
                        error = %err,
                        "failed to persist finding"
                    );
                }
            }
            if attempt < self.write_attempts {
                tokio::time::sleep(self.write_backoff).await;
            }
        }
        false
    }

    async fn queue_replay(&self, finding: &NewFinding) {
        let queued = match serde_json::to_string(finding) {
            Ok(payload) => self
                .fast
                .rpush(FastKeys::FINDING_REPLAY_QUEUE, &[payload])
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match queued {
            Ok(()) => {
                warn!(target: "vigil::pipeline", task_id = %self.task_id, template = %finding.template_id, "finding queued for replay");
            }
            Err(err) => {
                error!(target: "vigil::pipeline", task_id = %self.task_id, template = %finding.template_id, error = %err, "finding lost: replay queue unavailable");
            }
        }
    }
}

#[async_trait]
impl MatchHandler for ResultSink {
    async fn on_match(&self, mut event: MatchEvent) {
        if !event.matcher_status {
            return;
        }
        self.cap_response(&mut event);

        let finding = NewFinding {
            task_id: self.task_id.clone(),
            target: event.target().to_string(),
            template_id: event.template_id.clone(),
            severity: event.severity.clone(),
            title: event.title.clone(),
            details: event.raw.clone(),
            raw_ref: Some(FastKeys::results(&self.task_id)),
        };
        let payload = event.raw.to_string();
        if let Err(err) = self
            .fast
            .rpush(&FastKeys::log(&self.task_id), &[payload.clone()])
            .await
        {
            warn!(target: "vigil::pipeline", task_id = %self.task_id, error = %err, "failed to append live log");
        }

        if !self.persist(&finding).await {
            self.queue_replay(&finding).await;
            return;
        }
        if let Err(err) = self
            .fast
            .rpush(&FastKeys::results(&self.task_id), &[payload])
            .await
        {
            warn!(target: "vigil::pipeline", task_id = %self.task_id, error = %err, "failed to mirror finding");
        }

        self.recorded.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "vigil::pipeline",
            task_id = %self.task_id,
            template = %event.template_id,
            severity = %event.severity,
            "finding recorded"
        );
    }
}

/// Truncate to at most `cap` bytes without splitting a character.
fn truncate_at_boundary(text: &mut String, cap: usize) {
    if text.len() <= cap {
        return;
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
