//! Capability contracts for the external scanning engines.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// Expands bare hosts into `host:port` endpoints.
///
/// Must return an empty list for empty input and stop promptly once
/// `cancel` fires, reporting [`EngineError::Cancelled`].
#[async_trait]
pub trait PortDiscovery: Send + Sync {
    async fn discover(
        &self,
        hosts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, EngineError>;
}

/// Runs vulnerability templates against targets, reporting matches through
/// `handler` as they are produced.
#[async_trait]
pub trait VulnerabilityEngine: Send + Sync {
    async fn run(
        &self,
        targets: &[String],
        handler: &dyn MatchHandler,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;
}

#[async_trait]
pub trait MatchHandler: Send + Sync {
    async fn on_match(&self, event: MatchEvent);
}

/// One result event emitted by a vulnerability engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
    pub template_id: String,
    pub title: String,
    pub severity: String,
    pub host: String,
    pub matched_at: Option<String>,
    /// Only confirmed matches are persisted.
    pub matcher_status: bool,
    pub response: Option<String>,
    /// The full event as reported by the engine.
    pub raw: Value,
}

impl MatchEvent {
    /// Build from a JSONL result line in the template engine's format.
    pub fn from_json(raw: Value) -> Option<Self> {
        let template_id = raw.get("template-id")?.as_str()?.to_string();
        let info = raw.get("info");
        let text = |value: Option<&Value>, key: &str| {
            value
                .and_then(|v| v.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Some(Self {
            title: text(info, "name").unwrap_or_else(|| template_id.clone()),
            severity: text(info, "severity")
                .unwrap_or_else(|| "unknown".to_string()),
            host: text(Some(&raw), "host").unwrap_or_default(),
            matched_at: text(Some(&raw), "matched-at"),
            matcher_status: raw
                .get("matcher-status")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            response: text(Some(&raw), "response"),
            template_id,
            raw,
        })
    }

    /// Where the match was observed.
    pub fn target(&self) -> &str {
        self.matched_at.as_deref().unwrap_or(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_engine_result_line() {
        let event = MatchEvent::from_json(json!({
            "template-id": "exposed-panel",
            "info": { "name": "Exposed Panel", "severity": "medium" },
            "host": "http://10.0.0.1:8080",
            "matched-at": "http://10.0.0.1:8080/admin",
            "matcher-status": true,
            "response": "HTTP/1.1 200 OK"
        }))
        .unwrap();

        assert_eq!(event.template_id, "exposed-panel");
        assert_eq!(event.title, "Exposed Panel");
        assert_eq!(event.severity, "medium");
        assert!(event.matcher_status);
        assert_eq!(event.target(), "http://10.0.0.1:8080/admin");
    }

    #[test]
    fn missing_template_id_is_rejected() {
        assert!(MatchEvent::from_json(json!({ "host": "x" })).is_none());
    }

    #[test]
    fn matcher_status_defaults_to_false() {
        let event =
            MatchEvent::from_json(json!({ "template-id": "t", "host": "h" }))
                .unwrap();
        assert!(!event.matcher_status);
        assert_eq!(event.target(), "h");
        assert_eq!(event.severity, "unknown");
    }
}
