use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Global knobs for the scan engine and its background workers.
///
/// Every section carries defaults so a deployment only needs to spell out
/// what it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VigilConfig {
    /// Start lock, result truncation and read-side paging.
    pub lifecycle: LifecycleConfig,
    /// Liveness probe concurrency and per-attempt timeouts.
    pub probe: ProbeConfig,
    /// Built-in port discovery engine.
    pub discovery: DiscoveryConfig,
    /// External vulnerability engine invocation.
    pub engine: EngineConfig,
    /// Reconciliation worker cadence and retry policy.
    pub reconcile: ReconcileConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// TTL of the per-task start lock (seconds)
    pub start_lock_ttl_secs: u64,
    /// Cap applied to a match's raw response before it is persisted (bytes)
    pub response_cap_bytes: usize,
    /// Number of trailing live-log entries returned by `task_log`
    pub log_tail: usize,
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Durable writes tried per finding before it is queued for replay
    pub finding_write_attempts: u32,
    /// Pause between finding write attempts (ms)
    pub finding_retry_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_lock_ttl_secs: 30,
            response_cap_bytes: 10_240,
            log_tail: 100,
            default_page_size: 20,
            max_page_size: 500,
            finding_write_attempts: 3,
            finding_retry_ms: 250,
        }
    }
}

impl LifecycleConfig {
    pub fn start_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.start_lock_ttl_secs)
    }

    pub fn finding_retry(&self) -> Duration {
        Duration::from_millis(self.finding_retry_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Maximum simultaneous probes for one task
    pub concurrency: usize,
    /// Whole-request timeout for GET candidates (ms)
    pub http_timeout_ms: u64,
    /// Plaintext HEAD probe budget (ms)
    pub plaintext_timeout_ms: u64,
    /// TLS handshake + HEAD probe budget (ms)
    pub tls_timeout_ms: u64,
    /// Bare TCP connect fallback budget (ms)
    pub connect_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: 50,
            http_timeout_ms: 5_000,
            plaintext_timeout_ms: 500,
            tls_timeout_ms: 800,
            connect_timeout_ms: 2_000,
        }
    }
}

impl ProbeConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn plaintext_timeout(&self) -> Duration {
        Duration::from_millis(self.plaintext_timeout_ms)
    }

    pub fn tls_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Ports tried against every host that arrives without one.
    pub ports: Vec<u16>,
    pub connect_timeout_ms: u64,
    pub concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ports: vec![
                21, 22, 23, 25, 53, 80, 81, 110, 135, 139, 143, 443, 445,
                993, 995, 1433, 1521, 2375, 3000, 3306, 3389, 5000, 5432,
                5601, 5900, 6379, 7001, 8000, 8008, 8080, 8081, 8443, 8888,
                9000, 9090, 9200, 9443, 11211, 27017,
            ],
            connect_timeout_ms: 1_000,
            concurrency: 200,
        }
    }
}

impl DiscoveryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable name or path of the template engine.
    pub binary: PathBuf,
    /// Template directory handed to the engine with `-t`.
    pub templates_dir: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("nuclei"),
            templates_dir: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Bounded wait for a queue pop before re-checking shutdown (ms)
    pub pop_wait_ms: u64,
    /// Pause after a failed work item (ms)
    pub failure_backoff_ms: u64,
    /// Target sync attempts before the task id is dead-lettered
    pub max_sync_attempts: u32,
    /// Cadence of the task mirror convergence pass (seconds)
    pub task_sync_interval_secs: u64,
    /// Age after which a soft-deleted task without a queued purge is re-enqueued (seconds)
    pub purge_grace_secs: u64,
    /// Time an in-flight item gets to settle once shutdown fires (ms)
    pub drain_grace_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pop_wait_ms: 5_000,
            failure_backoff_ms: 2_000,
            max_sync_attempts: 3,
            task_sync_interval_secs: 60,
            purge_grace_secs: 600,
            drain_grace_ms: 5_000,
        }
    }
}

impl ReconcileConfig {
    pub fn pop_wait(&self) -> Duration {
        Duration::from_millis(self.pop_wait_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn task_sync_interval(&self) -> Duration {
        Duration::from_secs(self.task_sync_interval_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}
