use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::{net::TcpStream, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DiscoveryConfig;
use crate::scan::engines::{EngineError, PortDiscovery};

/// Connect-scan of a fixed port list.
#[derive(Clone)]
pub struct TcpConnectDiscovery {
    config: Arc<DiscoveryConfig>,
}

impl fmt::Debug for TcpConnectDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnectDiscovery")
            .field("ports", &self.config.ports.len())
            .field("concurrency", &self.config.concurrency)
            .finish()
    }
}

impl TcpConnectDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[async_trait]
impl PortDiscovery for TcpConnectDiscovery {
    async fn discover(
        &self,
        hosts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, EngineError> {
        let hosts: Vec<&str> = hosts
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            target: "vigil::pipeline",
            hosts = hosts.len(),
            ports = self.config.ports.len(),
            "port discovery started"
        );

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut probes = JoinSet::new();
        for host in &hosts {
            for &port in &self.config.ports {
                let address = join_host_port(host, port);
                let permits = Arc::clone(&permits);
                let cancel = cancel.clone();
                let budget = self.config.connect_timeout();
                probes.spawn(async move {
                    let _permit = tokio::select! {
                        _ = cancel.cancelled() => return None,
                        permit = permits.acquire_owned() => permit.ok()?,
                    };
                    let open = tokio::select! {
                        _ = cancel.cancelled() => false,
                        attempt = tokio::time::timeout(budget, TcpStream::connect(&address)) => {
                            matches!(attempt, Ok(Ok(_)))
                        }
                    };
                    open.then_some(address)
                });
            }
        }

        let mut open = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(Some(address)) = joined {
                debug!(target: "vigil::pipeline", %address, "open port");
                open.push(address);
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        open.sort();
        Ok(open)
    }
}
