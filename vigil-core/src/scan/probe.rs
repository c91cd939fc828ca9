//! Liveness and protocol detection for scan endpoints.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use rustls_pki_types::ServerName;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::Semaphore,
    task::JoinSet,
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::error::{CoreError, Result};
use crate::scan::{
    engines::EngineError,
    targets::{has_http_scheme, normalize, split_host_port},
    tls::insecure_client_config,
};

const HEAD_REQUEST: &[u8] = b"HEAD / HTTP/1.0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
    /// Accepts connections but did not speak HTTP.
    Tcp,
}

/// A confirmed-alive endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alive {
    pub protocol: Protocol,
    /// `http(s)://host[:port]` for web endpoints, bare `host:port` otherwise.
    pub address: String,
}

impl Alive {
    fn new(protocol: Protocol, address: impl Into<String>) -> Self {
        Self {
            protocol,
            address: address.into(),
        }
    }
}

/// Alive endpoints keyed by the normalized target.
pub type LivenessMap = HashMap<String, Alive>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Candidate {
    /// Confirm with a GET and a [200, 400) status.
    Get(String),
    /// Protocol probe already confirmed the endpoint.
    Detected(Alive),
    /// Fall back to a bare TCP connect.
    Connect(String),
}

#[derive(Clone)]
pub struct LivenessProber {
    config: ProbeConfig,
    http: reqwest::Client,
    tls: TlsConnector,
}

impl fmt::Debug for LivenessProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivenessProber")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LivenessProber {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.http_timeout())
            .no_proxy()
            .build()
            .map_err(|e| CoreError::Engine(format!("http client: {e}")))?;
        let tls = TlsConnector::from(insecure_client_config()?);

        Ok(Self { config, http, tls })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe every target with at most `concurrency` attempts in flight.
    ///
    /// Returns [`EngineError::Cancelled`] once `cancel` fires; partial
    /// results are discarded in that case.
    pub async fn probe(
        &self,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<LivenessMap, EngineError> {
        let mut alive = LivenessMap::new();
        if targets.is_empty() {
            return Ok(alive);
        }

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut workers = JoinSet::new();

        for raw in targets {
            let raw = raw.trim().to_string();
            if raw.is_empty() {
                continue;
            }
            let prober = self.clone();
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    permit = permits.acquire_owned() => permit.ok()?,
                };
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    found = prober.probe_one(&raw) => found,
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Some((key, endpoint))) => {
                    alive.insert(key, endpoint);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "vigil::probe", error = %err, "probe worker failed");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(alive)
    }

    /// Probe a single target; the first candidate that succeeds wins.
    pub async fn probe_one(&self, raw: &str) -> Option<(String, Alive)> {
        let key = normalize(raw);
        if key.is_empty() {
            return None;
        }

        for candidate in self.candidates(raw.trim()).await {
            let found = match candidate {
                Candidate::Detected(alive) => Some(alive),
                Candidate::Get(url) => self.confirm_get(&url).await,
                Candidate::Connect(address) => self
                    .confirm_connect(&address)
                    .await
                    .then(|| Alive::new(Protocol::Tcp, address)),
            };
            if let Some(alive) = found {
                debug!(target: "vigil::probe", target = %key, address = %alive.address, "endpoint alive");
                return Some((key, alive));
            }
        }
        None
    }

    async fn candidates(&self, target: &str) -> Vec<Candidate> {
        if has_http_scheme(target) {
            return vec![Candidate::Get(target.to_string())];
        }

        let Some((host, _port)) = split_host_port(target) else {
            return vec![
                Candidate::Get(format!("http://{target}")),
                Candidate::Get(format!("https://{target}")),
            ];
        };

        if self.is_plaintext_http(target).await {
            return vec![Candidate::Detected(Alive::new(
                Protocol::Http,
                format!("http://{target}"),
            ))];
        }
        if self.is_tls_http(host, target).await {
            return vec![Candidate::Detected(Alive::new(
                Protocol::Https,
                format!("https://{target}"),
            ))];
        }
        vec![Candidate::Connect(target.to_string())]
    }

    async fn confirm_get(&self, url: &str) -> Option<Alive> {
        let response = self.http.get(url).send().await.ok()?;
        let status = response.status().as_u16();
        if !(200..400).contains(&status) {
            return None;
        }
        let protocol = if url.starts_with("https://") {
            Protocol::Https
        } else {
            Protocol::Http
        };
        Some(Alive::new(protocol, url))
    }

    async fn confirm_connect(&self, address: &str) -> bool {
        matches!(
            tokio::time::timeout(
                self.config.connect_timeout(),
                TcpStream::connect(address)
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn is_plaintext_http(&self, address: &str) -> bool {
        within(self.config.plaintext_timeout(), async {
            let stream = TcpStream::connect(address).await.ok()?;
            Some(head_answers_http(stream).await)
        })
        .await
    }

    async fn is_tls_http(&self, host: &str, address: &str) -> bool {
        within(self.config.tls_timeout(), async {
            let server_name = ServerName::try_from(host.to_string()).ok()?;
            let stream = TcpStream::connect(address).await.ok()?;
            let tls = self.tls.connect(server_name, stream).await.ok()?;
            Some(head_answers_http(tls).await)
        })
        .await
    }
}

async fn within<F>(budget: Duration, probe: F) -> bool
where
    F: Future<Output = Option<bool>>,
{
    matches!(tokio::time::timeout(budget, probe).await, Ok(Some(true)))
}

/// Send a bare HEAD and check whether the first line is an HTTP status line.
async fn head_answers_http<S>(mut stream: S) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if stream.write_all(HEAD_REQUEST).await.is_err() {
        return false;
    }
    if stream.flush().await.is_err() {
        return false;
    }
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(read) if read > 0 => line.trim().starts_with("HTTP/"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hosts_without_port_get_both_schemes() {
        let prober = LivenessProber::new(ProbeConfig::default()).unwrap();
        let candidates = prober.candidates("example.internal").await;
        assert_eq!(
            candidates,
            vec![
                Candidate::Get("http://example.internal".into()),
                Candidate::Get("https://example.internal".into()),
            ]
        );
    }

    #[tokio::test]
    async fn scheme_targets_are_used_as_is() {
        let prober = LivenessProber::new(ProbeConfig::default()).unwrap();
        let candidates = prober.candidates("https://a.test:9443/x").await;
        assert_eq!(
            candidates,
            vec![Candidate::Get("https://a.test:9443/x".into())]
        );
    }

    #[tokio::test]
    async fn empty_input_probes_nothing() {
        let prober = LivenessProber::new(ProbeConfig::default()).unwrap();
        let map = prober
            .probe(&[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(map.is_empty());
    }
}
