#![allow(dead_code)]

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::Mutex,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use vigil_core::{
    config::{LifecycleConfig, ProbeConfig, ReconcileConfig},
    database::{MemoryDurableStore, MemoryFastStore},
    lifecycle::LifecycleManager,
    scan::{
        CancellationRegistry, EngineError, LivenessProber, MatchEvent,
        MatchHandler, PortDiscovery, ScanOrchestrator, ScanRunner,
        VulnerabilityEngine,
    },
};

const HTTP_REPLY: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Probe timeouts short enough for tests against localhost.
pub fn fast_probe_config() -> ProbeConfig {
    ProbeConfig {
        concurrency: 8,
        http_timeout_ms: 1_000,
        plaintext_timeout_ms: 300,
        tls_timeout_ms: 600,
        connect_timeout_ms: 500,
    }
}

pub fn fast_reconcile_config() -> ReconcileConfig {
    ReconcileConfig {
        pop_wait_ms: 50,
        failure_backoff_ms: 10,
        max_sync_attempts: 2,
        task_sync_interval_secs: 1,
        purge_grace_secs: 600,
        drain_grace_ms: 200,
    }
}

/// Discovery stub mapping hosts to canned endpoints.
///
/// With `failure_after_cancel` set it instead blocks until the scan is
/// cancelled and then reports a generic failure, the way a collaborator
/// that does not distinguish cancellation would.
#[derive(Debug, Default)]
pub struct StubDiscovery {
    answers: HashMap<String, Vec<String>>,
    pub calls: Mutex<Vec<Vec<String>>>,
    pub failure_after_cancel: Option<String>,
}

impl StubDiscovery {
    pub fn failing_after_cancel(message: &str) -> Self {
        Self {
            failure_after_cancel: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with(mut self, host: &str, endpoints: &[&str]) -> Self {
        self.answers.insert(
            host.to_string(),
            endpoints.iter().map(|e| e.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl PortDiscovery for StubDiscovery {
    async fn discover(
        &self,
        hosts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.calls.lock().await.push(hosts.to_vec());
        if let Some(message) = &self.failure_after_cancel {
            cancel.cancelled().await;
            return Err(EngineError::Failed(message.clone()));
        }
        Ok(hosts
            .iter()
            .flat_map(|host| self.answers.get(host).cloned().unwrap_or_default())
            .collect())
    }
}

/// Engine stub that records what it was given.
///
/// Emits `events` through the handler, then either returns or, when
/// `hold_until_cancelled` is set, blocks until the scan is cancelled.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    pub received: Mutex<Vec<Vec<String>>>,
    pub launches: AtomicUsize,
    pub events: Vec<serde_json::Value>,
    pub hold_until_cancelled: bool,
    pub failure: Option<String>,
    pub panic_with: Option<String>,
}

impl RecordingEngine {
    pub fn holding() -> Self {
        Self {
            hold_until_cancelled: true,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VulnerabilityEngine for RecordingEngine {
    async fn run(
        &self,
        targets: &[String],
        handler: &dyn MatchHandler,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.received.lock().await.push(targets.to_vec());

        for raw in &self.events {
            if let Some(event) = MatchEvent::from_json(raw.clone()) {
                handler.on_match(event).await;
            }
        }
        if let Some(message) = &self.panic_with {
            panic!("{message}");
        }
        if let Some(message) = &self.failure {
            return Err(EngineError::Failed(message.clone()));
        }
        if self.hold_until_cancelled {
            cancel.cancelled().await;
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

pub fn match_event(
    template: &str,
    host: &str,
    confirmed: bool,
) -> serde_json::Value {
    json!({
        "template-id": template,
        "info": { "name": template, "severity": "high" },
        "host": host,
        "matched-at": format!("{host}/"),
        "matcher-status": confirmed,
        "response": "HTTP/1.1 200 OK\r\n\r\n",
    })
}

/// Everything a lifecycle test needs, wired against the memory stores.
pub struct Harness {
    pub durable: MemoryDurableStore,
    pub fast: MemoryFastStore,
    pub registry: CancellationRegistry,
    pub engine: Arc<RecordingEngine>,
    pub discovery: Arc<StubDiscovery>,
    pub lifecycle: LifecycleManager,
}

impl Harness {
    pub fn new(discovery: StubDiscovery, engine: RecordingEngine) -> Result<Self> {
        let durable = MemoryDurableStore::new();
        let fast = MemoryFastStore::new();
        let registry = CancellationRegistry::new();
        let engine = Arc::new(engine);
        let discovery = Arc::new(discovery);
        let config = LifecycleConfig::default();

        let orchestrator = ScanOrchestrator::new(
            Arc::new(durable.clone()),
            Arc::new(fast.clone()),
            discovery.clone(),
            Arc::new(LivenessProber::new(fast_probe_config())?),
            engine.clone(),
            config.clone(),
        );
        let lifecycle = LifecycleManager::new(
            Arc::new(durable.clone()),
            Arc::new(fast.clone()),
            registry.clone(),
            ScanRunner::new(Arc::new(orchestrator)),
            config,
        );

        Ok(Self {
            durable,
            fast,
            registry,
            engine,
            discovery,
            lifecycle,
        })
    }
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(anyhow!("condition not met within {limit:?}"))
}

/// Plain TCP listener that answers any request with `200 OK`.
pub async fn spawn_http_listener() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if stream.read(&mut buf).await.is_ok() {
                    let _ = stream.write_all(HTTP_REPLY).await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });
    Ok(port)
}

/// Accepts connections and never says anything.
pub async fn spawn_silent_listener() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                drop(stream);
            });
        }
    });
    Ok(port)
}

/// TLS listener with a throwaway self-signed certificate that answers any
/// request with `200 OK` once the handshake completes.
pub async fn spawn_tls_listener() -> Result<u16> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .context("generate certificate")?;
    let cert_der = CertificateDer::from(cert.serialize_der()?);
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        cert.serialize_private_key_der(),
    ));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                if tls.read(&mut buf).await.is_ok() {
                    let _ = tls.write_all(HTTP_REPLY).await;
                    let _ = tls.shutdown().await;
                }
            });
        }
    });
    Ok(port)
}
