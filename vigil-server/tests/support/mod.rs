#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use vigil_core::{
    config::{ProbeConfig, VigilConfig},
    database::{MemoryDurableStore, MemoryFastStore},
    lifecycle::LifecycleManager,
    scan::{
        CancellationRegistry, EngineError, LivenessProber, MatchHandler,
        PortDiscovery, ScanOrchestrator, ScanRunner, VulnerabilityEngine,
    },
};
use vigil_server::{
    AppState,
    infra::config::{
        Config, ConfigMetadata, CorsConfig, DatabaseConfig, RedisConfig,
        ServerConfig,
    },
    routes::create_app,
};

pub struct NoDiscovery;

#[async_trait]
impl PortDiscovery for NoDiscovery {
    async fn discover(
        &self,
        _hosts: &[String],
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>, EngineError> {
        Ok(Vec::new())
    }
}

/// Blocks until the scan is cancelled.
#[derive(Default)]
pub struct HoldingEngine {
    pub launches: AtomicUsize,
}

#[async_trait]
impl VulnerabilityEngine for HoldingEngine {
    async fn run(
        &self,
        _targets: &[String],
        _handler: &dyn MatchHandler,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        Err(EngineError::Cancelled)
    }
}

pub fn test_config() -> Config {
    let mut scan = VigilConfig::default();
    scan.probe = ProbeConfig {
        concurrency: 4,
        http_timeout_ms: 500,
        plaintext_timeout_ms: 200,
        tls_timeout_ms: 300,
        connect_timeout_ms: 300,
    };
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        database: DatabaseConfig {
            url: "postgres://unused@localhost/vigil".into(),
            max_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://127.0.0.1:6379".into(),
        },
        cors: CorsConfig {
            allowed_origins: Vec::new(),
        },
        scan,
        metadata: ConfigMetadata::default(),
    }
}

/// Router over the memory stores with an engine that holds until stopped.
pub struct TestApp {
    pub router: Router,
    pub lifecycle: Arc<LifecycleManager>,
    pub engine: Arc<HoldingEngine>,
}

impl TestApp {
    pub fn new() -> Result<Self> {
        let config = test_config();
        let durable = MemoryDurableStore::new();
        let fast = MemoryFastStore::new();
        let engine = Arc::new(HoldingEngine::default());

        let orchestrator = ScanOrchestrator::new(
            Arc::new(durable.clone()),
            Arc::new(fast.clone()),
            Arc::new(NoDiscovery),
            Arc::new(LivenessProber::new(config.scan.probe.clone())?),
            engine.clone(),
            config.scan.lifecycle.clone(),
        );
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(durable.clone()),
            Arc::new(fast),
            CancellationRegistry::new(),
            ScanRunner::new(Arc::new(orchestrator)),
            config.scan.lifecycle.clone(),
        ));
        let state = AppState::new(Arc::clone(&lifecycle), Arc::new(config));

        Ok(Self {
            router: create_app(state),
            lifecycle,
            engine,
        })
    }

    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value)> {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, value))
    }
}

/// Accepts connections and never answers, so probing falls back to a bare
/// TCP liveness result.
pub async fn spawn_silent_listener() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    Ok(port)
}

pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("condition not met within {limit:?}"));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
