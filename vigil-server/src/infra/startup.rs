//! Ordered process bring-up and teardown.
//!
//! Storage comes first (schema migrated before anything reads it), then the
//! scan pipeline, then the reconciliation workers. Shutdown walks the same
//! path in reverse once the listener has drained.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::{
    MIGRATOR,
    database::{DurableStore, FastStore, PostgresStore, RedisFastStore},
    lifecycle::LifecycleManager,
    reconcile::ReconcileSupervisor,
    scan::{
        CancellationRegistry, LivenessProber, NucleiCliEngine,
        ScanOrchestrator, ScanRunner, TcpConnectDiscovery,
    },
};

use crate::infra::{
    app_state::AppState,
    config::{Config, ConfigWarnings},
};
use crate::routes::create_app;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "info,vigil::probe=warn,tower_http=warn,sqlx=warn".into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub fn log_warnings(warnings: &ConfigWarnings) {
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(hint = %hint, "{}", warning.message),
            None => warn!("{}", warning.message),
        }
    }
}

pub async fn connect_database(config: &Config) -> Result<PostgresStore> {
    PostgresStore::connect(
        &config.database.url,
        config.database.max_connections,
    )
    .await
    .context("failed to connect to PostgreSQL")
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied");
    Ok(())
}

/// Everything the running process owns besides the listener.
pub struct Services {
    pub lifecycle: Arc<LifecycleManager>,
    pub supervisor: ReconcileSupervisor,
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("lifecycle", &self.lifecycle)
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Wire the pipeline over already-connected stores and start the
    /// reconciliation workers.
    pub fn build(
        config: &Config,
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastStore>,
    ) -> Result<Self> {
        let scan = &config.scan;
        let prober = LivenessProber::new(scan.probe.clone())
            .context("failed to build liveness prober")?;
        let orchestrator = ScanOrchestrator::new(
            Arc::clone(&durable),
            Arc::clone(&fast),
            Arc::new(TcpConnectDiscovery::new(scan.discovery.clone())),
            Arc::new(prober),
            Arc::new(NucleiCliEngine::new(scan.engine.clone())),
            scan.lifecycle.clone(),
        );
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&durable),
            Arc::clone(&fast),
            CancellationRegistry::new(),
            ScanRunner::new(Arc::new(orchestrator)),
            scan.lifecycle.clone(),
        ));

        let shutdown = CancellationToken::new();
        let supervisor = ReconcileSupervisor::spawn(
            durable,
            fast,
            scan.reconcile.clone(),
            &shutdown,
        );

        Ok(Self {
            lifecycle,
            supervisor,
            shutdown,
        })
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let cancelled = self.lifecycle.registry().cancel_all();
        if cancelled > 0 {
            info!(cancelled, "cancelled running scans");
        }
        self.supervisor.shutdown().await;
        self.lifecycle.runner().shutdown().await;
        info!("shutdown complete");
    }
}

/// Bring up storage and services, then serve until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    let store = connect_database(&config).await?;
    migrate(store.pool()).await?;
    let durable: Arc<dyn DurableStore> = Arc::new(store);

    let fast: Arc<dyn FastStore> = Arc::new(
        RedisFastStore::connect(&config.redis.url)
            .await
            .context("failed to connect to Redis")?,
    );

    let services = Services::build(&config, durable, fast)?;
    let config = Arc::new(config);
    let state =
        AppState::new(Arc::clone(&services.lifecycle), Arc::clone(&config));
    let app = create_app(state);

    let bind = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("Vigil listening on {}", bind);

    let serve_token = services.shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(serve_token))
        .await
        .context("server error");

    services.shutdown().await;
    served
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        }
        _ = token.cancelled() => {}
    }
}
