//! # Vigil Core
//!
//! Scan orchestration and dual-store consistency engine for the Vigil DAST
//! service.
//!
//! ## Overview
//!
//! - **Lifecycle**: create, start, stop and delete tasks with the durable
//!   store written first and the mirror following
//! - **Scan pipeline**: target splitting, port discovery, liveness and
//!   protocol detection, vulnerability scanning
//! - **Cancellation**: per-task handles owned by the running execution
//! - **Reconciliation**: queue-driven and periodic workers that repair
//!   divergence between the stores
//!
//! ## Architecture
//!
//! - [`database`]: store ports plus PostgreSQL, Redis and in-memory adapters
//! - [`scan`]: engines, prober, orchestrator and runner
//! - [`lifecycle`]: the task state machine and read-side queries
//! - [`reconcile`]: background repair workers
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use vigil_core::{
//!     config::VigilConfig,
//!     database::{MemoryDurableStore, MemoryFastStore},
//!     lifecycle::{CreateTaskCommand, LifecycleManager},
//!     scan::{
//!         CancellationRegistry, LivenessProber, NucleiCliEngine,
//!         ScanOrchestrator, ScanRunner, TcpConnectDiscovery,
//!     },
//! };
//!
//! # async fn demo() -> vigil_core::Result<()> {
//! let config = VigilConfig::default();
//! let durable = Arc::new(MemoryDurableStore::new());
//! let fast = Arc::new(MemoryFastStore::new());
//! let orchestrator = ScanOrchestrator::new(
//!     durable.clone(),
//!     fast.clone(),
//!     Arc::new(TcpConnectDiscovery::new(config.discovery.clone())),
//!     Arc::new(LivenessProber::new(config.probe.clone())?),
//!     Arc::new(NucleiCliEngine::new(config.engine.clone())),
//!     config.lifecycle.clone(),
//! );
//! let lifecycle = LifecycleManager::new(
//!     durable,
//!     fast,
//!     CancellationRegistry::new(),
//!     ScanRunner::new(Arc::new(orchestrator)),
//!     config.lifecycle,
//! );
//!
//! let created = lifecycle
//!     .create(CreateTaskCommand {
//!         task_name: "perimeter".into(),
//!         targets: vec!["10.0.0.1:8080".into(), "example.internal".into()],
//!         ..Default::default()
//!     })
//!     .await?;
//! let handle = lifecycle.start(&created.task.id).await?;
//! println!("{:?}", handle.join().await);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod config;
pub mod database;
pub mod error;
pub mod lifecycle;
pub mod reconcile;
pub mod scan;

pub use error::{CoreError, Result};

/// Schema migrations for the durable store.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
