//! Scan pipeline: target handling, collaborator engines, probing and the
//! per-task execution machinery.

pub mod cancellation;
pub mod discovery;
pub mod engines;
pub mod nuclei;
pub mod orchestrator;
pub mod probe;
pub mod runner;
pub mod sink;
pub mod targets;
pub mod tls;

pub use cancellation::{CancellationRegistry, RegistrationGuard};
pub use discovery::TcpConnectDiscovery;
pub use engines::{
    EngineError, MatchEvent, MatchHandler, PortDiscovery, VulnerabilityEngine,
};
pub use nuclei::NucleiCliEngine;
pub use orchestrator::{ScanOrchestrator, ScanOutcome, Stage};
pub use probe::{Alive, LivenessMap, LivenessProber, Protocol};
pub use runner::{ScanHandle, ScanRunner};
pub use sink::ResultSink;
pub use targets::{SplitTargets, normalize, split_targets};
