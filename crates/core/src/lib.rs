//! scuttle core library.
//!
//! Lifecycle logic for running a workload next to a service-mesh sidecar:
//! configuration, the Envoy readiness gate, sidecar shutdown notifications,
//! and the shutdown decision chain applied when the workload exits.

pub mod config;
pub mod errors;
pub mod notify;
pub mod readiness;
pub mod shutdown;

// Re-exports for convenience.
pub use config::ScuttleConfig;
pub use notify::SidecarNotifier;
pub use readiness::{ReadinessGate, ReadinessOutcome, WaitBound};
pub use shutdown::{ShutdownOrchestrator, ShutdownOutcome, ShutdownPlan};
