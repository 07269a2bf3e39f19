//! Sidecar shutdown orchestration.
//!
//! [`ShutdownPlan::decide`] is a pure, ordered guard chain over the
//! configuration and the child's exit code. [`ShutdownOrchestrator`] carries
//! out the chosen plan once per run through the [`SidecarNotifier`].

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::ScuttleConfig;
use crate::notify::{QuitAttempt, SidecarNotifier};

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Why the Istio sidecar is left running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AdminApiUnset,
    AdminApiNotLocal,
    NeverKillIstio,
    NeverKillIstioOnFailure,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdminApiUnset => write!(f, "ENVOY_ADMIN_API not set"),
            Self::AdminApiNotLocal => write!(f, "ENVOY_ADMIN_API is not a localhost or 127.0.0.1"),
            Self::NeverKillIstio => write!(f, "NEVER_KILL_ISTIO is true"),
            Self::NeverKillIstioOnFailure => write!(f, "NEVER_KILL_ISTIO_ON_FAILURE is true"),
        }
    }
}

/// What to do with the sidecars once the child is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPlan {
    /// Only the generic quit endpoints; no Istio call.
    GenericOnly,
    /// Leave all sidecars alone and return to the caller.
    Skip(SkipReason),
    /// Leave all sidecars alone and terminate the program right away with
    /// the given code.
    SkipAndExit(i32),
    /// Generic quit endpoints and the Istio `/quitquitquit`.
    GenericAndIstio,
}

impl ShutdownPlan {
    /// Select the plan for a child that exited with `exit_code`. The first
    /// matching guard wins.
    pub fn decide(config: &ScuttleConfig, exit_code: i32) -> Self {
        if config.generic_quit_only {
            Self::GenericOnly
        } else if config.envoy_admin_api.is_empty() {
            Self::Skip(SkipReason::AdminApiUnset)
        } else if !is_loopback(&config.envoy_admin_api) {
            Self::Skip(SkipReason::AdminApiNotLocal)
        } else if config.never_kill_istio {
            Self::Skip(SkipReason::NeverKillIstio)
        } else if config.never_kill_istio_on_failure && exit_code != 0 {
            Self::SkipAndExit(exit_code)
        } else {
            Self::GenericAndIstio
        }
    }
}

/// Whether a sidecar URL points at this host.
pub fn is_loopback(url: &str) -> bool {
    url.contains("127.0.0.1") || url.contains("localhost")
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// How the caller should proceed after shutdown handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Continue to the common exit path.
    Completed,
    /// Terminate immediately with this code, skipping anything else.
    ExitImmediately(i32),
}

/// Record of one orchestrator run.
#[derive(Debug)]
pub struct ShutdownReport {
    pub plan: ShutdownPlan,
    pub outcome: ShutdownOutcome,
    pub attempts: Vec<QuitAttempt>,
}

/// Applies the shutdown plan for a run.
pub struct ShutdownOrchestrator {
    config: Arc<ScuttleConfig>,
    notifier: SidecarNotifier,
}

impl ShutdownOrchestrator {
    pub fn new(config: Arc<ScuttleConfig>) -> Self {
        let notifier = SidecarNotifier::new(config.quit_request_timeout);
        Self { config, notifier }
    }

    pub fn with_notifier(config: Arc<ScuttleConfig>, notifier: SidecarNotifier) -> Self {
        Self { config, notifier }
    }

    /// Decide and execute the plan for `exit_code`.
    pub async fn run(&self, exit_code: i32) -> ShutdownReport {
        let plan = ShutdownPlan::decide(&self.config, exit_code);
        let mut attempts = Vec::new();

        let outcome = match plan {
            ShutdownPlan::GenericOnly => {
                log_kill("Stopping generic endpoints only", "GENERIC_QUIT_ONLY is true", exit_code);
                attempts.extend(
                    self.notifier
                        .notify_generic(&self.config.generic_quit_endpoints)
                        .await,
                );
                ShutdownOutcome::Completed
            }
            ShutdownPlan::Skip(reason) => {
                log_kill("Skipping Istio kill", &reason.to_string(), exit_code);
                ShutdownOutcome::Completed
            }
            ShutdownPlan::SkipAndExit(code) => {
                log_kill(
                    "Skipping Istio kill",
                    &SkipReason::NeverKillIstioOnFailure.to_string(),
                    exit_code,
                );
                ShutdownOutcome::ExitImmediately(code)
            }
            ShutdownPlan::GenericAndIstio => {
                log_kill("Stopping Istio with API", "ISTIO_QUIT_API is set", exit_code);
                attempts.extend(
                    self.notifier
                        .notify_generic(&self.config.generic_quit_endpoints)
                        .await,
                );
                attempts.push(self.notifier.notify_mesh(&self.config.istio_quit_api).await);
                ShutdownOutcome::Completed
            }
        };

        ShutdownReport {
            plan,
            outcome,
            attempts,
        }
    }
}

fn log_kill(action: &str, reason: &str, exit_code: i32) {
    info!(action, reason, exit_code, "kill received");
}
