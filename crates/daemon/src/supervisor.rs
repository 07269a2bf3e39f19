//! Top-level control loop.
//!
//! Runs the readiness gate, launches the child, relays signals to it, waits
//! for it to exit, applies the sidecar shutdown plan and reports the exit
//! code the program should terminate with.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use scuttle_core::config::ScuttleConfig;
use scuttle_core::errors::{CoreError, ProcessError};
use scuttle_core::readiness::{ReadinessGate, ReadinessOutcome, WaitBound};
use scuttle_core::shutdown::{ShutdownOrchestrator, ShutdownOutcome};

use crate::executable;
use crate::signals::{ChildSlot, ExitHook, SignalRelay};

/// Exit code when Envoy never became ready under the quit-without-ready policy.
pub const EXIT_ENVOY_NOT_READY: i32 = 1;

/// Owns one supervised run.
pub struct Supervisor {
    config: Arc<ScuttleConfig>,
    orchestrator: Arc<ShutdownOrchestrator>,
    gate: Option<ReadinessGate>,
    child: ChildSlot,
    exit: ExitHook,
    injector: mpsc::UnboundedSender<Signal>,
    injected: mpsc::UnboundedReceiver<Signal>,
}

impl Supervisor {
    pub fn new(config: ScuttleConfig, exit: ExitHook) -> Self {
        let config = Arc::new(config);
        let orchestrator = Arc::new(ShutdownOrchestrator::new(config.clone()));
        let gate = ReadinessGate::from_config(&config);
        let (injector, injected) = mpsc::unbounded_channel();
        Self {
            config,
            orchestrator,
            gate,
            child: ChildSlot::new(),
            exit,
            injector,
            injected,
        }
    }

    /// Replace the readiness gate derived from configuration.
    pub fn with_gate(mut self, gate: Option<ReadinessGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn child(&self) -> ChildSlot {
        self.child.clone()
    }

    /// Sender whose signals the run's relay handles as if the OS had
    /// delivered them.
    pub fn signal_injector(&self) -> mpsc::UnboundedSender<Signal> {
        self.injector.clone()
    }

    /// Run `command` (executable followed by its arguments) to completion and
    /// return the code this program should exit with.
    pub async fn run(self, command: &[String]) -> Result<i32, CoreError> {
        let Some(program) = command.first() else {
            info!("no arguments received, exiting");
            return Ok(0);
        };

        if self.config.logging_enabled {
            info!("logging is now enabled");
        }

        let relay = SignalRelay::with_injector(
            self.injector.clone(),
            self.injected,
            self.child.clone(),
            self.orchestrator.clone(),
            self.exit.clone(),
        );
        if let Err(e) = relay.subscribe_interrupt() {
            warn!(error = %e, "failed to subscribe to SIGINT");
        }

        if let Some(gate) = self.gate {
            let bound = gate.bound();
            match gate.start().wait().await? {
                ReadinessOutcome::Ready { attempts } => {
                    info!(attempts, "blocking finished, Envoy has started");
                }
                ReadinessOutcome::Cancelled => {
                    info!("blocking finished, Envoy has started");
                }
                ReadinessOutcome::TimedOut { attempts } => match bound {
                    WaitBound::QuitWithoutReady(timeout) => {
                        error!(
                            ?timeout,
                            attempts, "blocking timeout reached and Envoy has not started, exiting"
                        );
                        return Ok(EXIT_ENVOY_NOT_READY);
                    }
                    WaitBound::WaitForReady(timeout) => {
                        warn!(
                            ?timeout,
                            attempts,
                            "blocking timeout reached and Envoy has not started, continuing with passed in executable"
                        );
                    }
                    WaitBound::Unbounded => {
                        warn!(attempts, "readiness wait ended without a bound, continuing");
                    }
                },
            }
        }

        let binary = executable::resolve(program)?;

        // Signals arriving between fork and recording the pid are held by
        // the relay instead of being taken as a quit before start.
        self.child.begin_spawn();
        let spawned = Command::new(&binary)
            .arg0(program)
            .args(&command[1..])
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                self.child.abandon_spawn();
                return Err(ProcessError::SpawnFailed {
                    path: binary.display().to_string(),
                    source,
                }
                .into());
            }
        };

        match child.id() {
            Some(id) => {
                self.child.set(Pid::from_raw(id as i32));
                info!(pid = id, binary = %binary.display(), "started child process");
            }
            None => self.child.abandon_spawn(),
        }

        if let Err(e) = relay.subscribe_forwardable() {
            warn!(error = %e, "failed to subscribe to forwardable signals");
        }

        let status = child.wait().await.map_err(ProcessError::WaitFailed)?;
        let exit_code = exit_code_of(status);
        info!(exit_code, "child process exited");

        let report = self.orchestrator.run(exit_code).await;
        match report.outcome {
            ShutdownOutcome::ExitImmediately(code) => Ok(code),
            ShutdownOutcome::Completed => Ok(exit_code),
        }
    }
}

/// Exit code for a finished child. A child killed by a signal reports
/// `128 + signo`, as a shell would.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signo)) => 128 + signo,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_of_normal_exit() {
        assert_eq!(exit_code_of(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[test]
    fn test_exit_code_of_signalled_child() {
        // Raw wait status for "terminated by SIGTERM".
        assert_eq!(exit_code_of(ExitStatus::from_raw(15)), 143);
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 137);
    }
}
