//! scuttle entry point.
//!
//! Wraps a workload running next to an Envoy/Istio sidecar: waits for the
//! proxy to become ready, runs the workload, relays signals to it and shuts
//! the sidecar down once it exits.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scuttle::signals;
use scuttle::Supervisor;
use scuttle_core::config::{parse_bool, ScuttleConfig, ENV_LOGGING};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Run a command next to a service-mesh sidecar.
///
/// Every argument is passed through to the command unchanged; settings come
/// from the environment.
#[derive(Parser, Debug)]
#[command(
    name = "scuttle",
    version,
    about,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// Executable to run, followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // The logging flag is read ahead of the rest so that warnings about
    // other variables reach the subscriber.
    let logging_enabled = std::env::var(ENV_LOGGING)
        .ok()
        .and_then(|v| parse_bool(ENV_LOGGING, v.trim()).ok())
        .unwrap_or(true);

    let filter = if logging_enabled {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new("off")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let config = ScuttleConfig::from_env();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "scuttle starting up"
    );

    let code = Supervisor::new(config, signals::process_exit())
        .run(&cli.command)
        .await
        .context("scuttle failed to run the command")?;

    std::process::exit(code);
}
