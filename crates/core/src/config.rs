//! Environment-based configuration for scuttle.
//!
//! Every setting comes from an environment variable. Values that fail to
//! parse are logged and replaced with the default for that variable rather
//! than aborting startup; the resolved [`ScuttleConfig`] is immutable and is
//! handed explicitly to each component.

use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Variable names
// ---------------------------------------------------------------------------

pub const ENV_LOGGING: &str = "SCUTTLE_LOGGING";
pub const ENV_ENVOY_ADMIN_API: &str = "ENVOY_ADMIN_API";
pub const ENV_START_WITHOUT_ENVOY: &str = "START_WITHOUT_ENVOY";
pub const ENV_WAIT_FOR_ENVOY_TIMEOUT: &str = "WAIT_FOR_ENVOY_TIMEOUT";
pub const ENV_QUIT_WITHOUT_ENVOY_TIMEOUT: &str = "QUIT_WITHOUT_ENVOY_TIMEOUT";
pub const ENV_GENERIC_QUIT_ONLY: &str = "GENERIC_QUIT_ONLY";
pub const ENV_GENERIC_QUIT_ENDPOINTS: &str = "GENERIC_QUIT_ENDPOINTS";
pub const ENV_QUIT_REQUEST_TIMEOUT: &str = "QUIT_REQUEST_TIMEOUT";
pub const ENV_ISTIO_QUIT_API: &str = "ISTIO_QUIT_API";
pub const ENV_NEVER_KILL_ISTIO: &str = "NEVER_KILL_ISTIO";
pub const ENV_NEVER_KILL_ISTIO_ON_FAILURE: &str = "NEVER_KILL_ISTIO_ON_FAILURE";

/// Envoy admin port and the pilot-agent port that serves `/quitquitquit`.
const ENVOY_ADMIN_PORT: &str = ":15000";
const PILOT_AGENT_PORT: &str = ":15020";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Resolved supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScuttleConfig {
    /// Emit log output at all.
    pub logging_enabled: bool,

    /// Envoy admin API base URL. Empty disables the readiness gate and the
    /// Istio shutdown path.
    pub envoy_admin_api: String,

    /// Start the child immediately without polling Envoy.
    pub start_without_envoy: bool,

    /// Give up waiting after this long and start the child anyway (zero = off).
    pub wait_for_envoy_timeout: Duration,

    /// Give up waiting after this long and exit without starting the child
    /// (zero = off). Takes precedence over `wait_for_envoy_timeout`.
    pub quit_without_envoy_timeout: Duration,

    /// Only call the generic quit endpoints on shutdown.
    pub generic_quit_only: bool,

    /// URLs that receive a `POST` when the child exits.
    pub generic_quit_endpoints: Vec<String>,

    /// Shared deadline for each batch of shutdown requests.
    pub quit_request_timeout: Duration,

    /// Base URL of the Istio agent API that serves `/quitquitquit`.
    pub istio_quit_api: String,

    /// Never shut down the Istio sidecar.
    pub never_kill_istio: bool,

    /// Leave the Istio sidecar running when the child exits non-zero.
    pub never_kill_istio_on_failure: bool,
}

fn default_quit_request_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ScuttleConfig {
    fn default() -> Self {
        Self {
            logging_enabled: true,
            envoy_admin_api: String::new(),
            start_without_envoy: false,
            wait_for_envoy_timeout: Duration::ZERO,
            quit_without_envoy_timeout: Duration::ZERO,
            generic_quit_only: false,
            generic_quit_endpoints: Vec::new(),
            quit_request_timeout: default_quit_request_timeout(),
            istio_quit_api: String::new(),
            never_kill_istio: false,
            never_kill_istio_on_failure: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl ScuttleConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unset and empty variables take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let envoy_admin_api = get(ENV_ENVOY_ADMIN_API)
            .map(|v| trim_base_url(&v))
            .unwrap_or_default();

        let istio_quit_api = get(ENV_ISTIO_QUIT_API)
            .map(|v| trim_base_url(&v))
            .unwrap_or_else(|| derive_istio_quit_api(&envoy_admin_api));

        let config = Self {
            logging_enabled: bool_or(get(ENV_LOGGING), ENV_LOGGING, defaults.logging_enabled),
            start_without_envoy: bool_or(
                get(ENV_START_WITHOUT_ENVOY),
                ENV_START_WITHOUT_ENVOY,
                defaults.start_without_envoy,
            ),
            wait_for_envoy_timeout: duration_or(
                get(ENV_WAIT_FOR_ENVOY_TIMEOUT),
                ENV_WAIT_FOR_ENVOY_TIMEOUT,
                defaults.wait_for_envoy_timeout,
            ),
            quit_without_envoy_timeout: duration_or(
                get(ENV_QUIT_WITHOUT_ENVOY_TIMEOUT),
                ENV_QUIT_WITHOUT_ENVOY_TIMEOUT,
                defaults.quit_without_envoy_timeout,
            ),
            generic_quit_only: bool_or(
                get(ENV_GENERIC_QUIT_ONLY),
                ENV_GENERIC_QUIT_ONLY,
                defaults.generic_quit_only,
            ),
            generic_quit_endpoints: get(ENV_GENERIC_QUIT_ENDPOINTS)
                .map(|v| split_endpoints(&v))
                .unwrap_or_default(),
            quit_request_timeout: duration_or(
                get(ENV_QUIT_REQUEST_TIMEOUT),
                ENV_QUIT_REQUEST_TIMEOUT,
                defaults.quit_request_timeout,
            ),
            never_kill_istio: bool_or(
                get(ENV_NEVER_KILL_ISTIO),
                ENV_NEVER_KILL_ISTIO,
                defaults.never_kill_istio,
            ),
            never_kill_istio_on_failure: bool_or(
                get(ENV_NEVER_KILL_ISTIO_ON_FAILURE),
                ENV_NEVER_KILL_ISTIO_ON_FAILURE,
                defaults.never_kill_istio_on_failure,
            ),
            envoy_admin_api,
            istio_quit_api,
        };

        debug!(?config, "configuration resolved from environment");
        config
    }

    /// Whether the readiness gate should poll Envoy before starting the child.
    pub fn waits_for_envoy(&self) -> bool {
        !self.envoy_admin_api.is_empty() && !self.start_without_envoy
    }
}

// ---------------------------------------------------------------------------
// Value parsing
// ---------------------------------------------------------------------------

/// Parse a boolean flag value.
pub fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var: var.into(),
            value: value.into(),
        }),
    }
}

/// Parse a duration such as `50ms`, `15s` or `1m30s`. A bare integer is
/// taken as seconds.
pub fn parse_duration(var: &str, value: &str) -> Result<Duration, ConfigError> {
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).map_err(|e| ConfigError::InvalidDuration {
        var: var.into(),
        value: value.into(),
        detail: e.to_string(),
    })
}

fn bool_or(value: Option<String>, var: &str, default: bool) -> bool {
    match value {
        None => default,
        Some(v) => parse_bool(var, &v).unwrap_or_else(|e| {
            warn!(error = %e, default, "using default value");
            default
        }),
    }
}

fn duration_or(value: Option<String>, var: &str, default: Duration) -> Duration {
    match value {
        None => default,
        Some(v) => parse_duration(var, &v).unwrap_or_else(|e| {
            warn!(error = %e, ?default, "using default value");
            default
        }),
    }
}

/// Split a comma-separated endpoint list, dropping blank entries.
///
/// Surrounding whitespace is kept here and trimmed by the notifier at send
/// time.
fn split_endpoints(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn trim_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Istio serves `/quitquitquit` from the pilot-agent port rather than the
/// Envoy admin port.
fn derive_istio_quit_api(envoy_admin_api: &str) -> String {
    if envoy_admin_api.contains(ENVOY_ADMIN_PORT) {
        envoy_admin_api.replacen(ENVOY_ADMIN_PORT, PILOT_AGENT_PORT, 1)
    } else {
        envoy_admin_api.to_string()
    }
}
