//! Readiness gate: block child startup until Envoy reports `LIVE`.
//!
//! The gate polls `{envoy_admin_api}/server_info` on a background task with
//! exponential backoff. The wait is bounded by the quit-without-ready timeout
//! if set, else by the wait-for-ready timeout if set, else unbounded. What to
//! do on timeout is the caller's decision; the gate only reports it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScuttleConfig;
use crate::errors::ReadinessError;

pub const SERVER_INFO_PATH: &str = "/server_info";

/// The only `state` value treated as ready.
pub const LIVE_STATE: &str = "LIVE";

// ---------------------------------------------------------------------------
// Wire type
// ---------------------------------------------------------------------------

/// Subset of Envoy's `GET /server_info` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub state: String,
}

impl ServerInfo {
    pub fn is_live(&self) -> bool {
        self.state == LIVE_STATE
    }
}

// ---------------------------------------------------------------------------
// Bound and outcome
// ---------------------------------------------------------------------------

/// Which timeout, if any, limits the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBound {
    /// On expiry the whole program exits without starting the child.
    QuitWithoutReady(Duration),
    /// On expiry the child is started anyway.
    WaitForReady(Duration),
    /// Wait until Envoy is live or the wait is cancelled.
    Unbounded,
}

impl WaitBound {
    /// Pick the active bound. A non-zero quit-without-ready timeout takes
    /// precedence over a non-zero wait-for-ready timeout.
    pub fn from_timeouts(quit_without_ready: Duration, wait_for_ready: Duration) -> Self {
        if !quit_without_ready.is_zero() {
            Self::QuitWithoutReady(quit_without_ready)
        } else if !wait_for_ready.is_zero() {
            Self::WaitForReady(wait_for_ready)
        } else {
            Self::Unbounded
        }
    }

    pub fn from_config(config: &ScuttleConfig) -> Self {
        Self::from_timeouts(config.quit_without_envoy_timeout, config.wait_for_envoy_timeout)
    }

    pub fn limit(&self) -> Option<Duration> {
        match self {
            Self::QuitWithoutReady(d) | Self::WaitForReady(d) => Some(*d),
            Self::Unbounded => None,
        }
    }
}

/// How a readiness wait resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// Envoy reported `LIVE` on the given (1-based) attempt.
    Ready { attempts: u32 },
    /// The bound elapsed first. Polling has stopped.
    TimedOut { attempts: u32 },
    /// The caller cancelled the wait before either of the above.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with randomisation between probe attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Each delay is drawn from `[d * (1 - r), d * (1 + r)]`.
    pub randomization_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            randomization_factor: 0.5,
        }
    }
}

impl BackoffPolicy {
    /// Fixed delay with no growth or jitter.
    pub fn constant(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            multiplier: 1.0,
            max_interval: interval,
            randomization_factor: 0.0,
        }
    }

    /// Un-jittered delay after the given failed attempt (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay after the given failed attempt with randomisation applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.randomization_factor <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.randomization_factor;
        let low = base.as_secs_f64() - spread;
        let high = base.as_secs_f64() + spread;
        Duration::from_secs_f64(rand::thread_rng().gen_range(low.max(0.0)..=high))
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Polls Envoy until it is live, bounded by a [`WaitBound`].
pub struct ReadinessGate {
    server_info_url: String,
    bound: WaitBound,
    backoff: BackoffPolicy,
    http: reqwest::Client,
}

impl ReadinessGate {
    /// Build a gate for the given admin API base URL.
    pub fn new(envoy_admin_api: &str, bound: WaitBound) -> Self {
        let server_info_url = format!(
            "{}{}",
            envoy_admin_api.trim_end_matches('/'),
            SERVER_INFO_PATH
        );
        Self {
            server_info_url,
            bound,
            backoff: BackoffPolicy::default(),
            http: reqwest::Client::new(),
        }
    }

    /// Build a gate from configuration, or `None` when waiting is disabled
    /// (no admin API configured, or `START_WITHOUT_ENVOY` set).
    pub fn from_config(config: &ScuttleConfig) -> Option<Self> {
        if !config.waits_for_envoy() {
            debug!(
                admin_api = %config.envoy_admin_api,
                start_without_envoy = config.start_without_envoy,
                "readiness gate disabled"
            );
            return None;
        }
        Some(Self::new(&config.envoy_admin_api, WaitBound::from_config(config)))
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn bound(&self) -> WaitBound {
        self.bound
    }

    pub fn server_info_url(&self) -> &str {
        &self.server_info_url
    }

    /// Start polling on a background task.
    pub fn start(self) -> ReadinessWait {
        info!(url = %self.server_info_url, bound = ?self.bound, "blocking until Envoy starts");

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { self.run(task_cancel).await });

        ReadinessWait { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) -> ReadinessOutcome {
        let attempts = AtomicU32::new(0);

        let bounded = async {
            match self.bound.limit() {
                // Dropping the poll future on expiry abandons any in-flight probe.
                Some(limit) => tokio::time::timeout(limit, self.poll_until_live(&attempts))
                    .await
                    .ok(),
                None => Some(self.poll_until_live(&attempts).await),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => ReadinessOutcome::Cancelled,
            result = bounded => match result {
                Some(attempts) => ReadinessOutcome::Ready { attempts },
                None => ReadinessOutcome::TimedOut {
                    attempts: attempts.load(Ordering::Acquire),
                },
            },
        }
    }

    /// Probe until `LIVE`, returning the number of attempts made.
    async fn poll_until_live(&self, attempts: &AtomicU32) -> u32 {
        loop {
            let attempt = attempts.fetch_add(1, Ordering::AcqRel) + 1;
            match self.probe().await {
                Ok(info) if info.is_live() => {
                    debug!(attempt, "Envoy reported LIVE");
                    return attempt;
                }
                Ok(info) => {
                    info!(attempt, state = %info.state, "polling Envoy, not ready yet");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "polling Envoy failed");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
        }
    }

    /// Issue a single `GET /server_info`.
    pub async fn probe(&self) -> Result<ServerInfo, ReadinessError> {
        let info = self
            .http
            .get(&self.server_info_url)
            .send()
            .await?
            .error_for_status()?
            .json::<ServerInfo>()
            .await?;
        Ok(info)
    }
}

/// Handle on a running readiness wait.
pub struct ReadinessWait {
    cancel: CancellationToken,
    task: JoinHandle<ReadinessOutcome>,
}

impl ReadinessWait {
    /// Stop polling; the wait resolves as [`ReadinessOutcome::Cancelled`]
    /// unless it already resolved.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the wait resolves.
    pub async fn wait(self) -> Result<ReadinessOutcome, ReadinessError> {
        self.task
            .await
            .map_err(|e| ReadinessError::TaskFailed(e.to_string()))
    }
}
