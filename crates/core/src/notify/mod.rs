//! Sidecar shutdown notifications.
//!
//! The [`SidecarNotifier`] sends best-effort `POST` requests to the generic
//! quit endpoints and to the Istio agent's `/quitquitquit`. Every request in a
//! batch shares one deadline; failures are logged per endpoint and never
//! abort sibling requests or fail the caller.

pub mod quit;

use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::errors::NotificationError;
pub use quit::{quit_url, QuitAttempt, QUIT_PATH};

/// Sends shutdown requests to sidecars.
#[derive(Clone)]
pub struct SidecarNotifier {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl SidecarNotifier {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            request_timeout,
        }
    }

    /// `POST` to every generic endpoint concurrently and wait for all of them
    /// to finish or hit the shared deadline.
    ///
    /// Endpoints are trimmed of surrounding spaces before use.
    pub async fn notify_generic(&self, endpoints: &[String]) -> Vec<QuitAttempt> {
        if endpoints.is_empty() {
            return Vec::new();
        }

        let deadline = Instant::now() + self.request_timeout;
        let budget = self.request_timeout;
        let mut tasks = JoinSet::new();

        for endpoint in endpoints {
            let url = endpoint.trim().to_string();
            let http = self.http.clone();
            tasks.spawn(async move {
                let result = quit::post_quit(&http, &url, deadline, budget).await;
                QuitAttempt { url, result }
            });
        }

        let mut attempts = Vec::with_capacity(endpoints.len());
        while let Some(joined) = tasks.join_next().await {
            let attempt = joined.unwrap_or_else(|e| QuitAttempt {
                url: String::new(),
                result: Err(NotificationError::TaskFailed(e.to_string())),
            });
            match &attempt.result {
                Ok(status) => info!(url = %attempt.url, status, "sent POST to generic endpoint"),
                Err(e) => warn!(url = %attempt.url, error = %e, "POST to generic endpoint failed"),
            }
            attempts.push(attempt);
        }
        attempts
    }

    /// `POST {istio_quit_api}/quitquitquit`.
    pub async fn notify_mesh(&self, istio_quit_api: &str) -> QuitAttempt {
        info!(api = %istio_quit_api, "stopping Istio using the Istio agent API");

        let url = quit_url(istio_quit_api);
        let deadline = Instant::now() + self.request_timeout;
        let result = quit::post_quit(&self.http, &url, deadline, self.request_timeout).await;

        match &result {
            Ok(status) => info!(url = %url, status, "sent quitquitquit to Istio"),
            Err(e) => warn!(url = %url, error = %e, "quitquitquit to Istio failed"),
        }
        QuitAttempt { url, result }
    }
}
