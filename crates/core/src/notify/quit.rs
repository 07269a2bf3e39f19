//! Single shutdown request to a sidecar endpoint.
//!
//! Sends a body-less `POST` under a deadline shared with the rest of its
//! batch. The response body is ignored; only the status code is reported.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::errors::NotificationError;

/// Path appended to the Istio agent API base URL.
pub const QUIT_PATH: &str = "/quitquitquit";

/// Result of one shutdown request.
#[derive(Debug)]
pub struct QuitAttempt {
    pub url: String,
    pub result: Result<u16, NotificationError>,
}

impl QuitAttempt {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// `{base}/quitquitquit` for an Istio agent base URL.
pub fn quit_url(base: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), QUIT_PATH)
}

/// `POST` to `url`, giving up at `deadline`. `budget` is the batch timeout
/// the deadline was derived from and is only used for reporting.
pub async fn post_quit(
    http: &reqwest::Client,
    url: &str,
    deadline: Instant,
    budget: Duration,
) -> Result<u16, NotificationError> {
    debug!(url, "sending quit request");

    let send = http.post(url).send();
    let resp = tokio::time::timeout_at(deadline, send)
        .await
        .map_err(|_| NotificationError::TimedOut { timeout: budget })??;

    Ok(resp.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_url() {
        assert_eq!(quit_url("http://127.0.0.1:15020"), "http://127.0.0.1:15020/quitquitquit");
        assert_eq!(quit_url("http://127.0.0.1:15020/"), "http://127.0.0.1:15020/quitquitquit");
    }
}
