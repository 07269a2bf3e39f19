//! End-to-end tests for the readiness gate and sidecar shutdown against a
//! fake Envoy / Istio agent.
//!
//! The fake serves `GET /server_info` from a scripted list of states and
//! counts every probe, `/quitquitquit` and generic quit call. It binds to
//! `127.0.0.1:0`, so no external network is involved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use scuttle_core::config::ScuttleConfig;
use scuttle_core::errors::NotificationError;
use scuttle_core::notify::SidecarNotifier;
use scuttle_core::readiness::{BackoffPolicy, ReadinessGate, ReadinessOutcome, WaitBound};
use scuttle_core::shutdown::{ShutdownOrchestrator, ShutdownOutcome, ShutdownPlan};

// ===========================================================================
// Fake sidecar
// ===========================================================================

#[derive(Default)]
struct FakeSidecar {
    /// States returned in order; the last one repeats once the list runs out.
    states: Mutex<VecDeque<String>>,
    last_state: Mutex<String>,
    probes: AtomicUsize,
    quits: AtomicUsize,
    generic_quits: AtomicUsize,
}

impl FakeSidecar {
    fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
    fn quits(&self) -> usize {
        self.quits.load(Ordering::SeqCst)
    }
    fn generic_quits(&self) -> usize {
        self.generic_quits.load(Ordering::SeqCst)
    }
}

/// The scripted state `ERROR` answers 503 instead of a body.
async fn server_info(
    State(fake): State<Arc<FakeSidecar>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    fake.probes.fetch_add(1, Ordering::SeqCst);
    let next = fake.states.lock().unwrap().pop_front();
    let state = match next {
        Some(s) => {
            *fake.last_state.lock().unwrap() = s.clone();
            s
        }
        None => fake.last_state.lock().unwrap().clone(),
    };
    if state == "ERROR" {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(serde_json::json!({ "state": state })))
}

async fn quitquitquit(State(fake): State<Arc<FakeSidecar>>) -> &'static str {
    fake.quits.fetch_add(1, Ordering::SeqCst);
    "OK"
}

async fn generic_quit(State(fake): State<Arc<FakeSidecar>>) -> &'static str {
    fake.generic_quits.fetch_add(1, Ordering::SeqCst);
    "bye"
}

/// Start a fake sidecar answering with `states`. Returns its base URL.
async fn spawn_fake_sidecar(states: &[&str]) -> (String, Arc<FakeSidecar>) {
    let fake = Arc::new(FakeSidecar {
        states: Mutex::new(states.iter().map(|s| s.to_string()).collect()),
        last_state: Mutex::new("PRE_INITIALIZING".into()),
        ..FakeSidecar::default()
    });

    let app = Router::new()
        .route("/server_info", get(server_info))
        .route("/quitquitquit", post(quitquitquit))
        .route("/generic/quit", post(generic_quit))
        .with_state(fake.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), fake)
}

/// Accept connections and never answer them. Returns the base URL.
async fn spawn_silent_listener() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::constant(Duration::from_millis(5))
}

// ===========================================================================
// Readiness gate
// ===========================================================================

#[tokio::test]
async fn test_ready_after_two_starting_responses() {
    let (base, fake) = spawn_fake_sidecar(&["STARTING", "STARTING", "LIVE"]).await;

    let gate = ReadinessGate::new(&base, WaitBound::Unbounded).with_backoff(fast_backoff());
    let outcome = gate.start().wait().await.unwrap();

    assert_eq!(outcome, ReadinessOutcome::Ready { attempts: 3 });
    assert_eq!(fake.probes(), 3);
}

#[tokio::test]
async fn test_ready_after_error_responses() {
    let (base, fake) = spawn_fake_sidecar(&["ERROR", "ERROR", "STARTING", "LIVE"]).await;

    let gate = ReadinessGate::new(&base, WaitBound::WaitForReady(Duration::from_secs(5)))
        .with_backoff(fast_backoff());
    let outcome = gate.start().wait().await.unwrap();

    assert_eq!(outcome, ReadinessOutcome::Ready { attempts: 4 });
    assert_eq!(fake.probes(), 4);
}

#[tokio::test]
async fn test_quit_without_ready_times_out() {
    let (base, fake) = spawn_fake_sidecar(&["STARTING"]).await;

    let config = ScuttleConfig {
        envoy_admin_api: base,
        quit_without_envoy_timeout: Duration::from_millis(50),
        wait_for_envoy_timeout: Duration::from_secs(30),
        ..ScuttleConfig::default()
    };
    let gate = ReadinessGate::from_config(&config)
        .unwrap()
        .with_backoff(fast_backoff());
    assert_eq!(gate.bound(), WaitBound::QuitWithoutReady(Duration::from_millis(50)));

    let outcome = gate.start().wait().await.unwrap();
    assert!(matches!(outcome, ReadinessOutcome::TimedOut { attempts } if attempts >= 1));

    // Polling stops at the deadline.
    let probes_at_timeout = fake.probes();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fake.probes(), probes_at_timeout);
}

#[tokio::test]
async fn test_unreachable_proxy_times_out() {
    let gate = ReadinessGate::new("http://127.0.0.1:9", WaitBound::WaitForReady(Duration::from_millis(60)))
        .with_backoff(fast_backoff());
    let outcome = gate.start().wait().await.unwrap();
    assert!(matches!(outcome, ReadinessOutcome::TimedOut { .. }));
}

#[tokio::test]
async fn test_disabled_gate_issues_no_requests() {
    let (base, fake) = spawn_fake_sidecar(&["LIVE"]).await;
    let config = ScuttleConfig {
        envoy_admin_api: base,
        start_without_envoy: true,
        ..ScuttleConfig::default()
    };

    assert!(ReadinessGate::from_config(&config).is_none());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fake.probes(), 0);
}

// ===========================================================================
// Shutdown orchestration
// ===========================================================================

#[tokio::test]
async fn test_default_plan_hits_generic_and_istio() {
    let (base, fake) = spawn_fake_sidecar(&["LIVE"]).await;
    let config = Arc::new(ScuttleConfig {
        envoy_admin_api: base.clone(),
        istio_quit_api: base.clone(),
        generic_quit_endpoints: vec![
            format!("  {}/generic/quit ", base),
            format!("{}/generic/quit", base),
        ],
        ..ScuttleConfig::default()
    });

    let report = ShutdownOrchestrator::new(config).run(0).await;

    assert_eq!(report.plan, ShutdownPlan::GenericAndIstio);
    assert_eq!(report.outcome, ShutdownOutcome::Completed);
    assert_eq!(report.attempts.len(), 3);
    assert!(report.attempts.iter().all(|a| a.is_delivered()));
    assert_eq!(fake.generic_quits(), 2);
    assert_eq!(fake.quits(), 1);
}

#[tokio::test]
async fn test_generic_only_skips_istio() {
    let (base, fake) = spawn_fake_sidecar(&["LIVE"]).await;
    let config = Arc::new(ScuttleConfig {
        generic_quit_only: true,
        envoy_admin_api: base.clone(),
        istio_quit_api: base.clone(),
        never_kill_istio_on_failure: true,
        generic_quit_endpoints: vec![format!("{}/generic/quit", base)],
        ..ScuttleConfig::default()
    });

    let report = ShutdownOrchestrator::new(config).run(9).await;

    assert_eq!(report.plan, ShutdownPlan::GenericOnly);
    assert_eq!(report.outcome, ShutdownOutcome::Completed);
    assert_eq!(fake.generic_quits(), 1);
    assert_eq!(fake.quits(), 0);
}

#[tokio::test]
async fn test_never_kill_on_failure_sends_nothing() {
    let (base, fake) = spawn_fake_sidecar(&["LIVE"]).await;
    let config = Arc::new(ScuttleConfig {
        envoy_admin_api: base.clone(),
        istio_quit_api: base.clone(),
        never_kill_istio_on_failure: true,
        generic_quit_endpoints: vec![format!("{}/generic/quit", base)],
        ..ScuttleConfig::default()
    });

    let report = ShutdownOrchestrator::new(config).run(2).await;

    assert_eq!(report.outcome, ShutdownOutcome::ExitImmediately(2));
    assert_eq!(fake.generic_quits(), 0);
    assert_eq!(fake.quits(), 0);
}

#[tokio::test]
async fn test_failed_endpoint_does_not_block_siblings() {
    let (base, fake) = spawn_fake_sidecar(&["LIVE"]).await;
    let config = Arc::new(ScuttleConfig {
        generic_quit_only: true,
        quit_request_timeout: Duration::from_secs(2),
        generic_quit_endpoints: vec![
            "http://127.0.0.1:9/quit".into(),
            format!("{}/generic/quit", base),
        ],
        ..ScuttleConfig::default()
    });

    let report = ShutdownOrchestrator::new(config).run(0).await;

    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts.iter().filter(|a| a.is_delivered()).count(), 1);
    assert_eq!(fake.generic_quits(), 1);
}

#[tokio::test]
async fn test_stuck_endpoint_bounded_by_shared_deadline() {
    let (base, fake) = spawn_fake_sidecar(&["LIVE"]).await;
    let silent = spawn_silent_listener().await;
    let budget = Duration::from_millis(200);

    let endpoints = vec![
        format!("{}/quit", silent),
        format!("{}/other", silent),
        format!("{}/generic/quit", base),
    ];

    let started = tokio::time::Instant::now();
    let attempts = SidecarNotifier::new(budget).notify_generic(&endpoints).await;
    let elapsed = started.elapsed();

    assert_eq!(attempts.len(), 3);
    let timed_out: Vec<_> = attempts
        .iter()
        .filter(|a| matches!(a.result, Err(NotificationError::TimedOut { timeout }) if timeout == budget))
        .collect();
    assert_eq!(timed_out.len(), 2);
    assert!(timed_out.iter().all(|a| a.url.starts_with(&silent)));

    let delivered: Vec<_> = attempts.iter().filter(|a| a.is_delivered()).collect();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].url.ends_with("/generic/quit"));
    assert_eq!(fake.generic_quits(), 1);

    // Both stuck calls share one deadline rather than adding up.
    assert!(elapsed >= budget, "returned before the deadline: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "deadline not shared: {elapsed:?}");
}
