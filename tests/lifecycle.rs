//! Session lifecycle, retry, and takeover integration tests.
//!
//! Everything runs against in-memory fakes: no Docker, no browser, no X
//! processes. The fakes live in `glovebox::testing` so the behavior under
//! test is the real manager, executor, detector, and takeover machinery.

use glovebox::api::{AcquireRequest, Automation, RunRequest};
use glovebox::config::Config;
use glovebox::detector::ChallengeSignature;
use glovebox::manager::SessionManager;
use glovebox::provider::SandboxProvider;
use glovebox::retry::RetryPolicy;
use glovebox::session::SessionState;
use glovebox::step::{StepRequest, StepStatus};
use glovebox::testing::{FakeDriverFactory, FakeFailure, FakeProvider, FakeDisplayFactory, Scripted};
use glovebox::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    automation: Automation,
    provider: Arc<FakeProvider>,
    drivers: Arc<FakeDriverFactory>,
    cancel: CancellationToken,
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 4,
        jitter_ratio: 0.0,
    };
    config
}

fn harness_with(config: Config) -> Harness {
    let provider = Arc::new(FakeProvider::new());
    let drivers = Arc::new(FakeDriverFactory::new());
    let manager = Arc::new(SessionManager::new(
        provider.clone(),
        drivers.clone(),
        Arc::new(FakeDisplayFactory::new()),
        config.session.default_idle_timeout(),
    ));
    Harness {
        automation: Automation::new(manager, &config),
        provider,
        drivers,
        cancel: CancellationToken::new(),
    }
}

fn harness() -> Harness {
    harness_with(fast_config())
}

fn navigate(url: &str) -> StepRequest {
    StepRequest {
        method: "navigate".to_string(),
        params: json!({ "url": url }),
        description: None,
    }
}

fn click(selector: &str) -> StepRequest {
    StepRequest {
        method: "click_selector".to_string(),
        params: json!({ "selector": selector }),
        description: None,
    }
}

fn acquire_persistent(key: &str) -> AcquireRequest {
    AcquireRequest {
        session_key: Some(key.to_string()),
        persistent: true,
        idle_timeout_secs: None,
    }
}

fn run_request(key: &str, steps: Vec<StepRequest>) -> RunRequest {
    RunRequest {
        acquire: acquire_persistent(key),
        steps,
    }
}

// ── Acquire ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn acquire_is_idempotent_for_live_key() {
    let h = harness();
    let first = h
        .automation
        .acquire_session(acquire_persistent("browser_k"))
        .await
        .unwrap();
    let second = h
        .automation
        .acquire_session(acquire_persistent("browser_k"))
        .await
        .unwrap();

    assert_eq!(h.provider.created_count(), 1);
    assert_eq!(first.display_url, second.display_url);
    assert_eq!(second.state, SessionState::Ready);
}

#[tokio::test]
async fn concurrent_acquires_provision_exactly_once() {
    let h = harness();
    let automation = Arc::new(h.automation);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let automation = automation.clone();
        handles.push(tokio::spawn(async move {
            automation
                .acquire_session(acquire_persistent("browser_storm"))
                .await
                .unwrap()
        }));
    }
    let mut urls = Vec::new();
    for handle in handles {
        urls.push(handle.await.unwrap().display_url);
    }

    assert_eq!(h.provider.created_count(), 1);
    assert!(urls.iter().all(|u| *u == urls[0]));
}

#[tokio::test]
async fn dead_instance_is_reprovisioned_not_reattached() {
    let h = harness();
    h.automation
        .acquire_session(acquire_persistent("browser_dead"))
        .await
        .unwrap();
    h.provider.kill("fake-instance-0").await;

    let again = h
        .automation
        .acquire_session(acquire_persistent("browser_dead"))
        .await
        .unwrap();
    assert_eq!(h.provider.created_count(), 2);
    assert_eq!(again.state, SessionState::Ready);
}

#[tokio::test]
async fn failed_provisioning_leaves_no_registry_entry() {
    let h = harness();
    h.provider
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = h
        .automation
        .acquire_session(acquire_persistent("browser_broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Provision(_)));

    // The key is gone; a later acquire with the provider fixed works.
    h.provider
        .fail_create
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let ok = h
        .automation
        .acquire_session(acquire_persistent("browser_broken"))
        .await
        .unwrap();
    assert_eq!(ok.state, SessionState::Ready);
}

// ── Step execution and retry ────────────────────────────────────────────────

#[tokio::test]
async fn malformed_step_rejected_without_provisioning() {
    let h = harness();
    let bad = StepRequest {
        method: "teleport".to_string(),
        params: json!({}),
        description: None,
    };
    let err = h
        .automation
        .run_steps(run_request("browser_bad", vec![bad]), &h.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStep { .. }));
    assert_eq!(h.provider.created_count(), 0);
}

#[tokio::test]
async fn soft_failure_retries_within_budget() {
    let h = harness();
    h.drivers
        .driver
        .script(vec![Scripted::Fail(FakeFailure::Timeout), Scripted::Ok])
        .await;

    let response = h
        .automation
        .run_steps(
            run_request("browser_retry", vec![navigate("https://example.com/")]),
            &h.cancel,
        )
        .await
        .unwrap();

    let result = &response.results[0];
    assert_eq!(result.status, StepStatus::RetriedThenSucceeded);
    assert_eq!(result.attempts, 2);
    assert_eq!(response.session_state, SessionState::Ready);
}

#[tokio::test]
async fn exhausted_retry_budget_becomes_hard_failure() {
    let h = harness();
    h.drivers
        .driver
        .script(vec![
            Scripted::Fail(FakeFailure::Timeout),
            Scripted::Fail(FakeFailure::Timeout),
            Scripted::Fail(FakeFailure::Timeout),
        ])
        .await;

    let response = h
        .automation
        .run_steps(
            run_request("browser_exhaust", vec![navigate("https://example.com/")]),
            &h.cancel,
        )
        .await
        .unwrap();

    let result = &response.results[0];
    assert_eq!(result.status, StepStatus::FailedHard);
    assert_eq!(result.attempts, 3);
    assert_eq!(response.session_state, SessionState::AwaitingManual);
}

#[tokio::test]
async fn hard_failure_suspends_and_skips_remaining_steps() {
    let h = harness();
    // Step 1 succeeds, step 2 raises a non-retryable driver error.
    h.drivers
        .driver
        .script(vec![Scripted::Ok, Scripted::Fail(FakeFailure::Other)])
        .await;

    let response = h
        .automation
        .run_steps(
            run_request(
                "browser_hard",
                vec![
                    navigate("https://example.com/a"),
                    navigate("https://example.com/b"),
                    navigate("https://example.com/c"),
                ],
            ),
            &h.cancel,
        )
        .await
        .unwrap();

    let statuses: Vec<StepStatus> = response.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Succeeded,
            StepStatus::FailedHard,
            StepStatus::SkippedTakeover,
        ]
    );
    assert_eq!(response.session_state, SessionState::AwaitingManual);
    assert!(
        response.display_url.is_some(),
        "takeover response must carry the display URL"
    );
    // The hard result carries a diagnostic screenshot.
    assert!(response.results[1].screenshot.is_some());
}

#[tokio::test]
async fn act_failure_after_successful_locate_suspends() {
    let h = harness();
    // A click is two driver calls: locate succeeds, the act on the
    // element raises a non-retryable error.
    h.drivers
        .driver
        .script(vec![Scripted::Ok, Scripted::Fail(FakeFailure::Other)])
        .await;

    let response = h
        .automation
        .run_steps(
            run_request("browser_act", vec![click("#submit")]),
            &h.cancel,
        )
        .await
        .unwrap();

    let result = &response.results[0];
    assert_eq!(result.status, StepStatus::FailedHard);
    assert_eq!(response.session_state, SessionState::AwaitingManual);
    assert_eq!(h.drivers.driver.dispatch_count().await, 2);
}

#[tokio::test]
async fn challenge_signature_preempts_retry() {
    let mut config = fast_config();
    config.challenges = vec![ChallengeSignature {
        name: "captcha".to_string(),
        title_markers: vec!["[Vv]erify you are human".to_string()],
        url_markers: vec![],
    }];
    let h = harness_with(config);
    h.drivers
        .driver
        .set_probe("https://example.com/gate", "Verify you are human")
        .await;

    let response = h
        .automation
        .run_steps(
            run_request("browser_challenge", vec![navigate("https://example.com/")]),
            &h.cancel,
        )
        .await
        .unwrap();

    let result = &response.results[0];
    // One attempt only: signatures are terminal even when the dispatch
    // itself succeeded and retry budget remains.
    assert_eq!(result.attempts, 1);
    assert_eq!(result.status, StepStatus::FailedHard);
    assert!(
        result
            .verdict
            .as_ref()
            .is_some_and(glovebox::Verdict::is_hard)
    );
    assert_eq!(response.session_state, SessionState::AwaitingManual);
}

// ── Takeover and resume ─────────────────────────────────────────────────────

#[tokio::test]
async fn requested_takeover_exposes_display_url() {
    let h = harness();
    h.automation
        .acquire_session(acquire_persistent("browser_manual"))
        .await
        .unwrap();

    let takeover = h.automation.request_takeover("browser_manual").await.unwrap();
    assert_eq!(takeover.state, SessionState::AwaitingManual);
    assert!(takeover.display_url.is_some());

    let state = h
        .automation
        .mark_manual_activity("browser_manual")
        .await
        .unwrap();
    assert_eq!(state, SessionState::ManualActive);

    let resumed = h.automation.resume("browser_manual").await.unwrap();
    assert_eq!(resumed, SessionState::Ready);
}

#[tokio::test]
async fn resume_then_rerun_remaining_steps() {
    let h = harness();
    h.drivers
        .driver
        .script(vec![Scripted::Ok, Scripted::Fail(FakeFailure::Other)])
        .await;

    let first = h
        .automation
        .run_steps(
            run_request(
                "browser_rerun",
                vec![
                    navigate("https://example.com/a"),
                    navigate("https://example.com/b"),
                    navigate("https://example.com/c"),
                ],
            ),
            &h.cancel,
        )
        .await
        .unwrap();
    assert_eq!(first.session_state, SessionState::AwaitingManual);

    // Human clears the blocker, automation resumes, and the caller
    // resubmits the unexecuted suffix.
    h.automation.resume("browser_rerun").await.unwrap();
    let second = h
        .automation
        .run_steps(
            run_request(
                "browser_rerun",
                vec![
                    navigate("https://example.com/b"),
                    navigate("https://example.com/c"),
                ],
            ),
            &h.cancel,
        )
        .await
        .unwrap();

    assert!(second.results.iter().all(|r| r.status.is_success()));
    assert_eq!(second.session_state, SessionState::Ready);
    assert_eq!(h.provider.created_count(), 1, "same instance throughout");
}

#[tokio::test]
async fn resume_on_destroyed_instance_terminates_session() {
    let h = harness();
    h.automation
        .acquire_session(acquire_persistent("browser_lost"))
        .await
        .unwrap();
    h.automation.request_takeover("browser_lost").await.unwrap();
    h.provider.kill("fake-instance-0").await;

    let err = h.automation.resume("browser_lost").await.unwrap_err();
    assert!(matches!(err, Error::SessionLost(_)));

    // The dead session is gone from the registry entirely.
    assert!(h.automation.list_sessions().await.is_empty());
    let err = h.automation.resume("browser_lost").await.unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
}

#[tokio::test]
async fn resume_without_takeover_is_rejected() {
    let h = harness();
    h.automation
        .acquire_session(acquire_persistent("browser_noop"))
        .await
        .unwrap();
    let err = h.automation.resume("browser_noop").await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn acquire_during_takeover_returns_suspended_session() {
    let h = harness();
    h.automation
        .acquire_session(acquire_persistent("browser_susp"))
        .await
        .unwrap();
    h.automation.request_takeover("browser_susp").await.unwrap();

    let again = h
        .automation
        .acquire_session(acquire_persistent("browser_susp"))
        .await
        .unwrap();
    assert_eq!(again.state, SessionState::AwaitingManual);
    assert_eq!(h.provider.created_count(), 1);
}

// ── Release and sweep ───────────────────────────────────────────────────────

#[tokio::test]
async fn nonpersistent_session_released_after_full_success() {
    let h = harness();
    let response = h
        .automation
        .run_steps(
            RunRequest {
                acquire: AcquireRequest {
                    session_key: None,
                    persistent: false,
                    idle_timeout_secs: None,
                },
                steps: vec![navigate("https://example.com/")],
            },
            &h.cancel,
        )
        .await
        .unwrap();

    assert!(response.released);
    assert_eq!(response.session_state, SessionState::Terminated);
    assert!(
        !h.provider.is_alive("fake-instance-0").await,
        "instance must be torn down"
    );
}

#[tokio::test]
async fn persistent_release_parks_instead_of_tearing_down() {
    let h = harness();
    h.automation
        .acquire_session(acquire_persistent("browser_park"))
        .await
        .unwrap();

    let torn_down = h
        .automation
        .release_session("browser_park", false)
        .await
        .unwrap();
    assert!(!torn_down);
    assert!(h.provider.is_alive("fake-instance-0").await);

    // Forced release frees it for real.
    let torn_down = h
        .automation
        .release_session("browser_park", true)
        .await
        .unwrap();
    assert!(torn_down);
    assert!(!h.provider.is_alive("fake-instance-0").await);
}

#[tokio::test]
async fn sweep_reclaims_expired_but_never_midstep_sessions() {
    let h = harness();
    let automation = Arc::new(h.automation);

    // Short idle budget, slow step: the run must outlive the timeout.
    automation
        .acquire_session(AcquireRequest {
            session_key: Some("browser_busy".to_string()),
            persistent: true,
            idle_timeout_secs: Some(0),
        })
        .await
        .unwrap();
    h.drivers
        .driver
        .set_dispatch_delay(Duration::from_millis(300))
        .await;

    let runner = {
        let automation = automation.clone();
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            automation
                .run_steps(
                    RunRequest {
                        acquire: AcquireRequest {
                            session_key: Some("browser_busy".to_string()),
                            persistent: true,
                            idle_timeout_secs: Some(0),
                        },
                        steps: vec![navigate("https://example.com/")],
                    },
                    &cancel,
                )
                .await
                .unwrap()
        })
    };

    // Give the runner time to take the slot lock and start dispatching.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reclaimed = automation.manager().sweep().await;
    assert_eq!(reclaimed, 0, "mid-step session must not be reclaimed");

    let response = runner.await.unwrap();
    assert!(response.results[0].status.is_success());

    // After the run the zero-second budget is spent immediately.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let reclaimed = automation.manager().sweep().await;
    assert_eq!(reclaimed, 1);

    let health = automation.health().await;
    assert_eq!(health.active_sessions, 0);
    assert_eq!(health.reclaimed_last_sweep, 1);
}

#[tokio::test]
async fn released_sessions_are_evicted_from_registry() {
    let h = harness();
    for key in ["browser_ev_a", "browser_ev_b", "browser_ev_c"] {
        h.automation
            .acquire_session(acquire_persistent(key))
            .await
            .unwrap();
    }
    assert_eq!(h.automation.list_sessions().await.len(), 3);

    for key in ["browser_ev_a", "browser_ev_b", "browser_ev_c"] {
        assert!(h.automation.release_session(key, true).await.unwrap());
    }

    // No tombstones: torn-down sessions leave the registry, so listing
    // and the health gauge do not grow with dead keys.
    assert!(h.automation.list_sessions().await.is_empty());
    assert_eq!(h.automation.health().await.active_sessions, 0);
    let err = h
        .automation
        .release_session("browser_ev_a", true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
}

#[tokio::test]
async fn terminated_key_can_be_acquired_fresh() {
    let h = harness();
    h.automation
        .acquire_session(acquire_persistent("browser_again"))
        .await
        .unwrap();
    h.automation
        .release_session("browser_again", true)
        .await
        .unwrap();

    let again = h
        .automation
        .acquire_session(acquire_persistent("browser_again"))
        .await
        .unwrap();
    assert_eq!(again.state, SessionState::Ready);
    assert_eq!(h.provider.created_count(), 2);
}
