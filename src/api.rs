//! Public operation surface.
//!
//! `Automation` composes the session manager with the step executor and
//! exposes the operations a caller sees: acquire, run, takeover, resume,
//! release, and inspection. Request and response shapes here are the
//! crate's wire vocabulary; everything serializes camelCase.

use crate::config::Config;
use crate::detector::FailureDetector;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::manager::SessionManager;
use crate::session::{SessionState, SessionSummary, TakeoverReason};
use crate::step::{StepRequest, StepResult, plan_sequence};
use crate::takeover;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireRequest {
    /// Reuse or create the session under this key; omitted means a fresh
    /// generated key.
    #[serde(default)]
    pub session_key: Option<String>,
    /// Persistent sessions survive release and are reclaimed only by the
    /// idle sweep or a forced release.
    #[serde(default)]
    pub persistent: bool,
    /// Override of the configured idle timeout, in seconds.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireResponse {
    pub session_key: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(flatten)]
    pub acquire: AcquireRequest,
    pub steps: Vec<StepRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub session_key: String,
    pub results: Vec<StepResult>,
    pub session_state: SessionState,
    /// Set when the run ended in a takeover, so the caller can surface
    /// the interactive display immediately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_url: Option<String>,
    /// True when a non-persistent session was torn down after the run.
    pub released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeoverResponse {
    pub session_key: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_url: Option<String>,
}

pub struct Automation {
    manager: Arc<SessionManager>,
    executor: Executor,
}

impl Automation {
    pub fn new(manager: Arc<SessionManager>, config: &Config) -> Self {
        let executor = Executor::new(
            FailureDetector::new(config.challenges.clone()),
            config.retry.clone(),
            config.session.step_timeout(),
        );
        Self { manager, executor }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub async fn acquire_session(&self, request: AcquireRequest) -> Result<AcquireResponse> {
        let idle_timeout = request.idle_timeout_secs.map(Duration::from_secs);
        let (key, handle) = self
            .manager
            .acquire(request.session_key, request.persistent, idle_timeout)
            .await?;
        let slot = handle.lock().await;
        let entry = slot
            .as_ref()
            .ok_or_else(|| Error::SessionNotFound(key.clone()))?;
        Ok(AcquireResponse {
            session_key: key,
            state: entry.session.state,
            display_url: entry.session.display_url.clone(),
        })
    }

    /// Acquire (or reuse) a session and run the step sequence against it.
    ///
    /// The whole sequence is validated before any session work happens; a
    /// malformed step rejects the request without side effects. A
    /// non-persistent session is torn down once the sequence completes
    /// fully successfully; any other ending leaves it in place so the
    /// caller can inspect, take over, or resume.
    pub async fn run_steps(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunResponse> {
        let planned = plan_sequence(&request.steps)?;

        let persistent = request.acquire.persistent;
        let idle_timeout = request.acquire.idle_timeout_secs.map(Duration::from_secs);
        let (key, handle) = self
            .manager
            .acquire(request.acquire.session_key, persistent, idle_timeout)
            .await?;

        let (results, state, display_url) = {
            let mut slot = handle.lock().await;
            let entry = slot
                .as_mut()
                .ok_or_else(|| Error::SessionNotFound(key.clone()))?;
            let results = self.executor.run(entry, &planned, cancel).await;
            (
                results,
                entry.session.state,
                entry.session.display_url.clone(),
            )
        };

        let fully_succeeded = results.iter().all(|r| r.status.is_success());
        let mut released = false;
        if !persistent && fully_succeeded {
            // The step results are the caller's payload; a teardown
            // hiccup here must not discard them.
            match self.manager.release(&key, false).await {
                Ok(freed) => released = freed,
                Err(err) => {
                    warn!(session = %key, error = %err, "post-run release failed; returning results");
                }
            }
        }

        let suspended = state.is_suspended();
        info!(
            session = %key,
            steps = results.len(),
            state = ?state,
            released,
            "step sequence finished"
        );
        Ok(RunResponse {
            session_key: key,
            results,
            session_state: if released {
                SessionState::Terminated
            } else {
                state
            },
            display_url: if suspended { display_url } else { None },
            released,
        })
    }

    /// Suspend automation on demand and hand the caller the display URL.
    pub async fn request_takeover(&self, key: &str) -> Result<TakeoverResponse> {
        let handle = self.manager.get(key).await?;
        let mut slot = handle.lock().await;
        let entry = slot
            .as_mut()
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))?;
        takeover::suspend(&mut entry.session, TakeoverReason::Requested)?;
        Ok(TakeoverResponse {
            session_key: key.to_string(),
            state: entry.session.state,
            display_url: entry.session.display_url.clone(),
        })
    }

    /// Record that the human is actively driving the suspended session.
    pub async fn mark_manual_activity(&self, key: &str) -> Result<SessionState> {
        let handle = self.manager.get(key).await?;
        let mut slot = handle.lock().await;
        let entry = slot
            .as_mut()
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))?;
        takeover::mark_manual_activity(&mut entry.session)?;
        Ok(entry.session.state)
    }

    /// Return control to automation after a takeover.
    pub async fn resume(&self, key: &str) -> Result<SessionState> {
        self.manager.resume(key).await
    }

    /// Release a session; returns true when the instance was torn down.
    pub async fn release_session(&self, key: &str, force: bool) -> Result<bool> {
        self.manager.release(key, force).await
    }

    pub async fn health(&self) -> crate::manager::Health {
        self.manager.health().await
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.manager.list().await
    }
}
