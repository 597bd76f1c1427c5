//! Session records and lifecycle state.
//!
//! A session is one logical, possibly long-lived automation context: a
//! caller-visible key bound to at most one live sandbox instance and one
//! live display channel at a time. Sessions are owned exclusively by the
//! session manager; other components borrow handles for one request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Caller-visible session key.
pub type SessionKey = String;

/// Provider-assigned sandbox instance identifier.
pub type InstanceId = String;

/// Generate a session key in the provider-facing format
/// `browser_<unix-secs>_<hex8>`.
pub fn generate_session_key() -> SessionKey {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let frac = format!("{:x}", now.as_nanos());
    let tail = &frac[frac.len().saturating_sub(8)..];
    format!("browser_{}_{}", secs, tail)
}

/// Lifecycle and control state of a session.
///
/// `AwaitingManual`, `ManualActive` and `ResumingAutomated` belong to the
/// takeover machine; the remaining states are pure lifecycle. Transitions
/// are validated in `takeover` and `manager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Provisioning,
    Ready,
    Running,
    AwaitingManual,
    ManualActive,
    ResumingAutomated,
    Idle,
    Reclaimed,
    Terminated,
}

impl SessionState {
    /// States in which the executor may dispatch steps.
    pub fn is_automated(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Idle)
    }

    /// States in which automation is suspended for a human operator.
    pub fn is_suspended(self) -> bool {
        matches!(self, Self::AwaitingManual | Self::ManualActive)
    }

    /// Terminal states; the backing instance is gone.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Reclaimed | Self::Terminated)
    }

    /// A live entry that `acquire` may hand back for the same key.
    pub fn is_reusable(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Idle)
    }
}

/// Why a takeover was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TakeoverReason {
    /// A blocking-hard verdict, carrying its failure code.
    HardFailure { code: String },
    /// The caller asked for manual control explicitly.
    Requested,
}

/// One human-control interval. At most one open record per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeoverRecord {
    pub session_key: SessionKey,
    pub reason: TakeoverReason,
    pub opened_at: DateTime<Utc>,
    /// None while the takeover is open.
    pub closed_at: Option<DateTime<Utc>>,
}

impl TakeoverRecord {
    pub fn open(session_key: &str, reason: TakeoverReason) -> Self {
        Self {
            session_key: session_key.to_string(),
            reason,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn close(&mut self) {
        if self.closed_at.is_none() {
            self.closed_at = Some(Utc::now());
        }
    }
}

/// One logical automation context.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    /// Assigned once at provisioning, immutable thereafter.
    pub instance_id: InstanceId,
    pub state: SessionState,
    pub persistent: bool,
    pub idle_timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Web URL of the display channel, set once ready.
    pub display_url: Option<String>,
    /// Index of the next step to execute within the current sequence.
    pub cursor: usize,
    /// True while a step is being dispatched; blocks the idle sweep.
    pub in_flight: bool,
    /// Open takeover interval, if any.
    pub takeover: Option<TakeoverRecord>,
    /// Closed takeover intervals, oldest first.
    pub takeover_history: Vec<TakeoverRecord>,
}

impl Session {
    pub fn new(key: &str, instance_id: &str, persistent: bool, idle_timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            instance_id: instance_id.to_string(),
            state: SessionState::Provisioning,
            persistent,
            idle_timeout,
            created_at: now,
            last_activity: now,
            display_url: None,
            cursor: 0,
            in_flight: false,
            takeover: None,
            takeover_history: Vec::new(),
        }
    }

    /// Reset the idle clock.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Age of the last activity.
    pub fn idle_age(&self) -> Duration {
        let age = Utc::now() - self.last_activity;
        age.to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the idle budget is spent. A session mid-step is never
    /// expired regardless of clock.
    pub fn is_expired(&self) -> bool {
        !self.in_flight && self.idle_age() > self.idle_timeout
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_key: self.key.clone(),
            instance_id: self.instance_id.clone(),
            state: self.state,
            persistent: self.persistent,
            created_at: self.created_at,
            last_activity: self.last_activity,
            display_url: self.display_url.clone(),
            cursor: self.cursor,
            takeover_open: self.takeover.as_ref().is_some_and(TakeoverRecord::is_open),
        }
    }
}

/// Caller-facing snapshot of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_key: SessionKey,
    pub instance_id: InstanceId,
    pub state: SessionState,
    pub persistent: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_url: Option<String>,
    pub cursor: usize,
    pub takeover_open: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_expected_shape() {
        let key = generate_session_key();
        assert!(key.starts_with("browser_"));
        let parts: Vec<&str> = key.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn expiry_respects_in_flight() {
        let mut session = Session::new("s1", "i-1", true, Duration::ZERO);
        session.last_activity = Utc::now() - chrono::Duration::seconds(60);
        assert!(session.is_expired());

        session.in_flight = true;
        assert!(!session.is_expired());
    }

    #[test]
    fn touch_resets_idle_clock() {
        let mut session = Session::new("s1", "i-1", true, Duration::from_secs(300));
        session.last_activity = Utc::now() - chrono::Duration::seconds(600);
        assert!(session.is_expired());
        session.touch();
        assert!(!session.is_expired());
    }

    #[test]
    fn takeover_record_closes_once() {
        let mut record = TakeoverRecord::open("s1", TakeoverReason::Requested);
        assert!(record.is_open());
        record.close();
        let first = record.closed_at;
        record.close();
        assert_eq!(record.closed_at, first);
    }

    #[test]
    fn state_predicates() {
        assert!(SessionState::Ready.is_automated());
        assert!(SessionState::Idle.is_reusable());
        assert!(SessionState::AwaitingManual.is_suspended());
        assert!(SessionState::ManualActive.is_suspended());
        assert!(SessionState::Terminated.is_terminal());
        assert!(!SessionState::AwaitingManual.is_automated());
    }
}
