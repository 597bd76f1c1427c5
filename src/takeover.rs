//! Hybrid takeover control machine.
//!
//! Governs the transitions between automated execution and human-controlled
//! intervals:
//!
//! `Automated → AwaitingManual → ManualActive → ResumingAutomated → Automated`
//!
//! "Automated" is not a single state here; it covers `Ready`, `Running`
//! and `Idle` on the session. A suspension opens a [`TakeoverRecord`];
//! resume closes it and passes through a health guard before automation
//! continues. While a session is suspended the executor must not dispatch
//! new steps against it; an in-flight step may finish and gets recorded.
//!
//! There is no reliable operator-activity signal from the web VNC proxy,
//! so `AwaitingManual → ManualActive` only happens through an explicit
//! [`mark_manual_activity`] call from the surrounding layer. Resume is
//! accepted from either suspended state.

use crate::error::Error;
use crate::session::{Session, SessionState, TakeoverReason, TakeoverRecord};
use tracing::info;

fn transition_error(session: &Session, detail: impl Into<String>) -> Error {
    Error::InvalidTransition {
        key: session.key.clone(),
        detail: detail.into(),
    }
}

/// Suspend automation on a session, opening a takeover record.
///
/// Idempotent while suspended: a second request returns the already-open
/// record so the caller gets the same display URL back.
pub fn suspend(session: &mut Session, reason: TakeoverReason) -> Result<&TakeoverRecord, Error> {
    if session.state.is_suspended() {
        return session
            .takeover
            .as_ref()
            .ok_or_else(|| transition_error(session, "suspended without an open takeover record"));
    }
    if !session.state.is_automated() {
        return Err(transition_error(
            session,
            format!("cannot suspend from state {:?}", session.state),
        ));
    }

    info!(session = %session.key, ?reason, "automation suspended for manual control");
    session.state = SessionState::AwaitingManual;
    session.touch();
    let record = TakeoverRecord::open(&session.key, reason);
    Ok(session.takeover.insert(record))
}

/// Record the first observed human interaction.
pub fn mark_manual_activity(session: &mut Session) -> Result<(), Error> {
    match session.state {
        SessionState::AwaitingManual => {
            session.state = SessionState::ManualActive;
            session.touch();
            Ok(())
        }
        SessionState::ManualActive => Ok(()),
        other => Err(transition_error(
            session,
            format!("manual activity signal in state {:?}", other),
        )),
    }
}

/// Start resuming: close the takeover record and enter the guard phase.
pub fn begin_resume(session: &mut Session) -> Result<(), Error> {
    if !session.state.is_suspended() {
        return Err(transition_error(
            session,
            format!("resume requested in state {:?}", session.state),
        ));
    }
    if let Some(mut record) = session.takeover.take() {
        record.close();
        session.takeover_history.push(record);
    }
    session.state = SessionState::ResumingAutomated;
    Ok(())
}

/// Finish resuming after the health guard ran.
///
/// A healthy session returns to automated control; an unhealthy one is
/// forced to `Terminated` and the caller surfaces `SessionLostError`.
pub fn complete_resume(session: &mut Session, healthy: bool) -> Result<(), Error> {
    if session.state != SessionState::ResumingAutomated {
        return Err(transition_error(
            session,
            format!("resume completion in state {:?}", session.state),
        ));
    }
    if healthy {
        info!(session = %session.key, "automation resumed");
        session.state = SessionState::Ready;
        session.touch();
        Ok(())
    } else {
        session.state = SessionState::Terminated;
        Err(Error::SessionLost(session.key.clone()))
    }
}

/// Force a session to a terminal state from anywhere, closing any open
/// takeover record. Used by release, sweep, and failed resume guards.
pub fn terminate(session: &mut Session, reclaimed: bool) {
    if let Some(mut record) = session.takeover.take() {
        record.close();
        session.takeover_history.push(record);
    }
    session.state = if reclaimed {
        SessionState::Reclaimed
    } else {
        SessionState::Terminated
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ready_session() -> Session {
        let mut session = Session::new("s1", "i-1", true, Duration::from_secs(300));
        session.state = SessionState::Ready;
        session
    }

    #[test]
    fn suspend_opens_single_record() {
        let mut session = ready_session();
        suspend(&mut session, TakeoverReason::Requested).unwrap();
        assert_eq!(session.state, SessionState::AwaitingManual);
        assert!(session.takeover.as_ref().unwrap().is_open());

        // Second request while suspended reuses the open record.
        let reason = TakeoverReason::HardFailure {
            code: "element_absent".into(),
        };
        suspend(&mut session, reason).unwrap();
        assert_eq!(session.takeover_history.len(), 0);
        assert_eq!(
            session.takeover.as_ref().unwrap().reason,
            TakeoverReason::Requested
        );
    }

    #[test]
    fn suspend_from_terminal_state_fails() {
        let mut session = ready_session();
        session.state = SessionState::Terminated;
        assert!(suspend(&mut session, TakeoverReason::Requested).is_err());
    }

    #[test]
    fn full_cycle_closes_record() {
        let mut session = ready_session();
        suspend(
            &mut session,
            TakeoverReason::HardFailure {
                code: "challenge:captcha".into(),
            },
        )
        .unwrap();
        mark_manual_activity(&mut session).unwrap();
        assert_eq!(session.state, SessionState::ManualActive);

        begin_resume(&mut session).unwrap();
        assert_eq!(session.state, SessionState::ResumingAutomated);
        assert!(session.takeover.is_none());
        assert_eq!(session.takeover_history.len(), 1);
        assert!(!session.takeover_history[0].is_open());

        complete_resume(&mut session, true).unwrap();
        assert_eq!(session.state, SessionState::Ready);
    }

    #[test]
    fn resume_without_activity_signal_is_accepted() {
        let mut session = ready_session();
        suspend(&mut session, TakeoverReason::Requested).unwrap();
        // Straight from AwaitingManual, no mark_manual_activity.
        begin_resume(&mut session).unwrap();
        complete_resume(&mut session, true).unwrap();
        assert_eq!(session.state, SessionState::Ready);
    }

    #[test]
    fn failed_guard_terminates() {
        let mut session = ready_session();
        suspend(&mut session, TakeoverReason::Requested).unwrap();
        begin_resume(&mut session).unwrap();
        match complete_resume(&mut session, false) {
            Err(Error::SessionLost(key)) => assert_eq!(key, "s1"),
            other => panic!("expected SessionLost, got {:?}", other),
        }
        assert_eq!(session.state, SessionState::Terminated);
    }

    #[test]
    fn resume_of_automated_session_is_rejected() {
        let mut session = ready_session();
        assert!(begin_resume(&mut session).is_err());
    }

    #[test]
    fn activity_signal_outside_takeover_is_rejected() {
        let mut session = ready_session();
        assert!(mark_manual_activity(&mut session).is_err());
    }

    #[test]
    fn terminate_closes_open_record() {
        let mut session = ready_session();
        suspend(&mut session, TakeoverReason::Requested).unwrap();
        terminate(&mut session, false);
        assert_eq!(session.state, SessionState::Terminated);
        assert!(session.takeover.is_none());
        assert!(!session.takeover_history[0].is_open());
    }
}
