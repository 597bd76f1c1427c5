//! Error taxonomy for the sandbox automation core.
//!
//! Provisioning and display-channel failures abort the call that raised
//! them and surface as distinct kinds so the surrounding layer can report
//! actionable detail. Step-level failures never appear here: they route
//! through the failure detector and the takeover machine instead, so work
//! already done stays resumable.

use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A sandbox instance could not be created. Fatal to that `acquire`
    /// call; no partial registry entry is left behind.
    #[error("sandbox provisioning failed: {0}")]
    Provision(String),

    /// The remote-desktop stack failed to come up after bounded retries.
    #[error("display channel failed to start: {0}")]
    DisplayChannel(String),

    /// A driver action raised outside the classified outcomes. Routed
    /// through the failure detector like any other outcome.
    #[error("step dispatch failed: {0}")]
    StepDispatch(String),

    /// Resume was attempted on a session whose backing instance is gone.
    /// The session has been forced to `Terminated`.
    #[error("session '{0}' lost its backing instance")]
    SessionLost(String),

    /// An operation referenced a key with no registry entry.
    #[error("no session registered under key '{0}'")]
    SessionNotFound(String),

    /// A submitted step failed boundary validation (unknown method,
    /// missing or malformed parameter).
    #[error("invalid step '{method}': {detail}")]
    InvalidStep { method: String, detail: String },

    /// A control-state transition that the takeover machine forbids.
    #[error("invalid control transition for session '{key}': {detail}")]
    InvalidTransition { key: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable short code for a hard-failure takeover reason.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Provision(_) => "provision",
            Self::DisplayChannel(_) => "display_channel",
            Self::StepDispatch(_) => "step_dispatch",
            Self::SessionLost(_) => "session_lost",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidStep { .. } => "invalid_step",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_key() {
        let err = Error::SessionNotFound("browser_17_abc".into());
        assert!(err.to_string().contains("browser_17_abc"));
        assert_eq!(err.code(), "session_not_found");
    }
}
