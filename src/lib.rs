//! glovebox: sandbox-backed browser automation with hybrid takeover.
//!
//! Sessions wrap a provisioned sandbox instance, a Chrome DevTools driver
//! attached to it, and a VNC display channel for human takeover. The
//! executor runs ordered step sequences against a session, a failure
//! detector classifies anything that goes wrong, and hard failures hand
//! control to a human through the display channel until automation is
//! resumed.

pub mod api;
pub mod config;
pub mod detector;
pub mod display;
pub mod driver;
pub mod error;
pub mod executor;
pub mod logging;
pub mod manager;
pub mod provider;
pub mod retry;
pub mod session;
pub mod step;
pub mod takeover;
pub mod testing;

pub use api::{AcquireRequest, AcquireResponse, Automation, RunRequest, RunResponse};
pub use config::Config;
pub use detector::{ChallengeSignature, FailureDetector, Verdict};
pub use error::{Error, Result};
pub use manager::SessionManager;
pub use retry::RetryPolicy;
pub use session::{Session, SessionState, SessionSummary};
pub use step::{Step, StepRequest, StepResult, StepStatus};
