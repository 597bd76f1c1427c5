//! Automation executor.
//!
//! Interprets an ordered step sequence against one session: dispatch each
//! step through the driver, classify the outcome, retry soft failures
//! under the central policy, and hand control to the takeover machine on
//! a hard verdict. Steps are never reordered or parallelized: they
//! encode a causal sequence, and step N's effects are visible before
//! step N+1 begins.
//!
//! The caller holds the session's slot lock for the whole run, which is
//! what serializes execution per session and keeps the idle sweep out.

use crate::detector::{FailureDetector, Verdict};
use crate::driver::{Driver, DriverError};
use crate::manager::SessionEntry;
use crate::retry::RetryPolicy;
use crate::session::{SessionState, TakeoverReason};
use crate::step::{PlannedStep, Step, StepResult, StepStatus};
use crate::takeover;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extra headroom on top of a wait step's own window before the outer
/// bound fires.
const WAIT_GRACE: Duration = Duration::from_secs(5);

/// What one dispatch produced besides success/failure.
#[derive(Default)]
struct DispatchOutput {
    diagnostic: Option<String>,
    screenshot: Option<String>,
}

pub struct Executor {
    detector: FailureDetector,
    retry: RetryPolicy,
    step_timeout: Duration,
}

impl Executor {
    pub fn new(detector: FailureDetector, retry: RetryPolicy, step_timeout: Duration) -> Self {
        Self {
            detector,
            retry,
            step_timeout,
        }
    }

    /// Execute the already-validated `steps` in order against the session
    /// until completion, hard failure, cancellation, or loss of automated
    /// control.
    ///
    /// Always returns one result per submitted step: steps not attempted
    /// because the session left automated control are marked
    /// `skippedTakeover`.
    pub async fn run(
        &self,
        entry: &mut SessionEntry,
        steps: &[PlannedStep],
        cancel: &CancellationToken,
    ) -> Vec<StepResult> {
        let mut results = Vec::with_capacity(steps.len());
        entry.session.cursor = 0;

        for (index, planned) in steps.iter().enumerate() {
            let step = &planned.step;
            let description = planned.description.clone();

            if !entry.session.state.is_automated() {
                results.push(StepResult::skipped(step, description));
                continue;
            }

            if cancel.is_cancelled() {
                info!(session = %entry.session.key, at_step = index, "run cancelled at step boundary");
                break;
            }

            entry.session.state = SessionState::Running;
            entry.session.in_flight = true;
            entry.session.touch();

            let result = self.run_one(entry, step, description).await;

            entry.session.in_flight = false;
            entry.session.touch();

            let hard = result.status == StepStatus::FailedHard;
            if result.status.is_success() {
                entry.session.cursor = index + 1;
            }
            results.push(result);

            if hard {
                // Suspension already happened in run_one; remaining steps
                // are recorded as skipped by the state check above.
                continue;
            }
            if entry.session.state == SessionState::Running {
                entry.session.state = SessionState::Ready;
            }
        }

        results
    }

    async fn run_one(
        &self,
        entry: &mut SessionEntry,
        step: &Step,
        description: Option<String>,
    ) -> StepResult {
        let key = entry.session.key.clone();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(session = %key, method = step.method(), attempt, "dispatching step");

            let dispatched = self.dispatch(entry.driver.as_ref(), step).await;
            let (outcome, output) = match dispatched {
                Ok(out) => (Ok(()), out),
                Err(err) => (Err(err), DispatchOutput::default()),
            };

            let probe = entry.driver.probe().await.ok();
            let last_verdict =
                self.detector
                    .classify(&outcome, probe.as_ref(), attempt, &self.retry);

            match &last_verdict {
                Verdict::Ok => {
                    let status = if attempt > 1 {
                        StepStatus::RetriedThenSucceeded
                    } else {
                        StepStatus::Succeeded
                    };
                    return StepResult {
                        method: step.method().to_string(),
                        description,
                        status,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt,
                        verdict: Some(last_verdict.clone()),
                        diagnostic: output.diagnostic,
                        screenshot: output.screenshot,
                    };
                }
                Verdict::RetryableSoft { reason } => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        session = %key,
                        method = step.method(),
                        attempt,
                        reason,
                        delay_ms = delay.as_millis() as u64,
                        "soft failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Verdict::BlockingHard { code, reason } => {
                    warn!(
                        session = %key,
                        method = step.method(),
                        attempt,
                        code,
                        reason,
                        "hard failure, suspending automation"
                    );
                    let screenshot = self.capture_diagnostic(entry.driver.as_ref()).await;
                    if let Err(err) = takeover::suspend(
                        &mut entry.session,
                        TakeoverReason::HardFailure { code: code.clone() },
                    ) {
                        warn!(session = %key, error = %err, "could not open takeover");
                    }
                    return StepResult {
                        method: step.method().to_string(),
                        description,
                        status: StepStatus::FailedHard,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt,
                        verdict: Some(last_verdict.clone()),
                        diagnostic: Some(reason.clone()),
                        screenshot,
                    };
                }
            }
        }
    }

    /// Bound for one dispatch of this step.
    fn bound_for(&self, step: &Step) -> Duration {
        match step {
            Step::Wait { timeout_secs, .. } => Duration::from_secs(*timeout_secs) + WAIT_GRACE,
            _ => self.step_timeout,
        }
    }

    async fn dispatch(
        &self,
        driver: &dyn Driver,
        step: &Step,
    ) -> std::result::Result<DispatchOutput, DriverError> {
        let bound = self.bound_for(step);
        let fut = self.dispatch_inner(driver, step);
        match tokio::time::timeout(bound, fut).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(bound)),
        }
    }

    async fn dispatch_inner(
        &self,
        driver: &dyn Driver,
        step: &Step,
    ) -> std::result::Result<DispatchOutput, DriverError> {
        match step {
            Step::Navigate { url } => {
                driver.navigate(url).await?;
                Ok(DispatchOutput::default())
            }
            Step::LocateAndAct { selector, action } => {
                let element = driver.locate(selector).await?;
                let text = driver.act(&element, action).await?;
                Ok(DispatchOutput {
                    diagnostic: text,
                    screenshot: None,
                })
            }
            Step::Wait {
                condition,
                timeout_secs,
            } => {
                driver.wait(condition, Duration::from_secs(*timeout_secs)).await?;
                Ok(DispatchOutput::default())
            }
            Step::RunScript { script } => {
                let value = driver.run_script(script).await?;
                Ok(DispatchOutput {
                    diagnostic: Some(value),
                    screenshot: None,
                })
            }
            Step::Screenshot => {
                let bytes = driver.screenshot().await?;
                Ok(DispatchOutput {
                    diagnostic: None,
                    screenshot: Some(BASE64.encode(bytes)),
                })
            }
        }
    }

    /// Best-effort screenshot for a hard-failure result.
    async fn capture_diagnostic(&self, driver: &dyn Driver) -> Option<String> {
        match tokio::time::timeout(Duration::from_secs(10), driver.screenshot()).await {
            Ok(Ok(bytes)) => Some(BASE64.encode(bytes)),
            _ => None,
        }
    }
}
