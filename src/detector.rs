//! Failure classification for driver outcomes.
//!
//! Heuristics are applied in a fixed order, first match wins. Challenge
//! detection runs before any retry consideration: spending retry budget
//! against a human-verification interstitial cannot succeed, so a matching
//! signature is a hard verdict regardless of attempts remaining.

use crate::driver::{DriverError, PageProbe};
use crate::retry::RetryPolicy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Verdict assigned to one dispatch outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Verdict {
    Ok,
    /// Plausibly transient; eligible for bounded automated retry.
    RetryableSoft { reason: String },
    /// Requires human intervention or session termination.
    BlockingHard { code: String, reason: String },
}

impl Verdict {
    pub fn is_hard(&self) -> bool {
        matches!(self, Self::BlockingHard { .. })
    }

    pub fn is_soft(&self) -> bool {
        matches!(self, Self::RetryableSoft { .. })
    }
}

/// Configured signature of a known challenge page for one target site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSignature {
    /// Label reported in the verdict, e.g. "captcha" or "login_wall".
    pub name: String,
    /// Patterns matched against the page title.
    #[serde(default)]
    pub title_markers: Vec<String>,
    /// Patterns matched against the page URL.
    #[serde(default)]
    pub url_markers: Vec<String>,
}

impl ChallengeSignature {
    fn matches(&self, probe: &PageProbe) -> bool {
        let hit = |patterns: &[String], haystack: &str| {
            patterns.iter().any(|p| match Regex::new(p) {
                Ok(re) => re.is_match(haystack),
                // A malformed pattern falls back to substring matching
                // rather than silently never firing.
                Err(_) => haystack.contains(p.as_str()),
            })
        };
        hit(&self.title_markers, &probe.title) || hit(&self.url_markers, &probe.url)
    }
}

/// Classifies driver outcomes into verdicts.
#[derive(Debug, Clone, Default)]
pub struct FailureDetector {
    signatures: Vec<ChallengeSignature>,
}

impl FailureDetector {
    pub fn new(signatures: Vec<ChallengeSignature>) -> Self {
        Self { signatures }
    }

    /// First configured signature matching the probe, if any.
    pub fn challenge_match(&self, probe: &PageProbe) -> Option<&ChallengeSignature> {
        self.signatures.iter().find(|sig| sig.matches(probe))
    }

    /// Classify the outcome of dispatch attempt `attempt` (1-based).
    ///
    /// `probe` is the page snapshot taken after the attempt; it may be
    /// absent when the driver itself was unreachable.
    pub fn classify(
        &self,
        outcome: &Result<(), DriverError>,
        probe: Option<&PageProbe>,
        attempt: u32,
        policy: &RetryPolicy,
    ) -> Verdict {
        // Challenge signatures preempt everything else, including success:
        // an interstitial can render while the dispatch itself "worked".
        if let Some(probe) = probe {
            if let Some(sig) = self.challenge_match(probe) {
                return Verdict::BlockingHard {
                    code: format!("challenge:{}", sig.name),
                    reason: format!(
                        "page matches challenge signature '{}' (title: '{}')",
                        sig.name, probe.title
                    ),
                };
            }
        }

        let err = match outcome {
            Ok(()) => return Verdict::Ok,
            Err(err) => err,
        };

        let budget_remains = policy.budget_remains(attempt);
        match err {
            DriverError::Timeout(elapsed) => {
                if budget_remains {
                    Verdict::RetryableSoft {
                        reason: format!("wait timed out after {:?}", elapsed),
                    }
                } else {
                    Verdict::BlockingHard {
                        code: "timeout".into(),
                        reason: format!("wait timed out after {:?}, retry budget exhausted", elapsed),
                    }
                }
            }
            DriverError::ElementAbsent(selector) => {
                // The selector may appear after further page settling.
                if budget_remains {
                    Verdict::RetryableSoft {
                        reason: format!("element absent: '{}'", selector),
                    }
                } else {
                    Verdict::BlockingHard {
                        code: "element_absent".into(),
                        reason: format!(
                            "element '{}' still absent after {} attempts",
                            selector, attempt
                        ),
                    }
                }
            }
            DriverError::Navigation(detail) => {
                if budget_remains {
                    Verdict::RetryableSoft {
                        reason: format!("navigation error: {}", detail),
                    }
                } else {
                    Verdict::BlockingHard {
                        code: "navigation".into(),
                        reason: format!("navigation error persisted: {}", detail),
                    }
                }
            }
            // Unknown failures are never silently retried.
            DriverError::Other(detail) => Verdict::BlockingHard {
                code: "unknown".into(),
                reason: detail.clone(),
            },
        }
    }
}
