//! Automation step model.
//!
//! Callers submit steps as `{method, params, description}` records; those
//! are validated into a closed [`Step`] enum at the boundary so an
//! unsupported operation or a missing parameter is rejected at submission
//! time, not halfway through a sequence. Steps are immutable once
//! submitted and their order is the execution order.

use crate::detector::Verdict;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Element action for a locate-and-act step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Click,
    Fill { text: String },
    ReadText,
}

/// Condition a wait step blocks on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitCondition {
    /// A selector becomes present on the page.
    SelectorVisible { selector: String },
    /// The page URL contains the fragment.
    UrlContains { fragment: String },
    /// Unconditional fixed delay.
    Fixed,
}

/// One declared automation instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Step {
    Navigate {
        url: String,
    },
    LocateAndAct {
        selector: String,
        action: Action,
    },
    Wait {
        condition: WaitCondition,
        timeout_secs: u64,
    },
    RunScript {
        script: String,
    },
    Screenshot,
}

impl Step {
    /// Short operation name for logs and results.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::LocateAndAct { .. } => "locate_and_act",
            Self::Wait { .. } => "wait",
            Self::RunScript { .. } => "run_script",
            Self::Screenshot => "screenshot",
        }
    }
}

/// Wire shape of one submitted step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Diagnostic only, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn required_str(req: &StepRequest, name: &str) -> Result<String, Error> {
    req.params
        .get(name)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidStep {
            method: req.method.clone(),
            detail: format!("missing required string parameter '{}'", name),
        })
}

const DEFAULT_WAIT_SECS: u64 = 30;

impl StepRequest {
    /// Validate the open wire shape into the closed step enum.
    pub fn validate(&self) -> Result<Step, Error> {
        match self.method.as_str() {
            "navigate" => {
                let raw = required_str(self, "url")?;
                let url = url::Url::parse(&raw).map_err(|e| Error::InvalidStep {
                    method: self.method.clone(),
                    detail: format!("bad url '{}': {}", raw, e),
                })?;
                Ok(Step::Navigate {
                    url: url.to_string(),
                })
            }
            "click_selector" => Ok(Step::LocateAndAct {
                selector: required_str(self, "selector")?,
                action: Action::Click,
            }),
            "type_text" => Ok(Step::LocateAndAct {
                selector: required_str(self, "selector")?,
                action: Action::Fill {
                    text: required_str(self, "text")?,
                },
            }),
            "read_text" => Ok(Step::LocateAndAct {
                selector: required_str(self, "selector")?,
                action: Action::ReadText,
            }),
            "wait" => {
                let timeout_secs = self
                    .params
                    .get("timeoutSecs")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(DEFAULT_WAIT_SECS);
                let condition = if let Some(sel) =
                    self.params.get("selector").and_then(|v| v.as_str())
                {
                    WaitCondition::SelectorVisible {
                        selector: sel.to_string(),
                    }
                } else if let Some(frag) =
                    self.params.get("urlContains").and_then(|v| v.as_str())
                {
                    WaitCondition::UrlContains {
                        fragment: frag.to_string(),
                    }
                } else {
                    WaitCondition::Fixed
                };
                Ok(Step::Wait {
                    condition,
                    timeout_secs,
                })
            }
            "execute_script" => Ok(Step::RunScript {
                script: required_str(self, "script")?,
            }),
            "screenshot" => Ok(Step::Screenshot),
            other => Err(Error::InvalidStep {
                method: other.to_string(),
                detail: "unsupported operation".to_string(),
            }),
        }
    }
}

/// A validated step paired with its caller-supplied description,
/// ready for the executor.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub step: Step,
    pub description: Option<String>,
}

/// Validate a whole submitted sequence into executable form, preserving
/// order. Validation happens exactly once, here at the boundary.
pub fn plan_sequence(requests: &[StepRequest]) -> Result<Vec<PlannedStep>, Error> {
    requests
        .iter()
        .map(|req| {
            Ok(PlannedStep {
                step: req.validate()?,
                description: req.description.clone(),
            })
        })
        .collect()
}

/// Outcome status of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Succeeded,
    RetriedThenSucceeded,
    FailedSoft,
    FailedHard,
    SkippedTakeover,
}

impl StepStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::RetriedThenSucceeded)
    }
}

/// Result record produced per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StepStatus,
    pub elapsed_ms: u64,
    /// Dispatch attempts that were made (0 for skipped steps).
    pub attempts: u32,
    /// Verdict the failure detector assigned to the final attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Error detail, extracted text, or similar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Base64 PNG captured on hard failure, when the driver could still
    /// produce one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl StepResult {
    /// Placeholder result for a step never attempted because the session
    /// left automated control.
    pub fn skipped(step: &Step, description: Option<String>) -> Self {
        Self {
            method: step.method().to_string(),
            description,
            status: StepStatus::SkippedTakeover,
            elapsed_ms: 0,
            attempts: 0,
            verdict: None,
            diagnostic: None,
            screenshot: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(method: &str, params: Value) -> StepRequest {
        StepRequest {
            method: method.to_string(),
            params,
            description: None,
        }
    }

    #[test]
    fn navigate_requires_valid_url() {
        let ok = req("navigate", json!({"url": "https://example.com/x"}));
        assert!(matches!(ok.validate().unwrap(), Step::Navigate { .. }));

        let bad = req("navigate", json!({"url": "not a url"}));
        assert!(bad.validate().is_err());

        let missing = req("navigate", json!({}));
        assert!(missing.validate().is_err());
    }

    #[test]
    fn unknown_method_rejected_at_boundary() {
        let r = req("teleport", json!({}));
        match r.validate() {
            Err(Error::InvalidStep { method, .. }) => assert_eq!(method, "teleport"),
            other => panic!("expected InvalidStep, got {:?}", other),
        }
    }

    #[test]
    fn type_text_maps_to_fill() {
        let r = req("type_text", json!({"selector": "#q", "text": "hi"}));
        match r.validate().unwrap() {
            Step::LocateAndAct {
                selector,
                action: Action::Fill { text },
            } => {
                assert_eq!(selector, "#q");
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn wait_picks_condition_from_params() {
        let sel = req("wait", json!({"selector": ".done", "timeoutSecs": 5}));
        match sel.validate().unwrap() {
            Step::Wait {
                condition: WaitCondition::SelectorVisible { selector },
                timeout_secs,
            } => {
                assert_eq!(selector, ".done");
                assert_eq!(timeout_secs, 5);
            }
            other => panic!("unexpected step {:?}", other),
        }

        let fixed = req("wait", json!({}));
        match fixed.validate().unwrap() {
            Step::Wait {
                condition: WaitCondition::Fixed,
                timeout_secs,
            } => assert_eq!(timeout_secs, DEFAULT_WAIT_SECS),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn sequence_validation_fails_fast() {
        let reqs = vec![
            req("navigate", json!({"url": "https://example.com"})),
            req("bogus", json!({})),
        ];
        assert!(plan_sequence(&reqs).is_err());
    }
}
