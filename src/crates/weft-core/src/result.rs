//! The caller-facing result of a run
//!
//! A [`WorkflowResult`] is the wire shape `start`/`resume` resolve with,
//! projected from the run's snapshot:
//!
//! ```json
//! { "status": "success" | "suspended" | "failed",
//!   "steps": { "<stepId>": { "status": "...", "output"?: …, "error"?: …, "payload"?: … } },
//!   "result"?: …,
//!   "suspended"?: [["<stepIdPath>", …]],
//!   "error"?: "…" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use weft_snapshot::{RunSnapshot, RunStatus, StepPath, StepStatus};

/// Per-step slice of a [`WorkflowResult`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub status: StepStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Suspension payload, present while the step is suspended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Terminal (or suspended) state of one run, as resolved by `start`/`resume`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub status: RunStatus,

    /// Step records keyed by dotted step path
    pub steps: HashMap<String, StepResult>,

    /// Final output, present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Paths awaiting resume, present while suspended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended: Option<Vec<StepPath>>,

    /// Terminal error message, present on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowResult {
    /// Project the caller-facing result out of a snapshot
    pub fn from_snapshot(snapshot: &RunSnapshot) -> Self {
        let steps = snapshot
            .steps
            .iter()
            .map(|(key, record)| {
                (
                    key.clone(),
                    StepResult {
                        status: record.status,
                        output: record.output.clone(),
                        error: record.error.clone(),
                        payload: record.suspend_payload.clone(),
                    },
                )
            })
            .collect();

        Self {
            status: snapshot.status,
            steps,
            result: snapshot.result.clone(),
            suspended: (!snapshot.suspended_paths.is_empty())
                .then(|| snapshot.suspended_paths.clone()),
            error: snapshot.error.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn is_suspended(&self) -> bool {
        self.status == RunStatus::Suspended
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    /// Record for a step, by id or dotted path
    pub fn step(&self, id: &str) -> Option<&StepResult> {
        if let Some(record) = self.steps.get(id) {
            return Some(record);
        }
        let suffix = format!(".{id}");
        self.steps
            .iter()
            .find(|(key, _)| key.ends_with(&suffix))
            .map(|(_, record)| record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_projection_from_suspended_snapshot() {
        let mut snapshot = RunSnapshot::new("run-1", "wf");
        snapshot.status = RunStatus::Suspended;
        snapshot
            .step_entry(&["step-1".to_string()])
            .mark_suspended(json!({"why": "input"}));
        snapshot.suspended_paths.push(vec!["step-1".to_string()]);

        let result = WorkflowResult::from_snapshot(&snapshot);
        assert!(result.is_suspended());
        assert_eq!(result.suspended, Some(vec![vec!["step-1".to_string()]]));
        assert_eq!(
            result.step("step-1").unwrap().payload,
            Some(json!({"why": "input"}))
        );
    }

    #[test]
    fn test_wire_shape_omits_empty_fields() {
        let mut snapshot = RunSnapshot::new("run-1", "wf");
        snapshot.status = RunStatus::Success;
        snapshot.result = Some(json!({"value": 7}));
        snapshot
            .step_entry(&["double".to_string()])
            .mark_success(json!({"value": 6}));

        let wire = serde_json::to_value(WorkflowResult::from_snapshot(&snapshot)).unwrap();
        assert_eq!(wire["status"], "success");
        assert_eq!(wire["result"], json!({"value": 7}));
        assert!(wire.get("suspended").is_none());
        assert!(wire.get("error").is_none());
        assert_eq!(wire["steps"]["double"]["status"], "success");
        assert!(wire["steps"]["double"].get("error").is_none());
    }

    #[test]
    fn test_step_lookup_by_suffix() {
        let mut snapshot = RunSnapshot::new("run-1", "wf");
        snapshot
            .step_entry(&["child".to_string(), "fetch".to_string()])
            .mark_success(json!(1));

        let result = WorkflowResult::from_snapshot(&snapshot);
        assert!(result.step("fetch").is_some());
        assert!(result.step("child.fetch").is_some());
        assert!(result.step("missing").is_none());
    }
}
