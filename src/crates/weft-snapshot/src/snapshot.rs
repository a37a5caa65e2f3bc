//! Core snapshot data structures for durable suspend/resume
//!
//! This module defines the durable unit of the engine: **[`RunSnapshot`]**, a plain-data
//! capture of one workflow run. A snapshot records the status of every step the run has
//! touched, which execution paths are still active, and where suspended paths must be
//! re-entered, so that a run can be resumed after arbitrary delays, process restarts, or
//! external events.
//!
//! # Structure
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │  RunSnapshot                                          │
//! │  • run_id: "5c0f…"          • workflow_id: "orders"   │
//! │  • status: Suspended        • timestamp: 2024-…       │
//! │  • input: {…}               • result: None            │
//! │  • steps: {                                           │
//! │      "fetch":   { status: success, output: {…} }      │
//! │      "approve": { status: suspended,                  │
//! │                   suspend_payload: {…}, run_count: 1 }│
//! │    }                                                  │
//! │  • active_paths:    [["approve"]]                     │
//! │  • suspended_paths: [["approve"]]                     │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Step records are keyed by their **dotted path** (`"child-workflow.step-id"` for steps
//! inside a nested workflow), produced by [`path_key`]. Paths themselves are plain
//! `Vec<String>` segments.
//!
//! Snapshots are pure data: step code is never serialized. At resume time the engine
//! re-resolves step ids against the in-memory workflow graph and replays recorded
//! outputs for already-successful nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Run identifier - unique per execution of a workflow
pub type RunId = String;

/// Path to a step inside a (possibly nested) workflow, outermost segment first
pub type StepPath = Vec<String>;

/// Join a step path into the dotted key used by [`RunSnapshot::steps`]
pub fn path_key(path: &[String]) -> String {
    path.join(".")
}

/// Status of a single step within a run
///
/// Legal transitions are `pending → running → {success, failed, suspended}` and
/// `suspended → running` (resume only). The engine is the sole writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Suspended,
}

/// Derived status of the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Suspended,
}

/// Execution record for one step of a run
///
/// One record exists per step path the run has entered. The record carries everything
/// needed to replay the step on resume without re-executing it: its output on success,
/// its error on failure, and the suspend/resume payloads around a suspension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Current status of this step
    pub status: StepStatus,

    /// Input the step was last invoked with; lets a resumed suspension or an
    /// interrupted loop iteration re-enter with the data it originally saw
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Output recorded on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Error message recorded on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Payload the step surfaced when it suspended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_payload: Option<Value>,

    /// Data submitted by a caller to resume this step, consumed on re-entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_payload: Option<Value>,

    /// Number of times the step body has been invoked (retries and loop iterations)
    pub run_count: u32,

    /// Wake deadline for timed suspensions (`sleep` / `sleep_until` nodes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,

    /// Per-element outputs of a partially completed `foreach`, in input order.
    /// `None` entries are elements that have not finished yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<Option<Value>>>,
}

impl StepRecord {
    /// Create a fresh record in `pending` status
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            suspend_payload: None,
            resume_payload: None,
            run_count: 0,
            wake_at: None,
            elements: None,
        }
    }

    /// Transition to `running`, bumping the invocation counter
    pub fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.run_count += 1;
    }

    /// Transition to `success` with the given output, clearing suspension state
    pub fn mark_success(&mut self, output: Value) {
        self.status = StepStatus::Success;
        self.output = Some(output);
        self.error = None;
        self.suspend_payload = None;
        self.resume_payload = None;
        self.wake_at = None;
    }

    /// Transition to `failed` with the given error message
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
    }

    /// Transition to `suspended` with the payload the step surfaced
    pub fn mark_suspended(&mut self, payload: Value) {
        self.status = StepStatus::Suspended;
        self.suspend_payload = Some(payload);
    }
}

impl Default for StepRecord {
    fn default() -> Self {
        Self::pending()
    }
}

/// Durable state of one workflow run
///
/// Persisted wholesale by a [`SnapshotStore`](crate::store::SnapshotStore), keyed by
/// `run_id`. Mutated only by the execution engine; callers submit resume data and event
/// payloads which the engine merges in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Unique id of this run
    pub run_id: RunId,

    /// Id of the workflow this run executes
    pub workflow_id: String,

    /// Derived status of the run
    pub status: RunStatus,

    /// Initial input the run was started with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Final output, present once the run reached `success`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Terminal error, present once the run reached `failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Per-step records keyed by dotted step path (see [`path_key`])
    pub steps: HashMap<String, StepRecord>,

    /// Paths currently being executed
    pub active_paths: Vec<StepPath>,

    /// Paths halted on a suspension, with the waypoint the resume must target
    pub suspended_paths: Vec<StepPath>,

    /// Last time the engine persisted this snapshot
    pub timestamp: DateTime<Utc>,
}

impl RunSnapshot {
    /// Create an empty snapshot for a new run
    pub fn new(run_id: impl Into<RunId>, workflow_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            input: None,
            result: None,
            error: None,
            steps: HashMap::new(),
            active_paths: Vec::new(),
            suspended_paths: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Look up the record for a step path
    pub fn step(&self, path: &[String]) -> Option<&StepRecord> {
        self.steps.get(&path_key(path))
    }

    /// Record for a step path, created as `pending` if absent
    pub fn step_entry(&mut self, path: &[String]) -> &mut StepRecord {
        self.steps.entry(path_key(path)).or_default()
    }

    /// Remove every record at or beneath `path`; used when a loop iteration or a
    /// foreach element re-enters a subtree that must execute fresh.
    pub fn clear_subtree(&mut self, path: &[String]) {
        let prefix = path_key(path);
        self.steps
            .retain(|key, _| key != &prefix && !key.starts_with(&format!("{prefix}.")));
    }

    /// Whether `path` is currently recorded as suspended
    pub fn is_suspended(&self, path: &[String]) -> bool {
        self.suspended_paths.iter().any(|p| p == path)
    }

    /// Refresh the persistence timestamp
    pub fn touch(&mut self) {
        self.timestamp = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_key_joins_segments() {
        assert_eq!(path_key(&["a".to_string()]), "a");
        assert_eq!(path_key(&["child".to_string(), "step".to_string()]), "child.step");
    }

    #[test]
    fn test_step_record_transitions() {
        let mut record = StepRecord::pending();
        assert_eq!(record.status, StepStatus::Pending);
        assert_eq!(record.run_count, 0);

        record.mark_running();
        assert_eq!(record.status, StepStatus::Running);
        assert_eq!(record.run_count, 1);

        record.mark_suspended(json!({"reason": "approval"}));
        assert_eq!(record.status, StepStatus::Suspended);
        assert!(record.suspend_payload.is_some());

        record.mark_running();
        record.mark_success(json!({"ok": true}));
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(record.run_count, 2);
        assert!(record.suspend_payload.is_none());
    }

    #[test]
    fn test_snapshot_step_entry_creates_pending() {
        let mut snapshot = RunSnapshot::new("run-1", "wf");
        let path = vec!["step-1".to_string()];

        assert!(snapshot.step(&path).is_none());
        snapshot.step_entry(&path).mark_running();
        assert_eq!(snapshot.step(&path).unwrap().status, StepStatus::Running);
    }

    #[test]
    fn test_clear_subtree_removes_nested_records() {
        let mut snapshot = RunSnapshot::new("run-1", "wf");
        snapshot.step_entry(&["loop-body".to_string()]).mark_running();
        snapshot
            .step_entry(&["loop-body".to_string(), "inner".to_string()])
            .mark_running();
        snapshot.step_entry(&["other".to_string()]).mark_running();

        snapshot.clear_subtree(&["loop-body".to_string()]);

        assert!(snapshot.step(&["loop-body".to_string()]).is_none());
        assert!(snapshot
            .step(&["loop-body".to_string(), "inner".to_string()])
            .is_none());
        assert!(snapshot.step(&["other".to_string()]).is_some());
    }

    #[test]
    fn test_snapshot_serialization_round_trip() {
        let mut snapshot = RunSnapshot::new("run-1", "wf");
        snapshot.input = Some(json!({"value": 3}));
        snapshot.status = RunStatus::Suspended;
        snapshot
            .step_entry(&["step-1".to_string()])
            .mark_suspended(json!({"waiting": true}));
        snapshot.suspended_paths.push(vec!["step-1".to_string()]);

        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: RunSnapshot = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.run_id, "run-1");
        assert_eq!(decoded.status, RunStatus::Suspended);
        assert_eq!(decoded.suspended_paths, vec![vec!["step-1".to_string()]]);
        assert_eq!(
            decoded.step(&["step-1".to_string()]).unwrap().status,
            StepStatus::Suspended
        );
    }
}
