//! Step definitions and the executable seam
//!
//! A **step** is the unit of work the engine schedules: an id, input/output
//! schemas, optional resume/suspend schemas, and an async body returning a
//! [`StepOutcome`]. The outcome is an explicit three-way result - success,
//! suspension, or failure - never a control-flow exception:
//!
//! ```rust
//! use weft_core::step::{Executable, StepDefinition, StepOutcome};
//! use serde_json::json;
//!
//! let double = StepDefinition::new(
//!     "double",
//!     json!({"type": "object", "properties": {"value": {"type": "number"}}, "required": ["value"]}),
//!     json!({"type": "object", "properties": {"value": {"type": "number"}}, "required": ["value"]}),
//!     |ctx| async move {
//!         let value = ctx.input()["value"].as_f64().unwrap_or(0.0);
//!         StepOutcome::Success(json!({"value": value * 2.0}))
//!     },
//! );
//! assert_eq!(double.id(), "double");
//! ```
//!
//! Steps and workflows share one seam: the [`Executable`] trait. A committed
//! workflow implements it too, so nesting a workflow as a step of another
//! workflow is ordinary composition - the engine notices the nesting through
//! [`Executable::as_workflow`] and recurses with the child's id prefixed onto
//! step paths.
//!
//! The [`StepContext`] handed to a step body carries the data channels the
//! engine keeps separate: `input_data` (the previous node's output),
//! `resume_data` (submitted by a caller or an event to wake a suspension),
//! the run's initial input, prior step results, the read-only
//! [`RuntimeContext`], a [`Registry`] handle, and the run's cancellation
//! token.

use crate::builder::Workflow;
use crate::context::RuntimeContext;
use crate::registry::Registry;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use weft_snapshot::{RunId, RunSnapshot};

/// Result of one step execution: the three legal exits
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step completed; the value feeds the next node
    Success(Value),
    /// The step paused its own path; the payload is surfaced to callers
    Suspended(Value),
    /// The step failed; retried per policy, then fatal to the enclosing composite
    Failed(String),
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, StepOutcome::Suspended(_))
    }
}

/// Async step body: consumes a context, produces an outcome
pub type StepFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, StepOutcome> + Send + Sync>;

/// Common interface over steps and workflows
///
/// Anything executable by the engine: an id, schemas at the boundary, and an
/// async body. Workflows implement this too (returning themselves from
/// [`as_workflow`](Self::as_workflow)), which is what makes
/// workflows-as-steps ordinary composition.
#[async_trait]
pub trait Executable: Send + Sync {
    /// Identifier, unique within the enclosing workflow
    fn id(&self) -> &str;

    /// Schema the input data must satisfy
    fn input_schema(&self) -> &Value;

    /// Schema the output data must satisfy
    fn output_schema(&self) -> &Value;

    /// Schema for resume data, when this executable can suspend
    fn resume_schema(&self) -> Option<&Value> {
        None
    }

    /// Schema for the payload surfaced on suspension
    fn suspend_schema(&self) -> Option<&Value> {
        None
    }

    /// Per-executable retry override; the engine default applies when `None`
    fn retry_policy(&self) -> Option<&RetryPolicy> {
        None
    }

    /// Downcast to a workflow for engine-side nesting
    fn as_workflow(&self) -> Option<&Workflow> {
        None
    }

    /// Run the body once
    async fn execute(&self, ctx: StepContext) -> StepOutcome;
}

/// Immutable descriptor of one step
///
/// Referenced (via `Arc`) by graph nodes, not owned by them; the same step
/// definition may appear in several workflows.
#[derive(Clone)]
pub struct StepDefinition {
    id: String,
    description: Option<String>,
    input_schema: Value,
    output_schema: Value,
    resume_schema: Option<Value>,
    suspend_schema: Option<Value>,
    retry_policy: Option<RetryPolicy>,
    execute: StepFn,
}

impl StepDefinition {
    /// Create a step from an async closure
    pub fn new<F, Fut>(
        id: impl Into<String>,
        input_schema: Value,
        output_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StepOutcome> + Send + 'static,
    {
        Self {
            id: id.into(),
            description: None,
            input_schema,
            output_schema,
            resume_schema: None,
            suspend_schema: None,
            retry_policy: None,
            execute: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare the schema resume data must satisfy
    pub fn with_resume_schema(mut self, schema: Value) -> Self {
        self.resume_schema = Some(schema);
        self
    }

    /// Declare the schema suspension payloads must satisfy
    pub fn with_suspend_schema(mut self, schema: Value) -> Self {
        self.suspend_schema = Some(schema);
        self
    }

    /// Override the engine's retry policy for this step
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

#[async_trait]
impl Executable for StepDefinition {
    fn id(&self) -> &str {
        &self.id
    }

    fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    fn output_schema(&self) -> &Value {
        &self.output_schema
    }

    fn resume_schema(&self) -> Option<&Value> {
        self.resume_schema.as_ref()
    }

    fn suspend_schema(&self) -> Option<&Value> {
        self.suspend_schema.as_ref()
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    async fn execute(&self, ctx: StepContext) -> StepOutcome {
        (self.execute)(ctx).await
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("execute", &"<fn>")
            .finish()
    }
}

/// Shared view of the run's live state, for prior-result lookups
#[derive(Clone)]
pub(crate) struct StateView {
    snapshot: Arc<Mutex<RunSnapshot>>,
}

impl StateView {
    pub(crate) fn new(snapshot: Arc<Mutex<RunSnapshot>>) -> Self {
        Self { snapshot }
    }

    fn with<T>(&self, f: impl FnOnce(&RunSnapshot) -> T) -> T {
        let guard = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }
}

/// Everything a step body can see while executing
#[derive(Clone)]
pub struct StepContext {
    pub(crate) run_id: RunId,
    pub(crate) input: Value,
    pub(crate) resume_data: Option<Value>,
    pub(crate) run_count: u32,
    pub(crate) runtime_context: RuntimeContext,
    pub(crate) registry: Arc<Registry>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) state: StateView,
}

impl StepContext {
    /// The input data for this invocation (the previous node's output)
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Resume data, present only when re-entering after a suspension
    pub fn resume_data(&self) -> Option<&Value> {
        self.resume_data.as_ref()
    }

    /// The initial input the run was started with
    pub fn init_data(&self) -> Value {
        self.state
            .with(|s| s.input.clone())
            .unwrap_or(Value::Null)
    }

    /// Output of a previously completed step, by step id or dotted path
    pub fn get_step_result(&self, id: &str) -> Option<Value> {
        self.state.with(|s| {
            if let Some(record) = s.steps.get(id) {
                return record.output.clone();
            }
            let suffix = format!(".{id}");
            s.steps
                .iter()
                .find(|(key, _)| key.ends_with(&suffix))
                .and_then(|(_, record)| record.output.clone())
        })
    }

    /// Convenience constructor for a suspension outcome
    pub fn suspend(&self, payload: Value) -> StepOutcome {
        StepOutcome::Suspended(payload)
    }

    /// Id of the run this invocation belongs to
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Number of times this step has been invoked in this run, this one included
    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    /// The read-only key-value bag threaded through the run
    pub fn runtime_context(&self) -> &RuntimeContext {
        &self.runtime_context
    }

    /// Registry for resolving sibling workflows and steps by id
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The run's cancellation token, for cooperative abort inside step bodies
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the run has been asked to abort
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("run_id", &self.run_id)
            .field("run_count", &self.run_count)
            .field("has_resume_data", &self.resume_data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn test_context(input: Value) -> StepContext {
        let mut snapshot = RunSnapshot::new("run-test", "wf-test");
        snapshot.input = Some(json!({"seed": 1}));
        StepContext {
            run_id: "run-test".to_string(),
            input,
            resume_data: None,
            run_count: 1,
            runtime_context: RuntimeContext::new(),
            registry: Arc::new(Registry::new()),
            cancellation: CancellationToken::new(),
            state: StateView::new(Arc::new(Mutex::new(snapshot))),
        }
    }

    #[tokio::test]
    async fn test_step_executes_closure() {
        let step = StepDefinition::new("double", json!({}), json!({}), |ctx| async move {
            let value = ctx.input()["value"].as_i64().unwrap_or(0);
            StepOutcome::Success(json!({"value": value * 2}))
        });

        let outcome = step.execute(test_context(json!({"value": 21}))).await;
        assert_eq!(outcome, StepOutcome::Success(json!({"value": 42})));
    }

    #[tokio::test]
    async fn test_suspend_helper_builds_suspended_outcome() {
        let step = StepDefinition::new("wait", json!({}), json!({}), |ctx| async move {
            ctx.suspend(json!({"reason": "needs input"}))
        });

        let outcome = step.execute(test_context(json!({}))).await;
        assert!(outcome.is_suspended());
    }

    #[test]
    fn test_init_data_reads_run_input() {
        let ctx = test_context(json!({}));
        assert_eq!(ctx.init_data(), json!({"seed": 1}));
    }

    #[test]
    fn test_get_step_result_matches_suffix() {
        let ctx = test_context(json!({}));
        {
            let mut guard = ctx.state.snapshot.lock().unwrap();
            guard
                .step_entry(&["child".to_string(), "fetch".to_string()])
                .mark_success(json!({"rows": 3}));
        }

        assert_eq!(ctx.get_step_result("fetch"), Some(json!({"rows": 3})));
        assert_eq!(ctx.get_step_result("child.fetch"), Some(json!({"rows": 3})));
        assert!(ctx.get_step_result("missing").is_none());
    }

    #[test]
    fn test_step_builder_attaches_schemas() {
        let step = StepDefinition::new("s", json!({}), json!({}), |_| async {
            StepOutcome::Success(Value::Null)
        })
        .with_resume_schema(json!({"type": "object"}))
        .with_suspend_schema(json!({"type": "object"}))
        .with_retry_policy(RetryPolicy::new(3));

        assert!(step.resume_schema().is_some());
        assert!(step.suspend_schema().is_some());
        assert_eq!(step.retry_policy().unwrap().max_attempts, 3);
    }
}
