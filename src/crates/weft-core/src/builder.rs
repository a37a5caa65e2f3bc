//! Workflow construction: the fluent graph builder
//!
//! A [`WorkflowBuilder`] composes steps into a graph through sequencing
//! (`then`), parallelism (`parallel`), branching (`branch`), post-checked
//! loops (`dowhile`/`dountil`), per-element iteration (`foreach`), pure data
//! mapping (`map`), timed pauses (`sleep`/`sleep_until`), and event waits
//! (`wait_for_event`). Nothing is validated while chaining;
//! [`commit`](WorkflowBuilder::commit) validates the whole graph - duplicate
//! step ids, schema compatibility along `then()` links, structural rules -
//! and freezes it into an immutable [`Workflow`].
//!
//! ```rust
//! use weft_core::{StepDefinition, StepOutcome, WorkflowBuilder};
//! use serde_json::json;
//!
//! let number = json!({"type": "object", "properties": {"value": {"type": "number"}}, "required": ["value"]});
//! let double = StepDefinition::new("double", number.clone(), number.clone(), |ctx| async move {
//!     let v = ctx.input()["value"].as_f64().unwrap_or(0.0);
//!     StepOutcome::Success(json!({"value": v * 2.0}))
//! });
//!
//! let mut builder = WorkflowBuilder::new("doubler", number.clone(), number.clone()).then(double);
//! let workflow = builder.commit().unwrap();
//! assert_eq!(workflow.id(), "doubler");
//!
//! // commit() is idempotent: the same graph comes back.
//! let again = builder.commit().unwrap();
//! assert!(workflow.same_graph(&again));
//! ```
//!
//! Committed workflows implement [`Executable`], so a workflow nests as a
//! step of another workflow by passing it to `then()` like any step.

use crate::error::{Result, WorkflowError};
use crate::node::{
    BranchArm, DeadlineFn, DurationFn, FieldMapping, FlowNode, LoopKind, MapSpec, SleepDeadline,
    SleepDuration,
};
use crate::schema;
use crate::step::{Executable, StepContext, StepDefinition, StepOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Conversion into the executable seam, for builder ergonomics
pub trait IntoExecutable {
    fn into_executable(self) -> Arc<dyn Executable>;
}

impl IntoExecutable for Arc<dyn Executable> {
    fn into_executable(self) -> Arc<dyn Executable> {
        self
    }
}

impl IntoExecutable for StepDefinition {
    fn into_executable(self) -> Arc<dyn Executable> {
        Arc::new(self)
    }
}

impl IntoExecutable for Arc<StepDefinition> {
    fn into_executable(self) -> Arc<dyn Executable> {
        self
    }
}

impl IntoExecutable for Workflow {
    fn into_executable(self) -> Arc<dyn Executable> {
        Arc::new(self)
    }
}

impl IntoExecutable for Arc<Workflow> {
    fn into_executable(self) -> Arc<dyn Executable> {
        self
    }
}

/// Options for `parallel` composites
#[derive(Debug, Clone, Default)]
pub struct ParallelOptions {
    /// Record child failures without failing the composite
    pub bypass_failures: bool,
}

/// Options for `foreach` composites
#[derive(Debug, Clone)]
pub struct ForeachOptions {
    /// Maximum element executions in flight; defaults to 1
    pub concurrency: usize,
}

impl Default for ForeachOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

impl BranchArm {
    /// Build an arm from a plain predicate closure and anything executable
    pub fn new<F>(predicate: F, step: impl IntoExecutable) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            step: step.into_executable(),
        }
    }
}

/// Fluent builder producing an immutable [`Workflow`]
pub struct WorkflowBuilder {
    id: String,
    description: Option<String>,
    input_schema: Value,
    output_schema: Value,
    nodes: Vec<FlowNode>,
    synth_counter: usize,
    committed: Option<Workflow>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>, input_schema: Value, output_schema: Value) -> Self {
        Self {
            id: id.into(),
            description: None,
            input_schema,
            output_schema,
            nodes: Vec::new(),
            synth_counter: 0,
            committed: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn push(mut self, node: FlowNode) -> Self {
        self.committed = None;
        self.nodes.push(node);
        self
    }

    fn synth_id(&mut self, kind: &str) -> String {
        let id = format!("{kind}-{}", self.synth_counter);
        self.synth_counter += 1;
        id
    }

    /// Append a step (or nested workflow) to the sequence
    pub fn then(self, step: impl IntoExecutable) -> Self {
        self.push(FlowNode::Step(step.into_executable()))
    }

    /// Run every child concurrently on the same input; the node's output maps
    /// child id to child output
    pub fn parallel(self, steps: Vec<Arc<dyn Executable>>) -> Self {
        self.parallel_with_options(steps, ParallelOptions::default())
    }

    pub fn parallel_with_options(
        self,
        steps: Vec<Arc<dyn Executable>>,
        options: ParallelOptions,
    ) -> Self {
        self.push(FlowNode::Parallel {
            children: steps,
            bypass_failures: options.bypass_failures,
        })
    }

    /// Evaluate predicates in order; run every matching arm concurrently
    pub fn branch(self, arms: Vec<BranchArm>) -> Self {
        self.push(FlowNode::Branch { arms })
    }

    /// Execute `step` repeatedly while the post-checked predicate holds
    pub fn dowhile<F>(self, step: impl IntoExecutable, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.push(FlowNode::Loop {
            child: step.into_executable(),
            kind: LoopKind::DoWhile,
            predicate: Arc::new(predicate),
        })
    }

    /// Execute `step` repeatedly until the post-checked predicate holds
    pub fn dountil<F>(self, step: impl IntoExecutable, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.push(FlowNode::Loop {
            child: step.into_executable(),
            kind: LoopKind::DoUntil,
            predicate: Arc::new(predicate),
        })
    }

    /// Execute `step` once per element of the (array) input, sequentially
    pub fn foreach(self, step: impl IntoExecutable) -> Self {
        self.foreach_with_options(step, ForeachOptions::default())
    }

    pub fn foreach_with_options(
        self,
        step: impl IntoExecutable,
        options: ForeachOptions,
    ) -> Self {
        self.push(FlowNode::Foreach {
            child: step.into_executable(),
            concurrency: options.concurrency.max(1),
        })
    }

    /// Insert a pure transform of the previous output
    pub fn map<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        let id = self.synth_id("map");
        self.push(FlowNode::Map {
            id,
            spec: MapSpec::Transform(Arc::new(f)),
        })
    }

    /// Insert a declarative field mapping
    pub fn map_spec(mut self, fields: Vec<FieldMapping>) -> Self {
        let id = self.synth_id("map");
        self.push(FlowNode::Map {
            id,
            spec: MapSpec::Fields(fields),
        })
    }

    /// Pause the path for a fixed duration; the engine wakes it automatically
    pub fn sleep(mut self, duration: Duration) -> Self {
        let id = self.synth_id("sleep");
        self.push(FlowNode::Sleep {
            id,
            duration: SleepDuration::Static(duration),
        })
    }

    /// Pause for a duration computed from the node's input
    pub fn sleep_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Duration + Send + Sync + 'static,
    {
        let id = self.synth_id("sleep");
        let f: DurationFn = Arc::new(f);
        self.push(FlowNode::Sleep {
            id,
            duration: SleepDuration::Dynamic(f),
        })
    }

    /// Pause the path until an absolute deadline
    pub fn sleep_until(mut self, deadline: DateTime<Utc>) -> Self {
        let id = self.synth_id("sleep-until");
        self.push(FlowNode::SleepUntil {
            id,
            deadline: SleepDeadline::Static(deadline),
        })
    }

    /// Pause until a deadline computed from the node's input
    pub fn sleep_until_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> DateTime<Utc> + Send + Sync + 'static,
    {
        let id = self.synth_id("sleep-until");
        let f: DeadlineFn = Arc::new(f);
        self.push(FlowNode::SleepUntil {
            id,
            deadline: SleepDeadline::Dynamic(f),
        })
    }

    /// Suspend `step` until an event with this name is sent to the run; the
    /// event payload becomes the step's resume data
    pub fn wait_for_event(self, event: impl Into<String>, step: impl IntoExecutable) -> Self {
        self.push(FlowNode::WaitForEvent {
            event: event.into(),
            step: step.into_executable(),
        })
    }

    /// Validate and freeze the graph
    ///
    /// Idempotent: repeated calls return the same committed workflow until a
    /// builder method changes the graph again.
    pub fn commit(&mut self) -> Result<Workflow> {
        if let Some(workflow) = &self.committed {
            return Ok(workflow.clone());
        }

        if self.id.is_empty() {
            return Err(WorkflowError::Configuration(
                "workflow id must not be empty".to_string(),
            ));
        }
        if self.nodes.is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "workflow '{}' has no nodes",
                self.id
            )));
        }

        self.check_duplicate_ids()?;
        self.check_schema_chain()?;

        let workflow = Workflow {
            inner: Arc::new(WorkflowInner {
                id: self.id.clone(),
                description: self.description.clone(),
                input_schema: self.input_schema.clone(),
                output_schema: self.output_schema.clone(),
                nodes: self.nodes.clone(),
            }),
        };
        self.committed = Some(workflow.clone());
        Ok(workflow)
    }

    fn check_duplicate_ids(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            for id in node.step_ids() {
                if !seen.insert(id.clone()) {
                    return Err(WorkflowError::Configuration(format!(
                        "duplicate step id '{id}' in workflow '{}'",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Walk the sequence checking each producer's output schema against the
    /// next consumer's input schema.
    fn check_schema_chain(&self) -> Result<()> {
        let permissive = json!({});
        let mut producer = self.input_schema.clone();

        for node in &self.nodes {
            match node {
                FlowNode::Step(step) => {
                    self.check_link(&producer, step.input_schema(), step.id())?;
                    producer = step.output_schema().clone();
                }
                FlowNode::Sequence(_) => {
                    // The builder only emits flat sequences; nested sequences
                    // come from nested workflows which validate themselves.
                    producer = permissive.clone();
                }
                FlowNode::Parallel { children, .. } => {
                    for child in children {
                        self.check_link(&producer, child.input_schema(), child.id())?;
                    }
                    producer = json!({"type": "object"});
                }
                FlowNode::Branch { arms } => {
                    for arm in arms {
                        self.check_link(&producer, arm.step.input_schema(), arm.step.id())?;
                    }
                    producer = json!({"type": "object"});
                }
                FlowNode::Loop { child, .. } => {
                    self.check_link(&producer, child.input_schema(), child.id())?;
                    // Iteration output feeds iteration input.
                    self.check_link(child.output_schema(), child.input_schema(), child.id())?;
                    producer = child.output_schema().clone();
                }
                FlowNode::Foreach { child, .. } => {
                    if let Some(t) = producer.get("type").and_then(Value::as_str) {
                        if t != "array" {
                            return Err(WorkflowError::validation(format!(
                                "foreach over '{}' needs an array input, got '{t}'",
                                child.id()
                            )));
                        }
                    }
                    if let Some(items) = producer.get("items") {
                        self.check_link(items, child.input_schema(), child.id())?;
                    }
                    producer = json!({"type": "array", "items": child.output_schema().clone()});
                }
                FlowNode::Map { .. } => {
                    // A map can reshape arbitrarily; the chain restarts.
                    producer = permissive.clone();
                }
                FlowNode::Sleep { .. } | FlowNode::SleepUntil { .. } => {
                    // Sleeps pass their input through untouched.
                }
                FlowNode::WaitForEvent { step, .. } => {
                    self.check_link(&producer, step.input_schema(), step.id())?;
                    producer = step.output_schema().clone();
                }
            }
        }

        self.check_link(&producer, &self.output_schema, "workflow output")
    }

    fn check_link(&self, producer: &Value, consumer: &Value, at: &str) -> Result<()> {
        schema::accepts(producer, consumer).map_err(|e| {
            WorkflowError::validation(format!(
                "incompatible schemas at '{at}' in workflow '{}': {e}",
                self.id
            ))
        })
    }
}

impl std::fmt::Debug for WorkflowBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowBuilder")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .field("committed", &self.committed.is_some())
            .finish()
    }
}

pub(crate) struct WorkflowInner {
    pub(crate) id: String,
    pub(crate) description: Option<String>,
    pub(crate) input_schema: Value,
    pub(crate) output_schema: Value,
    pub(crate) nodes: Vec<FlowNode>,
}

/// A committed, immutable workflow graph
///
/// Cheap to clone (the graph is shared behind an `Arc`). Implements
/// [`Executable`], so a workflow nests as a step of another workflow.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<WorkflowInner>,
}

impl Workflow {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn description(&self) -> Option<&str> {
        self.inner.description.as_deref()
    }

    pub(crate) fn nodes(&self) -> &[FlowNode] {
        &self.inner.nodes
    }

    /// Whether two handles share the identical committed graph
    pub fn same_graph(&self, other: &Workflow) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolve the executable a (possibly nested) step path refers to
    pub(crate) fn find_executable(&self, path: &[String]) -> Option<Arc<dyn Executable>> {
        let (first, rest) = path.split_first()?;

        for node in self.nodes() {
            let candidates: Vec<Arc<dyn Executable>> = match node {
                FlowNode::Step(step) => vec![step.clone()],
                FlowNode::Parallel { children, .. } => children.clone(),
                FlowNode::Branch { arms } => arms.iter().map(|a| a.step.clone()).collect(),
                FlowNode::Loop { child, .. } | FlowNode::Foreach { child, .. } => {
                    vec![child.clone()]
                }
                FlowNode::WaitForEvent { step, .. } => vec![step.clone()],
                FlowNode::Sequence(_)
                | FlowNode::Map { .. }
                | FlowNode::Sleep { .. }
                | FlowNode::SleepUntil { .. } => Vec::new(),
            };

            for candidate in candidates {
                if candidate.id() == first {
                    if rest.is_empty() {
                        return Some(candidate);
                    }
                    if let Some(nested) = candidate.as_workflow() {
                        return nested.find_executable(rest);
                    }
                    return None;
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.inner.id)
            .field("nodes", &self.inner.nodes)
            .finish()
    }
}

#[async_trait]
impl Executable for Workflow {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn input_schema(&self) -> &Value {
        &self.inner.input_schema
    }

    fn output_schema(&self) -> &Value {
        &self.inner.output_schema
    }

    fn as_workflow(&self) -> Option<&Workflow> {
        Some(self)
    }

    /// Run the workflow detached: in-memory persistence, no event listeners.
    ///
    /// The engine does not call this for nested workflows - it recurses into
    /// the child graph itself so suspension paths stay addressable - but a
    /// workflow resolved from a registry inside a step body can be invoked
    /// directly this way.
    async fn execute(&self, ctx: StepContext) -> StepOutcome {
        crate::executor::execute_detached(self.clone(), ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value_schema() -> Value {
        json!({"type": "object", "properties": {"value": {"type": "number"}}, "required": ["value"]})
    }

    fn passthrough(id: &str) -> StepDefinition {
        StepDefinition::new(id, value_schema(), value_schema(), |ctx| async move {
            StepOutcome::Success(ctx.input().clone())
        })
    }

    #[test]
    fn test_commit_freezes_and_is_idempotent() {
        let mut builder = WorkflowBuilder::new("wf", value_schema(), value_schema())
            .then(passthrough("a"))
            .then(passthrough("b"));

        let first = builder.commit().unwrap();
        let second = builder.commit().unwrap();
        assert!(first.same_graph(&second));
        assert_eq!(first.nodes().len(), 2);
    }

    #[test]
    fn test_builder_method_after_commit_yields_new_graph() {
        let mut builder =
            WorkflowBuilder::new("wf", value_schema(), value_schema()).then(passthrough("a"));
        let first = builder.commit().unwrap();

        let mut builder = builder.then(passthrough("b"));
        let second = builder.commit().unwrap();

        assert!(!first.same_graph(&second));
        assert_eq!(second.nodes().len(), 2);
    }

    #[test]
    fn test_commit_rejects_empty_workflow() {
        let mut builder = WorkflowBuilder::new("wf", json!({}), json!({}));
        assert!(matches!(
            builder.commit(),
            Err(WorkflowError::Configuration(_))
        ));
    }

    #[test]
    fn test_commit_rejects_duplicate_step_ids() {
        let mut builder = WorkflowBuilder::new("wf", value_schema(), value_schema())
            .then(passthrough("a"))
            .then(passthrough("a"));
        assert!(matches!(
            builder.commit(),
            Err(WorkflowError::Configuration(_))
        ));
    }

    #[test]
    fn test_commit_rejects_schema_mismatch() {
        let wants_name = StepDefinition::new(
            "wants-name",
            json!({"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]}),
            json!({}),
            |_| async { StepOutcome::Success(Value::Null) },
        );

        let mut builder = WorkflowBuilder::new("wf", value_schema(), json!({}))
            .then(passthrough("a"))
            .then(wants_name);

        assert!(matches!(builder.commit(), Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn test_map_restarts_schema_chain() {
        let wants_name = StepDefinition::new(
            "wants-name",
            json!({"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]}),
            json!({}),
            |_| async { StepOutcome::Success(Value::Null) },
        );

        let mut builder = WorkflowBuilder::new("wf", value_schema(), json!({}))
            .then(passthrough("a"))
            .map(|v| json!({"name": v["value"].to_string()}))
            .then(wants_name);

        assert!(builder.commit().is_ok());
    }

    #[test]
    fn test_foreach_requires_array_producer() {
        let mut builder = WorkflowBuilder::new("wf", value_schema(), json!({}))
            .then(passthrough("a"))
            .foreach(passthrough("each"));

        assert!(matches!(builder.commit(), Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn test_synth_ids_are_deterministic() {
        let build = || {
            WorkflowBuilder::new("wf", json!({}), json!({}))
                .map(|v| v.clone())
                .sleep(Duration::from_millis(1))
                .map(|v| v.clone())
        };

        let ids = |builder: &mut WorkflowBuilder| {
            builder
                .commit()
                .unwrap()
                .nodes()
                .iter()
                .flat_map(|n| n.step_ids())
                .collect::<Vec<_>>()
        };

        assert_eq!(ids(&mut build()), ids(&mut build()));
        assert_eq!(ids(&mut build()), vec!["map-0", "sleep-1", "map-2"]);
    }

    #[test]
    fn test_nested_workflow_lookup() {
        let mut child_builder = WorkflowBuilder::new("child", value_schema(), value_schema())
            .then(passthrough("inner"));
        let child = child_builder.commit().unwrap();

        let mut parent_builder =
            WorkflowBuilder::new("parent", value_schema(), value_schema()).then(child);
        let parent = parent_builder.commit().unwrap();

        let found = parent
            .find_executable(&["child".to_string(), "inner".to_string()])
            .unwrap();
        assert_eq!(found.id(), "inner");

        assert!(parent
            .find_executable(&["child".to_string(), "missing".to_string()])
            .is_none());
        assert!(parent.find_executable(&["child".to_string()]).is_some());
    }
}
