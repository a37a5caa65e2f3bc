//! The execution engine: a state machine over committed workflow graphs
//!
//! The executor walks a [`Workflow`](crate::builder::Workflow)'s node tree for
//! one run, driving each step through
//! `pending → running → {success | failed | suspended}` and the run itself to
//! a terminal or suspended state.
//!
//! # Execution model
//!
//! ```text
//! start(input) ──► persist(running) ──► walk nodes ──┬─► success ─► persist ─► finish
//!                                                    ├─► failed  ─► persist ─► finish
//!                                                    └─► suspended ─► persist ─► finish
//!                                                            ▲
//! resume(path, data) ──► load snapshot ──► replay ───────────┘
//! ```
//!
//! - **Suspension is not failure.** A step returning
//!   [`StepOutcome::Suspended`] halts only its own path; sibling parallel
//!   paths keep running, and the run reports `suspended` once no path is
//!   still active. The snapshot is persisted at every suspension point.
//! - **Resume replays, never re-executes.** Re-entering a run walks the graph
//!   from the root; nodes recorded `success` return their recorded outputs
//!   without running (and without re-emitting events), the suspended target
//!   consumes its resume data, and execution continues forward.
//! - **Failures bubble to the smallest enclosing composite.** `parallel` and
//!   `branch` fail fast by default: the first failing child trips a child
//!   cancellation token, remaining siblings are awaited, then the composite
//!   reports the failure.
//! - **Retries cover execution failures only.** Schema validation failures
//!   are fatal immediately; suspensions are normal exits. Transient `Failed`
//!   outcomes are re-invoked per the step's (or engine's) [`RetryPolicy`]
//!   with backoff.
//! - **Persistence failures stop everything.** A snapshot that cannot be
//!   saved surfaces as `Err`; the engine never continues on state it could
//!   not persist.

use crate::builder::Workflow;
use crate::context::RuntimeContext;
use crate::error::{Result, WorkflowError};
use crate::events::{EventBus, EventHub, RunEvent};
use crate::node::{BranchArm, FlowNode, LoopKind, MapSpec, PredicateFn};
use crate::registry::Registry;
use crate::result::WorkflowResult;
use crate::retry::RetryPolicy;
use crate::schema;
use crate::step::{Executable, StateView, StepContext, StepOutcome};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_snapshot::{
    InMemorySnapshotStore, RunSnapshot, RunStatus, SnapshotStore, StepPath, StepStatus,
};

/// Engine-wide execution settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Retry policy applied to steps without their own override.
    /// The default is a single attempt (no retries).
    pub default_retry: RetryPolicy,

    /// Bound on workflows-as-steps nesting
    pub max_depth: usize,

    /// Whether `send_event` buffers a payload per event name when no wait is
    /// pending (single slot, latest wins)
    pub buffer_events: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::none(),
            max_depth: 16,
            buffer_events: true,
        }
    }
}

/// Control-flow result of executing one node
#[derive(Debug, Clone)]
enum NodeFlow {
    /// Node completed; value feeds the next node
    Done(Value),
    /// One or more paths under this node are suspended
    Suspended(Vec<StepPath>),
    /// Node failed; bubbles to the smallest enclosing composite
    Failed(String),
}

/// How a leaf is entered after consulting the snapshot
enum LeafEntry {
    Fresh,
    Resume(Value),
    Replay(Value),
    StillSuspended,
}

/// One run's executor: workflow graph + snapshot + collaborators
#[derive(Clone)]
pub(crate) struct Executor {
    pub(crate) workflow: Workflow,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) runtime_context: RuntimeContext,
    pub(crate) bus: EventBus,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) cancel: CancellationToken,
    pub(crate) config: Arc<ExecutorConfig>,
    pub(crate) state: Arc<Mutex<RunSnapshot>>,
}

impl Executor {
    fn run_id(&self) -> String {
        self.with_state(|s| s.run_id.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RunSnapshot) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    async fn persist(&self) -> Result<()> {
        let (run_id, snapshot) = {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            guard.touch();
            (guard.run_id.clone(), guard.clone())
        };
        self.store.save(&run_id, &snapshot).await?;
        Ok(())
    }

    fn emit(&self, event: RunEvent) {
        self.bus.emit(event);
    }

    /// Drive a fresh run from its initial input
    #[tracing::instrument(skip(self, input), fields(workflow = %self.workflow.id()))]
    pub(crate) async fn start(&self, input: Value) -> Result<WorkflowResult> {
        if let Err(e) = schema::validate(self.workflow.input_schema(), &input, "workflow input") {
            // Bad initial data is a failed run, not a thrown error.
            self.with_state(|s| {
                s.input = Some(input.clone());
                s.status = RunStatus::Failed;
                s.error = Some(e.to_string());
            });
            self.persist().await?;
            self.emit(RunEvent::Finish {
                run_id: self.run_id(),
                status: RunStatus::Failed,
            });
            return Ok(self.current_result());
        }

        self.with_state(|s| {
            s.input = Some(input.clone());
            s.status = RunStatus::Running;
        });
        self.persist().await?;
        self.drive(input).await
    }

    /// Re-enter a loaded run; resume data has already been staged on the
    /// target step's record
    #[tracing::instrument(skip(self), fields(workflow = %self.workflow.id()))]
    pub(crate) async fn resume(&self) -> Result<WorkflowResult> {
        let input = self.with_state(|s| {
            s.status = RunStatus::Running;
            s.input.clone().unwrap_or(Value::Null)
        });
        self.persist().await?;
        self.drive(input).await
    }

    async fn drive(&self, input: Value) -> Result<WorkflowResult> {
        let run_id = self.run_id();
        self.emit(RunEvent::Start {
            run_id: run_id.clone(),
        });

        let nodes = self.workflow.nodes().to_vec();
        let flow = self
            .exec_sequence(nodes, input, Vec::new(), 0, self.cancel.clone())
            .await?;

        let status = match flow {
            NodeFlow::Done(value) => {
                match schema::validate(self.workflow.output_schema(), &value, "workflow output") {
                    Ok(()) => self.with_state(|s| {
                        s.status = RunStatus::Success;
                        s.result = Some(value);
                        s.error = None;
                        s.active_paths.clear();
                        s.suspended_paths.clear();
                        s.status
                    }),
                    Err(e) => self.with_state(|s| {
                        s.status = RunStatus::Failed;
                        s.error = Some(e.to_string());
                        s.active_paths.clear();
                        s.status
                    }),
                }
            }
            NodeFlow::Suspended(paths) => self.with_state(|s| {
                s.status = RunStatus::Suspended;
                s.suspended_paths = paths;
                s.active_paths.clear();
                s.status
            }),
            NodeFlow::Failed(error) => self.with_state(|s| {
                s.status = RunStatus::Failed;
                s.error = Some(error);
                s.active_paths.clear();
                s.status
            }),
        };

        self.persist().await?;
        self.emit(RunEvent::Finish { run_id, status });
        Ok(self.current_result())
    }

    fn current_result(&self) -> WorkflowResult {
        self.with_state(|s| WorkflowResult::from_snapshot(s))
    }

    fn exec_sequence(
        &self,
        nodes: Vec<FlowNode>,
        input: Value,
        prefix: Vec<String>,
        depth: usize,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<NodeFlow>> {
        async move {
            let mut current = input;
            for node in nodes {
                match self
                    .exec_node(node, current.clone(), prefix.clone(), depth, cancel.clone())
                    .await?
                {
                    NodeFlow::Done(value) => current = value,
                    other => return Ok(other),
                }
            }
            Ok(NodeFlow::Done(current))
        }
        .boxed()
    }

    fn exec_node(
        &self,
        node: FlowNode,
        input: Value,
        prefix: Vec<String>,
        depth: usize,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<NodeFlow>> {
        async move {
            if cancel.is_cancelled() {
                return Ok(NodeFlow::Failed(WorkflowError::Aborted.to_string()));
            }

            match node {
                FlowNode::Step(step) => self.exec_step(step, input, prefix, depth, cancel).await,
                FlowNode::Sequence(children) => {
                    self.exec_sequence(children, input, prefix, depth, cancel).await
                }
                FlowNode::Parallel {
                    children,
                    bypass_failures,
                } => {
                    self.exec_fanout(children, input, prefix, depth, cancel, bypass_failures)
                        .await
                }
                FlowNode::Branch { arms } => {
                    // Predicates run in declaration order; every match executes.
                    let matched = self.matching_arms(&arms, &input);
                    if matched.is_empty() {
                        debug!(workflow = %self.workflow.id(), "no branch arm matched");
                        return Ok(NodeFlow::Done(json!({})));
                    }
                    self.exec_fanout(matched, input, prefix, depth, cancel, false)
                        .await
                }
                FlowNode::Loop {
                    child,
                    kind,
                    predicate,
                } => {
                    self.exec_loop(child, kind, predicate, input, prefix, depth, cancel)
                        .await
                }
                FlowNode::Foreach { child, concurrency } => {
                    self.exec_foreach(child, concurrency, input, prefix, depth, cancel)
                        .await
                }
                FlowNode::Map { id, spec } => self.exec_map(&id, &spec, input, prefix).await,
                FlowNode::Sleep { id, duration } => {
                    let wake_at = Utc::now()
                        + chrono::Duration::from_std(duration.resolve(&input))
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    self.exec_sleep(&id, wake_at, input, prefix, cancel).await
                }
                FlowNode::SleepUntil { id, deadline } => {
                    let wake_at = deadline.resolve(&input);
                    self.exec_sleep(&id, wake_at, input, prefix, cancel).await
                }
                FlowNode::WaitForEvent { event, step } => {
                    self.exec_wait(&event, step, input, prefix, cancel).await
                }
            }
        }
        .boxed()
    }

    fn matching_arms(&self, arms: &[BranchArm], input: &Value) -> Vec<Arc<dyn Executable>> {
        arms.iter()
            .filter(|arm| (arm.predicate)(input))
            .map(|arm| arm.step.clone())
            .collect()
    }

    /// Execute a leaf step or nested workflow at `prefix + [step.id()]`
    async fn exec_step(
        &self,
        step: Arc<dyn Executable>,
        input: Value,
        prefix: Vec<String>,
        depth: usize,
        cancel: CancellationToken,
    ) -> Result<NodeFlow> {
        let path = child_path(&prefix, step.id());

        if let Some(nested) = step.as_workflow() {
            return self
                .exec_nested(nested.clone(), input, path, depth, cancel)
                .await;
        }

        let entry = self.leaf_entry(&path);
        match entry {
            LeafEntry::Replay(output) => Ok(NodeFlow::Done(output)),
            LeafEntry::StillSuspended => Ok(NodeFlow::Suspended(vec![path])),
            LeafEntry::Resume(data) => {
                self.exec_leaf(step, input, path, Some(data), cancel).await
            }
            LeafEntry::Fresh => self.exec_leaf(step, input, path, None, cancel).await,
        }
    }

    /// Consult the snapshot for how to enter a leaf at `path`
    fn leaf_entry(&self, path: &[String]) -> LeafEntry {
        self.with_state(|s| {
            let key = weft_snapshot::path_key(path);
            match s.steps.get_mut(&key) {
                Some(record) if record.status == StepStatus::Success => {
                    LeafEntry::Replay(record.output.clone().unwrap_or(Value::Null))
                }
                Some(record) if record.status == StepStatus::Suspended => {
                    match record.resume_payload.take() {
                        Some(data) => LeafEntry::Resume(data),
                        None => LeafEntry::StillSuspended,
                    }
                }
                _ => LeafEntry::Fresh,
            }
        })
    }

    /// Run a nested workflow inline, prefixing its steps with the child's id
    async fn exec_nested(
        &self,
        nested: Workflow,
        input: Value,
        path: StepPath,
        depth: usize,
        cancel: CancellationToken,
    ) -> Result<NodeFlow> {
        if depth + 1 > self.config.max_depth {
            return Err(WorkflowError::DepthExceeded {
                max_depth: self.config.max_depth,
            });
        }

        let replay = self.with_state(|s| {
            s.step(&path)
                .filter(|r| r.status == StepStatus::Success)
                .and_then(|r| r.output.clone())
        });
        if let Some(output) = replay {
            return Ok(NodeFlow::Done(output));
        }

        if let Err(e) = schema::validate(nested.input_schema(), &input, "workflow input") {
            self.with_state(|s| s.step_entry(&path).mark_failed(e.to_string()));
            return Ok(NodeFlow::Failed(e.to_string()));
        }

        self.with_state(|s| {
            let record = s.step_entry(&path);
            if record.status != StepStatus::Suspended {
                record.mark_running();
            } else {
                record.status = StepStatus::Running;
            }
            record.input = Some(input.clone());
        });
        self.emit(RunEvent::StepStart {
            path: path.clone(),
            input: input.clone(),
        });

        let flow = self
            .exec_sequence(
                nested.nodes().to_vec(),
                input,
                path.clone(),
                depth + 1,
                cancel,
            )
            .await?;

        match flow {
            NodeFlow::Done(output) => {
                match schema::validate(nested.output_schema(), &output, "workflow output") {
                    Ok(()) => {
                        self.with_state(|s| s.step_entry(&path).mark_success(output.clone()));
                        self.emit(RunEvent::StepResult {
                            path: path.clone(),
                            status: StepStatus::Success,
                            output: Some(output.clone()),
                            error: None,
                        });
                        self.emit(RunEvent::StepFinish { path });
                        Ok(NodeFlow::Done(output))
                    }
                    Err(e) => {
                        self.with_state(|s| s.step_entry(&path).mark_failed(e.to_string()));
                        self.emit(RunEvent::StepResult {
                            path,
                            status: StepStatus::Failed,
                            output: None,
                            error: Some(e.to_string()),
                        });
                        Ok(NodeFlow::Failed(e.to_string()))
                    }
                }
            }
            NodeFlow::Suspended(paths) => {
                self.with_state(|s| {
                    s.step_entry(&path).status = StepStatus::Suspended;
                });
                Ok(NodeFlow::Suspended(paths))
            }
            NodeFlow::Failed(error) => {
                self.with_state(|s| s.step_entry(&path).mark_failed(error.clone()));
                self.emit(RunEvent::StepResult {
                    path,
                    status: StepStatus::Failed,
                    output: None,
                    error: Some(error.clone()),
                });
                Ok(NodeFlow::Failed(error))
            }
        }
    }

    /// Execute a leaf step body (with record bookkeeping and events)
    async fn exec_leaf(
        &self,
        step: Arc<dyn Executable>,
        input: Value,
        path: StepPath,
        resume: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<NodeFlow> {
        self.with_state(|s| {
            s.suspended_paths.retain(|p| p != &path);
            if !s.active_paths.contains(&path) {
                s.active_paths.push(path.clone());
            }
            s.step_entry(&path).input = Some(input.clone());
        });
        self.emit(RunEvent::StepStart {
            path: path.clone(),
            input: input.clone(),
        });

        let outcome = self
            .run_leaf(step, input, &path, resume, cancel)
            .await?;
        self.finalize_leaf(&path, outcome).await
    }

    /// Invoke a step body with validation and retries; no record finalization
    async fn run_leaf(
        &self,
        step: Arc<dyn Executable>,
        input: Value,
        path: &[String],
        resume: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        if let Err(e) = schema::validate(step.input_schema(), &input, "step input") {
            return Ok(StepOutcome::Failed(e.to_string()));
        }

        let policy = step
            .retry_policy()
            .cloned()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let mut attempts = 0u32;

        loop {
            let run_count = self.with_state(|s| {
                let record = s.step_entry(path);
                record.mark_running();
                record.run_count
            });

            let ctx = StepContext {
                run_id: self.run_id(),
                input: input.clone(),
                resume_data: resume.clone(),
                run_count,
                runtime_context: self.runtime_context.clone(),
                registry: self.registry.clone(),
                cancellation: cancel.clone(),
                state: StateView::new(self.state.clone()),
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(StepOutcome::Failed(WorkflowError::Aborted.to_string()));
                }
                outcome = step.execute(ctx) => outcome,
            };

            match outcome {
                StepOutcome::Success(output) => {
                    // An output that violates the declared schema is a hard
                    // failure, never retried.
                    if let Err(e) = schema::validate(step.output_schema(), &output, "step output")
                    {
                        return Ok(StepOutcome::Failed(e.to_string()));
                    }
                    return Ok(StepOutcome::Success(output));
                }
                StepOutcome::Suspended(payload) => {
                    if let Some(suspend_schema) = step.suspend_schema() {
                        if let Err(e) =
                            schema::validate(suspend_schema, &payload, "suspend payload")
                        {
                            return Ok(StepOutcome::Failed(e.to_string()));
                        }
                    }
                    return Ok(StepOutcome::Suspended(payload));
                }
                StepOutcome::Failed(error) => {
                    attempts += 1;
                    if policy.should_retry(attempts) && !cancel.is_cancelled() {
                        let delay = policy.delay_for(attempts - 1);
                        warn!(
                            step = step.id(),
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(StepOutcome::Failed(error));
                }
            }
        }
    }

    /// Record a leaf outcome, emit events, persist on suspension
    async fn finalize_leaf(&self, path: &[String], outcome: StepOutcome) -> Result<NodeFlow> {
        match outcome {
            StepOutcome::Success(output) => {
                self.with_state(|s| {
                    s.step_entry(path).mark_success(output.clone());
                    s.active_paths.retain(|p| p != path);
                });
                self.emit(RunEvent::StepResult {
                    path: path.to_vec(),
                    status: StepStatus::Success,
                    output: Some(output.clone()),
                    error: None,
                });
                self.emit(RunEvent::StepFinish {
                    path: path.to_vec(),
                });
                Ok(NodeFlow::Done(output))
            }
            StepOutcome::Suspended(payload) => {
                self.with_state(|s| {
                    s.step_entry(path).mark_suspended(payload.clone());
                    s.active_paths.retain(|p| p != path);
                    if !s.is_suspended(path) {
                        s.suspended_paths.push(path.to_vec());
                    }
                    if s.active_paths.is_empty() {
                        s.status = RunStatus::Suspended;
                    }
                });
                self.persist().await?;
                self.emit(RunEvent::StepSuspended {
                    path: path.to_vec(),
                    payload,
                });
                Ok(NodeFlow::Suspended(vec![path.to_vec()]))
            }
            StepOutcome::Failed(error) => {
                self.with_state(|s| {
                    s.step_entry(path).mark_failed(error.clone());
                    s.active_paths.retain(|p| p != path);
                });
                self.emit(RunEvent::StepResult {
                    path: path.to_vec(),
                    status: StepStatus::Failed,
                    output: None,
                    error: Some(error.clone()),
                });
                Ok(NodeFlow::Failed(error))
            }
        }
    }

    /// Concurrent fan-out shared by `parallel` and matching `branch` arms
    async fn exec_fanout(
        &self,
        children: Vec<Arc<dyn Executable>>,
        input: Value,
        prefix: Vec<String>,
        depth: usize,
        cancel: CancellationToken,
        bypass_failures: bool,
    ) -> Result<NodeFlow> {
        let scope = cancel.child_token();
        let mut tasks = FuturesUnordered::new();

        for child in children {
            let child_id = child.id().to_string();
            let input = input.clone();
            let prefix = prefix.clone();
            let scope = scope.clone();
            tasks.push(async move {
                let flow = self.exec_step(child, input, prefix, depth, scope).await;
                (child_id, flow)
            });
        }

        let mut outputs = serde_json::Map::new();
        let mut suspended: Vec<StepPath> = Vec::new();
        let mut first_failure: Option<String> = None;

        while let Some((child_id, flow)) = tasks.next().await {
            match flow? {
                NodeFlow::Done(value) => {
                    outputs.insert(child_id, value);
                }
                NodeFlow::Suspended(paths) => suspended.extend(paths),
                NodeFlow::Failed(error) => {
                    if first_failure.is_none() {
                        first_failure = Some(error);
                        if !bypass_failures {
                            // Fail fast: cancel siblings, then await them.
                            scope.cancel();
                        }
                    }
                }
            }
        }

        if let Some(error) = first_failure {
            if !bypass_failures {
                return Ok(NodeFlow::Failed(error));
            }
        }
        if !suspended.is_empty() {
            return Ok(NodeFlow::Suspended(suspended));
        }
        Ok(NodeFlow::Done(Value::Object(outputs)))
    }

    /// Post-checked loop; the child always executes at least once
    #[allow(clippy::too_many_arguments)]
    async fn exec_loop(
        &self,
        child: Arc<dyn Executable>,
        kind: LoopKind,
        predicate: PredicateFn,
        input: Value,
        prefix: Vec<String>,
        depth: usize,
        cancel: CancellationToken,
    ) -> Result<NodeFlow> {
        let path = child_path(&prefix, child.id());

        // A loop that already completed replays its final output.
        let (completed, resume_input) = self.with_state(|s| match s.step(&path) {
            Some(r) if r.status == StepStatus::Success => (r.output.clone(), None),
            Some(r) if r.status == StepStatus::Suspended => (None, r.input.clone()),
            _ => (None, None),
        });
        if let Some(output) = completed {
            return Ok(NodeFlow::Done(output));
        }

        let mut current = resume_input.unwrap_or(input);
        loop {
            match self
                .exec_step(
                    child.clone(),
                    current.clone(),
                    prefix.clone(),
                    depth,
                    cancel.clone(),
                )
                .await?
            {
                NodeFlow::Done(output) => {
                    let again = match kind {
                        LoopKind::DoWhile => predicate(&output),
                        LoopKind::DoUntil => !predicate(&output),
                    };
                    if !again {
                        return Ok(NodeFlow::Done(output));
                    }
                    // Fresh iteration: forget the child subtree so it
                    // executes again instead of replaying.
                    self.with_state(|s| s.clear_subtree(&path));
                    current = output;
                }
                other => return Ok(other),
            }
        }
    }

    /// Bounded per-element iteration over an array input
    async fn exec_foreach(
        &self,
        child: Arc<dyn Executable>,
        concurrency: usize,
        input: Value,
        prefix: Vec<String>,
        depth: usize,
        cancel: CancellationToken,
    ) -> Result<NodeFlow> {
        let path = child_path(&prefix, child.id());

        let replay = self.with_state(|s| {
            s.step(&path)
                .filter(|r| r.status == StepStatus::Success)
                .and_then(|r| r.output.clone())
        });
        if let Some(output) = replay {
            return Ok(NodeFlow::Done(output));
        }

        let Value::Array(items) = input else {
            let error = format!("foreach over '{}' requires an array input", child.id());
            self.with_state(|s| s.step_entry(&path).mark_failed(error.clone()));
            return Ok(NodeFlow::Failed(error));
        };

        // Pick up partially completed elements from a previous suspension.
        let (mut slots, mut resume) = self.with_state(|s| {
            s.suspended_paths.retain(|p| p != &path);
            let record = s.step_entry(&path);
            let slots = record
                .elements
                .clone()
                .filter(|e| e.len() == items.len())
                .unwrap_or_else(|| vec![None; items.len()]);
            let resume = record.resume_payload.take();
            record.status = StepStatus::Running;
            record.input = Some(Value::Array(items.clone()));
            record.elements = Some(slots.clone());
            (slots, resume)
        });
        self.emit(RunEvent::StepStart {
            path: path.clone(),
            input: Value::Array(items.clone()),
        });

        let scope = cancel.child_token();
        let pending: Vec<(usize, Value)> = items
            .iter()
            .enumerate()
            .filter(|(i, _)| slots[*i].is_none())
            .map(|(i, item)| (i, item.clone()))
            .collect();

        let jobs = pending.into_iter().map(|(index, item)| {
            // Resume data goes to the first re-entered element.
            let resume_data = resume.take();
            let child = child.clone();
            let path = path.clone();
            let scope = scope.clone();
            async move {
                let outcome = self.run_leaf(child, item, &path, resume_data, scope).await;
                (index, outcome)
            }
        });

        let mut stream = futures::stream::iter(jobs).buffer_unordered(concurrency.max(1));
        let mut first_failure: Option<String> = None;
        let mut suspension: Option<Value> = None;

        while let Some((index, outcome)) = stream.next().await {
            match outcome? {
                StepOutcome::Success(value) => {
                    slots[index] = Some(value.clone());
                    self.with_state(|s| {
                        if let Some(elements) = s.step_entry(&path).elements.as_mut() {
                            elements[index] = Some(value);
                        }
                    });
                }
                StepOutcome::Suspended(payload) => {
                    // Path-local halt: in-flight siblings finish, no new
                    // elements start after the stream drains.
                    suspension = Some(payload);
                }
                StepOutcome::Failed(error) => {
                    if first_failure.is_none() {
                        first_failure = Some(error);
                        scope.cancel();
                    }
                }
            }
        }
        drop(stream);

        if let Some(error) = first_failure {
            self.with_state(|s| s.step_entry(&path).mark_failed(error.clone()));
            self.emit(RunEvent::StepResult {
                path: path.clone(),
                status: StepStatus::Failed,
                output: None,
                error: Some(error.clone()),
            });
            return Ok(NodeFlow::Failed(error));
        }

        if let Some(payload) = suspension {
            self.with_state(|s| {
                let record = s.step_entry(&path);
                record.mark_suspended(payload.clone());
                record.elements = Some(slots.clone());
                if !s.is_suspended(&path) {
                    s.suspended_paths.push(path.clone());
                }
                if s.active_paths.is_empty() {
                    s.status = RunStatus::Suspended;
                }
            });
            self.persist().await?;
            self.emit(RunEvent::StepSuspended {
                path: path.clone(),
                payload,
            });
            return Ok(NodeFlow::Suspended(vec![path]));
        }

        let output = Value::Array(slots.into_iter().flatten().collect());
        self.with_state(|s| {
            let record = s.step_entry(&path);
            record.mark_success(output.clone());
            record.elements = None;
        });
        self.emit(RunEvent::StepResult {
            path: path.clone(),
            status: StepStatus::Success,
            output: Some(output.clone()),
            error: None,
        });
        self.emit(RunEvent::StepFinish { path });
        Ok(NodeFlow::Done(output))
    }

    /// Pure transform; records a step entry for visibility but cannot suspend
    async fn exec_map(
        &self,
        id: &str,
        spec: &MapSpec,
        input: Value,
        prefix: Vec<String>,
    ) -> Result<NodeFlow> {
        let path = child_path(&prefix, id);

        let replay = self.with_state(|s| {
            s.step(&path)
                .filter(|r| r.status == StepStatus::Success)
                .and_then(|r| r.output.clone())
        });
        if let Some(output) = replay {
            return Ok(NodeFlow::Done(output));
        }

        self.emit(RunEvent::StepStart {
            path: path.clone(),
            input: input.clone(),
        });

        let (init, outputs) = self.with_state(|s| {
            let outputs: std::collections::HashMap<String, Value> = s
                .steps
                .iter()
                .filter_map(|(key, record)| {
                    record.output.clone().map(|output| (key.clone(), output))
                })
                .collect();
            (s.input.clone().unwrap_or(Value::Null), outputs)
        });

        let output = spec.apply(&input, &init, &|step_id| {
            if let Some(output) = outputs.get(step_id) {
                return Some(output.clone());
            }
            let suffix = format!(".{step_id}");
            outputs
                .iter()
                .find(|(key, _)| key.ends_with(&suffix))
                .map(|(_, output)| output.clone())
        });

        self.with_state(|s| {
            let record = s.step_entry(&path);
            record.mark_running();
            record.input = Some(input);
            record.mark_success(output.clone());
        });
        self.emit(RunEvent::StepResult {
            path: path.clone(),
            status: StepStatus::Success,
            output: Some(output.clone()),
            error: None,
        });
        self.emit(RunEvent::StepFinish { path });
        Ok(NodeFlow::Done(output))
    }

    /// Self-resuming timed suspension: persist the wake deadline, wait out
    /// the remainder, continue with the input passed through
    async fn exec_sleep(
        &self,
        id: &str,
        wake_at: DateTime<Utc>,
        input: Value,
        prefix: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<NodeFlow> {
        let path = child_path(&prefix, id);

        // Replay: the pause already elapsed in a previous pass.
        let (replay, recorded_wake) = self.with_state(|s| match s.step(&path) {
            Some(r) if r.status == StepStatus::Success => (r.output.clone(), None),
            Some(r) if r.status == StepStatus::Suspended => (None, r.wake_at),
            _ => (None, None),
        });
        if let Some(output) = replay {
            return Ok(NodeFlow::Done(output));
        }

        // A deadline recorded before a restart wins over re-resolving, so the
        // pause does not start over.
        let wake_at = recorded_wake.unwrap_or(wake_at);

        self.with_state(|s| {
            s.suspended_paths.retain(|p| p != &path);
            let record = s.step_entry(&path);
            record.mark_running();
            record.input = Some(input.clone());
            record.mark_suspended(json!({ "wake_at": wake_at.to_rfc3339() }));
            record.wake_at = Some(wake_at);
            if !s.is_suspended(&path) {
                s.suspended_paths.push(path.clone());
            }
            if s.active_paths.is_empty() {
                s.status = RunStatus::Suspended;
            }
        });
        self.persist().await?;
        self.emit(RunEvent::StepSuspended {
            path: path.clone(),
            payload: json!({ "wake_at": wake_at.to_rfc3339() }),
        });

        let remaining = (wake_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(step = id, remaining_ms = remaining.as_millis() as u64, "sleeping");

        tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(NodeFlow::Failed(WorkflowError::Aborted.to_string()));
            }
            _ = tokio::time::sleep(remaining) => {}
        }

        self.with_state(|s| {
            s.suspended_paths.retain(|p| p != &path);
            s.status = RunStatus::Running;
            s.step_entry(&path).mark_success(input.clone());
        });
        self.emit(RunEvent::StepResult {
            path: path.clone(),
            status: StepStatus::Success,
            output: Some(input.clone()),
            error: None,
        });
        self.emit(RunEvent::StepFinish { path });
        Ok(NodeFlow::Done(input))
    }

    /// Suspend the named step until an event for the run arrives, then run
    /// the step with the payload as its resume data
    async fn exec_wait(
        &self,
        event: &str,
        step: Arc<dyn Executable>,
        input: Value,
        prefix: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<NodeFlow> {
        let path = child_path(&prefix, step.id());

        let entry = self.leaf_entry(&path);
        let payload = match entry {
            LeafEntry::Replay(output) => return Ok(NodeFlow::Done(output)),
            // An explicit resume() stands in for the event after a restart.
            LeafEntry::Resume(data) => data,
            LeafEntry::StillSuspended => return Ok(NodeFlow::Suspended(vec![path])),
            LeafEntry::Fresh => {
                self.with_state(|s| {
                    let record = s.step_entry(&path);
                    record.input = Some(input.clone());
                    record.mark_suspended(json!({ "event": event }));
                    if !s.is_suspended(&path) {
                        s.suspended_paths.push(path.clone());
                    }
                });
                self.persist().await?;
                self.emit(RunEvent::StepSuspended {
                    path: path.clone(),
                    payload: json!({ "event": event }),
                });

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Ok(NodeFlow::Failed(WorkflowError::Aborted.to_string()));
                    }
                    payload = self.hub.wait(event) => payload,
                }
            }
        };

        if let Some(resume_schema) = step.resume_schema() {
            if let Err(e) = schema::validate(resume_schema, &payload, "event payload") {
                self.with_state(|s| {
                    s.suspended_paths.retain(|p| p != &path);
                    s.step_entry(&path).mark_failed(e.to_string());
                });
                return Ok(NodeFlow::Failed(e.to_string()));
            }
        }

        self.exec_leaf(step, input, path, Some(payload), cancel).await
    }
}

fn child_path(prefix: &[String], id: &str) -> StepPath {
    let mut path = prefix.to_vec();
    path.push(id.to_string());
    path
}

/// Run a workflow standalone, with in-memory persistence and no listeners.
///
/// Backs [`Executable::execute`] for workflows resolved from a registry
/// inside a step body; the engine's own nesting path never goes through here.
pub(crate) async fn execute_detached(workflow: Workflow, ctx: StepContext) -> StepOutcome {
    let run_id = format!("{}.{}", ctx.run_id(), workflow.id());
    let snapshot = RunSnapshot::new(run_id, workflow.id());
    let config = Arc::new(ExecutorConfig::default());

    let executor = Executor {
        workflow,
        store: Arc::new(InMemorySnapshotStore::new()),
        registry: ctx.registry.clone(),
        runtime_context: ctx.runtime_context.clone(),
        bus: EventBus::new(),
        hub: Arc::new(EventHub::new(config.buffer_events)),
        cancel: ctx.cancellation.clone(),
        config,
        state: Arc::new(Mutex::new(snapshot)),
    };

    match executor.start(ctx.input().clone()).await {
        Ok(result) => match result.status {
            RunStatus::Success => StepOutcome::Success(result.result.unwrap_or(Value::Null)),
            RunStatus::Suspended => StepOutcome::Suspended(json!({
                "suspended": result.suspended,
            })),
            _ => StepOutcome::Failed(
                result
                    .error
                    .unwrap_or_else(|| "workflow failed".to_string()),
            ),
        },
        Err(e) => StepOutcome::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_path_appends_segment() {
        let prefix = vec!["parent".to_string()];
        assert_eq!(
            child_path(&prefix, "step"),
            vec!["parent".to_string(), "step".to_string()]
        );
        assert_eq!(child_path(&[], "step"), vec!["step".to_string()]);
    }

    #[test]
    fn test_config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.default_retry.max_attempts, 1);
        assert_eq!(config.max_depth, 16);
        assert!(config.buffer_events);
    }
}
