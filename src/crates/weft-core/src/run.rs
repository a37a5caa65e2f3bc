//! The run handle: caller-facing façade over the engine
//!
//! A [`Run`] ties one execution of a workflow to a snapshot store and exposes
//! the full per-run surface:
//!
//! - [`start`](Run::start) / [`resume`](Run::resume) - drive the engine to
//!   `success`/`failed`/`suspended` and **resolve** with a
//!   [`WorkflowResult`]. User-code failures come back as `Ok` with
//!   `status: failed`; programmer errors (unknown run, unknown step,
//!   conflicting writer, invalid resume data) and persistence failures are
//!   `Err`.
//! - [`watch`](Run::watch) - callback per transition event, detachable.
//! - [`stream`](Run::stream) - the same events as a lazy, finite,
//!   non-restartable stream ending at the run's terminal event.
//! - [`send_event`](Run::send_event) - resolve a pending `wait_for_event`.
//! - [`cancel`](Run::cancel) - trip the run's cooperative abort signal.
//!
//! # Suspend and resume
//!
//! ```rust,ignore
//! let run = workflow.create_run(store.clone());
//! let paused = run.start(json!({})).await?;
//! assert!(paused.is_suspended());
//!
//! // Possibly in a fresh process: same run id, same store.
//! let run = workflow.create_run(store).with_run_id(paused_run_id);
//! let done = run
//!     .resume(ResumeOptions::step("step-1", json!({"city": "Berlin"})))
//!     .await?;
//! assert!(done.is_success());
//! ```
//!
//! # Single-writer discipline
//!
//! The engine persists the snapshot in `running` status the moment a
//! start/resume begins. A second resume that loads a `running` snapshot fails
//! with [`WorkflowError::Conflict`] instead of racing the first writer; calls
//! on one handle are additionally serialized by an internal gate.

use crate::builder::Workflow;
use crate::context::RuntimeContext;
use crate::error::{Result, WorkflowError};
use crate::events::{EventBus, EventHub, RunEvent, Subscription};
use crate::executor::{Executor, ExecutorConfig};
use crate::registry::Registry;
use crate::result::WorkflowResult;
use crate::schema;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_snapshot::{RunId, RunSnapshot, RunStatus, SnapshotStore, StepPath};

/// What to resume and with which data
#[derive(Debug, Clone)]
pub struct ResumeOptions {
    /// Suspended step, as a bare id or a nested path
    pub step: StepPath,
    /// Data for the step's resume channel, validated against its resume schema
    pub resume_data: Value,
}

impl ResumeOptions {
    /// Target a suspended step by id (matched against the last path segment)
    pub fn step(id: impl Into<String>, resume_data: Value) -> Self {
        Self {
            step: vec![id.into()],
            resume_data,
        }
    }

    /// Target a suspended step by full path, outermost workflow first
    pub fn path(step: StepPath, resume_data: Value) -> Self {
        Self { step, resume_data }
    }
}

impl Workflow {
    /// Create a run of this workflow against a snapshot store
    pub fn create_run(&self, store: Arc<dyn SnapshotStore>) -> Run {
        Run::new(self.clone(), store)
    }
}

/// One execution of a workflow: start, resume, observe, cancel
#[derive(Clone)]
pub struct Run {
    workflow: Workflow,
    store: Arc<dyn SnapshotStore>,
    registry: Arc<Registry>,
    runtime_context: RuntimeContext,
    config: Arc<ExecutorConfig>,
    run_id: RunId,
    bus: EventBus,
    hub: Arc<EventHub>,
    cancel: CancellationToken,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Run {
    pub fn new(workflow: Workflow, store: Arc<dyn SnapshotStore>) -> Self {
        let config = Arc::new(ExecutorConfig::default());
        Self {
            workflow,
            store,
            registry: Arc::new(Registry::new()),
            runtime_context: RuntimeContext::new(),
            hub: Arc::new(EventHub::new(config.buffer_events)),
            config,
            run_id: Uuid::new_v4().to_string(),
            bus: EventBus::new(),
            cancel: CancellationToken::new(),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Use a caller-chosen run id (required to resume across processes)
    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Attach a registry resolving sibling workflows/steps by id
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Attach the read-only key-value bag steps see
    pub fn with_runtime_context(mut self, runtime_context: RuntimeContext) -> Self {
        self.runtime_context = runtime_context;
        self
    }

    /// Override engine settings for this run
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.hub = Arc::new(EventHub::new(config.buffer_events));
        self.config = Arc::new(config);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    fn executor_with(&self, snapshot: RunSnapshot) -> Executor {
        Executor {
            workflow: self.workflow.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            runtime_context: self.runtime_context.clone(),
            bus: self.bus.clone(),
            hub: self.hub.clone(),
            cancel: self.cancel.clone(),
            config: self.config.clone(),
            state: Arc::new(Mutex::new(snapshot)),
        }
    }

    /// Drive the run from its initial input to a terminal or suspended state
    pub async fn start(&self, input: Value) -> Result<WorkflowResult> {
        let _gate = self.gate.lock().await;

        if self.store.load(&self.run_id).await?.is_some() {
            return Err(WorkflowError::Conflict(format!(
                "run '{}' was already started; resume it instead",
                self.run_id
            )));
        }

        let snapshot = RunSnapshot::new(self.run_id.clone(), self.workflow.id());
        self.executor_with(snapshot).start(input).await
    }

    /// Re-enter a suspended run at the given step with resume data
    pub async fn resume(&self, options: ResumeOptions) -> Result<WorkflowResult> {
        let _gate = self.gate.lock().await;

        let mut snapshot = self
            .store
            .load(&self.run_id)
            .await?
            .ok_or_else(|| WorkflowError::UnknownRun(self.run_id.clone()))?;

        if snapshot.status == RunStatus::Running {
            return Err(WorkflowError::Conflict(format!(
                "run '{}' is already being driven by another writer",
                self.run_id
            )));
        }
        if snapshot.status != RunStatus::Suspended {
            return Err(WorkflowError::Conflict(format!(
                "run '{}' is {:?}, not suspended",
                self.run_id, snapshot.status
            )));
        }

        let target = resolve_target(&snapshot.suspended_paths, &options.step)
            .ok_or_else(|| WorkflowError::UnknownStep(options.step.join(".")))?;

        match self.workflow.find_executable(&target) {
            Some(step) => {
                if let Some(resume_schema) = step.resume_schema() {
                    schema::validate(resume_schema, &options.resume_data, "resume data")?;
                }
                snapshot.step_entry(&target).resume_payload = Some(options.resume_data);
            }
            None => {
                // Timed pauses carry no executable; resuming one after a
                // restart just re-drives the run, which waits out whatever
                // remains of the recorded deadline.
                let timed = snapshot
                    .step(&target)
                    .map(|r| r.wake_at.is_some())
                    .unwrap_or(false);
                if !timed {
                    return Err(WorkflowError::UnknownStep(target.join(".")));
                }
            }
        }

        self.executor_with(snapshot).resume().await
    }

    /// Invoke `callback` for every transition event of this run
    ///
    /// Ordering is guaranteed per execution path; events from parallel paths
    /// interleave in an undefined order. Dropping the returned subscription
    /// (or calling `unsubscribe`) detaches the callback.
    pub fn watch<F>(&self, callback: F) -> Subscription
    where
        F: Fn(RunEvent) + Send + Sync + 'static,
    {
        self.bus.watch(callback)
    }

    /// Start the run and observe its events as a finite stream
    ///
    /// The stream yields every transition event and ends after the terminal
    /// `finish` event; it is not restartable. The final result is available
    /// from [`RunStream::result`].
    pub fn stream(&self, input: Value) -> RunStream {
        let events = BroadcastStream::new(self.bus.subscribe());
        let run = self.clone();
        let handle = tokio::spawn(async move { run.start(input).await });
        RunStream {
            events,
            handle,
            done: false,
        }
    }

    /// Deliver a named event payload to this run
    ///
    /// Resolves exactly one pending `wait_for_event` suspension. With none
    /// pending the payload is buffered (one slot per name, latest wins) when
    /// event buffering is on. Returns `true` when a pending wait consumed the
    /// payload immediately.
    pub fn send_event(&self, name: &str, payload: Value) -> bool {
        self.hub.send(name, payload)
    }

    /// Trip the run's cancellation token
    ///
    /// Cancellation is cooperative: the engine stops scheduling nodes and
    /// step bodies observe the token through their context; nothing is
    /// forcibly terminated.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The run's cancellation token, for wiring into external abort signals
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Read-only view of the latest persisted snapshot
    pub async fn get_state(&self) -> Result<Option<RunSnapshot>> {
        Ok(self.store.load(&self.run_id).await?)
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("run_id", &self.run_id)
            .field("workflow", &self.workflow.id())
            .finish()
    }
}

/// Match a resume target against the suspended paths of a snapshot
///
/// A single segment matches any suspended path ending in that id; longer
/// targets must match a full path exactly.
fn resolve_target(suspended: &[StepPath], step: &[String]) -> Option<StepPath> {
    if step.is_empty() {
        return None;
    }
    if step.len() == 1 {
        return suspended
            .iter()
            .find(|path| path.last() == step.first())
            .cloned();
    }
    suspended.iter().find(|path| path.as_slice() == step).cloned()
}

/// Finite stream of one run's events, ending at the terminal event
pub struct RunStream {
    events: BroadcastStream<RunEvent>,
    handle: tokio::task::JoinHandle<Result<WorkflowResult>>,
    done: bool,
}

impl RunStream {
    /// Await the run's final result, discarding any unread events
    pub async fn result(self) -> Result<WorkflowResult> {
        self.handle
            .await
            .map_err(|e| WorkflowError::Conflict(format!("run task failed: {e}")))?
    }
}

impl Stream for RunStream {
    type Item = RunEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match Pin::new(&mut this.events).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if event.is_finish() {
                        this.done = true;
                    }
                    return Poll::Ready(Some(event));
                }
                // A lagged stream consumer skips to the oldest retained
                // event rather than erroring out.
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for RunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStream").field("done", &self.done).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> StepPath {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_target_by_id_matches_last_segment() {
        let suspended = vec![path(&["child", "approve"]), path(&["other"])];

        assert_eq!(
            resolve_target(&suspended, &path(&["approve"])),
            Some(path(&["child", "approve"]))
        );
        assert_eq!(
            resolve_target(&suspended, &path(&["other"])),
            Some(path(&["other"]))
        );
        assert!(resolve_target(&suspended, &path(&["missing"])).is_none());
    }

    #[test]
    fn test_resolve_target_by_full_path() {
        let suspended = vec![path(&["child", "approve"])];

        assert_eq!(
            resolve_target(&suspended, &path(&["child", "approve"])),
            Some(path(&["child", "approve"]))
        );
        assert!(resolve_target(&suspended, &path(&["wrong", "approve"])).is_none());
        assert!(resolve_target(&suspended, &[]).is_none());
    }
}
