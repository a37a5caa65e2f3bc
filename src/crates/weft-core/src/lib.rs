//! # weft-core - Durable Workflow Execution Engine
//!
//! **A graph-based state machine for typed units of work.** Workflows are
//! composed from steps through a fluent builder - sequencing, parallelism,
//! branching, loops, per-element iteration, data mapping, timed pauses, event
//! waits - committed into an immutable graph, and interpreted by an engine
//! that can suspend mid-run, persist its state as a snapshot, and resume
//! after arbitrary delays, process restarts, or external events.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐   commit()   ┌────────────────────┐
//! │  WorkflowBuilder   │ ───────────► │  Workflow (frozen) │
//! │  then/parallel/…   │              └─────────┬──────────┘
//! └────────────────────┘                        │ create_run(store)
//!                                               ▼
//!                       watch/stream  ┌────────────────────┐  save/load
//!        callers ◄────────────────────│  Run ── Executor   │────────────► SnapshotStore
//!                 start/resume/       └────────────────────┘              (weft-snapshot)
//!                 send_event/cancel
//! ```
//!
//! - **Steps** ([`StepDefinition`]) declare schemas and an async body
//!   returning [`StepOutcome`]: `Success | Suspended | Failed` - suspension
//!   is a normal alternate exit, not an error.
//! - **The builder** ([`WorkflowBuilder`]) validates at `commit()`:
//!   duplicate ids and schema-incompatible `then()` links are build-time
//!   errors. `commit()` is idempotent.
//! - **The engine** drives `pending → running → {success, failed,
//!   suspended}` per step; a suspended path halts alone, sibling parallel
//!   paths keep going, and the snapshot is persisted at every suspension and
//!   terminal state. Resume replays recorded outputs instead of re-executing
//!   finished steps.
//! - **Workflows nest as steps**: a committed [`Workflow`] implements
//!   [`Executable`], so composition is uniform and suspended steps inside a
//!   nested workflow are addressed by path (`["child", "step"]`).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use weft_core::{StepDefinition, StepOutcome, WorkflowBuilder};
//! use weft_snapshot::InMemorySnapshotStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let number = json!({"type": "object",
//!                         "properties": {"value": {"type": "number"}},
//!                         "required": ["value"]});
//!
//!     let double = StepDefinition::new("double", number.clone(), number.clone(), |ctx| async move {
//!         let v = ctx.input()["value"].as_f64().unwrap_or(0.0);
//!         StepOutcome::Success(json!({"value": v * 2.0}))
//!     });
//!
//!     let workflow = WorkflowBuilder::new("doubler", number.clone(), number)
//!         .then(double)
//!         .commit()?;
//!
//!     let run = workflow.create_run(Arc::new(InMemorySnapshotStore::new()));
//!     let result = run.start(json!({"value": 21})).await?;
//!     assert_eq!(result.result, Some(json!({"value": 42.0})));
//!     Ok(())
//! }
//! ```
//!
//! Suspend/resume, event waits, and the event stream are covered in the
//! [`run`] and [`events`] module docs.

pub mod builder;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod node;
pub mod registry;
pub mod result;
pub mod retry;
pub mod run;
pub mod schema;
pub mod step;

pub use builder::{
    ForeachOptions, IntoExecutable, ParallelOptions, Workflow, WorkflowBuilder,
};
pub use context::RuntimeContext;
pub use error::{Result, WorkflowError};
pub use events::{EventBus, RunEvent, Subscription};
pub use executor::ExecutorConfig;
pub use node::{BranchArm, FieldMapping, LoopKind, MapSource, MapSpec};
pub use registry::Registry;
pub use result::{StepResult, WorkflowResult};
pub use retry::RetryPolicy;
pub use run::{ResumeOptions, Run, RunStream};
pub use step::{Executable, StepContext, StepDefinition, StepOutcome};

// Snapshot types surface through the same crate for convenience.
pub use weft_snapshot::{RunId, RunSnapshot, RunStatus, StepPath, StepStatus};
