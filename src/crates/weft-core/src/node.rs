//! Graph nodes: the compiled shape of a workflow
//!
//! A committed workflow is a tree of [`FlowNode`]s. Leaf nodes reference
//! [`Executable`]s (steps or nested workflows); composite nodes own their
//! children. The builder produces these, the executor interprets them -
//! nothing here executes anything.
//!
//! Context-dependent values (sleep durations, deadlines) follow the
//! `Static | Dynamic` shape: either a fixed value or a function of the node's
//! input, resolved once at the point of use.

use crate::step::Executable;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Predicate over a node's data, used by `branch` and the loop forms
pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Pure transform used by `map` nodes; suspension is impossible here
pub type MapFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Duration as a function of the node's input
pub type DurationFn = Arc<dyn Fn(&Value) -> Duration + Send + Sync>;

/// Absolute deadline as a function of the node's input
pub type DeadlineFn = Arc<dyn Fn(&Value) -> DateTime<Utc> + Send + Sync>;

/// How long a `sleep` node pauses
#[derive(Clone)]
pub enum SleepDuration {
    Static(Duration),
    Dynamic(DurationFn),
}

impl SleepDuration {
    pub fn resolve(&self, input: &Value) -> Duration {
        match self {
            SleepDuration::Static(d) => *d,
            SleepDuration::Dynamic(f) => f(input),
        }
    }
}

/// When a `sleep_until` node wakes
#[derive(Clone)]
pub enum SleepDeadline {
    Static(DateTime<Utc>),
    Dynamic(DeadlineFn),
}

impl SleepDeadline {
    pub fn resolve(&self, input: &Value) -> DateTime<Utc> {
        match self {
            SleepDeadline::Static(t) => *t,
            SleepDeadline::Dynamic(f) => f(input),
        }
    }
}

/// One arm of a `branch` node
#[derive(Clone)]
pub struct BranchArm {
    /// Evaluated in declaration order against the branch input
    pub predicate: PredicateFn,
    /// Executed (concurrently with other matching arms) when the predicate holds
    pub step: Arc<dyn Executable>,
}

/// Loop form: both check the predicate after each execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// Continue while the predicate is true
    DoWhile,
    /// Continue until the predicate is true
    DoUntil,
}

/// Source of one mapped field in a declarative `map`
#[derive(Clone)]
pub enum MapSource {
    /// A constant value
    Constant(Value),
    /// Dotted path into the previous node's output
    Path(String),
    /// Dotted path into the run's initial input
    InitPath(String),
    /// Another step's recorded output, optionally narrowed by a dotted path
    StepOutput {
        step: String,
        path: Option<String>,
    },
}

/// Target field and where its value comes from
#[derive(Clone)]
pub struct FieldMapping {
    pub target: String,
    pub source: MapSource,
}

/// Transform applied by a `map` node
#[derive(Clone)]
pub enum MapSpec {
    /// Arbitrary pure function of the previous output
    Transform(MapFn),
    /// Declarative field mapping
    Fields(Vec<FieldMapping>),
}

impl MapSpec {
    /// Apply the transform. `init` is the run's initial input; `step_output`
    /// resolves a step id to its recorded output.
    pub fn apply(
        &self,
        input: &Value,
        init: &Value,
        step_output: &dyn Fn(&str) -> Option<Value>,
    ) -> Value {
        match self {
            MapSpec::Transform(f) => f(input),
            MapSpec::Fields(fields) => {
                let mut out = serde_json::Map::new();
                for field in fields {
                    let value = match &field.source {
                        MapSource::Constant(v) => Some(v.clone()),
                        MapSource::Path(path) => lookup_path(input, path).cloned(),
                        MapSource::InitPath(path) => lookup_path(init, path).cloned(),
                        MapSource::StepOutput { step, path } => {
                            step_output(step).and_then(|output| match path {
                                Some(p) => lookup_path(&output, p).cloned(),
                                None => Some(output),
                            })
                        }
                    };
                    out.insert(field.target.clone(), value.unwrap_or(Value::Null));
                }
                Value::Object(out)
            }
        }
    }
}

/// Resolve a dotted path (`"a.b.c"`) inside a JSON value
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// One node of a committed workflow graph
#[derive(Clone)]
pub enum FlowNode {
    /// A leaf step (or nested workflow, through the executable seam)
    Step(Arc<dyn Executable>),

    /// Children executed in order, each output feeding the next input
    Sequence(Vec<FlowNode>),

    /// All children receive the same input; output maps child id to output
    Parallel {
        children: Vec<Arc<dyn Executable>>,
        /// Record child failures without failing the composite
        bypass_failures: bool,
    },

    /// Predicates evaluated in order; every matching arm runs concurrently
    Branch { arms: Vec<BranchArm> },

    /// Post-checked loop around one child; always executes at least once
    Loop {
        child: Arc<dyn Executable>,
        kind: LoopKind,
        predicate: PredicateFn,
    },

    /// One execution per input-array element, bounded by `concurrency`
    Foreach {
        child: Arc<dyn Executable>,
        concurrency: usize,
    },

    /// Pure data transform; cannot suspend
    Map { id: String, spec: MapSpec },

    /// Self-resuming timed suspension for a relative duration
    Sleep { id: String, duration: SleepDuration },

    /// Self-resuming timed suspension until an absolute deadline
    SleepUntil { id: String, deadline: SleepDeadline },

    /// Suspend `step` until an event with this name arrives for the run
    WaitForEvent {
        event: String,
        step: Arc<dyn Executable>,
    },
}

impl FlowNode {
    /// Ids of the step records this node will create, for duplicate detection
    pub fn step_ids(&self) -> Vec<String> {
        match self {
            FlowNode::Step(step) => vec![step.id().to_string()],
            FlowNode::Sequence(children) => {
                children.iter().flat_map(|n| n.step_ids()).collect()
            }
            FlowNode::Parallel { children, .. } => {
                children.iter().map(|c| c.id().to_string()).collect()
            }
            FlowNode::Branch { arms } => {
                arms.iter().map(|a| a.step.id().to_string()).collect()
            }
            FlowNode::Loop { child, .. } | FlowNode::Foreach { child, .. } => {
                vec![child.id().to_string()]
            }
            FlowNode::Map { id, .. }
            | FlowNode::Sleep { id, .. }
            | FlowNode::SleepUntil { id, .. } => vec![id.clone()],
            FlowNode::WaitForEvent { step, .. } => vec![step.id().to_string()],
        }
    }
}

impl std::fmt::Debug for FlowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowNode::Step(step) => f.debug_tuple("Step").field(&step.id()).finish(),
            FlowNode::Sequence(children) => {
                f.debug_tuple("Sequence").field(&children.len()).finish()
            }
            FlowNode::Parallel {
                children,
                bypass_failures,
            } => f
                .debug_struct("Parallel")
                .field(
                    "children",
                    &children.iter().map(|c| c.id()).collect::<Vec<_>>(),
                )
                .field("bypass_failures", bypass_failures)
                .finish(),
            FlowNode::Branch { arms } => f
                .debug_struct("Branch")
                .field("arms", &arms.iter().map(|a| a.step.id()).collect::<Vec<_>>())
                .finish(),
            FlowNode::Loop { child, kind, .. } => f
                .debug_struct("Loop")
                .field("child", &child.id())
                .field("kind", kind)
                .field("predicate", &"<fn>")
                .finish(),
            FlowNode::Foreach { child, concurrency } => f
                .debug_struct("Foreach")
                .field("child", &child.id())
                .field("concurrency", concurrency)
                .finish(),
            FlowNode::Map { id, .. } => f.debug_tuple("Map").field(id).finish(),
            FlowNode::Sleep { id, .. } => f.debug_tuple("Sleep").field(id).finish(),
            FlowNode::SleepUntil { id, .. } => f.debug_tuple("SleepUntil").field(id).finish(),
            FlowNode::WaitForEvent { event, step } => f
                .debug_struct("WaitForEvent")
                .field("event", event)
                .field("step", &step.id())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_path() {
        let value = json!({"a": {"b": {"c": 42}}});
        assert_eq!(lookup_path(&value, "a.b.c"), Some(&json!(42)));
        assert_eq!(lookup_path(&value, "a.b"), Some(&json!({"c": 42})));
        assert!(lookup_path(&value, "a.x").is_none());
    }

    #[test]
    fn test_map_spec_fields() {
        let spec = MapSpec::Fields(vec![
            FieldMapping {
                target: "doubled".to_string(),
                source: MapSource::Path("value".to_string()),
            },
            FieldMapping {
                target: "label".to_string(),
                source: MapSource::Constant(json!("fixed")),
            },
            FieldMapping {
                target: "seed".to_string(),
                source: MapSource::InitPath("seed".to_string()),
            },
            FieldMapping {
                target: "fetched".to_string(),
                source: MapSource::StepOutput {
                    step: "fetch".to_string(),
                    path: Some("rows".to_string()),
                },
            },
        ]);

        let out = spec.apply(&json!({"value": 6}), &json!({"seed": 9}), &|id| {
            (id == "fetch").then(|| json!({"rows": 3}))
        });

        assert_eq!(
            out,
            json!({"doubled": 6, "label": "fixed", "seed": 9, "fetched": 3})
        );
    }

    #[test]
    fn test_map_spec_missing_source_is_null() {
        let spec = MapSpec::Fields(vec![FieldMapping {
            target: "missing".to_string(),
            source: MapSource::Path("nope".to_string()),
        }]);

        let out = spec.apply(&json!({}), &json!({}), &|_| None);
        assert_eq!(out, json!({"missing": null}));
    }

    #[test]
    fn test_sleep_duration_resolution() {
        let fixed = SleepDuration::Static(Duration::from_millis(10));
        assert_eq!(fixed.resolve(&json!({})), Duration::from_millis(10));

        let dynamic = SleepDuration::Dynamic(Arc::new(|input| {
            Duration::from_millis(input["ms"].as_u64().unwrap_or(0))
        }));
        assert_eq!(dynamic.resolve(&json!({"ms": 25})), Duration::from_millis(25));
    }
}
