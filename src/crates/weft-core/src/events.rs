//! Run events: the transition feed and the external event hub
//!
//! Two channels live here, one in each direction:
//!
//! - **Outbound** - the engine emits a [`RunEvent`] at every state
//!   transition. An [`EventBus`] fans them out to `watch` callbacks and
//!   `stream` consumers. Ordering is guaranteed per execution path; events
//!   from parallel paths interleave in an undefined order.
//! - **Inbound** - `send_event` delivers named payloads into the run through
//!   an [`EventHub`], resolving exactly one pending `wait_for_event`
//!   suspension per send. When no wait is pending the hub buffers a single
//!   payload per event name (latest wins), so a send racing ahead of the
//!   suspension point is not lost.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::{broadcast, oneshot};
use weft_snapshot::{RunId, RunStatus, StepPath, StepStatus};

/// A state transition observed during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunEvent {
    /// The run entered execution
    Start { run_id: RunId },

    /// A step began executing
    StepStart { path: StepPath, input: Value },

    /// A step halted its path, surfacing a payload
    StepSuspended { path: StepPath, payload: Value },

    /// A step reached success or failure
    StepResult {
        path: StepPath,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A step's path moved on
    StepFinish { path: StepPath },

    /// The run reached a terminal or suspended state; last event of the run
    Finish { run_id: RunId, status: RunStatus },
}

impl RunEvent {
    /// Whether this is the terminal event of a run
    pub fn is_finish(&self) -> bool {
        matches!(self, RunEvent::Finish { .. })
    }
}

/// Fan-out of run events to watchers and streams
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Emit an event; silently dropped when nobody is listening
    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    /// Raw receiver for stream consumers
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Invoke `callback` for every event until the run finishes or the
    /// subscription is dropped
    pub fn watch<F>(&self, callback: F) -> Subscription
    where
        F: Fn(RunEvent) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let finish = event.is_finish();
                        callback(event);
                        if finish {
                            break;
                        }
                    }
                    // A slow watcher that lagged keeps receiving from the
                    // oldest retained event.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle detaching a `watch` callback when dropped or unsubscribed
#[derive(Debug)]
pub struct Subscription {
    handle: tokio::task::JoinHandle<()>,
}

impl Subscription {
    /// Stop delivering events to the callback
    pub fn unsubscribe(self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Inbound named events for `wait_for_event` suspensions
///
/// One hub exists per run; event names are scoped to it.
pub struct EventHub {
    inner: Mutex<HubInner>,
    buffering: bool,
}

#[derive(Default)]
struct HubInner {
    waiters: HashMap<String, VecDeque<oneshot::Sender<Value>>>,
    buffered: HashMap<String, Value>,
}

impl EventHub {
    pub fn new(buffering: bool) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            buffering,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a payload to exactly one pending wait for `name`.
    ///
    /// Returns `true` when a pending wait consumed the payload. Otherwise the
    /// payload is buffered (single slot per name, latest wins) when buffering
    /// is on, or dropped when it is off.
    pub fn send(&self, name: &str, payload: Value) -> bool {
        let mut inner = self.lock();
        if let Some(queue) = inner.waiters.get_mut(name) {
            while let Some(tx) = queue.pop_front() {
                if tx.send(payload.clone()).is_ok() {
                    return true;
                }
            }
        }
        if self.buffering {
            inner.buffered.insert(name.to_string(), payload);
        }
        false
    }

    /// Wait for the next payload named `name`, consuming a buffered one first
    pub async fn wait(&self, name: &str) -> Value {
        let rx = {
            let mut inner = self.lock();
            if let Some(payload) = inner.buffered.remove(name) {
                return payload;
            }
            let (tx, rx) = oneshot::channel();
            inner
                .waiters
                .entry(name.to_string())
                .or_default()
                .push_back(tx);
            rx
        };
        rx.await.unwrap_or(Value::Null)
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("EventHub")
            .field("buffering", &self.buffering)
            .field("pending_waits", &inner.waiters.len())
            .field("buffered", &inner.buffered.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_watch_receives_until_finish() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let _sub = bus.watch(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Give the watcher task a chance to subscribe-poll.
        tokio::task::yield_now().await;

        bus.emit(RunEvent::Start {
            run_id: "r".to_string(),
        });
        bus.emit(RunEvent::Finish {
            run_id: "r".to_string(),
            status: RunStatus::Success,
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let sub = bus.watch(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;
        sub.unsubscribe();
        tokio::task::yield_now().await;

        bus.emit(RunEvent::Start {
            run_id: "r".to_string(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hub_resolves_pending_wait() {
        let hub = Arc::new(EventHub::new(true));
        let hub_clone = hub.clone();

        let waiter = tokio::spawn(async move { hub_clone.wait("approval").await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(hub.send("approval", json!({"ok": true})));
        assert_eq!(waiter.await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_hub_buffers_early_send() {
        let hub = EventHub::new(true);
        assert!(!hub.send("approval", json!({"n": 1})));
        // Latest wins in the single slot.
        assert!(!hub.send("approval", json!({"n": 2})));

        assert_eq!(hub.wait("approval").await, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_hub_drops_when_buffering_disabled() {
        let hub = Arc::new(EventHub::new(false));
        assert!(!hub.send("approval", json!({"n": 1})));

        // Nothing buffered: a later wait blocks until a fresh send.
        let hub_clone = hub.clone();
        let waiter = tokio::spawn(async move { hub_clone.wait("approval").await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        hub.send("approval", json!({"n": 2}));
        assert_eq!(waiter.await.unwrap(), json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_send_resolves_exactly_one_wait() {
        let hub = Arc::new(EventHub::new(true));

        let w1 = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.wait("go").await })
        };
        let w2 = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.wait("go").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        hub.send("go", json!(1));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let finished = [w1.is_finished(), w2.is_finished()];
        assert_eq!(finished.iter().filter(|f| **f).count(), 1);

        hub.send("go", json!(2));
        let (a, b) = (w1.await.unwrap(), w2.await.unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = RunEvent::StepResult {
            path: vec!["step-1".to_string()],
            status: StepStatus::Success,
            output: Some(json!({"ok": true})),
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step-result");
        assert_eq!(json["status"], "success");
        assert!(json.get("error").is_none());
    }
}
