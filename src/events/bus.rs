//! Agent event bus
//!
//! In-process pub/sub for agent run events. `emit` stamps each event with a
//! per-run sequence number and hands it to every current subscriber
//! synchronously, in emission order. The bus also keeps the run contexts
//! used to abort a run by id or by session key.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::Clock;

/// Stream an agent event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStream {
    Lifecycle,
    Assistant,
    Tool,
    Error,
}

/// Event published by a running agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    /// Per-run sequence number, starting at 1
    pub seq: u64,
    pub stream: EventStream,
    /// Unix milliseconds
    pub ts: u64,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Registered agent run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub session_key: Option<String>,
    pub cancel: CancellationToken,
}

type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

#[derive(Default)]
struct BusState {
    seqs: HashMap<String, u64>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
    runs: HashMap<String, RunContext>,
    session_runs: HashMap<String, String>,
}

struct Inner {
    state: Mutex<BusState>,
    clock: Arc<dyn Clock>,
}

/// Handle to the agent event bus. Clones share the same state.
#[derive(Clone)]
pub struct AgentEventBus {
    inner: Arc<Inner>,
}

impl AgentEventBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        AgentEventBus {
            inner: Arc::new(Inner {
                state: Mutex::new(BusState::default()),
                clock,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Publish an event and return it with its assigned sequence number.
    ///
    /// Listeners run on the caller's task; a panicking listener is logged
    /// and does not affect the others.
    pub fn emit(&self, run_id: &str, stream: EventStream, data: Value) -> AgentEvent {
        let (event, listeners) = {
            let mut state = self.state();
            let session_key = state.runs.get(run_id).and_then(|r| r.session_key.clone());
            let seq = state.seqs.entry(run_id.to_string()).or_insert(0);
            *seq += 1;
            let seq = *seq;
            let event = AgentEvent {
                run_id: run_id.to_string(),
                seq,
                stream,
                ts: self.inner.clock.now_ms(),
                data,
                session_key,
            };
            let listeners: Vec<Listener> = state.listeners.iter().map(|(_, l)| l.clone()).collect();
            (event, listeners)
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(run_id = %event.run_id, seq = event.seq, "agent event listener panicked");
            }
        }
        event
    }

    /// Subscribe to every future event
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let mut state = self.state();
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.push((id, Arc::new(listener)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    /// Register a run. The latest registration for a session key wins.
    pub fn register_run(&self, run_id: &str, session_key: Option<&str>) -> RunContext {
        let mut state = self.state();
        insert_run(&mut state, run_id, session_key)
    }

    /// Register a run unless one with the same id is still active. The
    /// check and the insert happen under one lock.
    pub fn try_register_run(&self, run_id: &str, session_key: Option<&str>) -> Option<RunContext> {
        let mut state = self.state();
        if state.runs.contains_key(run_id) {
            return None;
        }
        Some(insert_run(&mut state, run_id, session_key))
    }

    pub fn run_context(&self, run_id: &str) -> Option<RunContext> {
        self.state().runs.get(run_id).cloned()
    }

    /// Current run for a session key
    pub fn run_for_session(&self, session_key: &str) -> Option<String> {
        self.state().session_runs.get(session_key).cloned()
    }

    /// Forget a finished run. The session index is only cleared if it still
    /// points at this run.
    pub fn clear_run(&self, run_id: &str) {
        let mut state = self.state();
        state.seqs.remove(run_id);
        if let Some(context) = state.runs.remove(run_id) {
            if let Some(key) = context.session_key {
                if state.session_runs.get(&key).map(String::as_str) == Some(run_id) {
                    state.session_runs.remove(&key);
                }
            }
        }
    }

    /// Cancel a run. Returns false if the run is unknown or already finished;
    /// aborting twice is not an error.
    pub fn abort_run(&self, run_id: &str) -> bool {
        let Some(context) = self.run_context(run_id) else {
            return false;
        };
        let first = !context.cancel.is_cancelled();
        context.cancel.cancel();
        if first {
            info!(run_id = %run_id, "agent run aborted");
        }
        true
    }

    /// Cancel the most recent run registered for a session key
    pub fn abort_session(&self, session_key: &str) -> Option<String> {
        let run_id = self.run_for_session(session_key)?;
        self.abort_run(&run_id).then_some(run_id)
    }

    /// Wipe all runs, counters and listeners
    pub fn reset(&self) {
        *self.state() = BusState::default();
    }

    /// Trace every event at debug level
    pub fn log_events(&self) -> Subscription {
        self.subscribe(|event| {
            debug!(
                run_id = %event.run_id,
                seq = event.seq,
                stream = ?event.stream,
                session_key = event.session_key.as_deref().unwrap_or(""),
                "agent event"
            );
        })
    }
}

fn insert_run(state: &mut BusState, run_id: &str, session_key: Option<&str>) -> RunContext {
    let context = RunContext {
        run_id: run_id.to_string(),
        session_key: session_key.map(str::to_string),
        cancel: CancellationToken::new(),
    };
    if let Some(key) = session_key {
        state.session_runs.insert(key.to_string(), run_id.to_string());
    }
    state.runs.insert(run_id.to_string(), context.clone());
    context
}

/// Listener registration; dropping it does not unsubscribe
#[must_use = "keep the subscription to unsubscribe later"]
pub struct Subscription {
    bus: std::sync::Weak<Inner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
            state.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;

    fn bus() -> AgentEventBus {
        AgentEventBus::new(Arc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn test_seq_is_per_run() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push((e.run_id.clone(), e.seq)));

        for run in ["A", "A", "B", "A"] {
            bus.emit(run, EventStream::Assistant, Value::Null);
        }

        let seen = seen.lock().unwrap();
        let seqs: Vec<u64> = seen.iter().map(|(_, s)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 1, 3]);
        assert_eq!(seen[2].0, "B");
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = bus();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let sub = bus.subscribe(move |_| *c.lock().unwrap() += 1);

        bus.emit("r", EventStream::Lifecycle, Value::Null);
        sub.unsubscribe();
        bus.emit("r", EventStream::Lifecycle, Value::Null);

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_break_others() {
        let bus = bus();
        let _bad = bus.subscribe(|_| panic!("boom"));
        let got = Arc::new(Mutex::new(0));
        let g = got.clone();
        let _good = bus.subscribe(move |_| *g.lock().unwrap() += 1);

        let event = bus.emit("r", EventStream::Tool, Value::Null);
        assert_eq!(event.seq, 1);
        assert_eq!(*got.lock().unwrap(), 1);
    }

    #[test]
    fn test_events_carry_session_key() {
        let bus = bus();
        bus.register_run("run-1", Some("agent:main:telegram:default:42"));
        let event = bus.emit("run-1", EventStream::Lifecycle, serde_json::json!({ "phase": "start" }));
        assert_eq!(event.session_key.as_deref(), Some("agent:main:telegram:default:42"));
        assert_eq!(event.ts, 1_000);
    }

    #[test]
    fn test_latest_registration_wins_for_session() {
        let bus = bus();
        let first = bus.register_run("run-1", Some("s"));
        let second = bus.register_run("run-2", Some("s"));

        assert_eq!(bus.abort_session("s").as_deref(), Some("run-2"));
        assert!(second.cancel.is_cancelled());
        assert!(!first.cancel.is_cancelled());

        // Clearing the older run leaves the newer mapping alone
        bus.clear_run("run-1");
        assert_eq!(bus.run_for_session("s").as_deref(), Some("run-2"));
        bus.clear_run("run-2");
        assert_eq!(bus.run_for_session("s"), None);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let bus = bus();
        let ctx = bus.register_run("run-1", None);
        assert!(bus.abort_run("run-1"));
        assert!(bus.abort_run("run-1"));
        assert!(ctx.cancel.is_cancelled());

        bus.clear_run("run-1");
        assert!(!bus.abort_run("run-1"));
        assert_eq!(bus.abort_session("nobody"), None);
    }

    #[test]
    fn test_try_register_refuses_active_run_id() {
        let bus = Arc::new(bus());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || bus.try_register_run("run-1", Some("s")).is_some())
            })
            .collect();
        let winners: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(winners.iter().filter(|won| **won).count(), 1);

        bus.clear_run("run-1");
        assert!(bus.try_register_run("run-1", Some("s")).is_some());
    }

    #[test]
    fn test_reset_wipes_state() {
        let bus = bus();
        let _sub = bus.subscribe(|_| {});
        bus.register_run("run-1", Some("s"));
        bus.emit("run-1", EventStream::Assistant, Value::Null);

        bus.reset();
        assert_eq!(bus.listener_count(), 0);
        assert!(bus.run_context("run-1").is_none());
        assert_eq!(bus.emit("run-1", EventStream::Assistant, Value::Null).seq, 1);
    }
}
