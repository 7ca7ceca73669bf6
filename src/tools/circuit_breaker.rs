//! Per-tool circuit breaker
//!
//! [`CircuitBreaker`] is a pure state machine: every method takes the
//! current time as an argument, so a sequence of `(outcome, timestamp)`
//! inputs always produces the same transitions. [`CircuitBreakerRegistry`]
//! owns one breaker per tool name and supplies the clock.
//!
//! - Closed: every call allowed. Opens on `consecutive_failure_threshold`
//!   consecutive failures, or once the rolling window holds at least
//!   `minimum_calls` samples with a failure rate at or above
//!   `failure_rate_threshold`.
//! - Open: calls rejected until `open_duration` has elapsed. The first
//!   check after that moves to half-open and admits the call.
//! - HalfOpen: admits up to `half_open_probe_count` probes. Reaching
//!   `half_open_success_threshold` successes closes the circuit with a fresh
//!   window; any failure reopens it for a full `open_duration`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::core::Clock;

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { opened_at: u64 },
    HalfOpen { admitted: u32, successes: u32 },
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    duration_ms: u64,
    at: u64,
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub tool: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub window_calls: usize,
    pub window_failures: usize,
    pub avg_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Deterministic breaker for one tool
#[derive(Debug)]
pub struct CircuitBreaker {
    tool: String,
    config: CircuitBreakerConfig,
    phase: Phase,
    samples: VecDeque<Sample>,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(tool: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            tool: tool.into(),
            config,
            phase: Phase::Closed,
            samples: VecDeque::new(),
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.phase.state()
    }

    /// Decide whether a call may proceed at `now`. May move Open to
    /// HalfOpen, and counts admitted half-open probes.
    pub fn allow_call(&mut self, now: u64) -> bool {
        match self.phase {
            Phase::Closed => true,
            Phase::Open { opened_at } => {
                if now >= opened_at.saturating_add(self.open_ms()) {
                    self.transition(Phase::HalfOpen {
                        admitted: 1,
                        successes: 0,
                    });
                    true
                } else {
                    false
                }
            }
            Phase::HalfOpen { admitted, successes } => {
                if admitted < self.config.half_open_probe_count {
                    self.phase = Phase::HalfOpen {
                        admitted: admitted + 1,
                        successes,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record the outcome of an admitted call
    pub fn record(&mut self, success: bool, duration_ms: u64, now: u64) {
        match self.phase {
            Phase::Closed => {
                self.push_sample(success, duration_ms, now);
                if success {
                    self.consecutive_failures = 0;
                } else {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                }
                if self.should_trip() {
                    self.transition(Phase::Open { opened_at: now });
                }
            }
            Phase::HalfOpen { admitted, successes } => {
                if !success {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    self.transition(Phase::Open { opened_at: now });
                    return;
                }
                let successes = successes + 1;
                if successes >= self.config.half_open_success_threshold {
                    self.samples.clear();
                    self.consecutive_failures = 0;
                    self.transition(Phase::Closed);
                } else {
                    self.phase = Phase::HalfOpen { admitted, successes };
                }
            }
            // Outcome of a call admitted before the circuit opened
            Phase::Open { .. } => {}
        }
    }

    /// Give back an admission whose call never reported an outcome, e.g.
    /// because the caller was cancelled mid-call. Only a half-open slot is
    /// returned; closed and open circuits keep no per-call state.
    pub fn abandon(&mut self) {
        if let Phase::HalfOpen { admitted, successes } = self.phase {
            self.phase = Phase::HalfOpen {
                admitted: admitted.saturating_sub(1),
                successes,
            };
        }
    }

    /// Time until an open circuit admits a probe
    pub fn retry_after_ms(&self, now: u64) -> Option<u64> {
        match self.phase {
            Phase::Open { opened_at } => Some(opened_at.saturating_add(self.open_ms()).saturating_sub(now)),
            _ => None,
        }
    }

    pub fn snapshot(&mut self, now: u64) -> CircuitSnapshot {
        self.prune(now);
        let window_failures = self.samples.iter().filter(|s| !s.success).count();
        let avg_duration_ms = if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().map(|s| s.duration_ms).sum::<u64>() / self.samples.len() as u64)
        };
        CircuitSnapshot {
            tool: self.tool.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures,
            window_calls: self.samples.len(),
            window_failures,
            avg_duration_ms,
            retry_after_ms: self.retry_after_ms(now),
        }
    }

    fn should_trip(&self) -> bool {
        if self.consecutive_failures >= self.config.consecutive_failure_threshold {
            return true;
        }
        let calls = self.samples.len();
        if calls == 0 || calls < self.config.minimum_calls as usize {
            return false;
        }
        let failures = self.samples.iter().filter(|s| !s.success).count();
        failures as f64 / calls as f64 >= self.config.failure_rate_threshold
    }

    fn push_sample(&mut self, success: bool, duration_ms: u64, now: u64) {
        self.samples.push_back(Sample {
            success,
            duration_ms,
            at: now,
        });
        self.prune(now);
    }

    fn prune(&mut self, now: u64) {
        let window = self.config.window.as_millis() as u64;
        let cutoff = now.saturating_sub(window);
        while self.samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
            self.samples.pop_front();
        }
        while self.samples.len() > self.config.max_samples.max(1) {
            self.samples.pop_front();
        }
    }

    fn open_ms(&self) -> u64 {
        self.config.open_duration.as_millis() as u64
    }

    fn transition(&mut self, next: Phase) {
        let from = self.phase.state();
        let to = next.state();
        self.phase = next;
        if to == CircuitState::Open {
            warn!(
                tool = %self.tool,
                from = %from,
                to = %to,
                consecutive_failures = self.consecutive_failures,
                window_calls = self.samples.len(),
                "circuit opened"
            );
        } else {
            info!(tool = %self.tool, from = %from, to = %to, "circuit transition");
        }
    }
}

/// Admission decision for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_after_ms: Option<u64> },
}

/// One breaker per tool name, created lazily on first use
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        defaults: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        CircuitBreakerRegistry {
            defaults,
            overrides,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Check and, if allowed, admit a call
    pub fn admit(&self, tool: &str) -> Admission {
        let now = self.clock.now_ms();
        let breaker = self.breaker(tool);
        let mut breaker = breaker.lock().unwrap_or_else(|p| p.into_inner());
        if breaker.allow_call(now) {
            Admission::Allowed
        } else {
            Admission::Rejected {
                retry_after_ms: breaker.retry_after_ms(now),
            }
        }
    }

    pub fn record(&self, tool: &str, success: bool, duration_ms: u64) {
        let now = self.clock.now_ms();
        let breaker = self.breaker(tool);
        breaker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record(success, duration_ms, now);
    }

    /// Release a half-open slot held by a call that will never be recorded
    pub fn abandon(&self, tool: &str) {
        self.breaker(tool).lock().unwrap_or_else(|p| p.into_inner()).abandon();
    }

    pub fn state(&self, tool: &str) -> CircuitState {
        self.breaker(tool).lock().unwrap_or_else(|p| p.into_inner()).state()
    }

    /// Snapshots of every breaker created so far, sorted by tool
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let now = self.clock.now_ms();
        let breakers: Vec<_> = self
            .breakers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<_> = breakers
            .iter()
            .map(|b| b.lock().unwrap_or_else(|p| p.into_inner()).snapshot(now))
            .collect();
        snapshots.sort_by(|a, b| a.tool.cmp(&b.tool));
        snapshots
    }

    fn breaker(&self, tool: &str) -> Arc<Mutex<CircuitBreaker>> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(tool.to_string())
            .or_insert_with(|| {
                let config = self.overrides.get(tool).cloned().unwrap_or_else(|| self.defaults.clone());
                Arc::new(Mutex::new(CircuitBreaker::new(tool, config)))
            })
            .clone()
    }
}
