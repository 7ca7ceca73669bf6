//! Clock abstraction
//!
//! Every time-dependent component (rate limiter, circuit breakers, delivery
//! recovery, session freshness) reads time through [`Clock`] so tests can
//! drive it with a [`ManualClock`] instead of real timers.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Millisecond wall clock
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time in unix milliseconds
    fn now_ms(&self) -> u64;

    /// Wait until `deadline_ms` has been reached
    async fn sleep_until(&self, deadline_ms: u64);
}

/// Real wall clock backed by chrono and tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    async fn sleep_until(&self, deadline_ms: u64) {
        let now = self.now_ms();
        if deadline_ms > now {
            tokio::time::sleep(Duration::from_millis(deadline_ms - now)).await;
        }
    }
}

/// Manually advanced clock for deterministic tests.
///
/// `sleep_until` jumps the clock forward instead of waiting.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the clock to an absolute value
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep_until(&self, deadline_ms: u64) {
        self.now.fetch_max(deadline_ms, Ordering::SeqCst);
    }
}
