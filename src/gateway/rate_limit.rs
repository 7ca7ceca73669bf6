//! Failed-authentication throttle
//!
//! Each identity (usually the peer IP) accumulates failures. Once the count
//! reaches the threshold the identity is blocked for
//! `min(max_delay, base_delay * 2^(failures - threshold))`.
//!
//! Records live in a bounded moka cache: at most `max_tracked` identities,
//! least recently used evicted first, and each record expires
//! `decay_window` after its last failure. Decay is also checked lazily
//! against the injected clock, so results never depend on when moka runs
//! its housekeeping.

use std::sync::Arc;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::core::Clock;

/// Per-identity failure record
#[derive(Debug, Clone, Copy, Default)]
struct RateLimitEntry {
    failure_count: u32,
    last_failure_at: u64,
    blocked_until: u64,
}

/// Exponential backoff throttle keyed by identity
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    entries: Cache<String, RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_tracked.max(1) as u64)
            .time_to_live(config.decay_window)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        RateLimiter {
            config,
            clock,
            entries,
        }
    }

    /// Whether the identity is currently blocked. Never mutates state.
    pub fn check(&self, identity: &str) -> bool {
        self.retry_after_ms(identity).is_some()
    }

    /// Remaining block time, if blocked
    pub fn retry_after_ms(&self, identity: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        let entry = self.entries.get(identity)?;
        if self.is_decayed(&entry, now) || now >= entry.blocked_until {
            return None;
        }
        Some(entry.blocked_until - now)
    }

    /// Record a failed attempt. Returns the block expiry if this failure
    /// (re)arms a block.
    pub fn record_failure(&self, identity: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        let entry = self
            .entries
            .entry(identity.to_string())
            .and_upsert_with(|current| {
                let mut entry = match current {
                    Some(current) if !self.is_decayed(current.value(), now) => *current.value(),
                    _ => RateLimitEntry::default(),
                };
                entry.failure_count = entry.failure_count.saturating_add(1);
                entry.last_failure_at = now;
                if entry.failure_count >= self.config.threshold {
                    entry.blocked_until = now.saturating_add(self.block_duration_ms(entry.failure_count));
                }
                entry
            })
            .into_value();

        if entry.failure_count < self.config.threshold {
            debug!(
                identity = %identity,
                failures = entry.failure_count,
                "auth failure recorded"
            );
            return None;
        }

        warn!(
            identity = %identity,
            failures = entry.failure_count,
            blocked_for_ms = entry.blocked_until - now,
            "auth rate limit tripped"
        );
        Some(entry.blocked_until)
    }

    /// Forget all failures for the identity
    pub fn record_success(&self, identity: &str) {
        self.entries.invalidate(identity);
    }

    /// Number of identities currently tracked
    pub fn tracked(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    fn block_duration_ms(&self, failure_count: u32) -> u64 {
        let base = self.config.base_delay.as_millis() as u64;
        let max = self.config.max_delay.as_millis() as u64;
        let exponent = failure_count.saturating_sub(self.config.threshold).min(32);
        base.saturating_mul(1u64 << exponent).min(max)
    }

    fn is_decayed(&self, entry: &RateLimitEntry, now: u64) -> bool {
        let window = self.config.decay_window.as_millis() as u64;
        now.saturating_sub(entry.last_failure_at) >= window
    }
}
