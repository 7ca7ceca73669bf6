//! Budgeted recovery pass over the delivery queue
//!
//! A pass loads every pending entry oldest-first and works within a
//! wall-clock budget (`max_recovery`):
//!
//! - entries already due are attempted in age order
//! - entries that become due before the budget runs out are waited for,
//!   soonest first
//! - entries whose backoff reaches past the budget are skipped and left
//!   untouched for the next pass
//!
//! Oldest-first is a preference only. A poisoned or slow entry never holds
//! back the ones behind it. Every pass starts over from the oldest entry;
//! an entry still over budget is skipped again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::queue::{DeliveryQueue, QueuedDelivery};
use crate::config::DeliveryConfig;
use crate::core::channel::DeliveryReceipt;
use crate::core::Clock;
use crate::error::{DeliveryError, Result};

/// Performs the actual send for a queue entry
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, entry: &QueuedDelivery) -> std::result::Result<DeliveryReceipt, DeliveryError>;

    /// Called after a confirmed send, before the entry is forgotten
    async fn delivered(&self, _entry: &QueuedDelivery, _receipt: &DeliveryReceipt) {}

    /// Called once an entry has been dead-lettered
    async fn dropped(&self, _entry: &QueuedDelivery) {}
}

/// Limits applied to one pass and to each attempt
#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    pub max_recovery_ms: u64,
    pub attempt_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RecoveryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        RecoveryPolicy {
            max_recovery_ms: config.max_recovery.as_millis() as u64,
            attempt_timeout_ms: config.attempt_timeout.as_millis() as u64,
            max_retries: config.max_retries,
            backoff: Backoff::from_config(config),
        }
    }

    /// When an entry may next be attempted
    pub fn due_at(&self, entry: &QueuedDelivery) -> u64 {
        let last = entry.last_attempt_at.unwrap_or(entry.enqueued_at);
        last.saturating_add(self.backoff.delay_ms(entry.retry_count))
    }
}

/// Counters for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySummary {
    pub delivered: usize,
    /// Failed transiently and rescheduled
    pub retried: usize,
    /// Dead-lettered (permanent failure or retries exhausted)
    pub dropped: usize,
    /// Backoff reached past the budget
    pub skipped: usize,
    /// Due within the budget but not reached before it expired
    pub deferred: usize,
    /// Being attempted elsewhere
    pub in_flight: usize,
    /// Queue I/O failed while settling; the entry is retried next pass
    pub errors: usize,
}

/// Result of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Retried,
    Dropped,
}

/// Ids currently being attempted, shared by the inline send path and the
/// recovery worker
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    /// Claim an id; `None` when someone else holds it
    pub fn claim(&self, id: &str) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(|p| p.into_inner());
        if ids.insert(id.to_string()) {
            Some(InFlightGuard {
                ids: self.ids.clone(),
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases an in-flight claim on drop
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids.lock().unwrap_or_else(|p| p.into_inner()).remove(&self.id);
    }
}

/// Run one recovery pass
pub async fn run_recovery_pass(
    queue: &DeliveryQueue,
    deliverer: &dyn Deliverer,
    clock: &dyn Clock,
    policy: &RecoveryPolicy,
    in_flight: &InFlight,
) -> Result<RecoverySummary> {
    let started = clock.now_ms();
    let deadline = started.saturating_add(policy.max_recovery_ms);
    let pending = queue.load_pending().await?;
    let mut summary = RecoverySummary::default();

    if pending.is_empty() {
        return Ok(summary);
    }
    debug!(pending = pending.len(), budget_ms = policy.max_recovery_ms, "recovery pass started");

    let mut ready = Vec::new();
    let mut waiting = Vec::new();
    for entry in pending {
        let due = policy.due_at(&entry);
        if due <= started {
            ready.push(entry);
        } else if due <= deadline {
            waiting.push((due, entry));
        } else {
            summary.skipped += 1;
            info!(
                entry_id = %entry.id,
                channel = %entry.channel,
                retry_count = entry.retry_count,
                wait_ms = due - started,
                remaining_ms = deadline - started,
                reason = "backoff exceeds recovery budget",
                "delivery skipped"
            );
        }
    }
    waiting.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.enqueued_at.cmp(&b.1.enqueued_at)));

    let scheduled = ready
        .into_iter()
        .map(|entry| (None, entry))
        .chain(waiting.into_iter().map(|(due, entry)| (Some(due), entry)));

    for (due, listed) in scheduled {
        if let Some(due) = due {
            if due >= deadline {
                summary.deferred += 1;
                continue;
            }
            clock.sleep_until(due).await;
        }

        let now = clock.now_ms();
        if now >= deadline {
            summary.deferred += 1;
            debug!(entry_id = %listed.id, "recovery budget exhausted, entry left for next pass");
            continue;
        }

        let Some(_claim) = in_flight.claim(&listed.id) else {
            summary.in_flight += 1;
            continue;
        };

        // The listing is stale once another claim holder has touched the entry
        let mut entry = match queue.load(&listed.id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(entry_id = %listed.id, "entry already settled, nothing to recover");
                continue;
            }
            Err(e) => {
                summary.errors += 1;
                warn!(entry_id = %listed.id, error = %e, "failed to reload delivery entry");
                continue;
            }
        };
        if policy.due_at(&entry) > now {
            summary.skipped += 1;
            debug!(
                entry_id = %entry.id,
                retry_count = entry.retry_count,
                "entry was rescheduled since listing, not due yet"
            );
            continue;
        }

        let timeout_ms = policy.attempt_timeout_ms.min(deadline - now);
        match attempt_delivery(queue, deliverer, clock, policy, &mut entry, timeout_ms).await {
            Ok(AttemptOutcome::Delivered) => summary.delivered += 1,
            Ok(AttemptOutcome::Retried) => summary.retried += 1,
            Ok(AttemptOutcome::Dropped) => summary.dropped += 1,
            Err(e) => {
                summary.errors += 1;
                warn!(
                    entry_id = %entry.id,
                    channel = %entry.channel,
                    error = %e,
                    "failed to settle delivery entry, continuing with the rest"
                );
            }
        }
    }

    info!(
        delivered = summary.delivered,
        retried = summary.retried,
        dropped = summary.dropped,
        skipped = summary.skipped,
        deferred = summary.deferred,
        errors = summary.errors,
        elapsed_ms = clock.now_ms().saturating_sub(started),
        "recovery pass finished"
    );
    Ok(summary)
}

/// Attempt one entry and settle it on disk
pub(crate) async fn attempt_delivery(
    queue: &DeliveryQueue,
    deliverer: &dyn Deliverer,
    clock: &dyn Clock,
    policy: &RecoveryPolicy,
    entry: &mut QueuedDelivery,
    timeout_ms: u64,
) -> Result<AttemptOutcome> {
    let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), deliverer.deliver(entry)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::transient(format!("attempt timed out after {}ms", timeout_ms))),
    };

    match result {
        Ok(receipt) => {
            queue.ack(&entry.id).await?;
            deliverer.delivered(entry, &receipt).await;
            info!(
                entry_id = %entry.id,
                channel = %entry.channel,
                retry_count = entry.retry_count,
                message_id = ?receipt.message_id,
                "delivered"
            );
            Ok(AttemptOutcome::Delivered)
        }
        Err(e) if !e.is_transient() => {
            queue.move_to_failed(entry, &e.message).await?;
            error!(
                entry_id = %entry.id,
                channel = %entry.channel,
                to = %entry.to,
                retry_count = entry.retry_count,
                reason = %e.message,
                "delivery dropped: permanent failure"
            );
            deliverer.dropped(entry).await;
            Ok(AttemptOutcome::Dropped)
        }
        Err(e) => {
            queue.record_failure(entry, &e.message, clock.now_ms()).await?;
            if entry.retry_count >= policy.max_retries {
                queue.move_to_failed(entry, &e.message).await?;
                error!(
                    entry_id = %entry.id,
                    channel = %entry.channel,
                    to = %entry.to,
                    retry_count = entry.retry_count,
                    reason = %e.message,
                    "delivery dropped: retries exhausted"
                );
                deliverer.dropped(entry).await;
                return Ok(AttemptOutcome::Dropped);
            }
            warn!(
                entry_id = %entry.id,
                channel = %entry.channel,
                retry_count = entry.retry_count,
                next_in_ms = policy.backoff.delay_ms(entry.retry_count),
                reason = %e.message,
                "delivery failed, will retry"
            );
            Ok(AttemptOutcome::Retried)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{DeliveryTarget, ReplyPayload};
    use crate::core::ManualClock;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// Deliverer scripted per recipient
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<HashMap<String, Vec<std::result::Result<(), DeliveryError>>>>,
        attempts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn script(&self, to: &str, outcomes: Vec<std::result::Result<(), DeliveryError>>) {
            self.outcomes.lock().unwrap().insert(to.to_string(), outcomes);
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Deliverer for Scripted {
        async fn deliver(&self, entry: &QueuedDelivery) -> std::result::Result<DeliveryReceipt, DeliveryError> {
            self.attempts.lock().unwrap().push(entry.to.clone());
            let next = self
                .outcomes
                .lock()
                .unwrap()
                .get_mut(&entry.to)
                .and_then(|o| if o.is_empty() { None } else { Some(o.remove(0)) });
            next.unwrap_or(Ok(())).map(|_| DeliveryReceipt::default())
        }
    }

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy::from_config(&DeliveryConfig::default())
    }

    fn entry(to: &str, enqueued_at: u64, retry_count: u32, last_attempt_at: Option<u64>) -> QueuedDelivery {
        let mut e = QueuedDelivery::new(
            DeliveryTarget {
                channel: "telegram".into(),
                to: to.into(),
                account_id: None,
                thread_id: None,
            },
            vec![ReplyPayload::text("hi")],
            enqueued_at,
        );
        e.retry_count = retry_count;
        e.last_attempt_at = last_attempt_at;
        e
    }

    const NOW: u64 = 1_000_000_000;

    #[tokio::test]
    async fn test_over_budget_entry_does_not_block_younger_entries() {
        let dir = tempdir().unwrap();
        let queue = DeliveryQueue::new(dir.path());
        let clock = ManualClock::new(NOW);
        let deliverer = Scripted::default();

        // retryCount=3 needs 125s of backoff, more than the 60s budget
        let old = entry("old", NOW - 10_000, 3, Some(NOW - 1_000));
        let young = entry("young", NOW - 5_000, 0, None);
        queue.enqueue(&old).await.unwrap();
        queue.enqueue(&young).await.unwrap();

        let summary = run_recovery_pass(&queue, &deliverer, &clock, &policy(), &InFlight::default())
            .await
            .unwrap();

        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(deliverer.attempts(), vec!["young"]);

        // The skipped entry stays queued, untouched
        let left = queue.load_pending().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, old.id);
        assert_eq!(left[0].retry_count, 3);
    }

    #[tokio::test]
    async fn test_waits_for_entries_due_within_budget() {
        let dir = tempdir().unwrap();
        let queue = DeliveryQueue::new(dir.path());
        let clock = ManualClock::new(NOW);
        let deliverer = Scripted::default();

        // retryCount=1: due 5s after its last attempt, 3s from now
        queue.enqueue(&entry("soon", NOW - 60_000, 1, Some(NOW - 2_000))).await.unwrap();

        let summary = run_recovery_pass(&queue, &deliverer, &clock, &policy(), &InFlight::default())
            .await
            .unwrap();

        assert_eq!(summary.delivered, 1);
        assert_eq!(clock.now_ms(), NOW + 3_000);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_isolated_and_dead_lettered() {
        let dir = tempdir().unwrap();
        let queue = DeliveryQueue::new(dir.path());
        let clock = ManualClock::new(NOW);
        let deliverer = Scripted::default();
        deliverer.script("bad", vec![Err(DeliveryError::permanent("invalid recipient"))]);

        queue.enqueue(&entry("bad", NOW - 2, 0, None)).await.unwrap();
        queue.enqueue(&entry("good", NOW - 1, 0, None)).await.unwrap();

        let summary = run_recovery_pass(&queue, &deliverer, &clock, &policy(), &InFlight::default())
            .await
            .unwrap();

        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(deliverer.attempts(), vec!["bad", "good"]);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert_eq!(queue.failed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_reschedules_then_drops_after_max_retries() {
        let dir = tempdir().unwrap();
        let queue = DeliveryQueue::new(dir.path());
        let clock = ManualClock::new(NOW);
        let deliverer = Scripted::default();
        deliverer.script("flaky", vec![Err(DeliveryError::transient("503"))]);

        queue.enqueue(&entry("flaky", NOW, 0, None)).await.unwrap();
        let summary = run_recovery_pass(&queue, &deliverer, &clock, &policy(), &InFlight::default())
            .await
            .unwrap();
        assert_eq!(summary.retried, 1);
        let left = queue.load_pending().await.unwrap();
        assert_eq!(left[0].retry_count, 1);
        assert_eq!(left[0].last_error.as_deref(), Some("503"));

        // One attempt away from the limit
        let dir2 = tempdir().unwrap();
        let queue2 = DeliveryQueue::new(dir2.path());
        deliverer.script("doomed", vec![Err(DeliveryError::transient("503"))]);
        queue2
            .enqueue(&entry("doomed", NOW - 1_000_000, 4, Some(NOW - 700_000)))
            .await
            .unwrap();
        let summary = run_recovery_pass(&queue2, &deliverer, &clock, &policy(), &InFlight::default())
            .await
            .unwrap();
        assert_eq!(summary.dropped, 1);
        assert_eq!(queue2.failed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_entries_are_left_alone() {
        let dir = tempdir().unwrap();
        let queue = DeliveryQueue::new(dir.path());
        let clock = ManualClock::new(NOW);
        let deliverer = Scripted::default();
        let e = entry("busy", NOW, 0, None);
        queue.enqueue(&e).await.unwrap();

        let in_flight = InFlight::default();
        let _held = in_flight.claim(&e.id).unwrap();

        let summary = run_recovery_pass(&queue, &deliverer, &clock, &policy(), &in_flight)
            .await
            .unwrap();
        assert_eq!(summary.in_flight, 1);
        assert!(deliverer.attempts().is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_pass_reevaluates_from_oldest() {
        let dir = tempdir().unwrap();
        let queue = DeliveryQueue::new(dir.path());
        let clock = ManualClock::new(NOW);
        let deliverer = Scripted::default();
        queue.enqueue(&entry("slow", NOW - 10, 3, Some(NOW))).await.unwrap();

        let first = run_recovery_pass(&queue, &deliverer, &clock, &policy(), &InFlight::default())
            .await
            .unwrap();
        assert_eq!(first.skipped, 1);

        // 125s later the entry is due and goes out on the next pass
        clock.advance(125_000);
        let second = run_recovery_pass(&queue, &deliverer, &clock, &policy(), &InFlight::default())
            .await
            .unwrap();
        assert_eq!(second.delivered, 1);
    }

    /// What the deliverer does behind the pass's back while sending "a"
    #[derive(Clone, Copy)]
    enum Interference {
        /// An inline send claims "b", delivers it and acks it
        InlineDelivers,
        /// An inline send claims "b" and fails transiently
        InlineFails,
        /// The record for "a" becomes impossible to remove
        BlockAck,
    }

    struct Interfering {
        queue: DeliveryQueue,
        in_flight: InFlight,
        other_id: String,
        interference: Interference,
        attempts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Deliverer for Interfering {
        async fn deliver(&self, entry: &QueuedDelivery) -> std::result::Result<DeliveryReceipt, DeliveryError> {
            self.attempts.lock().unwrap().push(entry.to.clone());
            if entry.to != "a" {
                return Ok(DeliveryReceipt::default());
            }
            match self.interference {
                Interference::InlineDelivers => {
                    let claim = self.in_flight.claim(&self.other_id).unwrap();
                    self.attempts.lock().unwrap().push("b(inline)".into());
                    self.queue.ack(&self.other_id).await.unwrap();
                    drop(claim);
                }
                Interference::InlineFails => {
                    let claim = self.in_flight.claim(&self.other_id).unwrap();
                    self.attempts.lock().unwrap().push("b(inline)".into());
                    let mut b = self.queue.load(&self.other_id).await.unwrap().unwrap();
                    self.queue.record_failure(&mut b, "503", NOW).await.unwrap();
                    drop(claim);
                }
                Interference::BlockAck => {
                    let path = self.queue.dir().join(format!("{}.json", entry.id));
                    std::fs::remove_file(&path).unwrap();
                    std::fs::create_dir(&path).unwrap();
                }
            }
            Ok(DeliveryReceipt::default())
        }
    }

    struct Race {
        _dir: tempfile::TempDir,
        queue: DeliveryQueue,
        in_flight: InFlight,
        deliverer: Interfering,
        b_id: String,
    }

    async fn race(interference: Interference) -> Race {
        let dir = tempdir().unwrap();
        let queue = DeliveryQueue::new(dir.path());
        let a = entry("a", NOW - 2, 0, None);
        let b = entry("b", NOW - 1, 0, None);
        queue.enqueue(&a).await.unwrap();
        queue.enqueue(&b).await.unwrap();

        let in_flight = InFlight::default();
        let deliverer = Interfering {
            // A second handle on the same directory, as the inline path has
            queue: DeliveryQueue::new(dir.path()),
            in_flight: in_flight.clone(),
            other_id: b.id.clone(),
            interference,
            attempts: Mutex::new(Vec::new()),
        };
        Race {
            _dir: dir,
            queue,
            in_flight,
            deliverer,
            b_id: b.id,
        }
    }

    #[tokio::test]
    async fn test_entry_acked_by_inline_send_is_not_sent_again() {
        let r = race(Interference::InlineDelivers).await;
        let clock = ManualClock::new(NOW);

        let summary = run_recovery_pass(&r.queue, &r.deliverer, &clock, &policy(), &r.in_flight)
            .await
            .unwrap();

        assert_eq!(*r.deliverer.attempts.lock().unwrap(), vec!["a", "b(inline)"]);
        assert_eq!(summary.delivered, 1);
        assert_eq!(r.queue.pending_count().await.unwrap(), 0);
        assert!(r.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_entry_rescheduled_by_inline_send_keeps_its_backoff() {
        let r = race(Interference::InlineFails).await;
        let clock = ManualClock::new(NOW);

        let summary = run_recovery_pass(&r.queue, &r.deliverer, &clock, &policy(), &r.in_flight)
            .await
            .unwrap();

        assert_eq!(*r.deliverer.attempts.lock().unwrap(), vec!["a", "b(inline)"]);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.skipped, 1);
        let b = r.queue.load(&r.b_id).await.unwrap().unwrap();
        assert_eq!(b.retry_count, 1);
        assert_eq!(b.last_attempt_at, Some(NOW));
    }

    #[tokio::test]
    async fn test_queue_io_error_on_one_entry_does_not_stop_the_pass() {
        let r = race(Interference::BlockAck).await;
        let clock = ManualClock::new(NOW);

        let summary = run_recovery_pass(&r.queue, &r.deliverer, &clock, &policy(), &r.in_flight)
            .await
            .unwrap();

        assert_eq!(*r.deliverer.attempts.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.delivered, 1);
        assert!(r.queue.load(&r.b_id).await.unwrap().is_none());
        assert!(r.in_flight.is_empty());
    }

    #[test]
    fn test_in_flight_claim_released_on_drop() {
        let in_flight = InFlight::default();
        let guard = in_flight.claim("a").unwrap();
        assert!(in_flight.claim("a").is_none());
        drop(guard);
        assert!(in_flight.claim("a").is_some());
    }
}
