//! Delivery service
//!
//! Owns the queue, the in-flight set and the recovery worker. `send`
//! persists first, then attempts once inline; anything that does not go
//! out immediately is left to the background worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{DeliveryQueue, QueuedDelivery};
use super::recovery::{attempt_delivery, run_recovery_pass, AttemptOutcome, Deliverer, InFlight, RecoveryPolicy, RecoverySummary};
use crate::config::DeliveryConfig;
use crate::core::channel::{ChannelRegistry, DeliveryReceipt};
use crate::core::Clock;
use crate::error::{DeliveryError, Result};
use crate::sessions::SessionDirectory;

/// Outcome of an inline send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    /// Confirmed by the channel
    Delivered,
    /// Persisted; the recovery worker will retry
    Queued,
    /// Permanently rejected and dead-lettered
    Dropped,
}

/// Queue counters for `queue.status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub last_pass: Option<RecoverySummary>,
}

/// Sends queue entries through registered channel adapters
pub struct ChannelDeliverer {
    channels: Arc<ChannelRegistry>,
    sessions: Option<Arc<SessionDirectory>>,
}

impl ChannelDeliverer {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        ChannelDeliverer {
            channels,
            sessions: None,
        }
    }

    /// Record confirmed sends as the session's last route
    pub fn with_sessions(mut self, sessions: Arc<SessionDirectory>) -> Self {
        self.sessions = Some(sessions);
        self
    }
}

#[async_trait]
impl Deliverer for ChannelDeliverer {
    async fn deliver(&self, entry: &QueuedDelivery) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        let Some(adapter) = self.channels.get(&entry.channel) else {
            // The adapter may register later; keep the entry around
            return Err(DeliveryError::transient(format!(
                "channel '{}' is not registered",
                entry.channel
            )));
        };
        if !adapter.capabilities().outbound {
            return Err(DeliveryError::permanent(format!(
                "channel '{}' cannot send outbound messages",
                entry.channel
            )));
        }
        adapter.deliver(&entry.to_request()).await
    }

    async fn delivered(&self, entry: &QueuedDelivery, _receipt: &DeliveryReceipt) {
        let (Some(sessions), Some(key)) = (&self.sessions, &entry.session_key) else {
            return;
        };
        if let Err(e) = sessions.record_delivery(key, &entry.target()).await {
            warn!(entry_id = %entry.id, session_key = %key, error = %e, "failed to record delivery route");
        }
    }
}

/// Durable outbound delivery with inline send and background recovery
pub struct DeliveryService {
    queue: DeliveryQueue,
    deliverer: Arc<dyn Deliverer>,
    clock: Arc<dyn Clock>,
    policy: RecoveryPolicy,
    poll_interval: Duration,
    in_flight: InFlight,
    pass_lock: tokio::sync::Mutex<()>,
    last_pass: std::sync::Mutex<Option<RecoverySummary>>,
}

impl DeliveryService {
    pub fn new(
        queue: DeliveryQueue,
        deliverer: Arc<dyn Deliverer>,
        clock: Arc<dyn Clock>,
        config: &DeliveryConfig,
    ) -> Self {
        DeliveryService {
            queue,
            deliverer,
            clock,
            policy: RecoveryPolicy::from_config(config),
            poll_interval: config.poll_interval,
            in_flight: InFlight::default(),
            pass_lock: tokio::sync::Mutex::new(()),
            last_pass: std::sync::Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Persist an entry, then try it once right away
    pub async fn send(&self, mut entry: QueuedDelivery) -> Result<SendStatus> {
        self.queue.enqueue(&entry).await?;

        let Some(_claim) = self.in_flight.claim(&entry.id) else {
            return Ok(SendStatus::Queued);
        };
        let outcome = attempt_delivery(
            &self.queue,
            self.deliverer.as_ref(),
            self.clock.as_ref(),
            &self.policy,
            &mut entry,
            self.policy.attempt_timeout_ms,
        )
        .await?;

        Ok(match outcome {
            AttemptOutcome::Delivered => SendStatus::Delivered,
            AttemptOutcome::Retried => SendStatus::Queued,
            AttemptOutcome::Dropped => SendStatus::Dropped,
        })
    }

    /// Run one recovery pass, waiting for any pass already in progress
    pub async fn recover(&self) -> Result<RecoverySummary> {
        let _pass = self.pass_lock.lock().await;
        self.run_pass().await
    }

    /// Run a pass unless one is already running
    pub async fn try_recover(&self) -> Option<Result<RecoverySummary>> {
        let _pass = self.pass_lock.try_lock().ok()?;
        Some(self.run_pass().await)
    }

    async fn run_pass(&self) -> Result<RecoverySummary> {
        let summary = run_recovery_pass(
            &self.queue,
            self.deliverer.as_ref(),
            self.clock.as_ref(),
            &self.policy,
            &self.in_flight,
        )
        .await?;
        *self.last_pass.lock().unwrap_or_else(|p| p.into_inner()) = Some(summary);
        Ok(summary)
    }

    /// Background worker: one pass at startup, then every poll interval
    pub async fn run_worker(self: Arc<Self>, shutdown: CancellationToken) {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "delivery recovery worker started");
        loop {
            match self.try_recover().await {
                Some(Ok(_)) => {}
                Some(Err(e)) => error!(error = %e, "delivery recovery pass failed"),
                None => debug!("recovery pass already running"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("delivery recovery worker stopped");
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        Ok(QueueStatus {
            pending: self.queue.pending_count().await?,
            failed: self.queue.failed_count().await?,
            in_flight: self.in_flight.len(),
            last_pass: *self.last_pass.lock().unwrap_or_else(|p| p.into_inner()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::testing::RecordingChannel;
    use crate::core::channel::{DeliveryTarget, InboundOnlyChannel, ReplyPayload};
    use crate::core::ManualClock;
    use tempfile::tempdir;

    fn target(channel: &str, to: &str) -> DeliveryTarget {
        DeliveryTarget {
            channel: channel.into(),
            to: to.into(),
            account_id: None,
            thread_id: None,
        }
    }

    fn service(dir: &std::path::Path, channels: ChannelRegistry) -> (DeliveryService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let deliverer = Arc::new(ChannelDeliverer::new(Arc::new(channels)));
        (
            DeliveryService::new(DeliveryQueue::new(dir), deliverer, clock.clone(), &DeliveryConfig::default()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_send_delivers_inline_and_clears_queue() {
        let dir = tempdir().unwrap();
        let telegram = RecordingChannel::new("telegram");
        let mut channels = ChannelRegistry::new();
        channels.register(telegram.clone());
        let (svc, _) = service(dir.path(), channels);

        let entry = QueuedDelivery::new(target("telegram", "42"), vec![ReplyPayload::text("hi")], 1)
            .with_idempotency_key("reply-1");
        assert_eq!(svc.send(entry).await.unwrap(), SendStatus::Delivered);

        assert_eq!(telegram.sent_to(), vec!["42"]);
        let sent = telegram.sent.lock().unwrap();
        assert_eq!(sent[0].idempotency_key.as_deref(), Some("reply-1"));
        drop(sent);
        assert_eq!(svc.status().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_picked_up_by_recovery() {
        let dir = tempdir().unwrap();
        let telegram = RecordingChannel::new("telegram");
        telegram.push_outcome(Err(DeliveryError::transient("502")));
        let mut channels = ChannelRegistry::new();
        channels.register(telegram.clone());
        let (svc, clock) = service(dir.path(), channels);

        let entry = QueuedDelivery::new(target("telegram", "42"), vec![ReplyPayload::text("hi")], clock.now_ms());
        assert_eq!(svc.send(entry).await.unwrap(), SendStatus::Queued);
        assert_eq!(svc.status().await.unwrap().pending, 1);

        // First retry is due 5s after the failed attempt, inside the budget
        let summary = svc.recover().await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(telegram.sent_to(), vec!["42"]);
        let status = svc.status().await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.last_pass.unwrap().delivered, 1);
    }

    #[tokio::test]
    async fn test_inbound_only_channel_is_dropped_loudly() {
        let dir = tempdir().unwrap();
        let mut channels = ChannelRegistry::new();
        channels.register(Arc::new(InboundOnlyChannel::new("webchat")));
        let (svc, _) = service(dir.path(), channels);

        let entry = QueuedDelivery::new(target("webchat", "b1"), vec![ReplyPayload::text("hi")], 1);
        assert_eq!(svc.send(entry).await.unwrap(), SendStatus::Dropped);
        let status = svc.status().await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.failed, 1);
    }

    #[tokio::test]
    async fn test_rejected_recipient_does_not_hold_up_others() {
        let dir = tempdir().unwrap();
        let telegram = RecordingChannel::new("telegram");
        telegram.reject_recipient("blocked");
        let mut channels = ChannelRegistry::new();
        channels.register(telegram.clone());
        let (svc, _) = service(dir.path(), channels);

        let bad = QueuedDelivery::new(target("telegram", "blocked"), vec![ReplyPayload::text("hi")], 1);
        let good = QueuedDelivery::new(target("telegram", "42"), vec![ReplyPayload::text("hi")], 2);
        assert_eq!(svc.send(bad).await.unwrap(), SendStatus::Dropped);
        assert_eq!(svc.send(good).await.unwrap(), SendStatus::Delivered);

        assert_eq!(telegram.sent_to(), vec!["42"]);
        let status = svc.status().await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.failed, 1);
    }

    #[tokio::test]
    async fn test_unregistered_channel_waits_for_adapter() {
        let dir = tempdir().unwrap();
        let (svc, _) = service(dir.path(), ChannelRegistry::new());
        let entry = QueuedDelivery::new(target("sms", "+100"), vec![ReplyPayload::text("hi")], 1);
        assert_eq!(svc.send(entry).await.unwrap(), SendStatus::Queued);
        assert_eq!(svc.status().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let (svc, _) = service(dir.path(), ChannelRegistry::new());
        let svc = Arc::new(svc);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(svc.clone().run_worker(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert!(svc.status().await.unwrap().last_pass.is_some());
    }
}
