//! File-backed delivery queue
//!
//! One JSON file per entry at `<state>/delivery-queue/<id>.json`, written
//! atomically before any delivery attempt. A file is removed only after a
//! confirmed send or moved to `failed/` on a drop decision.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::paths;
use crate::core::channel::{DeliveryTarget, OutboundRequest, ReplyPayload};
use crate::error::{Error, Result};

/// One outbound delivery, as persisted on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedDelivery {
    pub id: String,
    pub channel: String,
    pub to: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub payloads: Vec<ReplyPayload>,
    /// Session whose route is updated after a confirmed send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub enqueued_at: u64,
    #[serde(default)]
    pub last_attempt_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedDelivery {
    pub fn new(target: DeliveryTarget, payloads: Vec<ReplyPayload>, enqueued_at: u64) -> Self {
        QueuedDelivery {
            id: uuid::Uuid::new_v4().to_string(),
            channel: target.channel,
            to: target.to,
            account_id: target.account_id,
            thread_id: target.thread_id,
            payloads,
            session_key: None,
            idempotency_key: None,
            retry_count: 0,
            enqueued_at,
            last_attempt_at: None,
            last_error: None,
        }
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn target(&self) -> DeliveryTarget {
        DeliveryTarget {
            channel: self.channel.clone(),
            to: self.to.clone(),
            account_id: self.account_id.clone(),
            thread_id: self.thread_id.clone(),
        }
    }

    /// Request handed to the channel adapter. Falls back to the entry id
    /// as dedup key so retries of the same entry are recognizable.
    pub fn to_request(&self) -> OutboundRequest {
        OutboundRequest {
            channel: self.channel.clone(),
            to: self.to.clone(),
            account_id: self.account_id.clone(),
            thread_id: self.thread_id.clone(),
            payloads: self.payloads.clone(),
            idempotency_key: Some(
                self.idempotency_key
                    .clone()
                    .unwrap_or_else(|| self.id.clone()),
            ),
        }
    }
}

/// Queue directory plus its dead-letter directory
pub struct DeliveryQueue {
    dir: PathBuf,
    failed_dir: PathBuf,
}

impl DeliveryQueue {
    pub fn new(state_dir: &Path) -> Self {
        DeliveryQueue {
            dir: paths::delivery_queue_dir(state_dir),
            failed_dir: paths::delivery_failed_dir(state_dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn failed_dir(&self) -> &Path {
        &self.failed_dir
    }

    /// Persist a new entry. Returns only once the record is on disk.
    pub async fn enqueue(&self, entry: &QueuedDelivery) -> Result<()> {
        check_id(&entry.id)?;
        write_atomic(&self.dir, &self.entry_path(&entry.id), entry).await?;
        debug!(entry_id = %entry.id, channel = %entry.channel, "delivery enqueued");
        Ok(())
    }

    /// Remove a delivered entry
    pub async fn ack(&self, id: &str) -> Result<()> {
        check_id(id)?;
        match tokio::fs::remove_file(self.entry_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current on-disk copy of an entry; `None` once it has been acked or
    /// dead-lettered
    pub async fn load(&self, id: &str) -> Result<Option<QueuedDelivery>> {
        check_id(id)?;
        match tokio::fs::read(self.entry_path(id)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a failed attempt and persist the bumped retry count
    pub async fn record_failure(&self, entry: &mut QueuedDelivery, error: &str, now_ms: u64) -> Result<()> {
        entry.retry_count = entry.retry_count.saturating_add(1);
        entry.last_attempt_at = Some(now_ms);
        entry.last_error = Some(error.to_string());
        write_atomic(&self.dir, &self.entry_path(&entry.id), entry).await
    }

    /// Move an entry to the dead-letter directory
    pub async fn move_to_failed(&self, entry: &mut QueuedDelivery, reason: &str) -> Result<()> {
        entry.last_error = Some(reason.to_string());
        let target = self.failed_dir.join(format!("{}.json", entry.id));
        write_atomic(&self.failed_dir, &target, entry).await?;
        self.ack(&entry.id).await
    }

    /// All pending entries, oldest first. Unreadable records are moved to
    /// `failed/` with a `.corrupt` suffix and skipped.
    pub async fn load_pending(&self) -> Result<Vec<QueuedDelivery>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(".json") || !file.file_type().await?.is_file() {
                continue;
            }

            let parsed = tokio::fs::read(&path)
                .await
                .map_err(Error::from)
                .and_then(|raw| serde_json::from_slice::<QueuedDelivery>(&raw).map_err(Error::from));
            match parsed {
                Ok(entry) => entries.push(entry),
                Err(e) => self.quarantine(&path, &name, &e).await?,
            }
        }

        entries.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Number of pending records on disk
    pub async fn pending_count(&self) -> Result<usize> {
        count_json(&self.dir).await
    }

    /// Number of dead-lettered records
    pub async fn failed_count(&self) -> Result<usize> {
        count_json(&self.failed_dir).await
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn quarantine(&self, path: &Path, name: &str, error: &Error) -> Result<()> {
        tokio::fs::create_dir_all(&self.failed_dir).await?;
        let target = self.failed_dir.join(format!("{}.corrupt", name));
        tokio::fs::rename(path, &target).await?;
        warn!(
            path = %path.display(),
            quarantined = %target.display(),
            error = %error,
            "corrupt delivery record dropped"
        );
        Ok(())
    }
}

/// Entry ids become file names
fn check_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid delivery id: {}", id)))
    }
}

async fn write_atomic(dir: &Path, path: &Path, entry: &QueuedDelivery) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!(".{}.{}.tmp", entry.id, uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(entry)?).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn count_json(dir: &Path) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with('.') && name.ends_with(".json") {
            count += 1;
        }
    }
    Ok(count)
}
