//! On-disk session store
//!
//! One JSON object per agent at `<state>/agents/<agentId>/sessions/sessions.json`,
//! keyed by session key. All writes go through [`SessionStore::update`],
//! which holds a per-file lock while it loads, mutates and atomically
//! replaces the whole file.
//!
//! Before a write, a file larger than `rotate_bytes` is renamed to
//! `sessions.json.bak.<unixMs>` and only the newest `keep_backups` backups
//! are kept. A file that cannot be parsed is treated as empty and moved to
//! `sessions.json.corrupt.<unixMs>` on the next write.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::key::is_valid_agent_id;
use crate::config::paths;
use crate::config::SessionConfig;
use crate::core::Clock;
use crate::error::{Error, Result};

/// Structured delivery override attached to a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Persisted session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    /// Opaque runtime id (transcript handle)
    pub session_id: String,
    /// Last inbound or outbound activity (unix ms)
    pub updated_at: u64,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_context: Option<DeliveryContext>,
}

impl SessionEntry {
    pub fn new(session_id: impl Into<String>, now_ms: u64) -> Self {
        SessionEntry {
            session_id: session_id.into(),
            updated_at: now_ms,
            created_at: now_ms,
            last_channel: None,
            last_to: None,
            last_account_id: None,
            last_thread_id: None,
            delivery_context: None,
        }
    }
}

/// Contents of one agent's store file
pub type SessionMap = BTreeMap<String, SessionEntry>;

const STORE_FILE: &str = "sessions.json";
const BACKUP_MARKER: &str = ".bak.";
const CORRUPT_MARKER: &str = ".corrupt.";

/// File-backed session store partitioned by agent
pub struct SessionStore {
    state_dir: PathBuf,
    rotate_bytes: u64,
    keep_backups: usize,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(state_dir: impl Into<PathBuf>, config: &SessionConfig, clock: Arc<dyn Clock>) -> Self {
        SessionStore {
            state_dir: state_dir.into(),
            rotate_bytes: config.rotate_bytes,
            keep_backups: config.keep_backups,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store file for an agent
    pub fn path_for(&self, agent_id: &str) -> PathBuf {
        paths::sessions_path(&self.state_dir, agent_id)
    }

    /// Read an agent's sessions. Missing or corrupt files read as empty.
    pub async fn load(&self, agent_id: &str) -> Result<SessionMap> {
        check_agent_id(agent_id)?;
        let path = self.path_for(agent_id);
        Ok(read_store(&path).await?.unwrap_or_default())
    }

    /// Fetch one session
    pub async fn get(&self, agent_id: &str, session_key: &str) -> Result<Option<SessionEntry>> {
        Ok(self.load(agent_id).await?.remove(session_key))
    }

    /// Load, mutate and atomically persist an agent's store.
    ///
    /// Concurrent callers on the same agent are serialized; the closure
    /// always sees the result of every earlier update.
    pub async fn update<F, R>(&self, agent_id: &str, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut SessionMap) -> R,
    {
        check_agent_id(agent_id)?;
        let path = self.path_for(agent_id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let mut store = match read_store(&path).await? {
            Some(store) => store,
            None => {
                self.quarantine_if_present(&path).await?;
                SessionMap::new()
            }
        };

        let result = mutate(&mut store);

        self.rotate_if_needed(&path).await?;
        write_atomic(&path, &store).await?;
        Ok(result)
    }

    /// Agents that have a session partition on disk, sorted
    pub async fn agent_ids(&self) -> Result<Vec<String>> {
        let root = paths::agents_dir(&self.state_dir);
        let mut dir = match tokio::fs::read_dir(&root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_agent_id(name) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Search every agent partition for a session key
    pub async fn find_across_agents(&self, session_key: &str) -> Result<Vec<(String, SessionEntry)>> {
        let mut found = Vec::new();
        for agent_id in self.agent_ids().await? {
            if let Some(entry) = self.get(&agent_id, session_key).await? {
                found.push((agent_id, entry));
            }
        }
        Ok(found)
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn quarantine_if_present(&self, path: &Path) -> Result<()> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        let target = sibling(path, &format!("{}{}", CORRUPT_MARKER, self.clock.now_ms()));
        tokio::fs::rename(path, &target).await?;
        warn!(
            path = %path.display(),
            quarantined = %target.display(),
            "corrupt session store moved aside"
        );
        Ok(())
    }

    async fn rotate_if_needed(&self, path: &Path) -> Result<()> {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if size <= self.rotate_bytes {
            return Ok(());
        }

        let backup = sibling(path, &format!("{}{}", BACKUP_MARKER, self.clock.now_ms()));
        tokio::fs::rename(path, &backup).await?;
        info!(path = %path.display(), size, backup = %backup.display(), "session store rotated");

        self.prune_backups(path).await
    }

    async fn prune_backups(&self, path: &Path) -> Result<()> {
        let Some(dir) = path.parent() else {
            return Ok(());
        };
        let prefix = format!("{}{}", STORE_FILE, BACKUP_MARKER);

        let mut backups: Vec<(u64, PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stamp) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) {
                backups.push((stamp, entry.path()));
            }
        }

        backups.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, stale) in backups.into_iter().skip(self.keep_backups) {
            debug!(path = %stale.display(), "removing old session backup");
            tokio::fs::remove_file(&stale).await?;
        }
        Ok(())
    }
}

fn check_agent_id(agent_id: &str) -> Result<()> {
    if is_valid_agent_id(agent_id) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid agent id: {}", agent_id)))
    }
}

/// `Ok(None)` means the file exists but is unreadable as a store
async fn read_store(path: &Path) -> Result<Option<SessionMap>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Some(SessionMap::new())),
        Err(e) => return Err(e.into()),
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Some(SessionMap::new()));
    }
    match serde_json::from_slice::<SessionMap>(&raw) {
        Ok(store) => Ok(Some(store)),
        Err(e) => {
            let corruption = Error::StoreCorruption {
                path: path.display().to_string(),
                message: e.to_string(),
            };
            warn!(error = %corruption, "session store unreadable, treating as empty");
            Ok(None)
        }
    }
}

async fn write_atomic(path: &Path, store: &SessionMap) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = sibling(path, &format!(".{}.tmp", uuid::Uuid::new_v4()));
    let body = serde_json::to_vec_pretty(store)?;
    tokio::fs::write(&tmp, &body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| STORE_FILE.into());
    name.push(suffix);
    path.with_file_name(name)
}
