//! Session directory
//!
//! Maps session keys to delivery targets. Inbound messages create or touch
//! sessions and seed their reply route; confirmed deliveries update it.
//! Sessions are never deleted, staleness is a freshness check on
//! `updatedAt`.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::key::{agent_id_from_key, session_key, DEFAULT_AGENT};
use super::store::{SessionEntry, SessionStore};
use crate::core::channel::{ChannelRegistry, DeliveryTarget};
use crate::core::Clock;
use crate::error::{Error, Result};

/// Inbound message metadata used to create or touch a session
#[derive(Debug, Clone)]
pub struct InboundRoute {
    pub agent_id: String,
    pub channel: String,
    pub account_id: Option<String>,
    pub peer: String,
    pub thread_id: Option<String>,
}

/// Outcome of recording an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSession {
    pub session_key: String,
    pub session_id: String,
    pub created: bool,
}

/// Caller overrides when resolving a delivery target
#[derive(Debug, Clone, Default)]
pub struct TargetRequest {
    pub to: Option<String>,
    pub channel: Option<String>,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
    /// Broadcast-style send; never lands in a sticky thread
    pub announce: bool,
}

/// Session as shown by listings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_key: String,
    pub agent_id: String,
    pub fresh: bool,
    #[serde(flatten)]
    pub entry: SessionEntry,
}

/// Filters for [`SessionDirectory::list`]
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub agent_id: Option<String>,
    pub active_within_ms: Option<u64>,
    pub limit: Option<usize>,
}

/// Route candidate considered during resolution
struct Route<'a> {
    channel: &'a str,
    to: &'a str,
    account_id: Option<&'a str>,
    thread_id: Option<&'a str>,
}

/// Resolves sessions to delivery targets
pub struct SessionDirectory {
    store: SessionStore,
    channels: Arc<ChannelRegistry>,
    clock: Arc<dyn Clock>,
    fresh_within_ms: u64,
}

impl SessionDirectory {
    pub fn new(
        store: SessionStore,
        channels: Arc<ChannelRegistry>,
        clock: Arc<dyn Clock>,
        fresh_within_ms: u64,
    ) -> Self {
        SessionDirectory {
            store,
            channels,
            clock,
            fresh_within_ms,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Create or touch the session for an inbound message. The sender
    /// becomes the session's reply route.
    pub async fn record_inbound(&self, route: InboundRoute) -> Result<RecordedSession> {
        let key = session_key(&route.agent_id, &route.channel, route.account_id.as_deref(), &route.peer);
        let now = self.clock.now_ms();
        let agent_id = agent_id_from_key(&key).unwrap_or(DEFAULT_AGENT).to_string();

        let (session_id, created) = self
            .store
            .update(&agent_id, |store| {
                let mut created = false;
                let entry = store.entry(key.clone()).or_insert_with(|| {
                    created = true;
                    SessionEntry::new(uuid::Uuid::new_v4().to_string(), now)
                });
                entry.updated_at = now;
                entry.last_channel = Some(route.channel.clone());
                entry.last_to = Some(route.peer.clone());
                entry.last_account_id = route.account_id.clone();
                entry.last_thread_id = route.thread_id.clone();
                (entry.session_id.clone(), created)
            })
            .await?;

        debug!(session_key = %key, created, "inbound recorded");
        Ok(RecordedSession {
            session_key: key,
            session_id,
            created,
        })
    }

    /// Remember a confirmed delivery as the session's last route
    pub async fn record_delivery(&self, session_key: &str, target: &DeliveryTarget) -> Result<bool> {
        let Some(agent_id) = agent_id_from_key(session_key) else {
            return Ok(false);
        };
        let now = self.clock.now_ms();
        self.store
            .update(agent_id, |store| match store.get_mut(session_key) {
                Some(entry) => {
                    entry.updated_at = now;
                    entry.last_channel = Some(target.channel.clone());
                    entry.last_to = Some(target.to.clone());
                    entry.last_account_id = target.account_id.clone();
                    entry.last_thread_id = target.thread_id.clone();
                    true
                }
                None => false,
            })
            .await
    }

    /// Look up a session in its own partition
    pub async fn get(&self, session_key: &str) -> Result<Option<SessionEntry>> {
        let agent_id = agent_id_from_key(session_key).unwrap_or(DEFAULT_AGENT);
        self.store.get(agent_id, session_key).await
    }

    /// Resolve where a reply for `session_key` should go.
    ///
    /// Sources, in order: the session's delivery context, its last route,
    /// then the same key in any other agent partition. Only channels that
    /// are registered and outbound-capable qualify.
    pub async fn resolve_delivery_target(
        &self,
        session_key: &str,
        request: &TargetRequest,
    ) -> Result<DeliveryTarget> {
        if let Some(channel) = request.channel.as_deref() {
            if !self.channels.is_deliverable(channel) {
                return Err(Error::ChannelUnavailable(channel.to_string()));
            }
        }

        let own_agent = agent_id_from_key(session_key).unwrap_or(DEFAULT_AGENT);
        let mut entries = Vec::new();
        if let Some(entry) = self.get(session_key).await? {
            entries.push(entry);
        }
        entries.extend(
            self.store
                .find_across_agents(session_key)
                .await?
                .into_iter()
                .filter(|(agent, _)| agent != own_agent)
                .map(|(_, entry)| entry),
        );

        for entry in &entries {
            for route in routes_of(entry) {
                if let Some(target) = self.try_route(&route, entry, request) {
                    debug!(
                        session_key = %session_key,
                        channel = %target.channel,
                        thread = ?target.thread_id,
                        "delivery target resolved"
                    );
                    return Ok(target);
                }
            }
        }

        // No recorded route; an explicit channel and recipient still work
        if let (Some(channel), Some(to)) = (request.channel.as_deref(), request.to.as_deref()) {
            return Ok(DeliveryTarget {
                channel: channel.to_string(),
                to: to.to_string(),
                account_id: request.account_id.clone(),
                thread_id: if request.announce { None } else { request.thread_id.clone() },
            });
        }

        Err(Error::NoDeliveryTarget(session_key.to_string()))
    }

    fn try_route(&self, route: &Route<'_>, entry: &SessionEntry, request: &TargetRequest) -> Option<DeliveryTarget> {
        let channel = request.channel.as_deref().unwrap_or(route.channel);
        if !self.channels.is_deliverable(channel) {
            return None;
        }
        let to = request.to.as_deref().unwrap_or(route.to);

        Some(DeliveryTarget {
            channel: channel.to_string(),
            to: to.to_string(),
            account_id: request
                .account_id
                .clone()
                .or_else(|| route.account_id.map(str::to_string)),
            thread_id: sticky_thread(route, entry, channel, to, request),
        })
    }

    /// Sessions, most recently active first
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<SessionSummary>> {
        let now = self.clock.now_ms();
        let agents = match &filter.agent_id {
            Some(agent) => vec![agent.clone()],
            None => self.store.agent_ids().await?,
        };

        let mut sessions = Vec::new();
        for agent_id in agents {
            for (key, entry) in self.store.load(&agent_id).await? {
                if let Some(window) = filter.active_within_ms {
                    if now.saturating_sub(entry.updated_at) > window {
                        continue;
                    }
                }
                sessions.push(SessionSummary {
                    session_key: key,
                    agent_id: agent_id.clone(),
                    fresh: self.is_fresh(&entry),
                    entry,
                });
            }
        }

        sessions.sort_by(|a, b| b.entry.updated_at.cmp(&a.entry.updated_at));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    /// Whether a session has seen activity within the freshness window
    pub fn is_fresh(&self, entry: &SessionEntry) -> bool {
        self.clock.now_ms().saturating_sub(entry.updated_at) <= self.fresh_within_ms
    }
}

fn routes_of(entry: &SessionEntry) -> Vec<Route<'_>> {
    let mut routes = Vec::new();
    if let Some(ctx) = &entry.delivery_context {
        if let (Some(channel), Some(to)) = (ctx.channel.as_deref(), ctx.to.as_deref()) {
            routes.push(Route {
                channel,
                to,
                account_id: ctx.account_id.as_deref(),
                thread_id: ctx.thread_id.as_deref(),
            });
        }
    }
    if let (Some(channel), Some(to)) = (entry.last_channel.as_deref(), entry.last_to.as_deref()) {
        routes.push(Route {
            channel,
            to,
            account_id: entry.last_account_id.as_deref(),
            thread_id: entry.last_thread_id.as_deref(),
        });
    }
    routes
}

/// A recorded thread is reused only when the reply goes to the same channel
/// and the same recipient that was last delivered to. Announcements never
/// reuse it.
fn sticky_thread(
    route: &Route<'_>,
    entry: &SessionEntry,
    channel: &str,
    to: &str,
    request: &TargetRequest,
) -> Option<String> {
    if request.announce {
        return None;
    }
    if let Some(thread) = &request.thread_id {
        return Some(thread.clone());
    }
    let same_channel = channel == route.channel;
    let matches_last_to = entry.last_to.as_deref() == Some(to) && route.to == to;
    if same_channel && matches_last_to {
        route.thread_id.map(str::to_string)
    } else {
        None
    }
}
