//! Built-in gateway methods
//!
//! - `connect`: protocol negotiation and authentication
//! - `health`: liveness and counters
//! - `sessions.record` / `sessions.resolve` / `sessions.list`
//! - `send`: enqueue an outbound reply
//! - `agent` / `chat.abort`: start and cancel agent runs
//! - `tools.status` / `queue.status`: circuit and queue introspection

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use super::core::GatewayCore;
use super::dispatcher::{ConnectionContext, Handshake, MethodRegistry, TypedMethod};
use super::protocol::{
    events, AgentAccepted, AgentParams, ChatAbortParams, ChatAbortResult, ConnectParams, EmptyParams, HelloOk,
    SendParams, SendResult, ServerInfo, SessionsListParams, SessionsRecordParams, SessionsRecordResult,
    SessionsResolveParams, MIN_SUPPORTED_PROTOCOL, PROTOCOL_VERSION,
};
use crate::agent::AgentRunParams;
use crate::core::channel::DeliveryTarget;
use crate::delivery::QueuedDelivery;
use crate::error::{Error, Result};
use crate::sessions::key::is_valid_agent_id;
use crate::sessions::{InboundRoute, ListFilter, TargetRequest};

/// Register every built-in method. `agent` is only served when the core
/// has a runtime attached.
pub fn build(core: Arc<GatewayCore>) -> MethodRegistry {
    let mut methods = MethodRegistry::new();

    let c = core.clone();
    methods.register(
        "health",
        TypedMethod::new(move |_: EmptyParams, _ctx: Arc<ConnectionContext>| {
            let core = c.clone();
            async move {
                let queue = core.delivery.status().await?;
                Ok(json!({
                    "ok": true,
                    "version": crate::VERSION,
                    "protocol": PROTOCOL_VERSION,
                    "uptimeMs": core.uptime_ms(),
                    "channels": core.channels.ids(),
                    "pendingDeliveries": queue.pending,
                    "agent": core.agent.is_some(),
                }))
            }
        }),
    );

    let c = core.clone();
    methods.register(
        "sessions.record",
        TypedMethod::new(move |p: SessionsRecordParams, _ctx: Arc<ConnectionContext>| {
            let core = c.clone();
            async move {
                if !is_valid_agent_id(&p.agent_id) {
                    return Err(Error::Validation(format!("invalid agentId: {}", p.agent_id)));
                }
                let recorded = core
                    .sessions
                    .record_inbound(InboundRoute {
                        agent_id: p.agent_id,
                        channel: p.channel,
                        account_id: p.account_id,
                        peer: p.peer,
                        thread_id: p.thread_id,
                    })
                    .await?;
                Ok(SessionsRecordResult {
                    session_key: recorded.session_key,
                    session_id: recorded.session_id,
                    created: recorded.created,
                })
            }
        }),
    );

    let c = core.clone();
    methods.register(
        "sessions.resolve",
        TypedMethod::new(move |p: SessionsResolveParams, _ctx: Arc<ConnectionContext>| {
            let core = c.clone();
            async move {
                let request = TargetRequest {
                    to: p.to,
                    channel: p.channel,
                    account_id: p.account_id,
                    thread_id: p.thread_id,
                    announce: p.announce,
                };
                core.sessions.resolve_delivery_target(&p.session_key, &request).await
            }
        }),
    );

    let c = core.clone();
    methods.register(
        "sessions.list",
        TypedMethod::new(move |p: SessionsListParams, _ctx: Arc<ConnectionContext>| {
            let core = c.clone();
            async move {
                let filter = ListFilter {
                    agent_id: p.agent_id,
                    active_within_ms: p.active_minutes.map(|m| m.saturating_mul(60_000)),
                    limit: p.limit,
                };
                let sessions = core.sessions.list(&filter).await?;
                Ok(json!({ "count": sessions.len(), "sessions": sessions }))
            }
        }),
    );

    let c = core.clone();
    methods.register(
        "send",
        TypedMethod::new(move |p: SendParams, ctx: Arc<ConnectionContext>| {
            let core = c.clone();
            async move { send(&core, p, &ctx).await }
        }),
    );

    if core.agent.is_some() {
        let c = core.clone();
        methods.register(
            "agent",
            TypedMethod::new(move |p: AgentParams, _ctx: Arc<ConnectionContext>| {
                let core = c.clone();
                async move {
                    let runner = core
                        .agent
                        .clone()
                        .ok_or_else(|| Error::Internal("agent runtime detached".into()))?;
                    let run_id = runner
                        .start(AgentRunParams {
                            session_key: p.session_key,
                            message: p.message,
                            target: TargetRequest {
                                to: p.to,
                                announce: p.announce,
                                ..TargetRequest::default()
                            },
                            run_id: p.run_id,
                        })
                        .await?;
                    Ok(AgentAccepted {
                        run_id,
                        status: "accepted".to_string(),
                    })
                }
            }),
        );
    }

    let c = core.clone();
    methods.register(
        "chat.abort",
        TypedMethod::new(move |p: ChatAbortParams, _ctx: Arc<ConnectionContext>| {
            let core = c.clone();
            async move {
                let result = match p {
                    ChatAbortParams::Run { run_id } => ChatAbortResult {
                        aborted: core.bus.abort_run(&run_id),
                        run_id: Some(run_id),
                    },
                    ChatAbortParams::Session { session_key } => {
                        let run_id = core.bus.abort_session(&session_key);
                        ChatAbortResult {
                            aborted: run_id.is_some(),
                            run_id,
                        }
                    }
                };
                Ok(result)
            }
        }),
    );

    let c = core.clone();
    methods.register(
        "tools.status",
        TypedMethod::new(move |_: EmptyParams, _ctx: Arc<ConnectionContext>| {
            let core = c.clone();
            async move {
                Ok(json!({
                    "tools": core.tools.names(),
                    "circuits": core.tools.circuit_snapshots(),
                }))
            }
        }),
    );

    let c = core.clone();
    methods.register(
        "queue.status",
        TypedMethod::new(move |_: EmptyParams, _ctx: Arc<ConnectionContext>| {
            let core = c.clone();
            async move { core.delivery.status().await }
        }),
    );

    // `connect` advertises everything registered so far, plus itself
    let mut names = methods.names();
    names.push("connect".to_string());
    names.sort();
    let c = core;
    methods.register(
        "connect",
        TypedMethod::public(move |p: ConnectParams, ctx: Arc<ConnectionContext>| {
            let core = c.clone();
            let methods = names.clone();
            async move { connect(&core, p, &ctx, methods) }
        }),
    );

    methods
}

/// Pick the highest version both sides speak
pub fn negotiate_protocol(min: u32, max: u32) -> Result<u32> {
    let low = min.max(MIN_SUPPORTED_PROTOCOL);
    let high = max.min(PROTOCOL_VERSION);
    if min > max || low > high {
        return Err(Error::Protocol(format!(
            "protocol mismatch: client speaks {}..={}, server speaks {}..={}",
            min, max, MIN_SUPPORTED_PROTOCOL, PROTOCOL_VERSION
        )));
    }
    Ok(high)
}

fn connect(core: &GatewayCore, p: ConnectParams, ctx: &ConnectionContext, methods: Vec<String>) -> Result<HelloOk> {
    if ctx.is_authenticated() {
        return Err(Error::Protocol("connection already established".into()));
    }
    let protocol = negotiate_protocol(p.min_protocol, p.max_protocol)?;
    core.auth.authorize(&ctx.identity, ctx.remote_addr, p.auth.as_ref())?;

    info!(
        conn_id = %ctx.conn_id,
        client = %p.client.id,
        client_version = %p.client.version,
        protocol,
        "client connected"
    );
    ctx.complete_handshake(Handshake {
        client: p.client,
        protocol,
        caps: p.caps,
    })?;

    Ok(HelloOk {
        kind: "hello-ok".to_string(),
        protocol,
        server: ServerInfo {
            version: crate::VERSION.to_string(),
            conn_id: ctx.conn_id.clone(),
        },
        methods,
        events: events::all(),
    })
}

async fn send(core: &GatewayCore, p: SendParams, ctx: &ConnectionContext) -> Result<SendResult> {
    if p.payloads.is_empty() {
        return Err(Error::Validation("payloads must not be empty".into()));
    }
    if p.idempotency_key.trim().is_empty() {
        return Err(Error::Validation("idempotencyKey must not be empty".into()));
    }

    let target = match &p.session_key {
        Some(key) => {
            let request = TargetRequest {
                to: p.to.clone(),
                channel: p.channel.clone(),
                account_id: p.account_id.clone(),
                thread_id: p.thread_id.clone(),
                announce: p.announce,
            };
            core.sessions.resolve_delivery_target(key, &request).await?
        }
        None => {
            let (Some(channel), Some(to)) = (p.channel.clone(), p.to.clone()) else {
                return Err(Error::Validation("either sessionKey or channel and to are required".into()));
            };
            if !core.channels.is_deliverable(&channel) {
                return Err(Error::ChannelUnavailable(channel));
            }
            DeliveryTarget {
                channel,
                to,
                account_id: p.account_id.clone(),
                thread_id: if p.announce { None } else { p.thread_id.clone() },
            }
        }
    };

    let mut entry = QueuedDelivery::new(target, p.payloads, core.clock.now_ms()).with_idempotency_key(p.idempotency_key);
    if let Some(key) = p.session_key {
        entry = entry.with_session(key);
    }
    let id = entry.id.clone();
    let (channel, to) = (entry.channel.clone(), entry.to.clone());
    let status = core.delivery.send(entry).await?;
    info!(conn_id = %ctx.conn_id, entry_id = %id, channel = %channel, status = ?status, "send accepted");

    Ok(SendResult { id, status, channel, to })
}
