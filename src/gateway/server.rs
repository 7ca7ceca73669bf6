//! WebSocket server
//!
//! `/ws` carries the gateway protocol, `/health` is a plain HTTP liveness
//! check. Each connection gets one writer task fed by a bounded queue:
//! responses wait for room, pushed events are dropped when the client
//! falls behind so a slow socket never stalls the event bus.
//!
//! After the handshake every request runs on its own task, up to
//! [`MAX_CONCURRENT_REQUESTS`] per connection, so a slow `send` or `agent`
//! call never delays `chat.abort` or shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::core::GatewayCore;
use super::dispatcher::{ConnectionContext, Dispatcher};
use super::methods;
use super::origin::check_browser_origin;
use super::protocol::schema::ErrorFrame;
use super::protocol::{events, EventFrame, GatewayFrame, ProtocolError};
use crate::error::{Error, Result};
use crate::events::{AgentEvent, AgentEventBus, Subscription};

/// Close code sent when the handshake does not arrive in time
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code sent on shutdown
const CLOSE_GOING_AWAY: u16 = 1001;
/// Requests one connection may have running at once
pub const MAX_CONCURRENT_REQUESTS: usize = 16;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    core: Arc<GatewayCore>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(core: Arc<GatewayCore>, shutdown: CancellationToken) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(methods::build(core.clone())));
        AppState {
            core,
            dispatcher,
            shutdown,
        }
    }
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` fires
pub async fn serve(core: Arc<GatewayCore>, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", core.config.bind, core.config.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid bind address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "gateway listening on ws://{}/ws", addr);

    let app = router(AppState::new(core, shutdown.clone()));
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("gateway stopped");
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "version": crate::VERSION,
        "uptimeMs": state.core.uptime_ms(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = origin_guard(&headers, &state.core, addr) {
        return response;
    }

    let max = state.core.config.max_payload_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Refuse browser upgrades from foreign origins before any protocol work
fn origin_guard(headers: &HeaderMap, core: &GatewayCore, addr: SocketAddr) -> std::result::Result<(), Response> {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    check_browser_origin(origin, host, core.control_ui()).map_err(|rejection| {
        warn!(peer = %addr, host = host.unwrap_or(""), reason = %rejection, "browser origin rejected");
        (StatusCode::FORBIDDEN, "origin not allowed").into_response()
    })
}

async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let ctx = Arc::new(ConnectionContext::new(Some(addr)));
    debug!(conn_id = %ctx.conn_id, peer = %addr, "websocket opened");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.core.config.event_buffer.max(1));
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let deadline = tokio::time::Instant::now() + state.core.config.handshake_timeout;
    let mut subscription: Option<Subscription> = None;
    let requests = Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS));
    let mut tasks = JoinSet::new();

    loop {
        while tasks.try_join_next().is_some() {}

        let next = tokio::select! {
            _ = state.shutdown.cancelled() => {
                if ctx.is_authenticated() {
                    let frame = GatewayFrame::Event(EventFrame::new(events::SHUTDOWN, json!({ "reason": "gateway stopping" })));
                    let _ = send_frame(&tx, &frame).await;
                }
                let _ = tx.send(close(CLOSE_GOING_AWAY, "shutdown")).await;
                break;
            }
            _ = tokio::time::sleep_until(deadline), if !ctx.is_authenticated() => {
                warn!(conn_id = %ctx.conn_id, peer = %addr, "handshake timeout");
                let _ = tx.send(close(CLOSE_POLICY_VIOLATION, "handshake timeout")).await;
                break;
            }
            message = stream.next() => message,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(conn_id = %ctx.conn_id, error = %e, "websocket receive error");
                break;
            }
            None => break,
        };

        match message {
            Message::Text(text) if !ctx.is_authenticated() => {
                // Nothing may overtake the handshake
                if let Some(reply) = state.dispatcher.dispatch_text(text.as_str(), &ctx).await {
                    if send_frame(&tx, &reply).await.is_err() {
                        break;
                    }
                }
                if subscription.is_none() && ctx.is_authenticated() {
                    subscription = Some(push_events(&state.core.bus, tx.clone(), ctx.conn_id.clone()));
                }
            }
            Message::Text(text) => {
                let permit = tokio::select! {
                    _ = state.shutdown.cancelled() => continue,
                    permit = requests.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                spawn_dispatch(
                    &mut tasks,
                    state.dispatcher.clone(),
                    ctx.clone(),
                    tx.clone(),
                    text.as_str().to_owned(),
                    permit,
                );
            }
            Message::Binary(_) => {
                let frame = GatewayFrame::Error(ErrorFrame {
                    id: None,
                    error: ProtocolError::invalid_request("binary frames are not supported"),
                });
                if send_frame(&tx, &frame).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            // Ping/pong is answered by the websocket layer
            _ => {}
        }
    }

    if let Some(subscription) = subscription {
        subscription.unsubscribe();
    }
    // The peer is gone; outstanding replies have nowhere to go
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
    debug!(conn_id = %ctx.conn_id, "websocket closed");
}

/// Run one request off the receive loop and queue its reply
fn spawn_dispatch(
    tasks: &mut JoinSet<()>,
    dispatcher: Arc<Dispatcher>,
    ctx: Arc<ConnectionContext>,
    tx: mpsc::Sender<Message>,
    text: String,
    permit: OwnedSemaphorePermit,
) {
    tasks.spawn(async move {
        let _permit = permit;
        if let Some(reply) = dispatcher.dispatch_text(&text, &ctx).await {
            if send_frame(&tx, &reply).await.is_err() {
                debug!(conn_id = %ctx.conn_id, "reply dropped, connection closed");
            }
        }
    });
}

/// Forward agent events to one connection without ever blocking the emitter
fn push_events(bus: &AgentEventBus, tx: mpsc::Sender<Message>, conn_id: String) -> Subscription {
    bus.subscribe(move |event: &AgentEvent| {
        let frame = GatewayFrame::Event(event_frame(event));
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "failed to encode agent event");
                return;
            }
        };
        match tx.try_send(Message::Text(text.into())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %conn_id, run_id = %event.run_id, seq = event.seq, "client too slow, agent event dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    })
}

fn event_frame(event: &AgentEvent) -> EventFrame {
    EventFrame {
        event: events::AGENT.to_string(),
        data: serde_json::to_value(event).unwrap_or_default(),
        session_key: event.session_key.clone(),
        timestamp: Some(event.ts as i64),
    }
}

async fn send_frame(tx: &mpsc::Sender<Message>, frame: &GatewayFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    tx.send(Message::Text(text.into()))
        .await
        .map_err(|_| Error::Internal("connection writer closed".into()))
}

fn close(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
