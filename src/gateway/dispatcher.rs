//! Method dispatch
//!
//! Every request goes through the same pipeline: parse the params against
//! the method's closed schema, check the connection is authenticated, then
//! run the handler. Handler errors are mapped to wire errors here and
//! nowhere else.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use super::protocol::schema::ErrorFrame;
use super::protocol::{error_codes, ClientInfo, GatewayFrame, ProtocolError, RequestFrame, ResponseFrame};
use crate::error::{Error, Result};

/// Outcome of a completed `connect`
#[derive(Debug, Clone)]
pub struct Handshake {
    pub client: ClientInfo,
    pub protocol: u32,
    pub caps: Vec<String>,
}

/// Per-connection state visible to handlers
#[derive(Debug)]
pub struct ConnectionContext {
    pub conn_id: String,
    pub remote_addr: Option<SocketAddr>,
    /// Rate-limit key for this peer
    pub identity: String,
    handshake: OnceLock<Handshake>,
}

impl ConnectionContext {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        ConnectionContext {
            conn_id: uuid::Uuid::new_v4().to_string(),
            remote_addr,
            identity: remote_addr
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            handshake: OnceLock::new(),
        }
    }

    /// Record a successful handshake. Fails if one already happened.
    pub fn complete_handshake(&self, handshake: Handshake) -> Result<()> {
        self.handshake
            .set(handshake)
            .map_err(|_| Error::Protocol("connection already established".into()))
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.handshake.get().is_some()
    }
}

/// Validated call ready to run
pub type PreparedCall = BoxFuture<'static, Result<Value>>;

/// A named RPC method
pub trait MethodHandler: Send + Sync {
    /// Parse params against the method's schema. A failure here never
    /// reaches the handler.
    fn prepare(&self, params: Value, ctx: Arc<ConnectionContext>) -> Result<PreparedCall>;

    /// Whether the method needs a completed handshake
    fn requires_auth(&self) -> bool {
        true
    }
}

/// Handler over a typed, closed params struct
pub struct TypedMethod<P, F> {
    handler: F,
    requires_auth: bool,
    _params: PhantomData<fn() -> P>,
}

impl<P, F> TypedMethod<P, F> {
    pub fn new<Fut, R>(handler: F) -> Self
    where
        F: Fn(P, Arc<ConnectionContext>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        TypedMethod {
            handler,
            requires_auth: true,
            _params: PhantomData,
        }
    }

    /// Callable before the handshake
    pub fn public<Fut, R>(handler: F) -> Self
    where
        F: Fn(P, Arc<ConnectionContext>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        TypedMethod {
            handler,
            requires_auth: false,
            _params: PhantomData,
        }
    }
}

impl<P, F, Fut, R> MethodHandler for TypedMethod<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, Arc<ConnectionContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Serialize,
{
    fn prepare(&self, params: Value, ctx: Arc<ConnectionContext>) -> Result<PreparedCall> {
        // Absent params are an empty object, so `{}`-only schemas accept them
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };
        let parsed: P = serde_json::from_value(params).map_err(|e| Error::Validation(e.to_string()))?;
        let call = (self.handler)(parsed, ctx);
        Ok(async move { Ok(serde_json::to_value(call.await?)?) }.boxed())
    }

    fn requires_auth(&self) -> bool {
        self.requires_auth
    }
}

/// Method lookup table
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        MethodRegistry::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl MethodHandler + 'static) {
        self.methods.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(name).cloned()
    }

    /// Method names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Routes request frames to method handlers
pub struct Dispatcher {
    methods: MethodRegistry,
}

impl Dispatcher {
    pub fn new(methods: MethodRegistry) -> Self {
        Dispatcher { methods }
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    /// Handle one raw text frame. Returns the frame to send back, if any.
    pub async fn dispatch_text(&self, text: &str, ctx: &Arc<ConnectionContext>) -> Option<GatewayFrame> {
        let raw: Value = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(conn_id = %ctx.conn_id, error = %e, "unparseable frame");
                return Some(GatewayFrame::Error(ErrorFrame {
                    id: None,
                    error: ProtocolError::parse_error("invalid JSON"),
                }));
            }
        };

        let frame: GatewayFrame = match serde_json::from_value(raw.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                let error = ProtocolError::invalid_request(format!("invalid frame: {}", e));
                return Some(match raw.get("id").and_then(Value::as_str) {
                    Some(id) => GatewayFrame::Response(ResponseFrame::error(id, error)),
                    None => GatewayFrame::Error(ErrorFrame { id: None, error }),
                });
            }
        };

        match frame {
            GatewayFrame::Request(request) => Some(GatewayFrame::Response(self.dispatch(request, ctx).await)),
            GatewayFrame::Ping { id } => Some(GatewayFrame::Pong { id }),
            other => {
                debug!(conn_id = %ctx.conn_id, frame = ?other, "ignoring client frame");
                None
            }
        }
    }

    /// Run the validate, authenticate, call pipeline for one request
    pub async fn dispatch(&self, request: RequestFrame, ctx: &Arc<ConnectionContext>) -> ResponseFrame {
        let RequestFrame { id, method, params } = request;

        let outcome = AssertUnwindSafe(self.run(&method, params, ctx)).catch_unwind().await;
        match outcome {
            Ok(Ok(result)) => ResponseFrame::success(id, result),
            Ok(Err(err)) => {
                let wire = err.to_protocol_error();
                if wire.code == error_codes::INTERNAL_ERROR {
                    error!(conn_id = %ctx.conn_id, method = %method, error = %err, "method failed");
                } else {
                    debug!(conn_id = %ctx.conn_id, method = %method, code = wire.code, "method rejected");
                }
                ResponseFrame::error(id, wire)
            }
            Err(_) => {
                error!(conn_id = %ctx.conn_id, method = %method, "method handler panicked");
                ResponseFrame::error(id, ProtocolError::internal("internal error"))
            }
        }
    }

    async fn run(&self, method: &str, params: Value, ctx: &Arc<ConnectionContext>) -> Result<Value> {
        let Some(handler) = self.methods.get(method) else {
            return Err(Error::MethodNotFound(method.to_string()));
        };
        let call = handler.prepare(params, ctx.clone())?;
        if handler.requires_auth() && !ctx.is_authenticated() {
            return Err(Error::AuthRequired);
        }
        call.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::protocol::EmptyParams;
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct EchoParams {
        text: String,
    }

    fn dispatcher() -> Dispatcher {
        let mut methods = MethodRegistry::new();
        methods.register(
            "echo",
            TypedMethod::new(|p: EchoParams, _ctx| async move { Ok(serde_json::json!({ "text": p.text })) }),
        );
        methods.register(
            "login",
            TypedMethod::public(|_: EmptyParams, ctx: Arc<ConnectionContext>| async move {
                ctx.complete_handshake(Handshake {
                    client: ClientInfo {
                        id: "test".into(),
                        version: "1".into(),
                        platform: None,
                        mode: None,
                    },
                    protocol: 3,
                    caps: vec![],
                })?;
                Ok(true)
            }),
        );
        methods.register(
            "explode",
            TypedMethod::public(|_: EmptyParams, _ctx| async move {
                Err::<(), _>(Error::Internal("db password is hunter2".into()))
            }),
        );
        methods.register(
            "panic",
            TypedMethod::public(|_: EmptyParams, _ctx| async move {
                if true {
                    panic!("handler bug");
                }
                Ok(())
            }),
        );
        Dispatcher::new(methods)
    }

    fn request(method: &str, params: Value) -> RequestFrame {
        RequestFrame {
            id: "1".into(),
            method: method.into(),
            params,
        }
    }

    fn code(response: &ResponseFrame) -> i32 {
        response.error.as_ref().map(|e| e.code).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_validation_runs_before_auth() {
        let d = dispatcher();
        let ctx = Arc::new(ConnectionContext::new(None));

        let bad = d.dispatch(request("echo", serde_json::json!({ "text": "hi", "x": 1 })), &ctx).await;
        assert_eq!(code(&bad), error_codes::INVALID_PARAMS);

        let unauth = d.dispatch(request("echo", serde_json::json!({ "text": "hi" })), &ctx).await;
        assert_eq!(code(&unauth), error_codes::AUTH_REQUIRED);

        let login = d.dispatch(request("login", Value::Null), &ctx).await;
        assert!(login.error.is_none());
        let ok = d.dispatch(request("echo", serde_json::json!({ "text": "hi" })), &ctx).await;
        assert_eq!(ok.result.unwrap()["text"], "hi");

        let again = d.dispatch(request("login", Value::Null), &ctx).await;
        assert_eq!(code(&again), error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let d = dispatcher();
        let ctx = Arc::new(ConnectionContext::new(None));
        let response = d.dispatch(request("nope", Value::Null), &ctx).await;
        assert_eq!(code(&response), error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_internal_errors_and_panics_are_masked() {
        let d = dispatcher();
        let ctx = Arc::new(ConnectionContext::new(None));

        let failed = d.dispatch(request("explode", Value::Null), &ctx).await;
        let err = failed.error.unwrap();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert_eq!(err.message, "internal error");

        let panicked = d.dispatch(request("panic", Value::Null), &ctx).await;
        assert_eq!(panicked.error.unwrap().message, "internal error");
    }

    #[tokio::test]
    async fn test_dispatch_text_frames() {
        let d = dispatcher();
        let ctx = Arc::new(ConnectionContext::new(None));

        let pong = d.dispatch_text(r#"{"type":"ping","id":"p1"}"#, &ctx).await;
        assert!(matches!(pong, Some(GatewayFrame::Pong { ref id }) if id == "p1"));

        let garbage = d.dispatch_text("{not json", &ctx).await;
        match garbage {
            Some(GatewayFrame::Error(frame)) => assert_eq!(frame.error.code, error_codes::PARSE_ERROR),
            other => panic!("unexpected {:?}", other),
        }

        let smuggled = d
            .dispatch_text(r#"{"type":"request","id":"7","method":"echo","params":{},"admin":true}"#, &ctx)
            .await;
        match smuggled {
            Some(GatewayFrame::Response(r)) => {
                assert_eq!(r.id, "7");
                assert_eq!(code(&r), error_codes::INVALID_REQUEST);
            }
            other => panic!("unexpected {:?}", other),
        }

        let ignored = d.dispatch_text(r#"{"type":"pong","id":"x"}"#, &ctx).await;
        assert!(ignored.is_none());
    }
}
