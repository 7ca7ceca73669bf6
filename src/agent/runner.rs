//! Agent run orchestration
//!
//! Resolves the session and its delivery target, registers the run on the
//! event bus, drives the runtime and hands the produced payloads to the
//! delivery service.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::runtime::{AgentRunRequest, AgentRuntime, RunHandle};
use crate::core::channel::DeliveryTarget;
use crate::core::Clock;
use crate::delivery::{DeliveryService, QueuedDelivery, SendStatus};
use crate::error::{Error, Result};
use crate::events::{AgentEventBus, EventStream, RunContext};
use crate::sessions::{SessionDirectory, TargetRequest};
use crate::tools::ToolRegistry;

/// Parameters for one agent run
#[derive(Debug, Clone)]
pub struct AgentRunParams {
    pub session_key: String,
    pub message: String,
    pub target: TargetRequest,
    /// Caller-chosen id; generated when absent
    pub run_id: Option<String>,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Aborted,
    Failed,
}

/// Result of a finished run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub deliveries: Vec<SendStatus>,
}

/// A run whose target is resolved and whose context is registered
struct PreparedRun {
    context: RunContext,
    request: AgentRunRequest,
    target: DeliveryTarget,
}

/// Drives agent runs for the gateway
pub struct AgentRunner {
    runtime: Arc<dyn AgentRuntime>,
    sessions: Arc<SessionDirectory>,
    delivery: Arc<DeliveryService>,
    tools: Arc<ToolRegistry>,
    bus: AgentEventBus,
    clock: Arc<dyn Clock>,
}

impl AgentRunner {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        sessions: Arc<SessionDirectory>,
        delivery: Arc<DeliveryService>,
        tools: Arc<ToolRegistry>,
        bus: AgentEventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        AgentRunner {
            runtime,
            sessions,
            delivery,
            tools,
            bus,
            clock,
        }
    }

    /// Run to completion
    pub async fn run(&self, params: AgentRunParams) -> Result<RunReport> {
        let prepared = self.prepare(params).await?;
        Ok(self.execute(prepared).await)
    }

    /// Resolve and register the run, then drive it on a background task.
    /// Returns the run id once the run is accepted.
    pub async fn start(self: &Arc<Self>, params: AgentRunParams) -> Result<String> {
        let prepared = self.prepare(params).await?;
        let run_id = prepared.context.run_id.clone();
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.execute(prepared).await;
        });
        Ok(run_id)
    }

    async fn prepare(&self, params: AgentRunParams) -> Result<PreparedRun> {
        let target = self
            .sessions
            .resolve_delivery_target(&params.session_key, &params.target)
            .await?;
        let session_id = self.sessions.get(&params.session_key).await?.map(|e| e.session_id);

        let run_id = params.run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let Some(context) = self.bus.try_register_run(&run_id, Some(&params.session_key)) else {
            return Err(Error::Validation(format!("run '{}' is already active", run_id)));
        };

        Ok(PreparedRun {
            request: AgentRunRequest {
                run_id,
                session_key: params.session_key,
                session_id,
                message: params.message,
            },
            context,
            target,
        })
    }

    async fn execute(&self, prepared: PreparedRun) -> RunReport {
        let PreparedRun {
            context,
            request,
            target,
        } = prepared;
        let run_id = context.run_id.clone();
        let session_key = request.session_key.clone();

        info!(run_id = %run_id, session_key = %session_key, channel = %target.channel, "agent run started");
        self.bus.emit(&run_id, EventStream::Lifecycle, json!({ "phase": "start" }));

        let handle = RunHandle::new(run_id.clone(), self.bus.clone(), self.tools.clone(), context.cancel.clone());
        let outcome = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => None,
            result = self.runtime.run(request, handle) => Some(result),
        };

        let report = match outcome {
            Some(Ok(output)) if !context.cancel.is_cancelled() => {
                match self.deliver(&run_id, &session_key, &target, output.payloads).await {
                    Ok(deliveries) => {
                        self.bus.emit(
                            &run_id,
                            EventStream::Lifecycle,
                            json!({ "phase": "end", "deliveries": deliveries }),
                        );
                        RunReport {
                            run_id: run_id.clone(),
                            status: RunStatus::Completed,
                            deliveries,
                        }
                    }
                    Err(e) => self.fail(&run_id, &e),
                }
            }
            Some(Err(e)) => self.fail(&run_id, &e),
            _ => {
                info!(run_id = %run_id, "agent run aborted before delivery");
                self.bus.emit(&run_id, EventStream::Lifecycle, json!({ "phase": "end", "aborted": true }));
                RunReport {
                    run_id: run_id.clone(),
                    status: RunStatus::Aborted,
                    deliveries: Vec::new(),
                }
            }
        };

        self.bus.clear_run(&run_id);
        report
    }

    /// One queue entry per payload, keyed `<runId>:<index>` so a retried
    /// entry can be deduplicated by the channel
    async fn deliver(
        &self,
        run_id: &str,
        session_key: &str,
        target: &DeliveryTarget,
        payloads: Vec<crate::core::channel::ReplyPayload>,
    ) -> Result<Vec<SendStatus>> {
        let mut statuses = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.into_iter().enumerate() {
            let entry = QueuedDelivery::new(target.clone(), vec![payload], self.clock.now_ms())
                .with_session(session_key)
                .with_idempotency_key(format!("{}:{}", run_id, index));
            let status = self.delivery.send(entry).await?;
            if status == SendStatus::Dropped {
                warn!(run_id = %run_id, index, channel = %target.channel, "agent reply dropped");
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    fn fail(&self, run_id: &str, e: &Error) -> RunReport {
        error!(run_id = %run_id, error = %e, "agent run failed");
        let message = e.to_protocol_error().message;
        self.bus.emit(run_id, EventStream::Error, json!({ "message": message }));
        self.bus.emit(run_id, EventStream::Lifecycle, json!({ "phase": "error" }));
        RunReport {
            run_id: run_id.to_string(),
            status: RunStatus::Failed,
            deliveries: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::runtime::AgentRunOutput;
    use crate::config::{DeliveryConfig, SessionConfig, ToolsConfig};
    use crate::core::channel::testing::RecordingChannel;
    use crate::core::channel::ChannelRegistry;
    use crate::core::ManualClock;
    use crate::delivery::{ChannelDeliverer, DeliveryQueue};
    use crate::events::AgentEvent;
    use crate::sessions::{InboundRoute, SessionStore};
    use crate::tools::testing::FlakyTool;
    use crate::tools::{CircuitState, ToolCall, ToolCallOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl AgentRuntime for Echo {
        async fn run(&self, request: AgentRunRequest, handle: RunHandle) -> Result<AgentRunOutput> {
            handle.emit(EventStream::Assistant, json!({ "text": request.message }));
            Ok(AgentRunOutput {
                payloads: vec![
                    crate::core::channel::ReplyPayload::text(format!("echo: {}", request.message)),
                    crate::core::channel::ReplyPayload::text("bye"),
                ],
            })
        }
    }

    struct UsesTool;

    #[async_trait]
    impl AgentRuntime for UsesTool {
        async fn run(&self, _request: AgentRunRequest, handle: RunHandle) -> Result<AgentRunOutput> {
            let mut open = 0;
            for _ in 0..3 {
                if let ToolCallOutcome::CircuitOpen { .. } = handle.call_tool("search", json!({})).await {
                    open += 1;
                }
            }
            Ok(AgentRunOutput::text(format!("search unavailable x{}", open)))
        }
    }

    struct SearchOnce;

    #[async_trait]
    impl AgentRuntime for SearchOnce {
        async fn run(&self, _request: AgentRunRequest, handle: RunHandle) -> Result<AgentRunOutput> {
            let outcome = handle.call_tool("search", json!({})).await;
            Ok(AgentRunOutput::text(format!("search finished: {}", !outcome.is_circuit_open())))
        }
    }

    struct WaitForAbort;

    #[async_trait]
    impl AgentRuntime for WaitForAbort {
        async fn run(&self, _request: AgentRunRequest, handle: RunHandle) -> Result<AgentRunOutput> {
            handle.cancellation().cancelled().await;
            Ok(AgentRunOutput::text("too late"))
        }
    }

    struct Fails;

    #[async_trait]
    impl AgentRuntime for Fails {
        async fn run(&self, _request: AgentRunRequest, _handle: RunHandle) -> Result<AgentRunOutput> {
            Err(Error::Internal("model exploded at /srv/secret".into()))
        }
    }

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        telegram: Arc<RecordingChannel>,
        bus: AgentEventBus,
        session_key: String,
        runner: Arc<AgentRunner>,
        tools: Arc<ToolRegistry>,
        search_calls: Arc<AtomicUsize>,
        search_healthy: Arc<AtomicBool>,
        search_stalled: Arc<AtomicBool>,
        events: Arc<Mutex<Vec<AgentEvent>>>,
    }

    async fn fixture(runtime: Arc<dyn AgentRuntime>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let telegram = RecordingChannel::new("telegram");
        let mut channels = ChannelRegistry::new();
        channels.register(telegram.clone());
        let channels = Arc::new(channels);

        let store = SessionStore::new(dir.path(), &SessionConfig::default(), clock.clone());
        let sessions = Arc::new(SessionDirectory::new(store, channels.clone(), clock.clone(), 60_000));
        let recorded = sessions
            .record_inbound(InboundRoute {
                agent_id: "main".into(),
                channel: "telegram".into(),
                account_id: None,
                peer: "42".into(),
                thread_id: None,
            })
            .await
            .unwrap();

        let deliverer = Arc::new(ChannelDeliverer::new(channels).with_sessions(sessions.clone()));
        let delivery = Arc::new(DeliveryService::new(
            DeliveryQueue::new(dir.path()),
            deliverer,
            clock.clone(),
            &DeliveryConfig::default(),
        ));

        let tools_config = ToolsConfig {
            circuit: crate::config::CircuitBreakerConfig {
                consecutive_failure_threshold: 2,
                half_open_probe_count: 1,
                half_open_success_threshold: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut tools = ToolRegistry::new(&tools_config, clock.clone());
        let search = FlakyTool::new("search");
        let search_calls = search.calls.clone();
        let search_healthy = search.healthy.clone();
        let search_stalled = search.stalled.clone();
        tools.register(search);
        let tools = Arc::new(tools);

        let bus = AgentEventBus::new(clock.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _ = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let runner = Arc::new(AgentRunner::new(
            runtime,
            sessions,
            delivery,
            tools.clone(),
            bus.clone(),
            clock.clone(),
        ));
        Fixture {
            _dir: dir,
            clock,
            telegram,
            bus,
            session_key: recorded.session_key,
            runner,
            tools,
            search_calls,
            search_healthy,
            search_stalled,
            events,
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    fn params(session_key: &str, run_id: &str) -> AgentRunParams {
        AgentRunParams {
            session_key: session_key.to_string(),
            message: "hello".into(),
            target: TargetRequest::default(),
            run_id: Some(run_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_run_delivers_each_payload_with_idempotency_key() {
        let f = fixture(Arc::new(Echo)).await;
        let report = f.runner.run(params(&f.session_key, "run-1")).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.deliveries, vec![SendStatus::Delivered, SendStatus::Delivered]);
        let sent = f.telegram.sent.lock().unwrap();
        let keys: Vec<_> = sent.iter().map(|r| r.idempotency_key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["run-1:0", "run-1:1"]);
        assert!(sent.iter().all(|r| r.to == "42"));
        drop(sent);

        let events = f.events.lock().unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(events[0].data["phase"], "start");
        assert_eq!(events[2].data["phase"], "end");
        drop(events);
        assert!(f.bus.run_context("run-1").is_none());
    }

    #[tokio::test]
    async fn test_open_circuit_reaches_the_runtime() {
        let f = fixture(Arc::new(UsesTool)).await;
        f.runner.run(params(&f.session_key, "run-1")).await.unwrap();

        let sent = f.telegram.sent.lock().unwrap();
        assert_eq!(sent[0].payloads[0].as_text(), Some("search unavailable x1"));
    }

    #[tokio::test]
    async fn test_abort_by_session_skips_delivery() {
        let f = fixture(Arc::new(WaitForAbort)).await;
        let run_id = f.runner.start(params(&f.session_key, "run-1")).await.unwrap();
        assert_eq!(run_id, "run-1");

        assert_eq!(f.bus.abort_session(&f.session_key).as_deref(), Some("run-1"));
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while f.bus.run_context("run-1").is_some() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("run did not finish");
        assert!(f.bus.run_context("run-1").is_none());
        assert!(f.telegram.sent.lock().unwrap().is_empty());
        assert!(!f.bus.abort_run("run-1"));
    }

    #[tokio::test]
    async fn test_duplicate_run_id_is_rejected_while_active() {
        let f = fixture(Arc::new(WaitForAbort)).await;
        f.runner.start(params(&f.session_key, "run-1")).await.unwrap();

        let err = f.runner.start(params(&f.session_key, "run-1")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        f.bus.abort_run("run-1");
        eventually("run to finish", || f.bus.run_context("run-1").is_none()).await;
        f.runner.start(params(&f.session_key, "run-1")).await.unwrap();
        f.bus.abort_run("run-1");
    }

    #[tokio::test]
    async fn test_abort_during_half_open_tool_call_frees_the_breaker() {
        let f = fixture(Arc::new(SearchOnce)).await;
        let call = ToolCall::new("search", json!({}));
        f.tools.execute(&call).await;
        f.tools.execute(&call).await;
        assert_eq!(f.tools.breakers().state("search"), CircuitState::Open);

        // The run's tool call takes the single half-open slot and hangs
        f.clock.advance(30_000);
        f.search_stalled.store(true, Ordering::SeqCst);
        f.runner.start(params(&f.session_key, "run-1")).await.unwrap();
        eventually("tool call to start", || f.search_calls.load(Ordering::SeqCst) == 3).await;
        assert_eq!(f.tools.breakers().state("search"), CircuitState::HalfOpen);

        assert_eq!(f.bus.abort_session(&f.session_key).as_deref(), Some("run-1"));
        eventually("run to finish", || f.bus.run_context("run-1").is_none()).await;
        assert!(f.telegram.sent.lock().unwrap().is_empty());

        f.search_stalled.store(false, Ordering::SeqCst);
        f.search_healthy.store(true, Ordering::SeqCst);
        match f.tools.execute(&call).await {
            ToolCallOutcome::Completed(r) => assert!(r.success),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.tools.breakers().state("search"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_runtime_error_is_not_leaked() {
        let f = fixture(Arc::new(Fails)).await;
        let report = f.runner.run(params(&f.session_key, "run-1")).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);

        let events = f.events.lock().unwrap();
        let error = events.iter().find(|e| e.stream == EventStream::Error).unwrap();
        assert_eq!(error.data["message"], "internal error");
    }

    #[tokio::test]
    async fn test_unknown_session_without_explicit_target_fails() {
        let f = fixture(Arc::new(Echo)).await;
        let err = f
            .runner
            .run(params("agent:main:telegram:default:nobody", "run-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoDeliveryTarget(_)));
        assert!(f.bus.run_context("run-1").is_none());
    }
}
