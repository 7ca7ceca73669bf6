//! Gateway core
//!
//! Owns every registry the gateway needs: rate limiter, authenticator,
//! channels, sessions, delivery, tools and the event bus. One instance is
//! built at startup and shared by handle; tests build their own.

use std::sync::Arc;

use super::auth::Authenticator;
use super::rate_limit::RateLimiter;
use crate::agent::{AgentRunner, AgentRuntime};
use crate::channels;
use crate::config::{Config, ControlUiConfig, GatewayConfig};
use crate::core::channel::ChannelRegistry;
use crate::core::{Clock, SystemClock};
use crate::delivery::{ChannelDeliverer, DeliveryQueue, DeliveryService};
use crate::error::Result;
use crate::events::AgentEventBus;
use crate::sessions::{SessionDirectory, SessionStore};
use crate::tools::ToolRegistry;

pub struct GatewayCore {
    pub config: GatewayConfig,
    pub clock: Arc<dyn Clock>,
    pub limiter: Arc<RateLimiter>,
    pub auth: Authenticator,
    pub channels: Arc<ChannelRegistry>,
    pub sessions: Arc<SessionDirectory>,
    pub delivery: Arc<DeliveryService>,
    pub tools: Arc<ToolRegistry>,
    pub bus: AgentEventBus,
    pub agent: Option<Arc<AgentRunner>>,
    started_at: u64,
}

impl GatewayCore {
    /// Build a core with the given channels and tools
    pub fn new(config: &Config, clock: Arc<dyn Clock>, channels: ChannelRegistry, tools: ToolRegistry) -> Self {
        let state_dir = config.resolved_state_dir();
        let channels = Arc::new(channels);

        let limiter = Arc::new(RateLimiter::new(config.gateway.rate_limit.clone(), clock.clone()));
        let auth = Authenticator::new(&config.gateway.auth, limiter.clone());

        let store = SessionStore::new(&state_dir, &config.session, clock.clone());
        let sessions = Arc::new(SessionDirectory::new(
            store,
            channels.clone(),
            clock.clone(),
            config.session.fresh_within.as_millis() as u64,
        ));

        let deliverer = Arc::new(ChannelDeliverer::new(channels.clone()).with_sessions(sessions.clone()));
        let delivery = Arc::new(DeliveryService::new(
            DeliveryQueue::new(&state_dir),
            deliverer,
            clock.clone(),
            &config.delivery,
        ));

        GatewayCore {
            config: config.gateway.clone(),
            started_at: clock.now_ms(),
            bus: AgentEventBus::new(clock.clone()),
            clock,
            limiter,
            auth,
            channels,
            sessions,
            delivery,
            tools: Arc::new(tools),
            agent: None,
        }
    }

    /// Build a core from configuration alone: webhook channels, no tools,
    /// system clock
    pub fn from_config(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let channels = channels::build_registry(&config.channels)?;
        let tools = ToolRegistry::new(&config.tools, clock.clone());
        Ok(GatewayCore::new(config, clock, channels, tools))
    }

    /// Attach an agent runtime; enables the `agent` method
    pub fn with_runtime(mut self, runtime: Arc<dyn AgentRuntime>) -> Self {
        self.agent = Some(Arc::new(AgentRunner::new(
            runtime,
            self.sessions.clone(),
            self.delivery.clone(),
            self.tools.clone(),
            self.bus.clone(),
            self.clock.clone(),
        )));
        self
    }

    pub fn control_ui(&self) -> &ControlUiConfig {
        &self.config.control_ui
    }

    pub fn uptime_ms(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.started_at)
    }
}
