//! Gateway server implementation

use super::broadcast::CLOSE_RESTART;
use super::handler::ApiHandler;
use super::hub::GatewayHub;
use super::inbound::InboundProcessor;
use crate::agent::{AgentBackend, EchoBackend};
use crate::channels::{ChannelAdapter, ChannelEvent, WebhookAdapter};
use crate::config::ClawGateConfig;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Gateway server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Not started
    Stopped,
    /// Starting up
    Starting,
    /// Running
    Running,
    /// Shutting down
    ShuttingDown,
}

/// ClawGate gateway server
pub struct Gateway {
    config: ClawGateConfig,
    state: Arc<RwLock<GatewayState>>,
    hub: Arc<GatewayHub>,
    channels: Vec<Arc<dyn ChannelAdapter>>,
    event_rx: Arc<RwLock<Option<mpsc::Receiver<ChannelEvent>>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Create a new gateway with the given configuration and agent backend
    pub fn new(config: ClawGateConfig, backend: Arc<dyn AgentBackend>) -> Result<Self> {
        Self::with_channels(config, backend, Vec::new())
    }

    fn with_channels(
        config: ClawGateConfig,
        backend: Arc<dyn AgentBackend>,
        channels: Vec<Arc<dyn ChannelAdapter>>,
    ) -> Result<Self> {
        config.validate()?;

        let mut names: HashSet<&str> = config
            .channels
            .webhooks
            .iter()
            .map(|w| w.name.as_str())
            .collect();
        for channel in &channels {
            if !names.insert(channel.name()) {
                return Err(Error::Config(format!(
                    "duplicate channel name '{}'",
                    channel.name()
                )));
            }
        }

        let (event_tx, event_rx) = mpsc::channel(1000);
        let hub = Arc::new(GatewayHub::new(config.clone(), backend, event_tx)?);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            hub,
            channels,
            event_rx: Arc::new(RwLock::new(Some(event_rx))),
            local_addr: RwLock::new(None),
            tasks: RwLock::new(Vec::new()),
        })
    }

    /// Get current state
    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    /// Start the gateway: bind the listener, then start channels and
    /// background loops.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Stopped {
            return Err(Error::Gateway("Gateway already running".to_string()));
        }
        if self.hub.shutdown_token().is_cancelled() {
            return Err(Error::Gateway("Gateway cannot be restarted".to_string()));
        }
        *state = GatewayState::Starting;
        drop(state);

        tracing::info!("Starting ClawGate gateway");

        let addr = format!("{}:{}", self.config.gateway.host, self.config.gateway.port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = GatewayState::Stopped;
                return Err(Error::Gateway(format!("Failed to bind {}: {}", addr, e)));
            }
        };
        let local_addr = listener.local_addr()?;
        *self.local_addr.write().await = Some(local_addr);

        let mut tasks = Vec::new();
        tasks.push(self.spawn_server(listener));
        tasks.push(self.init_channels().await);
        tasks.push(spawn_tick_loop(self.hub.clone()));
        tasks.push(spawn_health_loop(self.hub.clone()));
        self.tasks.write().await.extend(tasks);

        *self.state.write().await = GatewayState::Running;

        tracing::info!(addr = %local_addr, "ClawGate gateway started");

        Ok(())
    }

    /// Stop the gateway
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Running {
            return Ok(());
        }
        *state = GatewayState::ShuttingDown;
        drop(state);

        tracing::info!("Stopping ClawGate gateway");

        self.hub.announce_shutdown("gateway stopping", None);
        let mut sessions: Vec<String> = self
            .hub
            .active_runs(None)
            .into_iter()
            .map(|run| run.session_key)
            .collect();
        sessions.sort();
        sessions.dedup();
        for session_key in sessions {
            self.hub.abort_session(&session_key);
        }
        self.hub
            .broadcaster()
            .close_all(CLOSE_RESTART, "gateway shutting down");
        self.hub.shutdown_token().cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.write().await.drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(15), task).await.is_err() {
                tracing::warn!("Gateway task did not stop in time");
            }
        }

        *self.state.write().await = GatewayState::Stopped;

        tracing::info!("ClawGate gateway stopped");

        Ok(())
    }

    fn spawn_server(&self, listener: tokio::net::TcpListener) -> JoinHandle<()> {
        let router = ApiHandler::router(self.hub.clone());
        let shutdown = self.hub.shutdown_token().clone();
        tokio::spawn(async move {
            let server = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        })
    }

    /// Start every configured channel adapter under supervision, plus the
    /// processor consuming their events.
    async fn init_channels(&self) -> JoinHandle<()> {
        let mut processor = InboundProcessor::new(self.hub.clone());

        for webhook in &self.config.channels.webhooks {
            let adapter = Arc::new(WebhookAdapter::new(webhook.clone()));
            self.hub.register_webhook(adapter.clone());
            processor.supervise(adapter);
        }
        for channel in &self.channels {
            processor.supervise(channel.clone());
        }

        match self.event_rx.write().await.take() {
            Some(rx) => tokio::spawn(processor.run(rx)),
            None => tokio::spawn(async {}),
        }
    }

    /// Address the listener is bound to, once started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Get configuration
    pub fn config(&self) -> &ClawGateConfig {
        &self.config
    }

    /// Shared runtime state
    pub fn hub(&self) -> &Arc<GatewayHub> {
        &self.hub
    }

    /// Get event sender for injecting channel events
    pub fn event_sender(&self) -> mpsc::Sender<ChannelEvent> {
        self.hub.inbound_sender()
    }
}

fn interval(ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(ms.max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Broadcast `tick`, sweep drained runs and prune presence
fn spawn_tick_loop(hub: Arc<GatewayHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = hub.shutdown_token().clone();
        let mut ticks = interval(hub.config().gateway.tick_interval_ms);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    hub.tick();
                    hub.sweep();
                }
            }
        }
    })
}

/// Refresh health periodically, broadcasting when it changed
fn spawn_health_loop(hub: Arc<GatewayHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown: CancellationToken = hub.shutdown_token().clone();
        hub.refresh_and_broadcast_health();
        let mut refreshes = interval(hub.config().gateway.health_refresh_ms);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = refreshes.tick() => {
                    hub.refresh_and_broadcast_health();
                }
            }
        }
    })
}

/// Builder for Gateway
pub struct GatewayBuilder {
    config: ClawGateConfig,
    backend: Option<Arc<dyn AgentBackend>>,
    channels: Vec<Arc<dyn ChannelAdapter>>,
}

impl GatewayBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: ClawGateConfig::default(),
            backend: None,
            channels: Vec::new(),
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: ClawGateConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the gateway host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.gateway.host = host.into();
        self
    }

    /// Set the gateway port
    pub fn port(mut self, port: u16) -> Self {
        self.config.gateway.port = port;
        self
    }

    /// Set the agent backend (defaults to [`EchoBackend`])
    pub fn backend(mut self, backend: Arc<dyn AgentBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Add a channel adapter to run under supervision
    pub fn channel(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.channels.push(adapter);
        self
    }

    /// Build the gateway
    pub fn build(self) -> Result<Gateway> {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(EchoBackend::new()) as Arc<dyn AgentBackend>);
        Gateway::with_channels(self.config, backend, self.channels)
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
