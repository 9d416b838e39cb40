//! Shared gateway runtime state
//!
//! `GatewayHub` owns the registries every connection, run task and
//! background loop works against. Registries sit behind short-lived
//! `std::sync::Mutex` locks that are never held across an await.

use super::broadcast::{Broadcaster, CloseSignal, ConnectionInfo};
use super::dispatch::MethodTable;
use crate::agent::{AgentBackend, AgentIntent};
use crate::channels::{
    deliver_reply, ChannelAdapter, ChannelEvent, ReplyTarget, WebhookAdapter,
};
use crate::chat::runner::{spawn_run, RunRequest};
use crate::chat::{
    CancelOutcome, ChatRunRegistry, CreateOutcome, Delivery, Ingest, RunEvent, RunRegistryConfig,
    RunSummary,
};
use crate::config::ClawGateConfig;
use crate::dedupe::DedupeCache;
use crate::error::{to_json, Error, Result};
use crate::nodes::NodeSubscriptionManager;
use crate::presence::{
    ChannelHealth, HealthInputs, PresenceEntry, PresenceRegistry, SessionDefaults, Snapshot,
    SnapshotCache, StateVersion,
};
use crate::protocol::params::ClientInfo;
use crate::session::{
    build_agent_main_session_key, canonicalize_main_session_alias, parse_agent_session_key,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Current Unix time in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Input for starting a chat run
#[derive(Debug, Clone)]
pub struct StartRun {
    pub session_key: String,
    pub client_run_id: String,
    /// Caller-chosen run id
    pub run_id: Option<String>,
    pub message: String,
    pub thinking: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Connection that asked for the run
    pub requester: Option<String>,
    pub reply: Option<ReplyTarget>,
}

/// Whether `start_run` launched a new run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub run_id: String,
    pub status: RunStatus,
}

/// Result of an abort request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortResult {
    pub aborted: bool,
    pub run_ids: Vec<String>,
}

/// Node view for `node.list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub node_id: String,
    pub connected: bool,
    pub conn_ids: Vec<String>,
    pub sessions: Vec<String>,
}

/// Shared gateway runtime
pub struct GatewayHub {
    config: ClawGateConfig,
    backend: Arc<dyn AgentBackend>,
    broadcaster: Broadcaster,
    methods: MethodTable,
    host: String,
    runs: Mutex<ChatRunRegistry>,
    nodes: Mutex<NodeSubscriptionManager>,
    dedupe: Mutex<DedupeCache>,
    snapshot: Mutex<SnapshotCache>,
    /// Last inbound route per session, with the time it was recorded
    routes: Mutex<HashMap<String, (ReplyTarget, u64)>>,
    channels: RwLock<BTreeMap<String, Arc<dyn ChannelAdapter>>>,
    webhooks: RwLock<HashMap<String, Arc<WebhookAdapter>>>,
    inbound_tx: mpsc::Sender<ChannelEvent>,
    shutdown: CancellationToken,
}

impl GatewayHub {
    pub fn new(
        config: ClawGateConfig,
        backend: Arc<dyn AgentBackend>,
        inbound_tx: mpsc::Sender<ChannelEvent>,
    ) -> Result<Self> {
        let methods = MethodTable::build()?;
        let runs = ChatRunRegistry::new(RunRegistryConfig {
            abort_grace_ms: config.runs.abort_grace_ms,
            eviction_grace_ms: config.runs.eviction_grace_ms,
            delta_throttle_ms: config.runs.delta_throttle_ms,
        });
        let dedupe = DedupeCache::new(config.dedupe.ttl_ms, config.dedupe.max_size);
        let presence = PresenceRegistry::new(config.presence.ttl_ms, config.presence.max_entries);
        let defaults = SessionDefaults {
            scope: config.session.scope,
            default_agent_id: config.session.agent_id.clone(),
            main_key: config.session.main_key.clone(),
            main_session_key: build_agent_main_session_key(
                &config.session.agent_id,
                Some(config.session.main_key.as_str()),
            ),
        };
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| config.gateway.host.clone());

        Ok(Self {
            backend,
            broadcaster: Broadcaster::new(),
            methods,
            host,
            runs: Mutex::new(runs),
            nodes: Mutex::new(NodeSubscriptionManager::new()),
            dedupe: Mutex::new(dedupe),
            snapshot: Mutex::new(SnapshotCache::new(presence, defaults)),
            routes: Mutex::new(HashMap::new()),
            channels: RwLock::new(BTreeMap::new()),
            webhooks: RwLock::new(HashMap::new()),
            inbound_tx,
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn config(&self) -> &ClawGateConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn AgentBackend> {
        &self.backend
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Sender for injecting channel events (webhooks, tests)
    pub fn inbound_sender(&self) -> mpsc::Sender<ChannelEvent> {
        self.inbound_tx.clone()
    }

    /// Gateway-wide shutdown signal
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Map main-bucket aliases onto the canonical key for this gateway
    pub fn canonical_session_key(&self, raw: &str) -> String {
        let agent_id = parse_agent_session_key(raw)
            .map(|(agent, _)| agent)
            .unwrap_or_else(|| self.config.session.agent_id.clone());
        canonicalize_main_session_alias(
            self.config.session.scope,
            &agent_id,
            &self.config.session.main_key,
            raw,
        )
    }

    // =========================================================================
    // Chat runs
    // =========================================================================

    /// Start a run, or report the active one for the same
    /// `(session_key, client_run_id)` pair.
    pub fn start_run(self: &Arc<Self>, request: StartRun) -> Result<RunStarted> {
        let now = now_ms();
        let outcome = {
            let mut runs = lock(&self.runs);
            match request.run_id.as_deref() {
                Some(run_id) => runs.create_with_id(
                    run_id,
                    &request.session_key,
                    &request.client_run_id,
                    request.requester.as_deref(),
                    now,
                )?,
                None => runs.create(
                    &request.session_key,
                    &request.client_run_id,
                    request.requester.as_deref(),
                    now,
                ),
            }
        };

        let handle = match outcome {
            CreateOutcome::Existing(handle) => {
                tracing::debug!(
                    run_id = %handle.run_id,
                    session_key = %handle.session_key,
                    "Duplicate chat.send joined in-flight run"
                );
                return Ok(RunStarted {
                    run_id: handle.run_id,
                    status: RunStatus::InFlight,
                });
            }
            CreateOutcome::Created(handle) => handle,
        };

        let agent_id = parse_agent_session_key(&handle.session_key)
            .map(|(agent, _)| agent)
            .unwrap_or_else(|| self.config.session.agent_id.clone());
        let timeout_ms = request
            .timeout_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.config.runs.agent_timeout_ms);
        let run_id = handle.run_id.clone();

        spawn_run(
            self.clone(),
            RunRequest {
                intent: AgentIntent {
                    run_id: run_id.clone(),
                    session_key: handle.session_key.clone(),
                    agent_id,
                    message: request.message,
                    thinking: request.thinking,
                },
                handle,
                timeout: Duration::from_millis(timeout_ms),
                reply: request.reply,
            },
        );

        Ok(RunStarted {
            run_id,
            status: RunStatus::Started,
        })
    }

    /// Apply a backend event and fan out whatever it produced
    pub fn ingest_run_event(&self, run_id: &str, event: RunEvent) -> Ingest {
        let ingest = lock(&self.runs).ingest(run_id, event, now_ms());
        if let Ingest::Deliver(delivery) = &ingest {
            self.publish_chat(delivery);
        }
        ingest
    }

    /// Abort one run of `session_key`
    pub fn abort_run(&self, session_key: &str, run_id: &str) -> Result<AbortResult> {
        let outcome = {
            let mut runs = lock(&self.runs);
            if let Some(entry) = runs.get(run_id) {
                if entry.session_key != session_key {
                    return Err(Error::InvalidRequest {
                        message: format!(
                            "run '{}' does not belong to session '{}'",
                            run_id, session_key
                        ),
                        fields: vec!["runId".to_string()],
                    });
                }
            }
            runs.cancel(run_id, now_ms())?
        };

        match outcome {
            CancelOutcome::Cancelled(delivery) => {
                self.publish_chat(&delivery);
                Ok(AbortResult {
                    aborted: true,
                    run_ids: vec![run_id.to_string()],
                })
            }
            CancelOutcome::AlreadyCancelled | CancelOutcome::AlreadyTerminal(_) => {
                Ok(AbortResult::default())
            }
        }
    }

    /// Abort every active run of `session_key`
    pub fn abort_session(&self, session_key: &str) -> AbortResult {
        let deliveries = lock(&self.runs).cancel_session(session_key, now_ms());
        for delivery in &deliveries {
            self.publish_chat(delivery);
        }
        AbortResult {
            aborted: !deliveries.is_empty(),
            run_ids: deliveries.into_iter().map(|d| d.event.run_id).collect(),
        }
    }

    /// Drain a run whose task has finished
    pub fn finish_run(&self, run_id: &str) {
        if lock(&self.runs).remove(run_id).is_some() {
            tracing::debug!(run_id, "Chat run drained");
        }
    }

    pub fn active_runs(&self, session_key: Option<&str>) -> Vec<RunSummary> {
        lock(&self.runs).active_runs(session_key)
    }

    pub fn active_run_count(&self) -> usize {
        lock(&self.runs).active_count()
    }

    /// Fan a chat event out.
    ///
    /// Operator connections get every chat event, node connections only
    /// the sessions they subscribe to, and the requester gets its own run
    /// exactly once. Deltas may be dropped for slow consumers; terminal
    /// events may not.
    pub fn publish_chat(&self, delivery: &Delivery) {
        let drop_if_slow = !delivery.event.state.is_terminal();
        let payload = to_json(&delivery.event);
        let text = match self.broadcaster.event_frame("chat", payload.clone(), None) {
            Ok((_, text)) => text,
            Err(e) => {
                tracing::error!(run_id = %delivery.event.run_id, error = %e, "Failed to encode chat event");
                return;
            }
        };

        let requester = delivery.requester.as_deref();
        let mut delivered: HashSet<String> = HashSet::new();
        for info in self.broadcaster.connections() {
            if !info.is_node() || Some(info.conn_id.as_str()) == requester {
                self.broadcaster
                    .send_text(&info.conn_id, text.clone(), drop_if_slow);
                delivered.insert(info.conn_id);
            }
        }

        let nodes = lock(&self.nodes);
        nodes.send_to_session(&delivery.event.session_key, "chat", &payload, |event| {
            for conn_id in self.broadcaster.node_connections(event.node_id) {
                if delivered.insert(conn_id.clone()) {
                    self.broadcaster.send_text(&conn_id, text.clone(), drop_if_slow);
                }
            }
        });
    }

    // =========================================================================
    // Connections, presence and nodes
    // =========================================================================

    /// Register an authenticated connection and announce its presence
    pub fn connection_opened(
        &self,
        info: ConnectionInfo,
        client: &ClientInfo,
        tx: mpsc::Sender<String>,
        close: CloseSignal,
    ) {
        let entry = PresenceEntry {
            instance_id: info.instance_id.clone(),
            host: client.display_name.clone(),
            ip: info.remote_addr.clone(),
            version: Some(client.version.clone()),
            platform: Some(client.platform.clone()),
            mode: Some(info.mode.as_str().to_string()),
            last_seen: now_ms(),
            device_id: client.device_id.clone(),
            roles: vec![info.role.as_str().to_string()],
            scopes: info.scopes.clone(),
            reason: Some("connect".to_string()),
        };
        tracing::info!(
            conn_id = %info.conn_id,
            role = info.role.as_str(),
            mode = info.mode.as_str(),
            client = %info.client_id,
            "Client connected"
        );
        self.broadcaster.register(info, tx, close);
        let version = lock(&self.snapshot).update_presence(entry);
        if let Some(version) = version {
            self.broadcast_presence(version);
        }
    }

    /// Forget a connection: presence, broadcaster slot and node subscriptions
    pub fn connection_closed(&self, conn_id: &str) {
        let Some(info) = self.broadcaster.unregister(conn_id) else {
            return;
        };
        tracing::info!(conn_id, "Client disconnected");

        if let Some(node_id) = info.node_id.as_deref() {
            if self.broadcaster.node_connections(node_id).is_empty() {
                let dropped = lock(&self.nodes).unsubscribe_all(node_id);
                if dropped > 0 {
                    tracing::debug!(node_id, dropped, "Removed node subscriptions");
                }
            }
        }

        let shared = self
            .broadcaster
            .connections()
            .iter()
            .any(|other| other.instance_id == info.instance_id);
        if !shared {
            let version = lock(&self.snapshot).remove_presence(&info.instance_id);
            if let Some(version) = version {
                self.broadcast_presence(version);
            }
        }
    }

    pub fn presence(&self) -> Vec<PresenceEntry> {
        lock(&self.snapshot).presence()
    }

    fn broadcast_presence(&self, version: StateVersion) {
        let presence = self.presence();
        if let Err(e) = self.broadcaster.broadcast(
            "presence",
            serde_json::json!({ "presence": presence }),
            Some(version),
            true,
        ) {
            tracing::warn!(error = %e, "Failed to broadcast presence");
        }
    }

    pub fn subscribe_node(&self, node_id: &str, session_key: &str) -> bool {
        lock(&self.nodes).subscribe(node_id, session_key)
    }

    pub fn unsubscribe_node(&self, node_id: &str, session_key: &str) -> bool {
        lock(&self.nodes).unsubscribe(node_id, session_key)
    }

    pub fn node_subscription_count(&self) -> usize {
        lock(&self.nodes).subscription_count()
    }

    /// Connected and subscribed nodes, sorted by id
    pub fn node_list(&self) -> Vec<NodeSummary> {
        let connected: HashSet<String> = self.broadcaster.connected_nodes().into_iter().collect();
        let nodes = lock(&self.nodes);
        let mut ids: Vec<String> = connected
            .iter()
            .cloned()
            .chain(nodes.subscribed_nodes())
            .collect();
        ids.sort();
        ids.dedup();
        ids.into_iter()
            .map(|node_id| NodeSummary {
                connected: connected.contains(&node_id),
                conn_ids: self.broadcaster.node_connections(&node_id),
                sessions: nodes.sessions_for(&node_id),
                node_id,
            })
            .collect()
    }

    // =========================================================================
    // Health and snapshot
    // =========================================================================

    fn health_inputs(&self) -> HealthInputs {
        let channels = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, adapter)| {
                let status = adapter.status();
                (
                    name.clone(),
                    ChannelHealth {
                        status: status.as_str().to_string(),
                        running: adapter.is_connected(),
                    },
                )
            })
            .collect();
        HealthInputs {
            connections: self.broadcaster.counts(),
            nodes: self.broadcaster.connected_nodes().len(),
            active_runs: self.active_run_count(),
            channels,
        }
    }

    /// Recompute health; returns the snapshot and whether the health
    /// version moved.
    pub fn refresh_health(&self) -> (Snapshot, bool) {
        let inputs = self.health_inputs();
        let mut cache = lock(&self.snapshot);
        let before = cache.state_version();
        let snapshot = cache.refresh(inputs, now_ms());
        let changed = snapshot.state_version != before;
        (snapshot, changed)
    }

    /// Refresh health and broadcast it when it changed
    pub fn refresh_and_broadcast_health(&self) -> Snapshot {
        let (snapshot, changed) = self.refresh_health();
        if changed {
            if let Err(e) = self.broadcaster.broadcast(
                "health",
                to_json(&snapshot.health),
                Some(snapshot.state_version),
                true,
            ) {
                tracing::warn!(error = %e, "Failed to broadcast health");
            }
        }
        snapshot
    }

    /// Cached snapshot with live presence
    pub fn snapshot(&self) -> Snapshot {
        lock(&self.snapshot).get_snapshot()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Broadcast a `tick`
    pub fn tick(&self) {
        let ts = now_ms();
        if let Err(e) = self
            .broadcaster
            .broadcast("tick", serde_json::json!({ "ts": ts }), None, true)
        {
            tracing::warn!(error = %e, "Failed to broadcast tick");
        }
    }

    /// Evict drained runs, stale presence and reply routes
    pub fn sweep(&self) {
        let now = now_ms();
        let evicted = lock(&self.runs).sweep(now);
        if evicted > 0 {
            tracing::debug!(evicted, "Swept chat runs");
        }

        let live = self.broadcaster.connections();
        let version = lock(&self.snapshot)
            .prune_presence(live.iter().map(|info| info.instance_id.as_str()), now);
        if let Some(version) = version {
            self.broadcast_presence(version);
        }

        let ttl = self.config.channels.route_ttl_ms;
        let mut routes = lock(&self.routes);
        let before = routes.len();
        routes.retain(|_, (_, seen_at)| now.saturating_sub(*seen_at) < ttl);
        let expired = before - routes.len();
        if expired > 0 {
            tracing::debug!(expired, "Swept reply routes");
        }
    }

    /// Tell every client the gateway is going away
    pub fn announce_shutdown(&self, reason: &str, restart_expected_ms: Option<u64>) {
        let mut data = serde_json::json!({ "reason": reason });
        if let Some(ms) = restart_expected_ms {
            data["restartExpectedMs"] = serde_json::json!(ms);
        }
        if let Err(e) = self.broadcaster.broadcast("shutdown", data, None, false) {
            tracing::warn!(error = %e, "Failed to broadcast shutdown");
        }
    }

    // =========================================================================
    // Inbound de-duplication and reply routing
    // =========================================================================

    /// Record `key`; true if it was already seen
    pub fn is_duplicate(&self, key: &str) -> bool {
        lock(&self.dedupe).check(key, Some(now_ms()))
    }

    /// Forget `key` so a redelivery is handled again
    pub fn forget_duplicate(&self, key: &str) {
        lock(&self.dedupe).remove(key);
    }

    pub fn remember_route(&self, session_key: &str, target: ReplyTarget) {
        lock(&self.routes).insert(session_key.to_string(), (target, now_ms()));
    }

    pub fn last_route(&self, session_key: &str) -> Option<ReplyTarget> {
        lock(&self.routes)
            .get(session_key)
            .map(|(target, _)| target.clone())
    }

    // =========================================================================
    // Channels
    // =========================================================================

    pub fn register_channel(&self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.name().to_string();
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, adapter);
    }

    pub fn register_webhook(&self, adapter: Arc<WebhookAdapter>) {
        let name = adapter.name().to_string();
        self.webhooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, adapter.clone());
        self.register_channel(adapter);
    }

    pub fn channel(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn webhook(&self, name: &str) -> Option<Arc<WebhookAdapter>> {
        self.webhooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn channels(&self) -> Vec<Arc<dyn ChannelAdapter>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Deliver a run's reply through its channel. Failures are logged.
    pub async fn deliver_reply(&self, target: &ReplyTarget, content: &str) {
        let Some(adapter) = self.channel(&target.channel) else {
            tracing::warn!(channel = %target.channel, "Reply dropped: unknown channel");
            return;
        };
        let timeout = Duration::from_millis(self.config.channels.send_timeout_ms);
        match deliver_reply(adapter, target.outbound(content), &self.config.channels.retry, timeout)
            .await
        {
            Ok(message_id) => tracing::debug!(
                channel = %target.channel,
                chat_id = %target.chat_id,
                message_id = %message_id,
                "Reply sent"
            ),
            Err(e) => tracing::warn!(
                channel = %target.channel,
                chat_id = %target.chat_id,
                error = %e.to_error_shape().message,
                "Reply delivery failed"
            ),
        }
    }
}
