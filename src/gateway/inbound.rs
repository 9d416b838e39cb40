//! Channel event processing
//!
//! Inbound messages are de-duplicated, mapped onto a session key and
//! turned into chat runs whose final reply goes back through the
//! originating adapter. Adapter lifecycle events drive the supervisors.

use super::hub::{GatewayHub, RunStarted, StartRun};
use crate::channels::{
    spawn_supervised, ChannelAdapter, ChannelEvent, InboundMessage, ReplyTarget, RestartPolicy,
    Supervised,
};
use crate::dedupe::inbound_message_key;
use crate::error::Result;
use crate::privacy::redact_secrets;
use crate::session::resolve_session_key;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Owns the channel supervisors and consumes their events
pub struct InboundProcessor {
    hub: Arc<GatewayHub>,
    supervisors: HashMap<String, Supervised>,
}

impl InboundProcessor {
    pub fn new(hub: Arc<GatewayHub>) -> Self {
        Self {
            hub,
            supervisors: HashMap::new(),
        }
    }

    /// Register `adapter` with the hub and start it under a supervisor
    pub fn supervise(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        let channels = &self.hub.config().channels;
        let policy = RestartPolicy {
            initial: Duration::from_millis(channels.restart_initial_ms),
            max: Duration::from_millis(channels.restart_max_ms),
        };
        let name = adapter.name().to_string();
        self.hub.register_channel(adapter.clone());
        let supervised = spawn_supervised(
            adapter,
            self.hub.inbound_sender(),
            policy,
            self.hub.shutdown_token().child_token(),
        );
        tracing::info!(channel = %name, "Channel adapter supervised");
        self.supervisors.insert(name, supervised);
    }

    /// Process events until shutdown, then wait for the supervisors
    pub async fn run(mut self, mut events: mpsc::Receiver<ChannelEvent>) {
        let shutdown = self.hub.shutdown_token().clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        for (name, supervised) in self.supervisors.drain() {
            if tokio::time::timeout(Duration::from_secs(10), supervised.join())
                .await
                .is_err()
            {
                tracing::warn!(channel = %name, "Channel supervisor did not stop in time");
            }
        }
        tracing::debug!("Channel event processor stopped");
    }

    fn handle(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => {
                if let Err(e) = handle_message(&self.hub, message) {
                    tracing::warn!(error = %e.to_error_shape().message, "Inbound message rejected");
                }
            }
            ChannelEvent::Connected { channel } => {
                tracing::info!(channel = %channel, "Channel connected");
                self.hub.refresh_and_broadcast_health();
            }
            ChannelEvent::Disconnected { channel, reason } => {
                tracing::warn!(channel = %channel, reason = %reason, "Channel disconnected");
                if let Some(supervised) = self.supervisors.get(&channel) {
                    supervised.request_restart();
                }
                self.hub.refresh_and_broadcast_health();
            }
            ChannelEvent::Error { channel, error } => {
                tracing::error!(channel = %channel, error = %redact_secrets(&error), "Channel error");
            }
        }
    }
}

/// Start a run for an inbound channel message.
///
/// Returns `None` for a message that was already handled.
pub fn handle_message(hub: &Arc<GatewayHub>, message: InboundMessage) -> Result<Option<RunStarted>> {
    let key = inbound_message_key(
        &message.channel,
        message.account_id.as_deref(),
        &message.chat_id,
        message.thread_id.as_deref(),
        &message.channel_message_id,
    );
    if hub.is_duplicate(&key) {
        tracing::debug!(channel = %message.channel, key = %key, "Duplicate inbound message dropped");
        return Ok(None);
    }

    let session = &hub.config().session;
    let ctx = message.session_context(&session.agent_id);
    let session_key = resolve_session_key(session.scope, &ctx, &session.main_key);
    let target = ReplyTarget::from_inbound(&message);

    let message_id = if message.channel_message_id.is_empty() {
        message.id.as_str()
    } else {
        message.channel_message_id.as_str()
    };
    tracing::debug!(
        channel = %message.channel,
        session_key = %session_key,
        message_id,
        "Inbound message"
    );

    let started = hub.start_run(StartRun {
        session_key: session_key.clone(),
        client_run_id: format!("{}:{}", message.channel, message_id),
        run_id: None,
        message: message.content,
        thinking: None,
        timeout_ms: None,
        requester: None,
        reply: Some(target.clone()),
    });
    match started {
        Ok(started) => {
            hub.remember_route(&session_key, target);
            Ok(Some(started))
        }
        Err(e) => {
            hub.forget_duplicate(&key);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedBackend;
    use crate::channels::testing::MockAdapter;
    use crate::gateway::hub::tests::{hub_with, wait_idle};
    use crate::session::ChatType;

    fn inbound(message_id: &str) -> InboundMessage {
        let mut message = InboundMessage::new("ops", "u-1", "u-1", "ping");
        message.channel_message_id = message_id.to_string();
        message
    }

    async fn hub_with_channel(reply: &[&str]) -> (Arc<GatewayHub>, Arc<MockAdapter>) {
        let hub = hub_with(Arc::new(ScriptedBackend::replying(reply)));
        let adapter = Arc::new(MockAdapter::new("ops"));
        hub.register_channel(adapter.clone());
        let (tx, _rx) = mpsc::channel(8);
        adapter.start(tx).await.unwrap();
        (hub, adapter)
    }

    #[tokio::test]
    async fn test_inbound_reply_round_trip() {
        let (hub, adapter) = hub_with_channel(&["pong"]).await;

        let started = handle_message(&hub, inbound("m-1")).unwrap().unwrap();
        wait_idle(&hub).await;

        let sent = adapter.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "pong");
        assert_eq!(sent[0].chat_id, "u-1");
        assert_eq!(sent[0].reply_to.as_deref(), Some("m-1"));
        assert!(!started.run_id.is_empty());

        let route = hub.last_route("agent:main:main").unwrap();
        assert_eq!(route.channel, "ops");
    }

    #[tokio::test]
    async fn test_duplicate_inbound_ignored() {
        let (hub, adapter) = hub_with_channel(&["pong"]).await;

        assert!(handle_message(&hub, inbound("m-1")).unwrap().is_some());
        wait_idle(&hub).await;
        assert!(handle_message(&hub, inbound("m-1")).unwrap().is_none());
        wait_idle(&hub).await;
        assert_eq!(adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_forgotten_message_is_handled_again() {
        let (hub, adapter) = hub_with_channel(&["pong"]).await;
        let key = inbound_message_key("ops", None, "u-1", None, "m-1");

        assert!(handle_message(&hub, inbound("m-1")).unwrap().is_some());
        wait_idle(&hub).await;
        hub.forget_duplicate(&key);
        assert!(handle_message(&hub, inbound("m-1")).unwrap().is_some());
        wait_idle(&hub).await;
        assert!(handle_message(&hub, inbound("m-1")).unwrap().is_none());
        assert_eq!(adapter.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_group_message_gets_isolated_session() {
        let (hub, _adapter) = hub_with_channel(&["ok"]).await;
        let mut message = inbound("m-9");
        message.chat_type = ChatType::Group;
        message.chat_id = "room-1".into();

        handle_message(&hub, message).unwrap();
        assert!(hub.last_route("agent:main:ops:group:room-1").is_some());
        assert!(hub.last_route("agent:main:main").is_none());
        wait_idle(&hub).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reply_is_retried() {
        let hub = hub_with(Arc::new(ScriptedBackend::replying(&["pong"])));
        let adapter = Arc::new(MockAdapter::new("ops").failing_sends(2));
        hub.register_channel(adapter.clone());
        let (tx, _rx) = mpsc::channel(8);
        adapter.start(tx).await.unwrap();

        handle_message(&hub, inbound("m-1")).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        wait_idle(&hub).await;

        assert_eq!(adapter.send_calls(), 3);
        assert_eq!(adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_processor_routes_events() {
        let hub = hub_with(Arc::new(ScriptedBackend::replying(&["pong"])));
        let adapter = Arc::new(MockAdapter::new("ops"));
        let (tx, rx) = mpsc::channel(8);
        let mut processor = InboundProcessor::new(hub.clone());
        processor.supervise(adapter.clone());
        let task = tokio::spawn(processor.run(rx));

        for _ in 0..100 {
            if adapter.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(ChannelEvent::Message(inbound("m-1"))).await.unwrap();
        for _ in 0..200 {
            if !adapter.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(adapter.sent().len(), 1);

        hub.shutdown_token().cancel();
        task.await.unwrap();
        assert!(!adapter.is_connected());
    }
}
