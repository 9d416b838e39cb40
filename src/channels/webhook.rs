//! Generic webhook channel adapter
//!
//! Inbound messages are POSTed to `/webhook/<name>` as JSON; replies are
//! POSTed to the configured `callback_url`.

use super::adapter::{AdapterBase, AdapterStatus, ChannelAdapter, ChannelEvent};
use super::message::{InboundMessage, OutboundMessage};
use crate::config::WebhookChannelConfig;
use crate::error::{Error, Result};
use crate::session::ChatType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

/// Outcome of an inbound request authentication check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    Rejected { reason: String },
    /// No secret configured; the request is accepted unverified
    NotApplicable,
}

impl AuthOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Authenticated | Self::NotApplicable)
    }
}

/// Inbound webhook body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Defaults to the sender for direct chats
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub chat_type: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(alias = "text")]
    pub content: String,
    #[serde(default)]
    pub mention: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackResponse {
    message_id: Option<String>,
}

/// Webhook channel adapter
pub struct WebhookAdapter {
    config: WebhookChannelConfig,
    base: AdapterBase,
    client: reqwest::Client,
    event_tx: RwLock<Option<mpsc::Sender<ChannelEvent>>>,
}

impl WebhookAdapter {
    pub fn new(config: WebhookChannelConfig) -> Self {
        Self {
            base: AdapterBase::new(config.name.clone()),
            config,
            client: reqwest::Client::new(),
            event_tx: RwLock::new(None),
        }
    }

    /// Check the `Authorization` header against the configured secret
    pub fn verify_bearer(&self, authorization: Option<&str>) -> AuthOutcome {
        let Some(secret) = self.config.secret.as_deref().filter(|s| !s.is_empty()) else {
            return AuthOutcome::NotApplicable;
        };
        match authorization.and_then(|h| h.strip_prefix("Bearer ")) {
            None => AuthOutcome::Rejected {
                reason: "missing bearer token".into(),
            },
            Some(token) if token.trim() == secret => AuthOutcome::Authenticated,
            Some(_) => AuthOutcome::Rejected {
                reason: "invalid bearer token".into(),
            },
        }
    }

    /// Convert a webhook body into an inbound message
    pub fn parse_payload(&self, payload: WebhookPayload) -> Result<InboundMessage> {
        let mut fields = Vec::new();
        if payload.message_id.trim().is_empty() {
            fields.push("messageId".to_string());
        }
        if payload.sender_id.trim().is_empty() {
            fields.push("senderId".to_string());
        }
        if payload.content.trim().is_empty() {
            fields.push("content".to_string());
        }
        let chat_type = match payload.chat_type.as_deref() {
            None => ChatType::Direct,
            Some(raw) => match ChatType::parse(raw) {
                Some(kind) => kind,
                None => {
                    fields.push("chatType".to_string());
                    ChatType::Direct
                }
            },
        };
        if !fields.is_empty() {
            return Err(Error::InvalidRequest {
                message: format!("invalid webhook payload: {}", fields.join(", ")),
                fields,
            });
        }

        let chat_id = payload
            .chat_id
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| payload.sender_id.clone());
        let mut message = InboundMessage::new(
            self.name(),
            &payload.sender_id,
            &chat_id,
            &payload.content,
        );
        message.channel_message_id = payload.message_id;
        message.sender_name = payload.sender_name;
        message.account_id = self.config.account_id.clone();
        message.thread_id = payload.thread_id;
        message.chat_type = chat_type;
        message.is_mention = payload.mention;
        Ok(message)
    }

    /// Forward an inbound message to the gateway
    pub async fn accept(&self, payload: WebhookPayload) -> Result<InboundMessage> {
        if !self.base.is_running() {
            return Err(Error::Unavailable(format!(
                "channel '{}' is not running",
                self.name()
            )));
        }
        let message = self.parse_payload(payload)?;
        let tx = self.event_tx.read().await.clone();
        let Some(tx) = tx else {
            return Err(Error::Unavailable(format!(
                "channel '{}' is not running",
                self.name()
            )));
        };
        tx.send(ChannelEvent::Message(message.clone()))
            .await
            .map_err(|_| Error::Unavailable("gateway is shutting down".into()))?;
        Ok(message)
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn start(&self, event_tx: mpsc::Sender<ChannelEvent>) -> Result<()> {
        self.base.set_status(AdapterStatus::Starting);
        *self.event_tx.write().await = Some(event_tx.clone());

        tracing::info!(
            channel = %self.name(),
            outbound = self.config.callback_url.is_some(),
            "Webhook adapter starting"
        );

        let _ = event_tx
            .send(ChannelEvent::Connected {
                channel: self.name().to_string(),
            })
            .await;
        self.base.set_status(AdapterStatus::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.base.set_status(AdapterStatus::Stopping);
        if let Some(tx) = self.event_tx.write().await.take() {
            let _ = tx
                .send(ChannelEvent::Disconnected {
                    channel: self.name().to_string(),
                    reason: "Adapter stopped".to_string(),
                })
                .await;
        }
        self.base.set_status(AdapterStatus::Stopped);
        tracing::info!(channel = %self.name(), "Webhook adapter stopped");
        Ok(())
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<String> {
        if !self.base.is_running() {
            return Err(Error::Channel(format!(
                "channel '{}' is not running",
                self.name()
            )));
        }
        let Some(url) = self.config.callback_url.as_deref() else {
            return Err(Error::invalid(format!(
                "channel '{}' has no callback_url",
                self.name()
            )));
        };

        let mut request = self.client.post(url).json(&message);
        if let Some(secret) = self.config.secret.as_deref() {
            request = request.bearer_auth(secret);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("{} callback failed: {}", self.name(), e)))?;

        let status = response.status();
        if !status.is_success() {
            let err = format!("{} callback returned {}", self.name(), status);
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(Error::Unavailable(err))
            } else {
                Err(Error::Channel(err))
            };
        }

        let id = response
            .json::<CallbackResponse>()
            .await
            .ok()
            .and_then(|body| body.message_id)
            .unwrap_or_else(|| format!("{}-{}", self.name(), uuid::Uuid::new_v4()));
        tracing::debug!(channel = %self.name(), chat_id = %message.chat_id, message_id = %id, "Reply delivered");
        Ok(id)
    }

    fn status(&self) -> AdapterStatus {
        self.base.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(secret: Option<&str>) -> WebhookAdapter {
        WebhookAdapter::new(WebhookChannelConfig {
            name: "ops".into(),
            secret: secret.map(str::to_string),
            callback_url: None,
            account_id: Some("bot-1".into()),
        })
    }

    fn payload() -> WebhookPayload {
        WebhookPayload {
            message_id: "m-1".into(),
            sender_id: "u-1".into(),
            sender_name: Some("Dana".into()),
            chat_id: None,
            chat_type: None,
            thread_id: None,
            content: "hello".into(),
            mention: false,
        }
    }

    #[test]
    fn test_verify_bearer() {
        assert_eq!(adapter(None).verify_bearer(None), AuthOutcome::NotApplicable);

        let guarded = adapter(Some("hook-secret"));
        assert!(guarded.verify_bearer(Some("Bearer hook-secret")).is_allowed());
        assert!(!guarded.verify_bearer(Some("Bearer nope")).is_allowed());
        assert!(!guarded.verify_bearer(None).is_allowed());
    }

    #[test]
    fn test_parse_payload_defaults_chat_to_sender() {
        let msg = adapter(None).parse_payload(payload()).unwrap();
        assert_eq!(msg.channel, "ops");
        assert_eq!(msg.chat_id, "u-1");
        assert_eq!(msg.channel_message_id, "m-1");
        assert_eq!(msg.account_id.as_deref(), Some("bot-1"));
        assert!(msg.is_dm());
    }

    #[test]
    fn test_parse_payload_names_bad_fields() {
        let mut bad = payload();
        bad.content = "  ".into();
        bad.chat_type = Some("broadcast".into());
        match adapter(None).parse_payload(bad).unwrap_err() {
            Error::InvalidRequest { fields, .. } => {
                assert_eq!(fields, vec!["content".to_string(), "chatType".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_payload_accepts_text_alias() {
        let parsed: WebhookPayload = serde_json::from_value(serde_json::json!({
            "messageId": "m-2",
            "senderId": "u-2",
            "chatId": "room",
            "chatType": "group",
            "text": "hi all"
        }))
        .unwrap();
        assert_eq!(parsed.content, "hi all");
        assert_eq!(parsed.chat_type.as_deref(), Some("group"));
    }

    #[tokio::test]
    async fn test_accept_forwards_message() {
        let adapter = adapter(None);
        let (tx, mut rx) = mpsc::channel(4);
        adapter.start(tx).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ChannelEvent::Connected { .. })));

        adapter.accept(payload()).await.unwrap();
        match rx.recv().await {
            Some(ChannelEvent::Message(msg)) => assert_eq!(msg.content, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        adapter.stop().await.unwrap();
        assert!(matches!(rx.recv().await, Some(ChannelEvent::Disconnected { .. })));
        assert!(adapter.accept(payload()).await.is_err());
    }

    #[tokio::test]
    async fn test_send_without_callback_is_rejected() {
        let adapter = adapter(None);
        let (tx, _rx) = mpsc::channel(4);
        adapter.start(tx).await.unwrap();
        let err = adapter
            .send_message(OutboundMessage::new("ops", "u-1", "reply"))
            .await
            .unwrap_err();
        assert!(!err.retryable());
    }
}
