//! Channel message types

use crate::session::{ChatType, MsgContext};
use serde::{Deserialize, Serialize};

/// Message received from a chat platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Gateway-local message id
    pub id: String,
    /// Channel (adapter) name
    pub channel: String,
    /// Platform message id; the dedupe key is built from it
    pub channel_message_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    /// Conversation id (DM peer, group or channel)
    pub chat_id: String,
    /// Platform account the adapter is logged in as
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
    pub chat_type: ChatType,
    pub content: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub is_mention: bool,
}

impl InboundMessage {
    /// Create a direct message
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            channel_message_id: String::new(),
            sender_id: sender_id.to_string(),
            sender_name: None,
            chat_id: chat_id.to_string(),
            account_id: None,
            thread_id: None,
            chat_type: ChatType::Direct,
            content: content.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_mention: false,
        }
    }

    pub fn is_dm(&self) -> bool {
        self.chat_type == ChatType::Direct
    }

    /// Conversation identity for session key resolution
    pub fn session_context(&self, agent_id: &str) -> MsgContext {
        let group_id = (!self.is_dm()).then(|| self.chat_id.clone());
        MsgContext {
            session_key: None,
            from: Some(format!("{}:{}", self.channel, self.sender_id)),
            chat_type: self.chat_type,
            group_id,
            channel: Some(self.channel.clone()),
            agent_id: Some(agent_id.to_string()),
        }
    }
}

/// Message to send to a chat platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            reply_to: None,
            thread_id: None,
        }
    }

    /// Reply to a specific platform message
    pub fn reply_to(mut self, message_id: &str) -> Self {
        if !message_id.is_empty() {
            self.reply_to = Some(message_id.to_string());
        }
        self
    }

    pub fn in_thread(mut self, thread_id: Option<&str>) -> Self {
        self.thread_id = thread_id.map(str::to_string);
        self
    }
}

/// Where a run's final reply goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTarget {
    pub channel: String,
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl ReplyTarget {
    pub fn from_inbound(message: &InboundMessage) -> Self {
        Self {
            channel: message.channel.clone(),
            chat_id: message.chat_id.clone(),
            reply_to: (!message.channel_message_id.is_empty())
                .then(|| message.channel_message_id.clone()),
            thread_id: message.thread_id.clone(),
        }
    }

    /// Same conversation, without quoting a specific message
    pub fn route_only(&self) -> Self {
        Self {
            reply_to: None,
            ..self.clone()
        }
    }

    pub fn outbound(&self, content: &str) -> OutboundMessage {
        let message = OutboundMessage::new(&self.channel, &self.chat_id, content)
            .in_thread(self.thread_id.as_deref());
        match &self.reply_to {
            Some(id) => message.reply_to(id),
            None => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{resolve_session_key, SessionScope};

    #[test]
    fn test_direct_message_context() {
        let msg = InboundMessage::new("ops", "u-1", "u-1", "hi");
        assert!(msg.is_dm());
        let ctx = msg.session_context("main");
        assert_eq!(ctx.from.as_deref(), Some("ops:u-1"));
        assert!(ctx.group_id.is_none());
        assert_eq!(
            resolve_session_key(SessionScope::PerSender, &ctx, "main"),
            "agent:main:main"
        );
    }

    #[test]
    fn test_group_message_context() {
        let mut msg = InboundMessage::new("ops", "u-1", "Room-7", "hi");
        msg.chat_type = ChatType::Group;
        let key = resolve_session_key(SessionScope::PerSender, &msg.session_context("main"), "main");
        assert_eq!(key, "agent:main:ops:group:room-7");
    }

    #[test]
    fn test_reply_target_builds_outbound() {
        let mut msg = InboundMessage::new("ops", "u-1", "c-9", "hi");
        msg.channel_message_id = "m-42".into();
        msg.thread_id = Some("t-1".into());

        let target = ReplyTarget::from_inbound(&msg);
        let out = target.outbound("hello back");
        assert_eq!(out.chat_id, "c-9");
        assert_eq!(out.reply_to.as_deref(), Some("m-42"));
        assert_eq!(out.thread_id.as_deref(), Some("t-1"));

        assert!(target.route_only().outbound("x").reply_to.is_none());
    }
}
