//! Channel adapter trait and shared adapter state

use super::message::{InboundMessage, OutboundMessage};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Events emitted by channel adapters
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A user message arrived
    Message(InboundMessage),
    /// The adapter is connected to its platform
    Connected { channel: String },
    /// The adapter lost its platform connection
    Disconnected { channel: String, reason: String },
    /// Non-fatal adapter error
    Error { channel: String, error: String },
}

impl ChannelEvent {
    pub fn channel(&self) -> &str {
        match self {
            Self::Message(message) => &message.channel,
            Self::Connected { channel }
            | Self::Disconnected { channel, .. }
            | Self::Error { channel, .. } => channel,
        }
    }
}

/// Adapter lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl AdapterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

/// Name and status bookkeeping shared by adapter implementations
#[derive(Debug)]
pub struct AdapterBase {
    name: String,
    status: RwLock<AdapterStatus>,
}

impl AdapterBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: RwLock::new(AdapterStatus::Stopped),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> AdapterStatus {
        *self
            .status
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_status(&self, status: AdapterStatus) {
        *self
            .status
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }

    pub fn is_running(&self) -> bool {
        self.status() == AdapterStatus::Running
    }
}

/// A chat platform bridge
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name, unique per gateway
    fn name(&self) -> &str;

    /// Connect to the platform and start forwarding events
    async fn start(&self, event_tx: mpsc::Sender<ChannelEvent>) -> Result<()>;

    /// Disconnect from the platform
    async fn stop(&self) -> Result<()>;

    /// Send a message, returning the platform message id
    async fn send_message(&self, message: OutboundMessage) -> Result<String>;

    fn status(&self) -> AdapterStatus;

    fn is_connected(&self) -> bool {
        self.status() == AdapterStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_base_status() {
        let base = AdapterBase::new("webhook");
        assert_eq!(base.name(), "webhook");
        assert_eq!(base.status(), AdapterStatus::Stopped);
        assert!(!base.is_running());

        base.set_status(AdapterStatus::Running);
        assert!(base.is_running());
        assert_eq!(base.status().as_str(), "running");
    }

    #[test]
    fn test_event_channel_name() {
        let event = ChannelEvent::Disconnected {
            channel: "ops".into(),
            reason: "socket closed".into(),
        };
        assert_eq!(event.channel(), "ops");
    }
}
