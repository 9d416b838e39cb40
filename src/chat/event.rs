//! `chat` event payload

use serde::{Deserialize, Serialize};

/// Run state as seen by `chat` event consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatEventState {
    Delta,
    Final,
    Aborted,
    Error,
}

impl ChatEventState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta)
    }
}

/// Payload of a `chat` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub run_id: String,
    pub session_key: String,
    /// Strictly increasing per run
    pub seq: u64,
    pub state: ChatEventState,
    /// Accumulated assistant text so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}
