//! Run entries and states

use super::event::ChatEventState;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Streaming,
    Final,
    Aborted,
    Error,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final | Self::Aborted | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Final => "final",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }

    pub(crate) fn event_state(&self) -> ChatEventState {
        match self {
            Self::Pending | Self::Streaming => ChatEventState::Delta,
            Self::Final => ChatEventState::Final,
            Self::Aborted => ChatEventState::Aborted,
            Self::Error => ChatEventState::Error,
        }
    }
}

/// Backend output for a run, already reduced to what the registry tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Incremental assistant text
    Delta(String),
    /// Backend signaled completion
    Final { stop_reason: Option<String> },
    /// Backend signaled failure
    Error(String),
}

/// One in-flight (or recently finished) agent invocation
#[derive(Debug)]
pub struct ChatRunEntry {
    pub run_id: String,
    pub session_key: String,
    pub client_run_id: String,
    pub state: RunState,
    /// Last delivered sequence number
    pub seq: u64,
    /// Accumulated assistant text
    pub buffer: String,
    pub cancel: CancellationToken,
    /// Connection that started the run, if any
    pub requester: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub finished_at: Option<u64>,
    pub(crate) last_delta_at: Option<u64>,
}

impl ChatRunEntry {
    pub fn handle(&self) -> RunHandle {
        RunHandle {
            run_id: self.run_id.clone(),
            session_key: self.session_key.clone(),
            client_run_id: self.client_run_id.clone(),
            state: self.state,
            cancel: self.cancel.clone(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            session_key: self.session_key.clone(),
            client_run_id: self.client_run_id.clone(),
            state: self.state,
            seq: self.seq,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What a caller gets back from `create`
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub session_key: String,
    pub client_run_id: String,
    pub state: RunState,
    pub cancel: CancellationToken,
}

/// Serializable view of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub session_key: String,
    pub client_run_id: String,
    pub state: RunState,
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
}
