//! Agent invocation types
//!
//! Defines what the gateway sends to an agent backend and what it expects
//! back.

use crate::chat::RunEvent;
use serde::{Deserialize, Serialize};

// =============================================================================
// Gateway → backend
// =============================================================================

/// One agent invocation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIntent {
    pub run_id: String,
    pub session_key: String,
    pub agent_id: String,
    pub message: String,
    /// Reasoning level hint, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

// =============================================================================
// Backend → gateway
// =============================================================================

/// Phase of an agent event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
    Start,
    Delta,
    Tool,
    End,
    Error,
}

/// One event from an agent backend stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub phase: AgentPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentEvent {
    fn bare(phase: AgentPhase) -> Self {
        Self {
            phase,
            text: None,
            media_urls: Vec::new(),
            tool_call_id: None,
            stop_reason: None,
            error: None,
        }
    }

    pub fn start() -> Self {
        Self::bare(AgentPhase::Start)
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::bare(AgentPhase::Delta)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::bare(AgentPhase::Tool)
        }
    }

    pub fn end(stop_reason: Option<&str>) -> Self {
        Self {
            stop_reason: stop_reason.map(str::to_string),
            ..Self::bare(AgentPhase::End)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::bare(AgentPhase::Error)
        }
    }

    /// Attach media URLs to a delta
    pub fn with_media(mut self, urls: impl IntoIterator<Item = String>) -> Self {
        self.media_urls.extend(urls);
        self
    }

    /// Reduce to the run-level event the registry tracks.
    ///
    /// `start` and `tool` phases carry nothing for chat clients. Media URLs
    /// are appended to the delta text as `MEDIA:<url>` lines.
    pub fn into_run_event(self) -> Option<RunEvent> {
        match self.phase {
            AgentPhase::Start | AgentPhase::Tool => None,
            AgentPhase::Delta => {
                let mut text = self.text.unwrap_or_default();
                for url in &self.media_urls {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str("MEDIA:");
                    text.push_str(url);
                }
                Some(RunEvent::Delta(text))
            }
            AgentPhase::End => Some(RunEvent::Final {
                stop_reason: self.stop_reason,
            }),
            AgentPhase::Error => Some(RunEvent::Error(
                self.error.unwrap_or_else(|| "agent backend failed".to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_map_to_run_events() {
        assert_eq!(AgentEvent::start().into_run_event(), None);
        assert_eq!(AgentEvent::tool("call_1").into_run_event(), None);
        assert_eq!(
            AgentEvent::delta("hi").into_run_event(),
            Some(RunEvent::Delta("hi".into()))
        );
        assert_eq!(
            AgentEvent::end(Some("end_turn")).into_run_event(),
            Some(RunEvent::Final {
                stop_reason: Some("end_turn".into())
            })
        );
        assert_eq!(
            AgentEvent::error("quota").into_run_event(),
            Some(RunEvent::Error("quota".into()))
        );
    }

    #[test]
    fn test_media_urls_become_lines() {
        let event = AgentEvent::delta("look")
            .with_media(vec!["https://img.example/a.png".to_string()]);
        assert_eq!(
            event.into_run_event(),
            Some(RunEvent::Delta("look\nMEDIA:https://img.example/a.png".into()))
        );
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(AgentEvent::tool("call_9")).unwrap();
        assert_eq!(json["phase"], "tool");
        assert_eq!(json["toolCallId"], "call_9");
        assert!(json.get("mediaUrls").is_none());
    }
}
