//! Agent backend trait and the bundled echo backend

use super::types::{AgentEvent, AgentIntent};
use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stream of events produced by one invocation
pub type AgentStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// Opaque agent execution capability
///
/// Implementations should observe `cancel` and end their stream promptly
/// once it fires; the gateway stops reading either way.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Backend name for logs and status
    fn name(&self) -> &str;

    /// Start an invocation and return its event stream
    async fn invoke(&self, intent: AgentIntent, cancel: CancellationToken) -> Result<AgentStream>;
}

/// Backend that streams the user's message back word by word
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    chunk_delay: Duration,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between chunks, to make streaming visible
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl AgentBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, intent: AgentIntent, cancel: CancellationToken) -> Result<AgentStream> {
        let chunks: Vec<String> = intent
            .message
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let delay = self.chunk_delay;

        let stream = async_stream::stream! {
            yield AgentEvent::start();
            let mut cancelled = false;
            for chunk in chunks {
                if !delay.is_zero() {
                    cancelled = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                }
                if cancelled || cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                yield AgentEvent::delta(chunk);
            }
            if !cancelled {
                yield AgentEvent::end(Some("end_turn"));
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentPhase;
    use futures::StreamExt;

    fn intent(message: &str) -> AgentIntent {
        AgentIntent {
            run_id: "run-1".into(),
            session_key: "agent:main:main".into(),
            agent_id: "main".into(),
            message: message.into(),
            thinking: None,
        }
    }

    #[tokio::test]
    async fn test_echo_streams_words_then_ends() {
        let backend = EchoBackend::new();
        let events: Vec<AgentEvent> = backend
            .invoke(intent("hello there world"), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.first().map(|e| e.phase), Some(AgentPhase::Start));
        assert_eq!(events.last().map(|e| e.phase), Some(AgentPhase::End));
        let text: String = events.iter().filter_map(|e| e.text.clone()).collect();
        assert_eq!(text, "hello there world");
    }

    #[tokio::test]
    async fn test_echo_stops_when_cancelled() {
        let backend = EchoBackend::new().with_chunk_delay(Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let mut stream = backend
            .invoke(intent("one two three four"), cancel.clone())
            .await
            .unwrap();

        assert_eq!(stream.next().await.map(|e| e.phase), Some(AgentPhase::Start));
        cancel.cancel();
        let rest: Vec<AgentEvent> = stream.collect().await;
        assert!(rest.iter().all(|e| e.phase != AgentPhase::End));
    }
}
