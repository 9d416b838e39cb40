//! Scripted backend for deterministic run lifecycle tests

use super::{AgentBackend, AgentEvent, AgentIntent, AgentStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Step {
    Emit(AgentEvent),
    Sleep(Duration),
    /// Stop yielding until the consumer gives up
    Hang,
}

pub struct ScriptedBackend {
    steps: Vec<Step>,
    invoke_error: Option<String>,
    invocations: AtomicUsize,
    intents: Mutex<Vec<AgentIntent>>,
    ignore_cancel: bool,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            invoke_error: None,
            invocations: AtomicUsize::new(0),
            intents: Mutex::new(Vec::new()),
            ignore_cancel: false,
        }
    }

    /// Deltas for each chunk followed by `end`
    pub fn replying(chunks: &[&str]) -> Self {
        let mut steps: Vec<Step> = chunks
            .iter()
            .map(|c| Step::Emit(AgentEvent::delta(*c)))
            .collect();
        steps.push(Step::Emit(AgentEvent::end(Some("end_turn"))));
        Self::new(steps)
    }

    pub fn failing(message: &str) -> Self {
        Self {
            invoke_error: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Keep emitting after cancellation, like a backend that never checks
    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn intents(&self) -> Vec<AgentIntent> {
        self.intents.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, intent: AgentIntent, cancel: CancellationToken) -> Result<AgentStream> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.intents.lock().unwrap().push(intent);
        if let Some(message) = &self.invoke_error {
            return Err(Error::Unavailable(message.clone()));
        }

        let steps = self.steps.clone();
        let ignore_cancel = self.ignore_cancel;
        let stream = async_stream::stream! {
            for step in steps {
                if !ignore_cancel && cancel.is_cancelled() {
                    break;
                }
                match step {
                    Step::Emit(event) => yield event,
                    Step::Sleep(delay) => tokio::time::sleep(delay).await,
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
