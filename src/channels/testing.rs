//! In-memory adapter for channel pipeline tests

use super::adapter::{AdapterBase, AdapterStatus, ChannelAdapter, ChannelEvent};
use super::message::OutboundMessage;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct MockAdapter {
    base: AdapterBase,
    failing_starts: AtomicU32,
    failing_sends: AtomicU32,
    send_delay: Option<Duration>,
    start_calls: AtomicU32,
    send_calls: AtomicU32,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            base: AdapterBase::new(name),
            failing_starts: AtomicU32::new(0),
            failing_sends: AtomicU32::new(0),
            send_delay: None,
            start_calls: AtomicU32::new(0),
            send_calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_starts(self, count: u32) -> Self {
        self.failing_starts.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_sends(self, count: u32) -> Self {
        self.failing_sends.store(count, Ordering::SeqCst);
        self
    }

    pub fn slow_sends(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.base.status() == AdapterStatus::Running
    }

    pub fn simulate_disconnect(&self) {
        self.base.set_status(AdapterStatus::Error);
    }
}

#[async_trait]
impl ChannelAdapter for MockAdapter {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn start(&self, event_tx: mpsc::Sender<ChannelEvent>) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_starts.store(remaining - 1, Ordering::SeqCst);
            self.base.set_status(AdapterStatus::Error);
            return Err(Error::Channel("platform unreachable".into()));
        }
        self.base.set_status(AdapterStatus::Running);
        let _ = event_tx
            .send(ChannelEvent::Connected {
                channel: self.name().to_string(),
            })
            .await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.base.set_status(AdapterStatus::Stopped);
        Ok(())
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<String> {
        let call = self.send_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.failing_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Unavailable("platform returned 503".into()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(format!("{}-msg-{}", self.name(), call))
    }

    fn status(&self) -> AdapterStatus {
        self.base.status()
    }
}
