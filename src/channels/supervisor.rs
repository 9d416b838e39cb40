//! Channel adapter supervision
//!
//! Each adapter runs under a supervisor task that keeps it started: failed
//! starts are retried with exponential backoff (2s → 60s cap), and a
//! restart request (the adapter reported `Disconnected`) stops and starts
//! it again.

use super::adapter::{AdapterStatus, ChannelAdapter, ChannelEvent};
use crate::retry::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Restart pacing for supervised adapters
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(60),
        }
    }
}

/// Handle to a supervised adapter
pub struct Supervised {
    restart: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Supervised {
    /// Ask the supervisor to restart the adapter unless it is running
    pub fn request_restart(&self) {
        self.restart.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the supervisor to exit after shutdown
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawn a supervisor for `adapter`
pub fn spawn_supervised(
    adapter: Arc<dyn ChannelAdapter>,
    event_tx: mpsc::Sender<ChannelEvent>,
    policy: RestartPolicy,
    shutdown: CancellationToken,
) -> Supervised {
    let restart = Arc::new(Notify::new());
    let task = tokio::spawn(supervise(adapter, event_tx, policy, shutdown, restart.clone()));
    Supervised { restart, task }
}

async fn supervise(
    adapter: Arc<dyn ChannelAdapter>,
    event_tx: mpsc::Sender<ChannelEvent>,
    policy: RestartPolicy,
    shutdown: CancellationToken,
    restart: Arc<Notify>,
) {
    let name = adapter.name().to_string();
    let mut backoff = ExponentialBackoff::new(policy.initial, policy.max);

    loop {
        loop {
            match adapter.start(event_tx.clone()).await {
                Ok(()) => {
                    backoff.reset();
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        channel = %name,
                        error = %e.to_error_shape().message,
                        retry_in_ms = delay.as_millis() as u64,
                        "Channel adapter failed to start"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(e) = adapter.stop().await {
                        tracing::warn!(channel = %name, error = %e, "Channel adapter stop failed");
                    }
                    return;
                }
                _ = restart.notified() => {}
            }
            // Disconnects caused by our own restart arrive late; ignore them.
            if adapter.status() != AdapterStatus::Running {
                break;
            }
        }

        tracing::info!(channel = %name, "Restarting channel adapter");
        if let Err(e) = adapter.stop().await {
            tracing::warn!(channel = %name, error = %e, "Channel adapter stop failed");
        }
        let delay = backoff.next_delay();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
