//! Per-run driver task
//!
//! One task per run: invoke the backend, forward its stream into the run
//! registry, stop on cancellation or timeout, then drain the run.

use super::{DropReason, Ingest, RunEvent, RunHandle};
use crate::agent::AgentIntent;
use crate::channels::ReplyTarget;
use crate::error::{Error, Result};
use crate::gateway::GatewayHub;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Everything a run task needs
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub handle: RunHandle,
    pub intent: AgentIntent,
    pub timeout: Duration,
    /// Channel route the final reply is delivered to
    pub reply: Option<ReplyTarget>,
}

/// Spawn the task driving one run
pub fn spawn_run(hub: Arc<GatewayHub>, request: RunRequest) -> JoinHandle<()> {
    tokio::spawn(drive_run(hub, request))
}

async fn drive_run(hub: Arc<GatewayHub>, request: RunRequest) {
    let run_id = request.handle.run_id.clone();
    let deadline = Instant::now() + request.timeout;
    tracing::debug!(
        run_id = %run_id,
        session_key = %request.handle.session_key,
        timeout_ms = request.timeout.as_millis() as u64,
        "Chat run started"
    );

    match consume(&hub, &request, deadline).await {
        Ok(Some(reply)) => {
            if let Some(target) = &request.reply {
                hub.deliver_reply(target, &reply).await;
            }
        }
        Ok(None) => {}
        Err(err) => {
            let shape = err.to_error_shape();
            tracing::warn!(run_id = %run_id, code = %shape.code, error = %shape.message, "Chat run failed");
            hub.ingest_run_event(&run_id, RunEvent::Error(shape.message));
        }
    }

    hub.finish_run(&run_id);
}

/// Forward backend events until the run ends.
///
/// Returns the final reply text when the run completed normally.
async fn consume(hub: &GatewayHub, request: &RunRequest, deadline: Instant) -> Result<Option<String>> {
    let run_id = request.handle.run_id.as_str();
    let cancel = request.handle.cancel.clone();
    let timed_out = || {
        Error::Unavailable(format!(
            "agent backend timed out after {}ms",
            request.timeout.as_millis()
        ))
    };

    let invoke = hub.backend().invoke(request.intent.clone(), cancel.clone());
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        result = tokio::time::timeout_at(deadline, invoke) => match result {
            Ok(stream) => stream?,
            Err(_) => return Err(timed_out()),
        },
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };
        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => return Err(timed_out()),
        };
        let Some(run_event) = event.into_run_event() else {
            continue;
        };

        let terminal = !matches!(run_event, RunEvent::Delta(_));
        match hub.ingest_run_event(run_id, run_event) {
            Ingest::Deliver(delivery) if terminal => {
                return Ok(delivery
                    .event
                    .message
                    .filter(|_| delivery.event.state == super::ChatEventState::Final));
            }
            Ingest::Deliver(_) | Ingest::Buffered => {}
            Ingest::Dropped(DropReason::Cancelled) => return Ok(None),
            Ingest::Dropped(reason) => {
                tracing::debug!(run_id, ?reason, "Run no longer accepts events");
                return Ok(None);
            }
        }
    }

    // Stream ended without an explicit completion
    match hub.ingest_run_event(run_id, RunEvent::Final { stop_reason: None }) {
        Ingest::Deliver(delivery) => Ok(delivery.event.message),
        _ => Ok(None),
    }
}
