//! `chat.send`, `chat.abort`, `chat.runs`

use crate::error::{to_json, Result};
use crate::gateway::broadcast::ConnectionInfo;
use crate::gateway::hub::{GatewayHub, StartRun};
use crate::protocol::params::{ChatAbortParams, ChatRunsParams, ChatSendParams};
use serde_json::{json, Value};
use std::sync::Arc;

/// Start a run (or join the in-flight one) and answer immediately
pub fn send(hub: &Arc<GatewayHub>, conn: &ConnectionInfo, params: ChatSendParams) -> Result<Value> {
    let session_key = hub.canonical_session_key(&params.session_key);
    let reply = if params.deliver {
        let route = hub.last_route(&session_key).map(|route| route.route_only());
        if route.is_none() {
            tracing::debug!(session_key = %session_key, "No channel route to deliver to");
        }
        route
    } else {
        None
    };

    let started = hub.start_run(StartRun {
        session_key,
        client_run_id: params.idempotency_key,
        run_id: params.run_id,
        message: params.message,
        thinking: params.thinking,
        timeout_ms: params.timeout_ms,
        requester: Some(conn.conn_id.clone()),
        reply,
    })?;
    Ok(to_json(started))
}

pub fn abort(hub: &GatewayHub, params: ChatAbortParams) -> Result<Value> {
    let session_key = hub.canonical_session_key(&params.session_key);
    let result = match params.run_id.as_deref() {
        Some(run_id) => hub.abort_run(&session_key, run_id)?,
        None => hub.abort_session(&session_key),
    };
    Ok(to_json(result))
}

pub fn runs(hub: &GatewayHub, params: ChatRunsParams) -> Value {
    let session_key = params
        .session_key
        .as_deref()
        .map(|key| hub.canonical_session_key(key));
    json!({ "runs": hub.active_runs(session_key.as_deref()) })
}
