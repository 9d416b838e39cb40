//! `node.subscribe`, `node.unsubscribe`, `node.list`

use crate::error::{to_json, Error, Result};
use crate::gateway::broadcast::ConnectionInfo;
use crate::gateway::hub::GatewayHub;
use crate::protocol::params::NodeSessionParams;
use serde_json::{json, Value};

fn node_id(conn: &ConnectionInfo) -> Result<&str> {
    conn.node_id
        .as_deref()
        .ok_or_else(|| Error::Forbidden("connection has no node id".into()))
}

pub fn subscribe(hub: &GatewayHub, conn: &ConnectionInfo, params: NodeSessionParams) -> Result<Value> {
    let node_id = node_id(conn)?;
    let session_key = hub.canonical_session_key(&params.session_key);
    let subscribed = hub.subscribe_node(node_id, &session_key);
    tracing::debug!(node_id, session_key = %session_key, subscribed, "Node subscribe");
    Ok(json!({ "subscribed": subscribed, "sessionKey": session_key }))
}

pub fn unsubscribe(hub: &GatewayHub, conn: &ConnectionInfo, params: NodeSessionParams) -> Result<Value> {
    let node_id = node_id(conn)?;
    let session_key = hub.canonical_session_key(&params.session_key);
    let removed = hub.unsubscribe_node(node_id, &session_key);
    Ok(json!({ "unsubscribed": removed, "sessionKey": session_key }))
}

pub fn list(hub: &GatewayHub) -> Value {
    json!({ "nodes": to_json(hub.node_list()) })
}
