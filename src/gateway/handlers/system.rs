//! `health`, `status`, `snapshot`, `system-presence`, `sessions.resolve`

use crate::error::{to_json, Error, Result};
use crate::gateway::GatewayHub;
use crate::protocol::params::{HealthParams, SessionsResolveParams};
use crate::session::{
    is_group_session_key, normalize_agent_id, resolve_session_key, ChatType, MsgContext,
    SessionScope,
};
use serde_json::{json, Value};

pub fn health(hub: &GatewayHub, params: HealthParams) -> Result<Value> {
    let cached = hub.snapshot();
    let snapshot = if params.probe || cached.health.ts == 0 {
        hub.refresh_and_broadcast_health()
    } else {
        cached
    };
    let mut body = to_json(&snapshot.health);
    body["stateVersion"] = to_json(snapshot.state_version);
    Ok(body)
}

pub fn status(hub: &GatewayHub) -> Value {
    let snapshot = hub.snapshot();
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "host": hub.host(),
        "uptimeMs": snapshot.uptime_ms,
        "connections": hub.broadcaster().counts(),
        "nodes": hub.broadcaster().connected_nodes().len(),
        "nodeSubscriptions": hub.node_subscription_count(),
        "activeRuns": hub.active_run_count(),
        "channels": hub.channel_names(),
        "stateVersion": snapshot.state_version,
    })
}

pub fn snapshot(hub: &GatewayHub) -> Value {
    to_json(hub.snapshot())
}

pub fn presence(hub: &GatewayHub) -> Value {
    json!({ "presence": hub.presence() })
}

/// Run the session key resolver for an arbitrary conversation identity
pub fn sessions_resolve(hub: &GatewayHub, params: SessionsResolveParams) -> Result<Value> {
    let defaults = &hub.config().session;
    let mut fields = Vec::new();

    let scope = match params.scope.as_deref() {
        None => defaults.scope,
        Some(raw) => SessionScope::parse(raw).unwrap_or_else(|| {
            fields.push("scope".to_string());
            defaults.scope
        }),
    };
    let chat_type = match params.chat_type.as_deref() {
        None => ChatType::Direct,
        Some(raw) => ChatType::parse(raw).unwrap_or_else(|| {
            fields.push("chatType".to_string());
            ChatType::Direct
        }),
    };
    if !fields.is_empty() {
        return Err(Error::InvalidRequest {
            message: format!("invalid sessions.resolve params: {}", fields.join(", ")),
            fields,
        });
    }

    let agent_id = normalize_agent_id(params.agent_id.as_deref().unwrap_or(&defaults.agent_id));
    let main_key = params.main_key.unwrap_or_else(|| defaults.main_key.clone());
    let ctx = MsgContext {
        session_key: params.session_key,
        from: params.from,
        chat_type,
        group_id: params.group_id,
        channel: params.channel,
        agent_id: Some(agent_id.clone()),
    };
    let session_key = resolve_session_key(scope, &ctx, &main_key);

    Ok(json!({
        "sessionKey": session_key,
        "scope": scope,
        "agentId": agent_id,
        "isGroup": is_group_session_key(&session_key),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedBackend;
    use crate::gateway::hub::tests::hub_with;
    use std::sync::Arc;

    fn resolve(params: serde_json::Value) -> Result<Value> {
        let hub = hub_with(Arc::new(ScriptedBackend::new(Vec::new())));
        sessions_resolve(&hub, serde_json::from_value(params).unwrap())
    }

    #[test]
    fn test_health_refreshes_cold_cache() {
        let hub = hub_with(Arc::new(ScriptedBackend::new(Vec::new())));
        let body = health(&hub, HealthParams::default()).unwrap();
        assert!(body["ts"].as_u64().unwrap() > 0);
        assert_eq!(body["stateVersion"]["health"], 1);

        // served from cache: no version bump
        let body = health(&hub, HealthParams::default()).unwrap();
        assert_eq!(body["stateVersion"]["health"], 1);
        let body = health(&hub, HealthParams { probe: true }).unwrap();
        assert_eq!(body["stateVersion"]["health"], 1);
    }

    #[test]
    fn test_status_reports_counts() {
        let hub = hub_with(Arc::new(ScriptedBackend::new(Vec::new())));
        hub.subscribe_node("desktop-1", "agent:main:main");
        let body = status(&hub);
        assert_eq!(body["activeRuns"], 0);
        assert_eq!(body["connections"]["total"], 0);
        assert_eq!(body["nodeSubscriptions"], 1);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_resolve_direct_and_group() {
        let direct = resolve(json!({"from": "+15550001111", "channel": "telegram"})).unwrap();
        assert_eq!(direct["sessionKey"], "agent:main:main");
        assert_eq!(direct["isGroup"], false);

        let group = resolve(json!({
            "from": "+15550001111",
            "chatType": "group",
            "groupId": "Team-Room",
            "channel": "telegram"
        }))
        .unwrap();
        assert_eq!(group["isGroup"], true);
        assert!(group["sessionKey"].as_str().unwrap().starts_with("agent:main:telegram:group:"));

        let global = resolve(json!({"scope": "global", "chatType": "group", "groupId": "x"})).unwrap();
        assert_eq!(global["sessionKey"], "global");
    }

    #[test]
    fn test_resolve_rejects_unknown_enums() {
        match resolve(json!({"scope": "per-planet", "chatType": "broadcast"})).unwrap_err() {
            Error::InvalidRequest { fields, .. } => {
                assert_eq!(fields, vec!["scope".to_string(), "chatType".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
