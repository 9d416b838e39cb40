//! Typed method parameters
//!
//! Params are schema-validated first, then deserialized into these types, so
//! handlers only ever see well-formed input.

use super::schema::ParamSchema;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Validate `params` against `schema` and deserialize into `T`
pub fn parse_params<T: DeserializeOwned>(schema: &ParamSchema, params: &Value) -> Result<T> {
    schema.validate(params)?;
    let value = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(value).map_err(|e| {
        Error::invalid(format!("invalid {} params: {}", schema.method, e))
    })
}

/// Front-end kind of a connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientMode {
    ChannelBridge,
    Cli,
    Node,
    ControlUi,
}

impl ClientMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelBridge => "channel-bridge",
            Self::Cli => "cli",
            Self::Node => "node",
            Self::ControlUi => "control-ui",
        }
    }
}

/// Authorization role of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Operator,
    Node,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Node => "node",
        }
    }
}

/// Full operator access
pub const SCOPE_ADMIN: &str = "operator.admin";
/// Operator write access (start/abort runs)
pub const SCOPE_WRITE: &str = "operator.write";

/// Client identity sent with `connect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: ClientMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Shared-secret credentials sent with `connect`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// `connect` params
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ClientRole>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// `health` params
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthParams {
    #[serde(default)]
    pub probe: bool,
}

/// `sessions.resolve` params
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsResolveParams {
    pub scope: Option<String>,
    pub session_key: Option<String>,
    pub from: Option<String>,
    pub chat_type: Option<String>,
    pub group_id: Option<String>,
    pub channel: Option<String>,
    pub agent_id: Option<String>,
    pub main_key: Option<String>,
}

/// `chat.send` params
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
    pub thinking: Option<String>,
    #[serde(default)]
    pub deliver: bool,
    pub timeout_ms: Option<u64>,
    pub run_id: Option<String>,
}

/// `chat.abort` params
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAbortParams {
    pub session_key: String,
    pub run_id: Option<String>,
}

/// `chat.runs` params
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRunsParams {
    pub session_key: Option<String>,
}

/// `node.subscribe` / `node.unsubscribe` params
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSessionParams {
    pub session_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::methods::{find_method, CONNECT_SCHEMA};
    use serde_json::json;

    #[test]
    fn test_parse_chat_send() {
        let spec = find_method("chat.send").unwrap();
        let params: ChatSendParams = parse_params(
            &spec.schema,
            &json!({
                "sessionKey": "agent:main:main",
                "message": "hello",
                "idempotencyKey": "r1",
                "deliver": true
            }),
        )
        .unwrap();
        assert_eq!(params.session_key, "agent:main:main");
        assert_eq!(params.idempotency_key, "r1");
        assert!(params.deliver);
        assert!(params.run_id.is_none());
    }

    #[test]
    fn test_parse_empty_params() {
        let spec = find_method("health").unwrap();
        let params: HealthParams = parse_params(&spec.schema, &Value::Null).unwrap();
        assert!(!params.probe);
    }

    #[test]
    fn test_parse_connect() {
        let params: ConnectParams = parse_params(
            &CONNECT_SCHEMA,
            &json!({
                "minProtocol": 3,
                "maxProtocol": 3,
                "client": {"id": "desktop", "version": "1.2.0", "platform": "macos", "mode": "node"},
                "role": "node",
                "nodeId": "desktop-1"
            }),
        )
        .unwrap();
        assert_eq!(params.client.mode, ClientMode::Node);
        assert_eq!(params.role, Some(ClientRole::Node));
        assert_eq!(params.node_id.as_deref(), Some("desktop-1"));
    }

    #[test]
    fn test_connect_rejects_unknown_client_field() {
        let err = parse_params::<ConnectParams>(
            &CONNECT_SCHEMA,
            &json!({
                "minProtocol": 3,
                "maxProtocol": 3,
                "client": {"id": "x", "version": "1", "platform": "p", "mode": "cli", "evil": 1}
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid connect params"));
    }

    #[test]
    fn test_connect_rejects_unknown_mode() {
        assert!(parse_params::<ConnectParams>(
            &CONNECT_SCHEMA,
            &json!({
                "minProtocol": 3,
                "maxProtocol": 3,
                "client": {"id": "x", "version": "1", "platform": "p", "mode": "toaster"}
            }),
        )
        .is_err());
    }
}
