//! Declared gateway methods and events

use super::schema::{FieldKind, FieldSpec, ParamSchema};

/// Longest accepted per-request agent timeout (24h)
const MAX_TIMEOUT_MS: i64 = 24 * 60 * 60 * 1000;

/// Who may call a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodAccess {
    /// Any operator connection
    Read,
    /// Operators holding `operator.write` or `operator.admin`
    Write,
    /// Node connections only
    Node,
}

/// A declared method: name, access class and parameter schema
#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    pub name: &'static str,
    pub access: MethodAccess,
    pub schema: ParamSchema,
}

impl MethodSpec {
    const fn new(name: &'static str, access: MethodAccess, fields: &'static [FieldSpec]) -> Self {
        Self {
            name,
            access,
            schema: ParamSchema::new(name, fields),
        }
    }
}

/// Handshake request; only valid as the first frame of a connection
pub const CONNECT_METHOD: &str = "connect";

pub const CONNECT_SCHEMA: ParamSchema = ParamSchema::new(
    CONNECT_METHOD,
    &[
        FieldSpec::required("minProtocol", FieldKind::Integer { min: 1, max: 1000 }),
        FieldSpec::required("maxProtocol", FieldKind::Integer { min: 1, max: 1000 }),
        FieldSpec::required("client", FieldKind::Object),
        FieldSpec::optional("role", FieldKind::NonEmptyString),
        FieldSpec::optional("scopes", FieldKind::StringArray),
        FieldSpec::optional("auth", FieldKind::Object),
        FieldSpec::optional("nodeId", FieldKind::NonEmptyString),
    ],
);

/// Every method the gateway serves after the handshake
pub const GATEWAY_METHODS: &[MethodSpec] = &[
    MethodSpec::new(
        "health",
        MethodAccess::Read,
        &[FieldSpec::optional("probe", FieldKind::Bool)],
    ),
    MethodSpec::new("status", MethodAccess::Read, &[]),
    MethodSpec::new("snapshot", MethodAccess::Read, &[]),
    MethodSpec::new("system-presence", MethodAccess::Read, &[]),
    MethodSpec::new(
        "sessions.resolve",
        MethodAccess::Read,
        &[
            FieldSpec::optional("scope", FieldKind::NonEmptyString),
            FieldSpec::optional("sessionKey", FieldKind::String),
            FieldSpec::optional("from", FieldKind::String),
            FieldSpec::optional("chatType", FieldKind::NonEmptyString),
            FieldSpec::optional("groupId", FieldKind::String),
            FieldSpec::optional("channel", FieldKind::String),
            FieldSpec::optional("agentId", FieldKind::String),
            FieldSpec::optional("mainKey", FieldKind::String),
        ],
    ),
    MethodSpec::new(
        "chat.send",
        MethodAccess::Write,
        &[
            FieldSpec::required("sessionKey", FieldKind::NonEmptyString),
            FieldSpec::required("message", FieldKind::NonEmptyString),
            FieldSpec::required("idempotencyKey", FieldKind::NonEmptyString),
            FieldSpec::optional("thinking", FieldKind::String),
            FieldSpec::optional("deliver", FieldKind::Bool),
            FieldSpec::optional(
                "timeoutMs",
                FieldKind::Integer {
                    min: 1,
                    max: MAX_TIMEOUT_MS,
                },
            ),
            FieldSpec::optional("runId", FieldKind::NonEmptyString),
        ],
    ),
    MethodSpec::new(
        "chat.abort",
        MethodAccess::Write,
        &[
            FieldSpec::required("sessionKey", FieldKind::NonEmptyString),
            FieldSpec::optional("runId", FieldKind::NonEmptyString),
        ],
    ),
    MethodSpec::new(
        "chat.runs",
        MethodAccess::Read,
        &[FieldSpec::optional("sessionKey", FieldKind::NonEmptyString)],
    ),
    MethodSpec::new(
        "node.subscribe",
        MethodAccess::Node,
        &[FieldSpec::required("sessionKey", FieldKind::NonEmptyString)],
    ),
    MethodSpec::new(
        "node.unsubscribe",
        MethodAccess::Node,
        &[FieldSpec::required("sessionKey", FieldKind::NonEmptyString)],
    ),
    MethodSpec::new("node.list", MethodAccess::Read, &[]),
];

/// Events the gateway may broadcast
pub const GATEWAY_EVENTS: &[&str] = &["chat", "presence", "health", "tick", "shutdown"];

/// Look up a declared method by name
pub fn find_method(name: &str) -> Option<&'static MethodSpec> {
    GATEWAY_METHODS.iter().find(|m| m.name == name)
}

/// Names of all declared methods, in declaration order
pub fn method_names() -> Vec<&'static str> {
    GATEWAY_METHODS.iter().map(|m| m.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_method_names_unique() {
        let names = method_names();
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
        assert!(!names.contains(&CONNECT_METHOD));
    }

    #[test]
    fn test_find_method() {
        let spec = find_method("chat.send").unwrap();
        assert_eq!(spec.access, MethodAccess::Write);
        assert!(find_method("chat.explode").is_none());
    }

    #[test]
    fn test_chat_send_schema() {
        let spec = find_method("chat.send").unwrap();
        spec.schema
            .validate(&json!({
                "sessionKey": "agent:main:main",
                "message": "hi",
                "idempotencyKey": "r1",
                "timeoutMs": 30000
            }))
            .unwrap();
        assert!(spec
            .schema
            .validate(&json!({"sessionKey": "s", "message": "hi"}))
            .is_err());
        assert!(spec
            .schema
            .validate(&json!({
                "sessionKey": "s",
                "message": "hi",
                "idempotencyKey": "r1",
                "attachments": []
            }))
            .is_err());
    }

    #[test]
    fn test_connect_schema() {
        CONNECT_SCHEMA
            .validate(&json!({
                "minProtocol": 3,
                "maxProtocol": 3,
                "client": {"id": "cli", "version": "1.0", "platform": "linux", "mode": "cli"}
            }))
            .unwrap();
        assert!(CONNECT_SCHEMA.validate(&json!({"minProtocol": 3})).is_err());
    }
}
