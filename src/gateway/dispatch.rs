//! Method table and request dispatch
//!
//! Every declared method maps to exactly one handler; the table is checked
//! at startup. A request is looked up, authorized, validated and only then
//! handed to its handler.

use super::broadcast::ConnectionInfo;
use super::handlers::{chat, nodes, system};
use super::hub::GatewayHub;
use crate::error::{Error, Result};
use crate::protocol::params::parse_params;
use crate::protocol::{
    MethodAccess, MethodSpec, RequestFrame, ResponseFrame, GATEWAY_METHODS,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Handler behind a method name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    Health,
    Status,
    Snapshot,
    SystemPresence,
    SessionsResolve,
    ChatSend,
    ChatAbort,
    ChatRuns,
    NodeSubscribe,
    NodeUnsubscribe,
    NodeList,
}

const REGISTRATIONS: &[(&str, Handler)] = &[
    ("health", Handler::Health),
    ("status", Handler::Status),
    ("snapshot", Handler::Snapshot),
    ("system-presence", Handler::SystemPresence),
    ("sessions.resolve", Handler::SessionsResolve),
    ("chat.send", Handler::ChatSend),
    ("chat.abort", Handler::ChatAbort),
    ("chat.runs", Handler::ChatRuns),
    ("node.subscribe", Handler::NodeSubscribe),
    ("node.unsubscribe", Handler::NodeUnsubscribe),
    ("node.list", Handler::NodeList),
];

/// Declared methods bound to their handlers
#[derive(Debug)]
pub struct MethodTable {
    entries: HashMap<&'static str, (MethodSpec, Handler)>,
}

impl MethodTable {
    /// Bind every declared gateway method
    pub fn build() -> Result<Self> {
        Self::bind(GATEWAY_METHODS, REGISTRATIONS)
    }

    fn bind(declared: &[MethodSpec], registrations: &[(&'static str, Handler)]) -> Result<Self> {
        let mut problems = Vec::new();
        let mut entries = HashMap::new();

        for spec in declared {
            let handlers: Vec<Handler> = registrations
                .iter()
                .filter(|(name, _)| *name == spec.name)
                .map(|(_, handler)| *handler)
                .collect();
            match handlers.as_slice() {
                [handler] => {
                    entries.insert(spec.name, (*spec, *handler));
                }
                [] => problems.push(format!("method '{}' has no handler", spec.name)),
                _ => problems.push(format!("method '{}' has {} handlers", spec.name, handlers.len())),
            }
        }
        for (name, _) in registrations {
            if !declared.iter().any(|spec| spec.name == *name) {
                problems.push(format!("handler registered for undeclared method '{}'", name));
            }
        }

        if problems.is_empty() {
            Ok(Self { entries })
        } else {
            Err(Error::Gateway(problems.join("; ")))
        }
    }

    pub fn get(&self, method: &str) -> Option<&(MethodSpec, Handler)> {
        self.entries.get(method)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reject callers whose role or scopes do not cover `access`
pub fn authorize(access: MethodAccess, conn: &ConnectionInfo) -> Result<()> {
    match access {
        MethodAccess::Read => Ok(()),
        MethodAccess::Write if conn.can_write() => Ok(()),
        MethodAccess::Write if conn.is_node() => Err(Error::Forbidden(
            "node connections cannot call operator write methods".into(),
        )),
        MethodAccess::Write => Err(Error::Forbidden("missing scope: operator.write".into())),
        MethodAccess::Node if conn.is_node() => Ok(()),
        MethodAccess::Node => Err(Error::Forbidden("method requires the node role".into())),
    }
}

/// Handle one request frame from an authenticated connection
pub async fn dispatch(hub: &Arc<GatewayHub>, conn: &ConnectionInfo, request: RequestFrame) -> ResponseFrame {
    let started = Instant::now();
    let RequestFrame { id, method, params } = request;

    match route(hub, conn, &method, &params).await {
        Ok(result) => {
            tracing::debug!(
                conn_id = %conn.conn_id,
                method = %method,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request handled"
            );
            ResponseFrame::ok(id, result)
        }
        Err(err) => {
            let shape = err.to_error_shape();
            tracing::info!(
                conn_id = %conn.conn_id,
                method = %method,
                code = %shape.code,
                error = %shape.message,
                "Request failed"
            );
            ResponseFrame::err(id, shape)
        }
    }
}

async fn route(hub: &Arc<GatewayHub>, conn: &ConnectionInfo, method: &str, params: &Value) -> Result<Value> {
    let Some((spec, handler)) = hub.methods().get(method) else {
        return Err(if method == crate::protocol::methods::CONNECT_METHOD {
            Error::invalid("connect is only valid as the first request")
        } else {
            Error::invalid(format!("unknown method: {}", method))
        });
    };
    authorize(spec.access, conn)?;
    spec.schema.validate(params)?;

    let schema = &spec.schema;
    match handler {
        Handler::Health => system::health(hub, parse_params(schema, params)?),
        Handler::Status => Ok(system::status(hub)),
        Handler::Snapshot => Ok(system::snapshot(hub)),
        Handler::SystemPresence => Ok(system::presence(hub)),
        Handler::SessionsResolve => system::sessions_resolve(hub, parse_params(schema, params)?),
        Handler::ChatSend => chat::send(hub, conn, parse_params(schema, params)?),
        Handler::ChatAbort => chat::abort(hub, parse_params(schema, params)?),
        Handler::ChatRuns => Ok(chat::runs(hub, parse_params(schema, params)?)),
        Handler::NodeSubscribe => nodes::subscribe(hub, conn, parse_params(schema, params)?),
        Handler::NodeUnsubscribe => nodes::unsubscribe(hub, conn, parse_params(schema, params)?),
        Handler::NodeList => Ok(nodes::list(hub)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{ScriptedBackend, Step};
    use crate::gateway::broadcast::tests::{node, operator};
    use crate::gateway::hub::tests::{hub_with, wait_idle};
    use crate::protocol::ErrorCode;
    use serde_json::json;

    fn hub() -> Arc<GatewayHub> {
        hub_with(Arc::new(ScriptedBackend::replying(&["ok"])))
    }

    async fn call(hub: &Arc<GatewayHub>, conn: &ConnectionInfo, method: &str, params: Value) -> ResponseFrame {
        dispatch(hub, conn, RequestFrame::new("r1", method, params)).await
    }

    fn code(response: &ResponseFrame) -> ErrorCode {
        response.error.as_ref().map(|e| e.code).unwrap()
    }

    #[test]
    fn test_table_binds_every_declared_method() {
        let table = MethodTable::build().unwrap();
        assert_eq!(table.len(), GATEWAY_METHODS.len());
        for spec in GATEWAY_METHODS {
            assert!(table.get(spec.name).is_some(), "{} unbound", spec.name);
        }
    }

    #[test]
    fn test_table_rejects_missing_and_duplicate_handlers() {
        let missing = MethodTable::bind(GATEWAY_METHODS, &REGISTRATIONS[1..]).unwrap_err();
        assert!(missing.to_string().contains("'health' has no handler"));

        let mut doubled = REGISTRATIONS.to_vec();
        doubled.push(("status", Handler::Snapshot));
        let err = MethodTable::bind(GATEWAY_METHODS, &doubled).unwrap_err();
        assert!(err.to_string().contains("'status' has 2 handlers"));

        let mut extra = REGISTRATIONS.to_vec();
        extra.push(("chat.history", Handler::ChatRuns));
        assert!(MethodTable::bind(GATEWAY_METHODS, &extra).is_err());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let hub = hub();
        let response = call(&hub, &operator("c"), "chat.history", Value::Null).await;
        assert!(!response.ok);
        assert_eq!(code(&response), ErrorCode::InvalidRequest);

        let response = call(&hub, &operator("c"), "connect", json!({})).await;
        assert_eq!(code(&response), ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_authorization_before_validation() {
        let hub = hub();
        // bad params, but the node role is rejected first
        let response = call(&hub, &node("n", "desktop-1"), "chat.send", json!({"bogus": 1})).await;
        assert_eq!(code(&response), ErrorCode::Forbidden);

        let response = call(&hub, &operator("c"), "node.subscribe", json!({"sessionKey": "main"})).await;
        assert_eq!(code(&response), ErrorCode::Forbidden);

        let mut reader = operator("r");
        reader.scopes = vec!["operator.read".into()];
        let response = call(&hub, &reader, "chat.abort", json!({"sessionKey": "main"})).await;
        assert_eq!(code(&response), ErrorCode::Forbidden);
        let response = call(&hub, &reader, "status", Value::Null).await;
        assert!(response.ok);
    }

    #[tokio::test]
    async fn test_schema_violation_names_field() {
        let hub = hub();
        let response = call(
            &hub,
            &operator("c"),
            "chat.send",
            json!({"sessionKey": "main", "message": "hi", "idempotencyKey": "k", "extra": true}),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::InvalidRequest);
        assert!(error.message.contains("extra"));
        assert_eq!(error.details.unwrap()["fields"][0], "extra");
    }

    #[tokio::test]
    async fn test_chat_send_round_trip() {
        let hub = hub_with(Arc::new(ScriptedBackend::new(vec![Step::Hang])));
        let conn = operator("c");
        let params = json!({"sessionKey": "main", "message": "hi", "idempotencyKey": "k-1"});

        let first = call(&hub, &conn, "chat.send", params.clone()).await;
        let second = call(&hub, &conn, "chat.send", params).await;
        let first = first.result.unwrap();
        assert_eq!(first["status"], "started");
        let second = second.result.unwrap();
        assert_eq!(second["status"], "in_flight");
        assert_eq!(second["runId"], first["runId"]);

        hub.abort_session("agent:main:main");
        wait_idle(&hub).await;
    }

    #[tokio::test]
    async fn test_chat_abort_unknown_run() {
        let hub = hub_with(Arc::new(ScriptedBackend::new(vec![Step::Hang])));
        let response = call(
            &hub,
            &operator("c"),
            "chat.abort",
            json!({"sessionKey": "main", "runId": "nope"}),
        )
        .await;
        assert_eq!(code(&response), ErrorCode::NotFound);
    }
}
