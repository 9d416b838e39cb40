//! Frame types and the strict frame decoder

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version spoken by this gateway
pub const PROTOCOL_VERSION: u32 = 3;

const REQ_KEYS: &[&str] = &["type", "id", "method", "params"];
const RES_KEYS: &[&str] = &["type", "id", "ok", "result", "error"];
const EVENT_KEYS: &[&str] = &["type", "event", "data", "seq", "stateVersion"];

/// Wire error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or schema-failing input; never retried by the gateway
    InvalidRequest,
    /// Transient failure; safe to retry with backoff
    Unavailable,
    /// Unknown run, session or node
    NotFound,
    /// Would violate the single-active-run rule
    Conflict,
    /// Caller lacks the role or scope for the method
    Forbidden,
}

impl ErrorCode {
    /// Wire spelling of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unavailable => "UNAVAILABLE",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Forbidden => "FORBIDDEN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload of a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Per-dimension monotonic counters used by clients to detect missed
/// broadcasts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

/// Request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Successful response
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response
    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Event frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Gateway-global broadcast sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            seq: None,
            state_version: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_state_version(mut self, version: StateVersion) -> Self {
        self.state_version = Some(version);
        self
    }
}

/// A decoded protocol frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

impl From<RequestFrame> for Frame {
    fn from(frame: RequestFrame) -> Self {
        Frame::Req(frame)
    }
}

impl From<ResponseFrame> for Frame {
    fn from(frame: ResponseFrame) -> Self {
        Frame::Res(frame)
    }
}

impl From<EventFrame> for Frame {
    fn from(frame: EventFrame) -> Self {
        Frame::Event(frame)
    }
}

/// Structured decode failure
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    /// Request id, when one could be recovered from the malformed frame
    pub id: Option<String>,
    /// Offending field names
    pub fields: Vec<String>,
    pub message: String,
}

impl DecodeError {
    fn new(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            fields: Vec::new(),
            message: message.into(),
        }
    }

    fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::InvalidRequest {
            message: err.message,
            fields: err.fields,
        }
    }
}

/// Decode raw text into a validated frame.
///
/// Payloads larger than `max_bytes` are rejected before parsing.
pub fn decode_frame(raw: &str, max_bytes: usize) -> std::result::Result<Frame, DecodeError> {
    if raw.len() > max_bytes {
        return Err(DecodeError::new(None, "payload too large"));
    }

    let value: Value = serde_json::from_str(raw)
        .map_err(|e| DecodeError::new(None, format!("invalid request frame: {}", e)))?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::new(None, "invalid request frame: expected object"));
    };
    let id = obj.get("id").and_then(Value::as_str).map(str::to_string);

    let frame_type = match obj.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(_) => {
            return Err(DecodeError::new(id, "invalid request frame: 'type' must be a string")
                .with_fields(vec!["type".to_string()]))
        }
        None => {
            return Err(DecodeError::new(id, "invalid request frame: missing 'type'")
                .with_fields(vec!["type".to_string()]))
        }
    };

    let allowed = match frame_type.as_str() {
        "req" => REQ_KEYS,
        "res" => RES_KEYS,
        "event" => EVENT_KEYS,
        other => {
            return Err(DecodeError::new(
                id,
                format!("invalid request frame: unknown frame type '{}'", other),
            )
            .with_fields(vec!["type".to_string()]))
        }
    };

    let unexpected: Vec<String> = obj
        .keys()
        .filter(|k| !allowed.contains(&k.as_str()))
        .cloned()
        .collect();
    if !unexpected.is_empty() {
        return Err(DecodeError::new(
            id,
            format!(
                "invalid request frame: unexpected properties {}",
                quote_list(&unexpected)
            ),
        )
        .with_fields(unexpected));
    }

    let invalid = match frame_type.as_str() {
        "req" => check_request_fields(&obj),
        "res" => check_response_fields(&obj),
        _ => check_event_fields(&obj),
    };
    if !invalid.is_empty() {
        return Err(DecodeError::new(
            id,
            format!("invalid request frame: bad fields {}", quote_list(&invalid)),
        )
        .with_fields(invalid));
    }

    serde_json::from_value(Value::Object(obj))
        .map_err(|e| DecodeError::new(id, format!("invalid request frame: {}", e)))
}

/// Encode a frame as JSON text
pub fn encode_frame(frame: &Frame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

fn check_request_fields(obj: &Map<String, Value>) -> Vec<String> {
    let mut bad = Vec::new();
    if !is_non_empty_str(obj.get("id")) {
        bad.push("id".to_string());
    }
    if !is_non_empty_str(obj.get("method")) {
        bad.push("method".to_string());
    }
    if !matches!(obj.get("params"), None | Some(Value::Null) | Some(Value::Object(_))) {
        bad.push("params".to_string());
    }
    bad
}

fn check_response_fields(obj: &Map<String, Value>) -> Vec<String> {
    let mut bad = Vec::new();
    if !is_non_empty_str(obj.get("id")) {
        bad.push("id".to_string());
    }
    if !matches!(obj.get("ok"), Some(Value::Bool(_))) {
        bad.push("ok".to_string());
    }
    if !matches!(obj.get("error"), None | Some(Value::Null) | Some(Value::Object(_))) {
        bad.push("error".to_string());
    }
    bad
}

fn check_event_fields(obj: &Map<String, Value>) -> Vec<String> {
    let mut bad = Vec::new();
    if !is_non_empty_str(obj.get("event")) {
        bad.push("event".to_string());
    }
    match obj.get("seq") {
        None | Some(Value::Null) => {}
        Some(seq) if seq.as_u64().is_some() => {}
        Some(_) => bad.push("seq".to_string()),
    }
    if !matches!(
        obj.get("stateVersion"),
        None | Some(Value::Null) | Some(Value::Object(_))
    ) {
        bad.push("stateVersion".to_string());
    }
    bad
}

fn is_non_empty_str(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::String(s)) if !s.trim().is_empty())
}

pub(crate) fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("'{}'", n))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAX: usize = 512 * 1024;

    #[test]
    fn test_decode_request() {
        let frame = decode_frame(
            r#"{"type":"req","id":"1","method":"health","params":{"probe":true}}"#,
            MAX,
        )
        .unwrap();
        match frame {
            Frame::Req(req) => {
                assert_eq!(req.id, "1");
                assert_eq!(req.method, "health");
                assert_eq!(req.params, json!({"probe": true}));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_request_without_params() {
        let frame = decode_frame(r#"{"type":"req","id":"a","method":"status"}"#, MAX).unwrap();
        assert!(matches!(frame, Frame::Req(ref r) if r.params.is_null()));
    }

    #[test]
    fn test_decode_rejects_unknown_property() {
        let err = decode_frame(
            r#"{"type":"req","id":"7","method":"status","extra":1}"#,
            MAX,
        )
        .unwrap_err();
        assert_eq!(err.id.as_deref(), Some("7"));
        assert_eq!(err.fields, vec!["extra".to_string()]);
        assert!(err.message.contains("'extra'"));
    }

    #[test]
    fn test_decode_rejects_missing_method() {
        let err = decode_frame(r#"{"type":"req","id":"7"}"#, MAX).unwrap_err();
        assert_eq!(err.fields, vec!["method".to_string()]);
    }

    #[test]
    fn test_decode_rejects_non_object_params() {
        let err = decode_frame(r#"{"type":"req","id":"7","method":"x","params":[1]}"#, MAX)
            .unwrap_err();
        assert_eq!(err.fields, vec!["params".to_string()]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_frame("not json", MAX).unwrap_err();
        assert!(err.id.is_none());
        assert!(err.message.starts_with("invalid request frame"));

        let err = decode_frame("[1,2,3]", MAX).unwrap_err();
        assert!(err.message.contains("expected object"));

        let err = decode_frame(r#"{"type":"ping","id":"1"}"#, MAX).unwrap_err();
        assert_eq!(err.fields, vec!["type".to_string()]);
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let raw = format!(
            r#"{{"type":"req","id":"1","method":"chat.send","params":{{"message":"{}"}}}}"#,
            "x".repeat(64)
        );
        let err = decode_frame(&raw, 32).unwrap_err();
        assert_eq!(err.message, "payload too large");
    }

    #[test]
    fn test_decode_event_with_state_version() {
        let frame = decode_frame(
            r#"{"type":"event","event":"presence","data":{},"seq":3,"stateVersion":{"presence":2,"health":1}}"#,
            MAX,
        )
        .unwrap();
        let Frame::Event(event) = frame else {
            panic!("expected event");
        };
        assert_eq!(event.seq, Some(3));
        assert_eq!(
            event.state_version,
            Some(StateVersion {
                presence: 2,
                health: 1
            })
        );
    }

    #[test]
    fn test_encode_response_shapes() {
        let ok = encode_frame(&ResponseFrame::ok("1", json!({"runId": "r"})).into()).unwrap();
        let value: Value = serde_json::from_str(&ok).unwrap();
        assert_eq!(value, json!({"type":"res","id":"1","ok":true,"result":{"runId":"r"}}));

        let err = encode_frame(
            &ResponseFrame::err("2", ErrorShape::new(ErrorCode::NotFound, "unknown run")).into(),
        )
        .unwrap();
        let value: Value = serde_json::from_str(&err).unwrap();
        assert_eq!(
            value,
            json!({"type":"res","id":"2","ok":false,"error":{"code":"NOT_FOUND","message":"unknown run"}})
        );
    }

    #[test]
    fn test_encode_event_omits_absent_optionals() {
        let text = encode_frame(&EventFrame::new("tick", json!({"ts": 1})).into()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type":"event","event":"tick","data":{"ts":1}}));
    }

    #[test]
    fn test_decode_error_converts_to_invalid_request() {
        let err: Error = decode_frame(r#"{"type":"req","id":"1","method":"x","bogus":true}"#, MAX)
            .unwrap_err()
            .into();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }
}
