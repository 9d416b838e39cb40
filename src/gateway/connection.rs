//! WebSocket connection runtime
//!
//! ```text
//!  socket ──► reader ──► decode ──► dispatch ──► broadcaster queue ─┐
//!    ▲                                                             │
//!    └────────────── writer task ◄── bounded mpsc ◄────────────────┘
//! ```
//!
//! The first frame must be `connect`. After `hello-ok` the connection is
//! registered with the broadcaster; all later output (responses and
//! events) goes through its bounded queue.

use super::broadcast::{CloseSignal, ConnectionInfo, SendOutcome, CLOSE_POLICY};
use super::dispatch::dispatch;
use super::hub::GatewayHub;
use crate::config::{AuthConfig, AuthMode};
use crate::error::{Error, Result};
use crate::protocol::methods::{method_names, CONNECT_METHOD, CONNECT_SCHEMA};
use crate::protocol::params::{ClientInfo, ConnectAuth, ConnectParams, SCOPE_ADMIN};
use crate::protocol::{
    decode_frame, encode_frame, parse_params, ClientMode, ClientRole, Frame, RequestFrame,
    ResponseFrame, GATEWAY_EVENTS, PROTOCOL_VERSION,
};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CLOSE_NORMAL: u16 = 1000;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Upgrade an HTTP request to a gateway connection
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    remote: Option<ConnectInfo<SocketAddr>>,
    State(hub): State<Arc<GatewayHub>>,
) -> impl IntoResponse {
    let max_payload = hub.config().gateway.max_payload_bytes;
    let remote = remote.map(|ConnectInfo(addr)| addr);
    ws.max_message_size(max_payload)
        .on_upgrade(move |socket| serve_connection(hub, socket, remote))
}

/// Validate a `connect` request and derive the connection identity
pub fn authenticate(
    auth: &AuthConfig,
    conn_id: &str,
    request: &RequestFrame,
    remote: Option<SocketAddr>,
) -> Result<(ConnectionInfo, ClientInfo)> {
    if request.method != CONNECT_METHOD {
        return Err(Error::invalid(format!(
            "first request must be connect, got '{}'",
            request.method
        )));
    }
    let params: ConnectParams = parse_params(&CONNECT_SCHEMA, &request.params)?;

    if params.min_protocol > PROTOCOL_VERSION || params.max_protocol < PROTOCOL_VERSION {
        return Err(Error::InvalidRequest {
            message: format!(
                "protocol mismatch: server speaks {}, client offered {}..={}",
                PROTOCOL_VERSION, params.min_protocol, params.max_protocol
            ),
            fields: vec!["minProtocol".to_string(), "maxProtocol".to_string()],
        });
    }
    check_auth(auth, params.auth.as_ref())?;

    let client = params.client;
    let role = if client.mode == ClientMode::Node {
        ClientRole::Node
    } else {
        params.role.unwrap_or(ClientRole::Operator)
    };
    let scopes = match role {
        ClientRole::Node => Vec::new(),
        ClientRole::Operator if params.scopes.is_empty() => vec![SCOPE_ADMIN.to_string()],
        ClientRole::Operator => params.scopes,
    };
    let node_id = (role == ClientRole::Node).then(|| {
        params
            .node_id
            .or_else(|| client.instance_id.clone())
            .unwrap_or_else(|| client.id.clone())
    });
    let instance_id = client
        .device_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| conn_id.to_string());

    let info = ConnectionInfo {
        conn_id: conn_id.to_string(),
        role,
        mode: client.mode,
        scopes,
        node_id,
        client_id: client.id.clone(),
        instance_id,
        remote_addr: remote.map(|addr| addr.ip().to_string()),
    };
    Ok((info, client))
}

fn check_auth(config: &AuthConfig, offered: Option<&ConnectAuth>) -> Result<()> {
    let (expected, given, what) = match config.mode {
        AuthMode::None => return Ok(()),
        AuthMode::Token => (
            config.token.as_deref(),
            offered.and_then(|a| a.token.as_deref()),
            "token",
        ),
        AuthMode::Password => (
            config.password.as_deref(),
            offered.and_then(|a| a.password.as_deref()),
            "password",
        ),
    };
    match (expected, given) {
        (Some(expected), Some(given)) if !expected.is_empty() && expected == given => Ok(()),
        (_, None) => Err(Error::Forbidden(format!("gateway {} required", what))),
        _ => Err(Error::Forbidden(format!("gateway {} mismatch", what))),
    }
}

/// Body of the successful `connect` response
pub fn hello_ok(hub: &GatewayHub, info: &ConnectionInfo) -> Value {
    let gateway = &hub.config().gateway;
    json!({
        "type": "hello-ok",
        "protocol": PROTOCOL_VERSION,
        "server": {
            "version": env!("CARGO_PKG_VERSION"),
            "host": hub.host(),
            "connId": info.conn_id,
        },
        "features": {
            "methods": method_names(),
            "events": GATEWAY_EVENTS,
        },
        "snapshot": hub.snapshot(),
        "policy": {
            "maxPayload": gateway.max_payload_bytes,
            "maxQueuedFrames": gateway.max_queued_frames,
            "tickIntervalMs": gateway.tick_interval_ms,
        },
    })
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Run one connection to completion
pub async fn serve_connection(hub: Arc<GatewayHub>, socket: WebSocket, remote: Option<SocketAddr>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    let Some((info, client, connect_id)) = handshake(&hub, &conn_id, &mut sink, &mut stream, remote).await
    else {
        return;
    };

    let (tx, rx) = mpsc::channel(hub.config().gateway.max_queued_frames);
    let close = CloseSignal::new();
    hub.connection_opened(info.clone(), &client, tx, close.clone());

    // hello-ok goes out before anything queued during registration
    let hello = ResponseFrame::ok(connect_id, hello_ok(&hub, &info));
    if send_direct(&mut sink, &Frame::Res(hello)).await.is_err() {
        hub.connection_closed(&conn_id);
        return;
    }

    let writer = tokio::spawn(write_loop(sink, rx, close.clone()));
    read_loop(&hub, &info, &mut stream, &close).await;

    close.close(CLOSE_NORMAL, "");
    hub.connection_closed(&conn_id);
    if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
        tracing::debug!(conn_id = %conn_id, "Writer did not finish in time");
    }
}

/// Wait for `connect`; answers failures and closes the socket itself
async fn handshake(
    hub: &GatewayHub,
    conn_id: &str,
    sink: &mut WsSink,
    stream: &mut WsStream,
    remote: Option<SocketAddr>,
) -> Option<(ConnectionInfo, ClientInfo, String)> {
    let gateway = &hub.config().gateway;
    let deadline = Duration::from_millis(gateway.handshake_timeout_ms);

    let text = match tokio::time::timeout(deadline, next_text(stream)).await {
        Ok(Some(text)) => text,
        Ok(None) => return None,
        Err(_) => {
            tracing::debug!(conn_id, "Handshake timed out");
            close_socket(sink, CLOSE_POLICY, "handshake timeout").await;
            return None;
        }
    };

    let (id, result) = match decode_frame(&text, gateway.max_payload_bytes) {
        Ok(Frame::Req(request)) => {
            let result = authenticate(&hub.config().auth, conn_id, &request, remote);
            (request.id, result)
        }
        Ok(_) => (
            String::new(),
            Err(Error::invalid("first frame must be a connect request")),
        ),
        Err(err) => (err.id.clone().unwrap_or_default(), Err(Error::from(err))),
    };

    match result {
        Ok((info, client)) => Some((info, client, id)),
        Err(err) => {
            let shape = err.to_error_shape();
            tracing::info!(conn_id, code = %shape.code, error = %shape.message, "Handshake rejected");
            let reason = shape.message.clone();
            let _ = send_direct(sink, &Frame::Res(ResponseFrame::err(id, shape))).await;
            close_socket(sink, CLOSE_POLICY, &reason).await;
            None
        }
    }
}

async fn read_loop(hub: &Arc<GatewayHub>, info: &ConnectionInfo, stream: &mut WsStream, close: &CloseSignal) {
    let max_payload = hub.config().gateway.max_payload_bytes;
    loop {
        let text = tokio::select! {
            biased;
            _ = close.closed() => break,
            text = next_text(stream) => match text {
                Some(text) => text,
                None => break,
            },
        };

        let response = match decode_frame(&text, max_payload) {
            Ok(Frame::Req(request)) => dispatch(hub, info, request).await,
            Ok(Frame::Res(res)) => ResponseFrame::err(
                res.id,
                Error::invalid("clients may only send req frames").to_error_shape(),
            ),
            Ok(Frame::Event(_)) => ResponseFrame::err(
                String::new(),
                Error::invalid("clients may only send req frames").to_error_shape(),
            ),
            Err(err) => {
                let id = err.id.clone().unwrap_or_default();
                ResponseFrame::err(id, Error::from(err).to_error_shape())
            }
        };

        match hub
            .broadcaster()
            .send_frame(&info.conn_id, &Frame::Res(response), false)
        {
            Ok(SendOutcome::Queued) => {}
            Ok(outcome) => {
                tracing::debug!(conn_id = %info.conn_id, ?outcome, "Response not queued");
                break;
            }
            Err(e) => tracing::error!(conn_id = %info.conn_id, error = %e, "Failed to encode response"),
        }
    }
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<String>, close: CloseSignal) {
    loop {
        tokio::select! {
            biased;
            _ = close.closed() => break,
            next = rx.recv() => match next {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
        }
    }

    // already-queued frames (e.g. `shutdown`) go out before the close frame
    let flush = async {
        while let Ok(text) = rx.try_recv() {
            if sink.send(Message::Text(text)).await.is_err() {
                return false;
            }
        }
        true
    };
    if !matches!(tokio::time::timeout(FLUSH_TIMEOUT, flush).await, Ok(true)) {
        return;
    }

    let (code, reason) = close
        .reason()
        .map(|(code, reason)| (code, reason.to_string()))
        .unwrap_or((CLOSE_NORMAL, String::new()));
    close_socket(&mut sink, code, &reason).await;
}

/// Next text payload; `None` once the peer is gone
async fn next_text(stream: &mut WsStream) -> Option<String> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => return Some(text),
                Err(_) => return Some(String::new()),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
        }
    }
    None
}

async fn send_direct(sink: &mut WsSink, frame: &Frame) -> Result<()> {
    let text = encode_frame(frame)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| Error::Unavailable(format!("websocket send failed: {}", e)))
}

async fn close_socket(sink: &mut WsSink, code: u16, reason: &str) {
    // close reasons are limited to 123 bytes
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason[..end].to_string().into(),
        })))
        .await;
}
