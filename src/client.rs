//! WebSocket client for a running gateway
//!
//! Used by the `call` and `watch` CLI commands. Speaks the same framed
//! protocol as any other front-end: `connect` first, then requests.

use crate::presence::StateVersionTracker;
use crate::protocol::params::SCOPE_ADMIN;
use crate::protocol::{decode_frame, encode_frame, EventFrame, Frame, RequestFrame, PROTOCOL_VERSION};
use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type WebSocketStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Frames larger than this are rejected client-side too
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Connection settings for [`GatewayClient::connect`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub token: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub mode: String,
    pub timeout: Duration,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            password: None,
            client_id: "clawgate-cli".to_string(),
            mode: "cli".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// `connect` request params for these options
    pub fn connect_params(&self) -> Value {
        let mut params = json!({
            "minProtocol": PROTOCOL_VERSION,
            "maxProtocol": PROTOCOL_VERSION,
            "client": {
                "id": self.client_id,
                "version": env!("CARGO_PKG_VERSION"),
                "platform": std::env::consts::OS,
                "mode": self.mode,
            },
        });
        if self.mode != "node" {
            params["scopes"] = json!([SCOPE_ADMIN]);
        }
        if self.token.is_some() || self.password.is_some() {
            let mut auth = json!({});
            if let Some(token) = &self.token {
                auth["token"] = json!(token);
            }
            if let Some(password) = &self.password {
                auth["password"] = json!(password);
            }
            params["auth"] = auth;
        }
        params
    }
}

/// Client side of one gateway connection
pub struct GatewayClient {
    write: SplitSink<WebSocketStream, Message>,
    read: SplitStream<WebSocketStream>,
    hello: Value,
    next_id: u64,
    timeout: Duration,
    /// Events received while waiting for a response
    backlog: VecDeque<EventFrame>,
}

impl GatewayClient {
    /// Open a connection and complete the `connect` handshake
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        tracing::debug!(url = %options.url, "Connecting to gateway");
        let (ws_stream, _) = tokio::time::timeout(options.timeout, connect_async(options.url.as_str()))
            .await
            .context("Timed out connecting to gateway")?
            .context("Failed to connect to gateway")?;
        let (write, read) = ws_stream.split();

        let mut client = Self {
            write,
            read,
            hello: Value::Null,
            next_id: 0,
            timeout: options.timeout,
            backlog: VecDeque::new(),
        };
        client.hello = client
            .call("connect", options.connect_params())
            .await
            .context("Gateway rejected connect")?;
        if client.hello["type"] != "hello-ok" {
            bail!("unexpected handshake reply: {}", client.hello);
        }
        tracing::debug!(
            conn_id = %client.hello["server"]["connId"].as_str().unwrap_or_default(),
            "Connected to gateway"
        );
        Ok(client)
    }

    /// The `hello-ok` payload from the handshake
    pub fn hello(&self) -> &Value {
        &self.hello
    }

    /// Send a request and wait for its response
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let request = Frame::Req(RequestFrame::new(id.clone(), method, params));
        self.write
            .send(Message::Text(encode_frame(&request)?))
            .await
            .context("Failed to send request")?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.next_frame())
                .await
                .map_err(|_| anyhow!("timed out waiting for '{}' response", method))??;
            match frame {
                Frame::Res(response) if response.id == id => {
                    if response.ok {
                        return Ok(response.result.unwrap_or(Value::Null));
                    }
                    let error = response
                        .error
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_else(|| "request failed".to_string());
                    bail!(error);
                }
                Frame::Event(event) => self.backlog.push_back(event),
                Frame::Res(_) | Frame::Req(_) => {}
            }
        }
    }

    /// Next broadcast event; `None` once the gateway closed the connection
    pub async fn next_event(&mut self) -> Result<Option<EventFrame>> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }
        loop {
            match self.next_frame().await {
                Ok(Frame::Event(event)) => return Ok(Some(event)),
                Ok(_) => {}
                Err(e) if e.is::<Closed>() => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        while let Some(message) = self.read.next().await {
            match message.context("WebSocket error")? {
                Message::Text(text) => {
                    return decode_frame(&text, MAX_FRAME_BYTES)
                        .map_err(|e| anyhow!("bad frame from gateway: {}", e.message));
                }
                Message::Close(frame) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(Closed(reason).into());
                }
                _ => {}
            }
        }
        Err(Closed(String::new()).into())
    }

    /// Close the connection politely
    pub async fn close(mut self) -> Result<()> {
        self.write.send(Message::Close(None)).await.ok();
        Ok(())
    }
}

#[derive(Debug)]
struct Closed(String);

impl std::fmt::Display for Closed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "connection closed by gateway")
        } else {
            write!(f, "connection closed by gateway: {}", self.0)
        }
    }
}

impl std::error::Error for Closed {}

/// What `watch` reports for each broadcast
#[derive(Debug, Clone)]
pub enum WatchUpdate {
    Event(EventFrame),
    /// A state version gap was seen and the snapshot re-fetched
    Resynced(Value),
}

/// Follow broadcasts until the gateway goes away, re-fetching `snapshot`
/// whenever a state version gap shows an update was missed.
pub async fn watch<F>(client: &mut GatewayClient, mut on_update: F) -> Result<()>
where
    F: FnMut(&WatchUpdate),
{
    let mut tracker = StateVersionTracker::new();
    if let Some(version) = stated_version(&client.hello()["snapshot"]) {
        tracker.reset(version);
    }

    while let Some(event) = client.next_event().await? {
        let resync = event
            .state_version
            .map(|version| tracker.observe(version).any())
            .unwrap_or(false);
        let shutdown = event.event == "shutdown";
        on_update(&WatchUpdate::Event(event));
        if shutdown {
            break;
        }
        if resync {
            tracing::info!("State version gap detected, re-fetching snapshot");
            let snapshot = client.call("snapshot", Value::Null).await?;
            if let Some(version) = stated_version(&snapshot) {
                tracker.reset(version);
            }
            on_update(&WatchUpdate::Resynced(snapshot));
        }
    }
    Ok(())
}

fn stated_version(snapshot: &Value) -> Option<crate::protocol::StateVersion> {
    serde_json::from_value(snapshot.get("stateVersion")?.clone()).ok()
}
