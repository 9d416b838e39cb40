//! Gateway server for ClawGate
//!
//! Provides the WebSocket control plane, the HTTP API and the channel
//! pipeline feeding chat runs.

pub(crate) mod broadcast;
pub mod connection;
pub mod dispatch;
mod handler;
pub mod handlers;
pub(crate) mod hub;
pub mod inbound;
mod server;

pub use broadcast::{
    BroadcastReport, Broadcaster, CloseSignal, ConnectionInfo, SendOutcome, CLOSE_POLICY,
    CLOSE_RESTART,
};
pub use dispatch::MethodTable;
pub use handler::ApiHandler;
pub use hub::{now_ms, AbortResult, GatewayHub, NodeSummary, RunStarted, RunStatus, StartRun};
pub use inbound::InboundProcessor;
pub use server::{Gateway, GatewayBuilder, GatewayState};
