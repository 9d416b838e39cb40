//! ClawGate - multi-front-end agent gateway
//!
//! ClawGate sits between many heterogeneous front-ends (chat platform
//! bridges, command-line tools, companion "node" devices, control UIs) and a
//! single shared agent backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ClawGate Gateway                          │
//! │                                                                  │
//! │  WebSocket clients ──► connection ──► dispatch ──► handlers      │
//! │  (cli, node, ui)          │ ▲                         │          │
//! │                           │ └──── broadcaster ◄───────┤          │
//! │                           ▼                           ▼          │
//! │                   presence / health            chat run registry │
//! │                        snapshot                       │          │
//! │                                                       ▼          │
//! │  channel adapters ──► inbound pipeline ──► runner ──► backend    │
//! │  (webhook, ...)   ◄── reply delivery  ◄──────┘                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: framed request/response/event wire protocol
//! - [`gateway`]: WebSocket control plane, HTTP API and lifecycle
//! - [`chat`]: chat run registry, cancellation and the run driver
//! - [`session`]: canonical session key resolution
//! - [`channels`]: channel adapters, supervision and reply delivery
//! - [`nodes`]: node-to-session subscriptions
//! - [`presence`]: presence registry, health summary and state versions
//! - [`dedupe`]: TTL + size bounded de-duplication cache
//! - [`retry`]: exponential backoff with jitter
//! - [`privacy`]: secret redaction
//! - [`agent`]: the agent backend seam
//! - [`client`]: WebSocket client for a running gateway
//! - [`config`]: configuration management

pub mod agent;
pub mod channels;
pub mod chat;
pub mod client;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod gateway;
pub mod nodes;
pub mod presence;
pub mod privacy;
pub mod protocol;
pub mod retry;
pub mod session;

pub use config::ClawGateConfig;
pub use error::{Error, Result};
