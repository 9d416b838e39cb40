//! Agent backend seam
//!
//! The agent's reasoning and tool loop lives outside the gateway. The
//! gateway hands it an [`AgentIntent`] and consumes the resulting stream of
//! [`AgentEvent`]s; everything behind [`AgentBackend`] is opaque.
//!
//! ```text
//! chat.send ──▶ runner ──invoke(intent, cancel)──▶ AgentBackend
//!                  ▲                                   │
//!                  └──────── AgentStream (events) ◀────┘
//! ```

mod backend;
pub mod types;

pub use backend::{AgentBackend, AgentStream, EchoBackend};
pub use types::{AgentEvent, AgentIntent, AgentPhase};

#[cfg(test)]
pub(crate) mod testing;
