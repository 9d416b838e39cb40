//! Channel adapters
//!
//! Chat platform bridges feed [`ChannelEvent`]s into the gateway and take
//! replies back through [`ChannelAdapter::send_message`]. Adapters run under
//! a restart supervisor; replies go out with per-attempt timeouts and
//! retry/backoff.

mod adapter;
mod delivery;
mod message;
pub mod supervisor;
mod webhook;

pub use adapter::{AdapterBase, AdapterStatus, ChannelAdapter, ChannelEvent};
pub use delivery::deliver_reply;
pub use message::{InboundMessage, OutboundMessage, ReplyTarget};
pub use supervisor::{spawn_supervised, RestartPolicy, Supervised};
pub use webhook::{AuthOutcome, WebhookAdapter, WebhookPayload};

#[cfg(test)]
pub(crate) mod testing;
