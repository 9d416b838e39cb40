//! Node subscriptions
//!
//! Nodes (companion devices, CLIs) mirror the event stream of the sessions
//! they subscribe to without being the channel that originated them.

mod subscriptions;

pub use subscriptions::{NodeEvent, NodeSubscriptionManager};
