//! Presence and health snapshot
//!
//! The gateway keeps a point-in-time view of connected peers (presence)
//! and subsystem health, versioned per dimension with a [`StateVersion`].
//! Broadcasts that reflect a change carry the new version; a client that
//! sees a version skip ahead re-fetches the whole snapshot instead of
//! replaying deltas.

mod health;
mod registry;
mod snapshot;

pub use crate::protocol::StateVersion;
pub use health::{ChannelHealth, ConnectionCounts, HealthInputs, HealthSummary};
pub use registry::{PresenceEntry, PresenceRegistry};
pub use snapshot::{ResyncNeeded, SessionDefaults, Snapshot, SnapshotCache, StateVersionTracker};
