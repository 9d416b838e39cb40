//! Versioned snapshot cache

use super::health::{HealthInputs, HealthSummary};
use super::registry::{PresenceEntry, PresenceRegistry};
use crate::protocol::StateVersion;
use crate::session::SessionScope;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Session settings clients need to address the main bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDefaults {
    pub scope: SessionScope,
    pub default_agent_id: String,
    pub main_key: String,
    pub main_session_key: String,
}

/// Full snapshot served by `snapshot` and the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub presence: Vec<PresenceEntry>,
    pub health: HealthSummary,
    pub state_version: StateVersion,
    pub uptime_ms: u64,
    pub session_defaults: SessionDefaults,
}

/// Presence + health cache with monotonic per-dimension versions
#[derive(Debug)]
pub struct SnapshotCache {
    started_at: Instant,
    version: StateVersion,
    presence: PresenceRegistry,
    health: HealthSummary,
    session_defaults: SessionDefaults,
}

impl SnapshotCache {
    pub fn new(presence: PresenceRegistry, session_defaults: SessionDefaults) -> Self {
        Self {
            started_at: Instant::now(),
            version: StateVersion::default(),
            presence,
            health: HealthSummary::default(),
            session_defaults,
        }
    }

    /// Recompute health from `inputs` and return the fresh snapshot. The
    /// health version is bumped only if its content changed; presence is
    /// left alone.
    pub fn refresh(&mut self, inputs: HealthInputs, now: u64) -> Snapshot {
        let started = Instant::now();
        let duration_ms = started.elapsed().as_millis() as u64;
        let health = HealthSummary::collect(inputs, now, duration_ms);
        if !health.same_content(&self.health) {
            self.version.health += 1;
        }
        self.health = health;
        self.get_snapshot()
    }

    /// Cached snapshot, without recomputing health
    pub fn get_snapshot(&self) -> Snapshot {
        Snapshot {
            presence: self.presence.list(),
            health: self.health.clone(),
            state_version: self.version,
            uptime_ms: self.uptime_ms(),
            session_defaults: self.session_defaults.clone(),
        }
    }

    /// Insert or update a presence entry; returns the new version if the
    /// presence content changed.
    pub fn update_presence(&mut self, entry: PresenceEntry) -> Option<StateVersion> {
        self.presence.upsert(entry).then(|| self.bump_presence())
    }

    /// Remove a presence entry; returns the new version if one was removed.
    pub fn remove_presence(&mut self, instance_id: &str) -> Option<StateVersion> {
        self.presence.remove(instance_id).then(|| self.bump_presence())
    }

    /// Refresh `last_seen` of the `live` instances, then drop stale
    /// entries; returns the new version if any expired.
    pub fn prune_presence<'a, I>(&mut self, live: I, now: u64) -> Option<StateVersion>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for instance_id in live {
            self.presence.touch(instance_id, now);
        }
        self.presence.prune(now).then(|| self.bump_presence())
    }

    pub fn presence(&self) -> Vec<PresenceEntry> {
        self.presence.list()
    }

    pub fn health(&self) -> &HealthSummary {
        &self.health
    }

    pub fn state_version(&self) -> StateVersion {
        self.version
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn bump_presence(&mut self) -> StateVersion {
        self.version.presence += 1;
        self.version
    }
}

/// Which dimensions a client must re-fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncNeeded {
    pub presence: bool,
    pub health: bool,
}

impl ResyncNeeded {
    pub fn any(&self) -> bool {
        self.presence || self.health
    }
}

/// Client-side gap detector for broadcast state versions.
///
/// A version that skips ahead by more than one, or moves backwards (the
/// gateway restarted), means an update was missed and the client must
/// fetch a full snapshot.
#[derive(Debug, Clone, Default)]
pub struct StateVersionTracker {
    last: Option<StateVersion>,
}

impl StateVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a version seen on a broadcast
    pub fn observe(&mut self, seen: StateVersion) -> ResyncNeeded {
        let Some(last) = self.last else {
            self.last = Some(seen);
            return ResyncNeeded::default();
        };
        let needed = ResyncNeeded {
            presence: dimension_gap(last.presence, seen.presence),
            health: dimension_gap(last.health, seen.health),
        };
        self.last = Some(seen);
        needed
    }

    /// Adopt the version of a freshly fetched snapshot
    pub fn reset(&mut self, version: StateVersion) {
        self.last = Some(version);
    }

    pub fn last(&self) -> Option<StateVersion> {
        self.last
    }
}

fn dimension_gap(last: u64, seen: u64) -> bool {
    seen < last || seen > last.saturating_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{ChannelHealth, ConnectionCounts};

    fn cache() -> SnapshotCache {
        SnapshotCache::new(
            PresenceRegistry::new(1_000, 10),
            SessionDefaults {
                scope: SessionScope::PerSender,
                default_agent_id: "main".into(),
                main_key: "main".into(),
                main_session_key: "agent:main:main".into(),
            },
        )
    }

    fn entry(id: &str, last_seen: u64) -> PresenceEntry {
        PresenceEntry {
            instance_id: id.into(),
            last_seen,
            ..Default::default()
        }
    }

    fn inputs(connections: usize) -> HealthInputs {
        HealthInputs {
            connections: ConnectionCounts {
                total: connections,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_health_version_bumps_only_on_change() {
        let mut cache = cache();
        let first = cache.refresh(inputs(1), 10);
        assert_eq!(first.state_version.health, 1);

        let same = cache.refresh(inputs(1), 20);
        assert_eq!(same.state_version.health, 1);
        assert_eq!(same.health.ts, 20);

        let changed = cache.refresh(inputs(2), 30);
        assert_eq!(changed.state_version.health, 2);
    }

    #[test]
    fn test_presence_version_bumps_on_change() {
        let mut cache = cache();
        assert_eq!(cache.update_presence(entry("a", 1)).unwrap().presence, 1);
        assert!(cache.update_presence(entry("a", 2)).is_none());
        assert_eq!(cache.remove_presence("a").unwrap().presence, 2);
        assert!(cache.remove_presence("a").is_none());
        assert_eq!(cache.state_version().presence, 2);
    }

    #[test]
    fn test_refresh_leaves_presence_alone() {
        let mut cache = cache();
        cache.update_presence(entry("a", 0));
        let snap = cache.refresh(inputs(0), 5_000);
        assert_eq!(snap.presence.len(), 1);
        assert_eq!(snap.state_version.presence, 1);
    }

    #[test]
    fn test_prune_presence_spares_live_instances() {
        let mut cache = cache();
        cache.update_presence(entry("live", 0));
        cache.update_presence(entry("stale", 0));

        let version = cache.prune_presence(["live"], 5_000).unwrap();
        assert_eq!(version.presence, 3);
        let presence = cache.presence();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].instance_id, "live");
        assert_eq!(presence[0].last_seen, 5_000);

        assert!(cache.prune_presence(["live"], 5_500).is_none());
        assert_eq!(cache.state_version().presence, 3);
    }

    #[test]
    fn test_versions_never_decrease() {
        let mut cache = cache();
        let mut last = cache.state_version();
        for i in 0..20u64 {
            if i % 3 == 0 {
                cache.update_presence(entry(&format!("p{}", i), i));
            }
            let snap = cache.refresh(inputs((i % 4) as usize), i);
            assert!(snap.state_version.presence >= last.presence);
            assert!(snap.state_version.health >= last.health);
            last = snap.state_version;
        }
    }

    #[test]
    fn test_get_snapshot_uses_cached_health() {
        let mut cache = cache();
        let mut with_channel = inputs(1);
        with_channel.channels.insert(
            "slack".into(),
            ChannelHealth {
                status: "running".into(),
                running: true,
            },
        );
        cache.refresh(with_channel, 10);
        let snap = cache.get_snapshot();
        assert_eq!(snap.health.ts, 10);
        assert!(snap.health.channels.contains_key("slack"));
        assert_eq!(snap.session_defaults.main_session_key, "agent:main:main");
    }

    #[test]
    fn test_tracker_detects_gaps() {
        let mut tracker = StateVersionTracker::new();
        let v = |presence, health| StateVersion { presence, health };
        assert!(!tracker.observe(v(1, 1)).any());
        assert!(!tracker.observe(v(2, 1)).any());
        let gap = tracker.observe(v(4, 1));
        assert!(gap.presence);
        assert!(!gap.health);
        let restart = tracker.observe(v(0, 0));
        assert!(restart.presence && restart.health);
        tracker.reset(v(5, 5));
        assert!(!tracker.observe(v(5, 6)).any());
    }
}
