//! Presence registry

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Liveness and identity record of a connected peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Registry key: device id when known, else connection id
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PresenceEntry {
    /// Equal apart from `last_seen`
    fn same_content(&self, other: &PresenceEntry) -> bool {
        let mut a = self.clone();
        a.last_seen = other.last_seen;
        a == *other
    }
}

/// Presence entries keyed by instance id, bounded by TTL and count
#[derive(Debug)]
pub struct PresenceRegistry {
    entries: HashMap<String, PresenceEntry>,
    ttl_ms: u64,
    max_entries: usize,
}

impl PresenceRegistry {
    pub fn new(ttl_ms: u64, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
            max_entries,
        }
    }

    /// Insert or update an entry. Returns `true` when the visible content
    /// changed (a bare `last_seen` bump is not a change).
    pub fn upsert(&mut self, entry: PresenceEntry) -> bool {
        let changed = match self.entries.get(&entry.instance_id) {
            Some(existing) => !existing.same_content(&entry),
            None => true,
        };
        self.entries.insert(entry.instance_id.clone(), entry);
        let evicted = self.enforce_capacity();
        changed || evicted
    }

    /// Mark an entry as seen at `now`. Not a content change.
    pub fn touch(&mut self, instance_id: &str, now: u64) -> bool {
        match self.entries.get_mut(instance_id) {
            Some(entry) => {
                entry.last_seen = entry.last_seen.max(now);
                true
            }
            None => false,
        }
    }

    /// Remove an entry by instance id
    pub fn remove(&mut self, instance_id: &str) -> bool {
        self.entries.remove(instance_id).is_some()
    }

    /// Drop entries not seen within the TTL. Returns `true` if any were
    /// removed.
    pub fn prune(&mut self, now: u64) -> bool {
        if self.ttl_ms == 0 {
            return false;
        }
        let ttl = self.ttl_ms;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.last_seen) < ttl);
        before != self.entries.len()
    }

    /// Entries, most recently seen first
    pub fn list(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        entries
    }

    pub fn get(&self, instance_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(instance_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn enforce_capacity(&mut self) -> bool {
        let mut evicted = false;
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .values()
                .min_by(|a, b| {
                    a.last_seen
                        .cmp(&b.last_seen)
                        .then_with(|| a.instance_id.cmp(&b.instance_id))
                })
                .map(|e| e.instance_id.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    evicted = true;
                }
                None => break,
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, last_seen: u64) -> PresenceEntry {
        PresenceEntry {
            instance_id: id.to_string(),
            mode: Some("cli".to_string()),
            last_seen,
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_reports_changes() {
        let mut reg = PresenceRegistry::new(60_000, 10);
        assert!(reg.upsert(entry("a", 1)));
        // Only last_seen moved.
        assert!(!reg.upsert(entry("a", 2)));
        assert_eq!(reg.get("a").unwrap().last_seen, 2);

        let mut changed = entry("a", 3);
        changed.reason = Some("disconnect".to_string());
        assert!(reg.upsert(changed));
    }

    #[test]
    fn test_prune_by_ttl() {
        let mut reg = PresenceRegistry::new(1_000, 10);
        reg.upsert(entry("old", 0));
        reg.upsert(entry("new", 900));
        assert!(reg.prune(1_500));
        assert!(reg.get("old").is_none());
        assert!(reg.get("new").is_some());
        assert!(!reg.prune(1_500));
    }

    #[test]
    fn test_touch_keeps_entry_alive() {
        let mut reg = PresenceRegistry::new(1_000, 10);
        reg.upsert(entry("live", 0));
        reg.upsert(entry("gone", 0));
        assert!(reg.touch("live", 1_200));
        assert!(!reg.touch("missing", 1_200));
        assert!(reg.prune(1_500));
        assert_eq!(reg.get("live").unwrap().last_seen, 1_200);
        assert!(reg.get("gone").is_none());
    }

    #[test]
    fn test_capacity_evicts_least_recently_seen() {
        let mut reg = PresenceRegistry::new(0, 2);
        reg.upsert(entry("a", 10));
        reg.upsert(entry("b", 5));
        assert!(reg.upsert(entry("c", 20)));
        assert_eq!(reg.len(), 2);
        assert!(reg.get("b").is_none());
    }

    #[test]
    fn test_list_sorted_by_recency() {
        let mut reg = PresenceRegistry::new(0, 10);
        reg.upsert(entry("a", 1));
        reg.upsert(entry("b", 3));
        reg.upsert(entry("c", 2));
        let ids: Vec<String> = reg.list().into_iter().map(|e| e.instance_id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_remove() {
        let mut reg = PresenceRegistry::new(0, 10);
        reg.upsert(entry("a", 1));
        assert!(reg.remove("a"));
        assert!(!reg.remove("a"));
        assert!(reg.is_empty());
    }
}
