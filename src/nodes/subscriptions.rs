//! Bidirectional node <-> session subscription index

use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// One delivery handed to a node sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEvent<'a> {
    pub node_id: &'a str,
    pub event: &'a str,
    /// Serialized payload; `None` for a null payload
    pub payload_json: Option<&'a str>,
}

/// Subscription index.
///
/// The forward map (`node -> sessions`) and reverse map
/// (`session -> nodes`) always mirror each other, and neither holds
/// empty sets. Ids are trimmed; empty ids are ignored.
#[derive(Debug, Default)]
pub struct NodeSubscriptionManager {
    node_sessions: HashMap<String, HashSet<String>>,
    session_nodes: HashMap<String, HashSet<String>>,
}

impl NodeSubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a node to a session. Returns `false` if the pair already
    /// existed or an id was empty.
    pub fn subscribe(&mut self, node_id: &str, session_key: &str) -> bool {
        let (node_id, session_key) = (node_id.trim(), session_key.trim());
        if node_id.is_empty() || session_key.is_empty() {
            return false;
        }

        let added = self
            .node_sessions
            .entry(node_id.to_string())
            .or_default()
            .insert(session_key.to_string());
        self.session_nodes
            .entry(session_key.to_string())
            .or_default()
            .insert(node_id.to_string());

        if added {
            tracing::debug!(node_id, session_key, "Node subscribed");
        }
        added
    }

    /// Remove one subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&mut self, node_id: &str, session_key: &str) -> bool {
        let (node_id, session_key) = (node_id.trim(), session_key.trim());
        if node_id.is_empty() || session_key.is_empty() {
            return false;
        }

        let removed = remove_pair(&mut self.node_sessions, node_id, session_key);
        remove_pair(&mut self.session_nodes, session_key, node_id);

        if removed {
            tracing::debug!(node_id, session_key, "Node unsubscribed");
        }
        removed
    }

    /// Remove a node from every session. Returns the number of
    /// subscriptions dropped.
    pub fn unsubscribe_all(&mut self, node_id: &str) -> usize {
        let node_id = node_id.trim();
        let Some(sessions) = self.node_sessions.remove(node_id) else {
            return 0;
        };
        for session_key in &sessions {
            remove_pair(&mut self.session_nodes, session_key, node_id);
        }
        tracing::debug!(node_id, count = sessions.len(), "Node unsubscribed from all sessions");
        sessions.len()
    }

    /// Invoke `sink` once per node subscribed to `session_key`.
    ///
    /// Delivery is synchronous and exhaustive over the subscribers present
    /// at call time. Returns the number of sink invocations.
    pub fn send_to_session<F>(
        &self,
        session_key: &str,
        event: &str,
        payload: &Value,
        mut sink: F,
    ) -> usize
    where
        F: FnMut(NodeEvent<'_>),
    {
        let Some(nodes) = self.session_nodes.get(session_key.trim()) else {
            return 0;
        };
        let payload_json = to_payload_json(payload);
        for node_id in nodes {
            sink(NodeEvent {
                node_id,
                event,
                payload_json: payload_json.as_deref(),
            });
        }
        nodes.len()
    }

    /// Sessions a node is subscribed to, sorted
    pub fn sessions_for(&self, node_id: &str) -> Vec<String> {
        sorted(self.node_sessions.get(node_id.trim()))
    }

    /// Nodes subscribed to a session, sorted
    pub fn subscribers_of(&self, session_key: &str) -> Vec<String> {
        sorted(self.session_nodes.get(session_key.trim()))
    }

    /// Nodes holding at least one subscription, sorted
    pub fn subscribed_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.node_sessions.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn subscription_count(&self) -> usize {
        self.node_sessions.values().map(HashSet::len).sum()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (node, sessions) in &self.node_sessions {
            assert!(!sessions.is_empty(), "empty forward entry for {}", node);
            for session in sessions {
                assert!(
                    self.session_nodes
                        .get(session)
                        .is_some_and(|nodes| nodes.contains(node)),
                    "{} -> {} missing from reverse map",
                    node,
                    session
                );
            }
        }
        for (session, nodes) in &self.session_nodes {
            assert!(!nodes.is_empty(), "empty reverse entry for {}", session);
            for node in nodes {
                assert!(
                    self.node_sessions
                        .get(node)
                        .is_some_and(|sessions| sessions.contains(session)),
                    "{} -> {} missing from forward map",
                    session,
                    node
                );
            }
        }
    }
}

fn remove_pair(map: &mut HashMap<String, HashSet<String>>, key: &str, member: &str) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(member);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}

fn to_payload_json(payload: &Value) -> Option<String> {
    if payload.is_null() {
        None
    } else {
        serde_json::to_string(payload).ok()
    }
}

fn sorted(set: Option<&HashSet<String>>) -> Vec<String> {
    let mut items: Vec<String> = set.map(|s| s.iter().cloned().collect()).unwrap_or_default();
    items.sort();
    items
}
