//! Health summary

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health of one channel adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHealth {
    pub status: String,
    pub running: bool,
}

/// Connection counts by client mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounts {
    pub total: usize,
    pub by_mode: BTreeMap<String, usize>,
}

/// Raw inputs gathered from the gateway for one health refresh
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub connections: ConnectionCounts,
    pub nodes: usize,
    pub active_runs: usize,
    pub channels: BTreeMap<String, ChannelHealth>,
}

/// Point-in-time health view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub ok: bool,
    pub ts: u64,
    pub duration_ms: u64,
    pub connections: ConnectionCounts,
    pub nodes: usize,
    pub active_runs: usize,
    pub channels: BTreeMap<String, ChannelHealth>,
}

impl HealthSummary {
    /// Build a summary from gathered inputs.
    ///
    /// Health is `ok` when every configured channel adapter is running.
    pub fn collect(inputs: HealthInputs, ts: u64, duration_ms: u64) -> Self {
        let ok = inputs.channels.values().all(|c| c.running);
        Self {
            ok,
            ts,
            duration_ms,
            connections: inputs.connections,
            nodes: inputs.nodes,
            active_runs: inputs.active_runs,
            channels: inputs.channels,
        }
    }

    /// Equal apart from timing fields
    pub fn same_content(&self, other: &HealthSummary) -> bool {
        self.ok == other.ok
            && self.connections == other.connections
            && self.nodes == other.nodes
            && self.active_runs == other.active_runs
            && self.channels == other.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(running: bool) -> HealthInputs {
        let mut channels = BTreeMap::new();
        channels.insert(
            "telegram".to_string(),
            ChannelHealth {
                status: if running { "running" } else { "error" }.to_string(),
                running,
            },
        );
        HealthInputs {
            channels,
            ..Default::default()
        }
    }

    #[test]
    fn test_ok_reflects_channels() {
        assert!(HealthSummary::collect(inputs(true), 1, 0).ok);
        assert!(!HealthSummary::collect(inputs(false), 1, 0).ok);
        assert!(HealthSummary::collect(HealthInputs::default(), 1, 0).ok);
    }

    #[test]
    fn test_same_content_ignores_timing() {
        let a = HealthSummary::collect(inputs(true), 1, 5);
        let b = HealthSummary::collect(inputs(true), 99, 7);
        assert!(a.same_content(&b));
        let c = HealthSummary::collect(inputs(false), 1, 5);
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_serializes_camel_case() {
        let summary = HealthSummary::collect(HealthInputs::default(), 10, 2);
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["durationMs"], 2);
        assert_eq!(value["activeRuns"], 0);
        assert!(value["connections"]["byMode"].is_object());
    }
}
