//! Event fan-out to connected clients
//!
//! Every connection owns a bounded outbound queue drained by its writer
//! task. Fan-out never blocks: a full queue either drops the frame
//! (`drop_if_slow`) or marks the connection as a slow consumer and closes
//! it.

use crate::error::Result;
use crate::presence::ConnectionCounts;
use crate::protocol::{encode_frame, ClientMode, ClientRole, EventFrame, Frame, StateVersion};
use crate::protocol::params::{SCOPE_ADMIN, SCOPE_WRITE};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// WebSocket close code for policy violations (slow consumer, bad handshake)
pub const CLOSE_POLICY: u16 = 1008;
/// WebSocket close code for a gateway restart
pub const CLOSE_RESTART: u16 = 1012;

/// Identity of an authenticated connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub conn_id: String,
    pub role: ClientRole,
    pub mode: ClientMode,
    pub scopes: Vec<String>,
    /// Node id for node-role connections
    pub node_id: Option<String>,
    pub client_id: String,
    /// Presence key: device id, else connection id
    pub instance_id: String,
    pub remote_addr: Option<String>,
}

impl ConnectionInfo {
    pub fn is_node(&self) -> bool {
        self.role == ClientRole::Node
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Operator allowed to start and abort runs
    pub fn can_write(&self) -> bool {
        self.role == ClientRole::Operator && (self.has_scope(SCOPE_ADMIN) || self.has_scope(SCOPE_WRITE))
    }
}

/// Close request shared between the broadcaster and a connection's tasks
#[derive(Debug, Clone, Default)]
pub struct CloseSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<(u16, String)>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a close; the first reason wins
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.reason.set((code, reason.into()));
        self.token.cancel();
    }

    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<(u16, &str)> {
        self.reason.get().map(|(code, reason)| (*code, reason.as_str()))
    }
}

/// Result of queueing one frame for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full and the frame was optional
    Dropped,
    /// Queue full for a required frame, connection closing, or writer gone
    Closed,
    /// No such connection
    Unknown,
}

/// Per-broadcast delivery counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub seq: u64,
    pub queued: usize,
    pub dropped: usize,
    pub closed: usize,
}

impl BroadcastReport {
    fn record(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Queued => self.queued += 1,
            SendOutcome::Dropped => self.dropped += 1,
            SendOutcome::Closed => self.closed += 1,
            SendOutcome::Unknown => {}
        }
    }
}

struct Slot {
    info: ConnectionInfo,
    tx: mpsc::Sender<String>,
    close: CloseSignal,
}

/// Registry of live connections and their outbound queues
#[derive(Default)]
pub struct Broadcaster {
    slots: Mutex<HashMap<String, Slot>>,
    seq: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, info: ConnectionInfo, tx: mpsc::Sender<String>, close: CloseSignal) {
        let conn_id = info.conn_id.clone();
        self.slots().insert(conn_id, Slot { info, tx, close });
    }

    pub fn unregister(&self, conn_id: &str) -> Option<ConnectionInfo> {
        self.slots().remove(conn_id).map(|slot| slot.info)
    }

    pub fn connection(&self, conn_id: &str) -> Option<ConnectionInfo> {
        self.slots().get(conn_id).map(|slot| slot.info.clone())
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.slots().values().map(|slot| slot.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Connection ids currently serving `node_id`
    pub fn node_connections(&self, node_id: &str) -> Vec<String> {
        self.slots()
            .values()
            .filter(|slot| slot.info.node_id.as_deref() == Some(node_id))
            .map(|slot| slot.info.conn_id.clone())
            .collect()
    }

    /// Distinct node ids with at least one live connection
    pub fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .slots()
            .values()
            .filter_map(|slot| slot.info.node_id.clone())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn counts(&self) -> ConnectionCounts {
        let slots = self.slots();
        let mut counts = ConnectionCounts {
            total: slots.len(),
            ..Default::default()
        };
        for slot in slots.values() {
            *counts
                .by_mode
                .entry(slot.info.mode.as_str().to_string())
                .or_default() += 1;
        }
        counts
    }

    /// Encode an event frame with the next global sequence number
    pub fn event_frame(
        &self,
        event: &str,
        data: Value,
        state_version: Option<StateVersion>,
    ) -> Result<(u64, String)> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut frame = EventFrame::new(event, data).with_seq(seq);
        if let Some(version) = state_version {
            frame = frame.with_state_version(version);
        }
        Ok((seq, encode_frame(&Frame::Event(frame))?))
    }

    /// Queue already-encoded text for one connection
    pub fn send_text(&self, conn_id: &str, text: String, drop_if_slow: bool) -> SendOutcome {
        match self.slots().get(conn_id) {
            Some(slot) => push(slot, text, drop_if_slow),
            None => SendOutcome::Unknown,
        }
    }

    /// Queue one frame for one connection
    pub fn send_frame(&self, conn_id: &str, frame: &Frame, drop_if_slow: bool) -> Result<SendOutcome> {
        let text = encode_frame(frame)?;
        Ok(self.send_text(conn_id, text, drop_if_slow))
    }

    /// Broadcast an event to every connection
    pub fn broadcast(
        &self,
        event: &str,
        data: Value,
        state_version: Option<StateVersion>,
        drop_if_slow: bool,
    ) -> Result<BroadcastReport> {
        let (seq, text) = self.event_frame(event, data, state_version)?;
        let mut report = BroadcastReport {
            seq,
            ..Default::default()
        };
        for slot in self.slots().values() {
            report.record(push(slot, text.clone(), drop_if_slow));
        }
        tracing::trace!(event, seq, queued = report.queued, dropped = report.dropped, "Broadcast");
        Ok(report)
    }

    /// Close every connection
    pub fn close_all(&self, code: u16, reason: &str) {
        for slot in self.slots().values() {
            slot.close.close(code, reason);
        }
    }
}

/// Slots stay registered until [`Broadcaster::unregister`]; a slow
/// consumer is only signalled to close.
fn push(slot: &Slot, text: String, drop_if_slow: bool) -> SendOutcome {
    let conn_id = slot.info.conn_id.as_str();
    if slot.close.is_closed() {
        return SendOutcome::Closed;
    }
    match slot.tx.try_send(text) {
        Ok(()) => SendOutcome::Queued,
        Err(TrySendError::Full(_)) if drop_if_slow => {
            tracing::debug!(conn_id, "Outbound queue full, dropping optional frame");
            SendOutcome::Dropped
        }
        Err(TrySendError::Full(_)) => {
            tracing::warn!(conn_id, "Closing slow consumer");
            slot.close.close(CLOSE_POLICY, "slow consumer");
            SendOutcome::Closed
        }
        Err(TrySendError::Closed(_)) => SendOutcome::Closed,
    }
}
