//! Chat run registry

use super::event::{ChatEvent, ChatEventState};
use super::run::{ChatRunEntry, RunEvent, RunHandle, RunState, RunSummary};
use crate::error::{Error, Result};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Registry tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRegistryConfig {
    /// How long a cancelled run's late events are swallowed
    pub abort_grace_ms: u64,
    /// How long an undrained terminal run is kept
    pub eviction_grace_ms: u64,
    /// Minimum spacing between delivered deltas of one run
    pub delta_throttle_ms: u64,
}

impl Default for RunRegistryConfig {
    fn default() -> Self {
        Self {
            abort_grace_ms: 5_000,
            eviction_grace_ms: 60_000,
            delta_throttle_ms: 150,
        }
    }
}

/// Result of `create`
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A new run was registered; the caller must start it
    Created(RunHandle),
    /// An active run already exists for the pair; nothing was started
    Existing(RunHandle),
}

impl CreateOutcome {
    pub fn handle(&self) -> &RunHandle {
        match self {
            Self::Created(handle) | Self::Existing(handle) => handle,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// A chat event ready for fan-out
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event: ChatEvent,
    /// Connection that started the run
    pub requester: Option<String>,
}

/// Result of `cancel`
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The run was active and is now aborted
    Cancelled(Delivery),
    /// The run had already been cancelled
    AlreadyCancelled,
    /// The run had already finished; nothing changed
    AlreadyTerminal(RunState),
}

/// Why an ingested event was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Cancelled,
    Terminal,
    UnknownRun,
}

/// Result of ingesting a backend event
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    Deliver(Delivery),
    /// Accumulated but held back by delta throttling
    Buffered,
    Dropped(DropReason),
}

/// Registry of chat runs.
///
/// Plain data with `&mut self` operations; the gateway owns it behind a
/// lock that is never held across an await.
#[derive(Debug)]
pub struct ChatRunRegistry {
    config: RunRegistryConfig,
    runs: HashMap<String, ChatRunEntry>,
    /// `(sessionKey, clientRunId) -> runId` for non-terminal runs
    active: HashMap<(String, String), String>,
    /// `runId -> cancelled at`
    aborted: HashMap<String, u64>,
}

impl ChatRunRegistry {
    pub fn new(config: RunRegistryConfig) -> Self {
        Self {
            config,
            runs: HashMap::new(),
            active: HashMap::new(),
            aborted: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RunRegistryConfig {
        &self.config
    }

    /// Register a run for `(session_key, client_run_id)`, or return the
    /// active one for that pair.
    pub fn create(
        &mut self,
        session_key: &str,
        client_run_id: &str,
        requester: Option<&str>,
        now: u64,
    ) -> CreateOutcome {
        let pair = (session_key.to_string(), client_run_id.to_string());
        if let Some(existing) = self.active_entry(&pair) {
            return CreateOutcome::Existing(existing.handle());
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        CreateOutcome::Created(self.insert(run_id, pair, requester, now))
    }

    /// Like [`create`](Self::create), but with a caller-chosen run id.
    ///
    /// Fails with `CONFLICT` if `run_id` already names a different run, or a
    /// recently cancelled one.
    pub fn create_with_id(
        &mut self,
        run_id: &str,
        session_key: &str,
        client_run_id: &str,
        requester: Option<&str>,
        now: u64,
    ) -> Result<CreateOutcome> {
        let pair = (session_key.to_string(), client_run_id.to_string());
        if let Some(existing) = self.active_entry(&pair) {
            if existing.run_id != run_id {
                return Err(Error::Conflict(format!(
                    "client run '{}' is already active as run '{}'",
                    client_run_id, existing.run_id
                )));
            }
            return Ok(CreateOutcome::Existing(existing.handle()));
        }
        if self.runs.contains_key(run_id) || self.aborted.contains_key(run_id) {
            return Err(Error::Conflict(format!("run id '{}' is already in use", run_id)));
        }
        Ok(CreateOutcome::Created(self.insert(
            run_id.to_string(),
            pair,
            requester,
            now,
        )))
    }

    /// Cancel a run. Idempotent: repeated calls and calls on finished runs
    /// change nothing.
    pub fn cancel(&mut self, run_id: &str, now: u64) -> Result<CancelOutcome> {
        let Some(entry) = self.runs.get_mut(run_id) else {
            if self.aborted.contains_key(run_id) {
                return Ok(CancelOutcome::AlreadyCancelled);
            }
            return Err(Error::NotFound(format!("unknown run '{}'", run_id)));
        };

        match entry.state {
            RunState::Aborted => return Ok(CancelOutcome::AlreadyCancelled),
            state if state.is_terminal() => return Ok(CancelOutcome::AlreadyTerminal(state)),
            _ => {}
        }

        entry.state = RunState::Aborted;
        entry.seq += 1;
        entry.updated_at = now;
        entry.finished_at = Some(now);
        entry.cancel.cancel();
        let delivery = terminal_delivery(entry, None, None);

        let pair = (entry.session_key.clone(), entry.client_run_id.clone());
        self.aborted.insert(run_id.to_string(), now);
        self.release_pair(&pair, run_id);

        tracing::info!(
            run_id,
            session_key = %delivery.event.session_key,
            "Chat run cancelled"
        );
        Ok(CancelOutcome::Cancelled(delivery))
    }

    /// Cancel every active run of a session; returns one delivery per run
    /// that was actually cancelled.
    pub fn cancel_session(&mut self, session_key: &str, now: u64) -> Vec<Delivery> {
        let run_ids: Vec<String> = self
            .active
            .iter()
            .filter(|((session, _), _)| session == session_key)
            .map(|(_, run_id)| run_id.clone())
            .collect();

        run_ids
            .iter()
            .filter_map(|run_id| match self.cancel(run_id, now) {
                Ok(CancelOutcome::Cancelled(delivery)) => Some(delivery),
                _ => None,
            })
            .collect()
    }

    /// Apply one backend event to a run.
    pub fn ingest(&mut self, run_id: &str, event: RunEvent, now: u64) -> Ingest {
        if let Some(cancelled_at) = self.aborted.get(run_id) {
            if now.saturating_sub(*cancelled_at) <= self.config.abort_grace_ms {
                tracing::debug!(run_id, "Dropping event for cancelled run");
                return Ingest::Dropped(DropReason::Cancelled);
            }
        }

        let throttle = self.config.delta_throttle_ms;
        let Some(entry) = self.runs.get_mut(run_id) else {
            return Ingest::Dropped(DropReason::UnknownRun);
        };
        if entry.state.is_terminal() {
            let reason = if entry.state == RunState::Aborted {
                DropReason::Cancelled
            } else {
                DropReason::Terminal
            };
            return Ingest::Dropped(reason);
        }
        entry.updated_at = now;

        match event {
            RunEvent::Delta(text) => {
                if text.is_empty() {
                    return Ingest::Buffered;
                }
                entry.buffer.push_str(&text);
                entry.state = RunState::Streaming;
                if let Some(last) = entry.last_delta_at {
                    if now.saturating_sub(last) < throttle {
                        return Ingest::Buffered;
                    }
                }
                entry.last_delta_at = Some(now);
                entry.seq += 1;
                Ingest::Deliver(Delivery {
                    event: ChatEvent {
                        run_id: entry.run_id.clone(),
                        session_key: entry.session_key.clone(),
                        seq: entry.seq,
                        state: ChatEventState::Delta,
                        message: Some(entry.buffer.clone()),
                        error_message: None,
                        stop_reason: None,
                    },
                    requester: entry.requester.clone(),
                })
            }
            RunEvent::Final { stop_reason } => {
                entry.state = RunState::Final;
                entry.seq += 1;
                entry.finished_at = Some(now);
                let delivery = terminal_delivery(entry, None, stop_reason);
                let pair = (entry.session_key.clone(), entry.client_run_id.clone());
                self.release_pair(&pair, run_id);
                Ingest::Deliver(delivery)
            }
            RunEvent::Error(message) => {
                entry.state = RunState::Error;
                entry.seq += 1;
                entry.finished_at = Some(now);
                let delivery = terminal_delivery(entry, Some(message), None);
                let pair = (entry.session_key.clone(), entry.client_run_id.clone());
                self.release_pair(&pair, run_id);
                Ingest::Deliver(delivery)
            }
        }
    }

    /// Whether the run has been cancelled (or is unknown and recorded as
    /// cancelled).
    pub fn is_cancelled(&self, run_id: &str) -> bool {
        self.aborted.contains_key(run_id)
            || self
                .runs
                .get(run_id)
                .is_some_and(|entry| entry.state == RunState::Aborted)
    }

    /// Remove a drained run
    pub fn remove(&mut self, run_id: &str) -> Option<ChatRunEntry> {
        let entry = self.runs.remove(run_id)?;
        let pair = (entry.session_key.clone(), entry.client_run_id.clone());
        self.release_pair(&pair, run_id);
        Some(entry)
    }

    /// Evict undrained terminal runs past the eviction grace and forget
    /// abort records past the abort grace. Returns evicted run count.
    pub fn sweep(&mut self, now: u64) -> usize {
        let eviction_grace = self.config.eviction_grace_ms;
        let expired: Vec<String> = self
            .runs
            .values()
            .filter(|entry| {
                entry
                    .finished_at
                    .is_some_and(|at| now.saturating_sub(at) >= eviction_grace)
            })
            .map(|entry| entry.run_id.clone())
            .collect();
        for run_id in &expired {
            self.remove(run_id);
        }

        let abort_grace = self.config.abort_grace_ms;
        self.aborted
            .retain(|_, cancelled_at| now.saturating_sub(*cancelled_at) <= abort_grace);

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Evicted finished chat runs");
        }
        expired.len()
    }

    pub fn get(&self, run_id: &str) -> Option<&ChatRunEntry> {
        self.runs.get(run_id)
    }

    /// Active runs, optionally limited to one session, oldest first
    pub fn active_runs(&self, session_key: Option<&str>) -> Vec<RunSummary> {
        let mut runs: Vec<RunSummary> = self
            .active
            .iter()
            .filter(|((session, _), _)| session_key.map_or(true, |s| s == session))
            .filter_map(|(_, run_id)| self.runs.get(run_id))
            .map(ChatRunEntry::summary)
            .collect();
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        runs
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn active_entry(&self, pair: &(String, String)) -> Option<&ChatRunEntry> {
        self.active
            .get(pair)
            .and_then(|run_id| self.runs.get(run_id))
            .filter(|entry| !entry.state.is_terminal())
    }

    fn insert(
        &mut self,
        run_id: String,
        pair: (String, String),
        requester: Option<&str>,
        now: u64,
    ) -> RunHandle {
        let entry = ChatRunEntry {
            run_id: run_id.clone(),
            session_key: pair.0.clone(),
            client_run_id: pair.1.clone(),
            state: RunState::Pending,
            seq: 0,
            buffer: String::new(),
            cancel: CancellationToken::new(),
            requester: requester.map(str::to_string),
            created_at: now,
            updated_at: now,
            finished_at: None,
            last_delta_at: None,
        };
        let handle = entry.handle();
        tracing::info!(
            run_id = %run_id,
            session_key = %pair.0,
            client_run_id = %pair.1,
            "Chat run created"
        );
        self.active.insert(pair, run_id.clone());
        self.runs.insert(run_id, entry);
        handle
    }

    fn release_pair(&mut self, pair: &(String, String), run_id: &str) {
        if self.active.get(pair).is_some_and(|id| id == run_id) {
            self.active.remove(pair);
        }
    }
}

fn terminal_delivery(
    entry: &ChatRunEntry,
    error_message: Option<String>,
    stop_reason: Option<String>,
) -> Delivery {
    Delivery {
        event: ChatEvent {
            run_id: entry.run_id.clone(),
            session_key: entry.session_key.clone(),
            seq: entry.seq,
            state: entry.state.event_state(),
            message: (!entry.buffer.is_empty()).then(|| entry.buffer.clone()),
            error_message,
            stop_reason,
        },
        requester: entry.requester.clone(),
    }
}
