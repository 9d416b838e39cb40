//! Time- and capacity-bounded "seen before" guard
//!
//! Used for at-most-once handling of inbound channel messages (keyed by
//! provider, account, conversation, thread and message id) and anywhere
//! else a request must be handled idempotently.
//!
//! Eviction is strictly by insertion order: a hit does not refresh an
//! entry, so both TTL expiry and capacity eviction pop from the front of
//! the same queue.

use std::collections::{HashMap, VecDeque};

/// Bookkeeping for one recorded key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupeEntry {
    pub inserted_at: u64,
    /// `None` when the cache has no TTL
    pub expires_at: Option<u64>,
}

/// Dedupe cache over string keys with millisecond timestamps
#[derive(Debug)]
pub struct DedupeCache {
    ttl_ms: u64,
    max_size: usize,
    entries: HashMap<String, DedupeEntry>,
    order: VecDeque<String>,
}

impl DedupeCache {
    /// Create a cache. `ttl_ms == 0` disables expiry; `max_size == 0`
    /// retains nothing.
    pub fn new(ttl_ms: u64, max_size: usize) -> Self {
        Self {
            ttl_ms,
            max_size,
            entries: HashMap::new(),
            order: VecDeque::with_capacity(max_size.min(1024)),
        }
    }

    /// Report whether `key` was already recorded, recording it if new.
    ///
    /// `now` defaults to the wall clock. Empty keys are never recorded and
    /// never reported as duplicates.
    pub fn check(&mut self, key: &str, now: Option<u64>) -> bool {
        if key.is_empty() {
            return false;
        }
        let now = now.unwrap_or_else(now_ms);
        self.expire(now);

        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at.map_or(true, |at| now < at) {
                return true;
            }
        }

        self.insert(key, now);
        false
    }

    /// Forget one key so it can be recorded again
    pub fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }

    /// Forget every recorded key
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&DedupeEntry> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: &str, now: u64) {
        let entry = DedupeEntry {
            inserted_at: now,
            expires_at: (self.ttl_ms > 0).then(|| now.saturating_add(self.ttl_ms)),
        };
        // An expired entry for this key is already gone, so this is a fresh
        // insert at the back of the queue.
        if self.entries.insert(key.to_string(), entry).is_none() {
            self.order.push_back(key.to_string());
        }

        while self.entries.len() > self.max_size {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn expire(&mut self, now: u64) {
        if self.ttl_ms == 0 {
            return;
        }
        while let Some(front) = self.order.front() {
            let expired = match self.entries.get(front) {
                Some(entry) => entry.expires_at.map_or(false, |at| now >= at),
                None => true,
            };
            if !expired {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }
}

/// Build the composite dedupe key for an inbound channel message
pub fn inbound_message_key(
    channel: &str,
    account_id: Option<&str>,
    chat_id: &str,
    thread_id: Option<&str>,
    message_id: &str,
) -> String {
    if message_id.trim().is_empty() {
        return String::new();
    }
    format!(
        "{}|{}|{}|{}|{}",
        channel,
        account_id.unwrap_or("default"),
        chat_id,
        thread_id.unwrap_or(""),
        message_id
    )
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
