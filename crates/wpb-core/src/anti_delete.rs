//! Anti-delete: keep a short-lived copy of recent messages so their content
//! can be republished when the sender revokes them.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use tokio::time::Instant;

use crate::{domain::Jid, messaging::types::InboundMessage};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

const MEDIA_PLACEHOLDER: &str = "[Media message]";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedMessage {
    pub id: String,
    pub chat_id: Jid,
    pub sender_id: Option<Jid>,
    /// Empty for media without caption.
    pub text: String,
    pub inserted_at: Instant,
}

/// Message cache keyed by message id.
///
/// Entries expire after `ttl`; when `max_entries` is exceeded the oldest
/// entries go first.
#[derive(Debug)]
pub struct MessageCache {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<String, CachedMessage>,
    // Insertion order; stale pairs (overwritten ids) are skipped on eviction.
    order: VecDeque<(String, Instant)>,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl MessageCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, msg: &InboundMessage) {
        self.insert_at(msg, Instant::now());
    }

    pub fn insert_at(&mut self, msg: &InboundMessage, now: Instant) {
        if msg.key.id.is_empty() {
            return;
        }
        self.purge_expired(now);

        let entry = CachedMessage {
            id: msg.key.id.clone(),
            chat_id: msg.key.remote_jid.clone(),
            sender_id: msg.key.participant.clone(),
            text: msg.text().to_string(),
            inserted_at: now,
        };
        self.order.push_back((entry.id.clone(), now));
        self.entries.insert(entry.id.clone(), entry);

        while self.entries.len() > self.max_entries {
            if !self.pop_oldest() {
                break;
            }
        }
    }

    /// Remove and return a live entry. A second call for the same id yields
    /// `None`, so recovery fires at most once.
    pub fn take(&mut self, id: &str) -> Option<CachedMessage> {
        self.take_at(id, Instant::now())
    }

    pub fn take_at(&mut self, id: &str, now: Instant) -> Option<CachedMessage> {
        self.purge_expired(now);
        self.entries.remove(id)
    }

    pub fn purge_expired(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) -> bool {
        let Some((id, at)) = self.order.pop_front() else {
            return false;
        };
        if self.entries.get(&id).is_some_and(|e| e.inserted_at == at) {
            self.entries.remove(&id);
        }
        true
    }
}

/// Text republished into the chat when a cached message is revoked.
pub fn recovery_notice(msg: &CachedMessage) -> String {
    let body = if msg.text.trim().is_empty() {
        MEDIA_PLACEHOLDER
    } else {
        msg.text.as_str()
    };
    format!("🛑 Deleted message recovered:\n\n{body}")
}
