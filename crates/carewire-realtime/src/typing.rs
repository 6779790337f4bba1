//! Typing indicators scoped to a context record.
//!
//! Entries are keyed by `(context, context_id, identity)`. Several identities
//! may type in the same context at once; no ordering is implied between them
//! beyond arrival order for display.
//!
//! The local identity's own indicator is inserted optimistically as
//! [`TypingState::Pending`] when the UI emits `typing_started`, and becomes
//! [`TypingState::Confirmed`] once the server echoes it back.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use carewire_core::{ContextId, Identity, Profile};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

/// Kind of record a typing indicator is attached to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TypingContext {
    /// A patient record.
    Patient,
    /// An organization.
    Organization,
    /// A tenant (hospital).
    Tenant,
    /// A user account.
    User,
    /// Any context this client has no dedicated variant for.
    Other(String),
}

impl TypingContext {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Patient => "patient",
            Self::Organization => "organization",
            Self::Tenant => "tenant",
            Self::User => "user",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for TypingContext {
    fn from(s: String) -> Self {
        match s.as_str() {
            "patient" => Self::Patient,
            "organization" | "organisation" => Self::Organization,
            "tenant" => Self::Tenant,
            "user" => Self::User,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for TypingContext {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<TypingContext> for String {
    fn from(c: TypingContext) -> Self {
        match c {
            TypingContext::Other(s) => s,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for TypingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one typing indicator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypingKey {
    /// Kind of record.
    pub context: TypingContext,
    /// Record.
    pub context_id: ContextId,
    /// Who is typing.
    pub identity: Identity,
}

impl TypingKey {
    /// Build a key.
    pub fn new(
        context: TypingContext,
        context_id: impl Into<ContextId>,
        identity: impl Into<Identity>,
    ) -> Self {
        Self {
            context,
            context_id: context_id.into(),
            identity: identity.into(),
        }
    }
}

/// Whether the server has confirmed an indicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingState {
    /// Inserted locally, not yet echoed by the server.
    Pending,
    /// Reported by the server.
    Confirmed,
}

/// One identity typing in one context.
#[derive(Clone, Debug, PartialEq)]
pub struct TypingEntry {
    /// Who is typing.
    pub identity: Identity,
    /// Kind of record.
    pub context: TypingContext,
    /// Record.
    pub context_id: ContextId,
    /// Public profile.
    pub profile: Profile,
    /// Confirmation state.
    pub state: TypingState,
    /// Last start event (local or remote) for this key.
    pub updated_at: Instant,
    seq: u64,
}

/// All typing indicators known to this client.
pub struct TypingTracker {
    entries: HashMap<TypingKey, TypingEntry>,
    next_seq: u64,
    tx: watch::Sender<Arc<Vec<TypingEntry>>>,
}

impl TypingTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            tx,
        }
    }

    /// Record a server-confirmed typing start.
    ///
    /// Promotes a pending local entry to confirmed. Returns whether the
    /// visible state changed.
    pub fn start(&mut self, key: TypingKey, profile: Profile, now: Instant) -> bool {
        self.upsert(key, profile, TypingState::Confirmed, now)
    }

    /// Record the local identity's own typing start before the server echo.
    ///
    /// Never downgrades a confirmed entry.
    pub fn start_local(&mut self, key: TypingKey, profile: Profile, now: Instant) -> bool {
        self.upsert(key, profile, TypingState::Pending, now)
    }

    fn upsert(&mut self, key: TypingKey, profile: Profile, state: TypingState, now: Instant) -> bool {
        let changed = if let Some(entry) = self.entries.get_mut(&key) {
            entry.updated_at = now;
            let promote = state == TypingState::Confirmed && entry.state == TypingState::Pending;
            let profile_changed = state == TypingState::Confirmed && entry.profile != profile;
            if promote {
                entry.state = TypingState::Confirmed;
            }
            if profile_changed {
                entry.profile = profile;
            }
            promote || profile_changed
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            let entry = TypingEntry {
                identity: key.identity.clone(),
                context: key.context.clone(),
                context_id: key.context_id.clone(),
                profile,
                state,
                updated_at: now,
                seq,
            };
            let _ = self.entries.insert(key, entry);
            true
        };
        if changed {
            self.publish();
        }
        changed
    }

    /// Remove an indicator. Returns whether it existed.
    pub fn stop(&mut self, key: &TypingKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.publish();
        }
        removed
    }

    /// Drop entries not refreshed within `ttl`. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.updated_at) < ttl);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            self.publish();
        }
        dropped
    }

    /// Drop every entry. Returns whether anything was dropped.
    pub fn clear(&mut self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.entries.clear();
        self.publish();
        true
    }

    /// Identities typing in one context, in arrival order.
    pub fn in_context(&self, context: &TypingContext, context_id: &ContextId) -> Vec<TypingEntry> {
        self.current()
            .iter()
            .filter(|e| &e.context == context && &e.context_id == context_id)
            .cloned()
            .collect()
    }

    /// Look up one entry.
    pub fn get(&self, key: &TypingKey) -> Option<&TypingEntry> {
        self.entries.get(key)
    }

    /// Number of indicators.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no one is typing anywhere.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The last published snapshot, in arrival order.
    pub fn current(&self) -> Arc<Vec<TypingEntry>> {
        self.tx.borrow().clone()
    }

    /// Receive a new snapshot after every visible change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<TypingEntry>>> {
        self.tx.subscribe()
    }

    fn publish(&self) {
        let mut all: Vec<TypingEntry> = self.entries.values().cloned().collect();
        all.sort_by_key(|e| e.seq);
        let _ = self.tx.send_replace(Arc::new(all));
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new()
    }
}
