//! Client-side projection of the server's presence registry.
//!
//! Maps each online identity to the set of its open sessions. The server is
//! authoritative: this copy only changes in response to push events and is
//! replaced wholesale by every snapshot.
//!
//! Offline policy: when an identity's last session closes, its entry is
//! removed immediately (the profile is not retained).
//!
//! Session accounting: every increment is tied to a session handle. When the
//! server names the session, duplicate `presence_online` events for it are
//! ignored. When it does not, a synthetic handle is minted per event, and an
//! untagged `presence_offline` closes the most recently added synthetic
//! session (or, failing that, the most recent session of any kind).
//!
//! A snapshot tracks at most [`MAX_SESSIONS_PER_IDENTITY`] sessions per
//! identity; larger declared counts are clamped and logged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use carewire_core::{Identity, Profile, SessionId};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::protocol::SnapshotEntry;

/// Sessions a snapshot may record for one identity.
pub const MAX_SESSIONS_PER_IDENTITY: usize = 256;

/// One physical connection of an identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    /// Session ID (server-assigned or synthetic).
    pub session_id: SessionId,
    /// Owner.
    pub identity: Identity,
    /// When the session connected, or when this client learned about it.
    pub connected_at: DateTime<Utc>,
    /// Whether the ID was minted locally because the wire carried none.
    pub synthetic: bool,
}

/// Presence of one identity.
#[derive(Clone, Debug, PartialEq)]
pub struct PresenceEntry {
    /// The identity.
    pub identity: Identity,
    /// Latest profile reported for it.
    pub profile: Profile,
    sessions: Vec<SessionHandle>,
    seq: u64,
}

impl PresenceEntry {
    /// Number of open sessions; always equal to `sessions().len()`.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open sessions, oldest first.
    pub fn sessions(&self) -> &[SessionHandle] {
        &self.sessions
    }

    /// Whether at least one session is open.
    pub fn is_online(&self) -> bool {
        !self.sessions.is_empty()
    }

    /// `"Online"` for one session, `"N sessions"` for more.
    pub fn status_label(&self) -> String {
        match self.sessions.len() {
            0 => "Offline".to_string(),
            1 => "Online".to_string(),
            n => format!("{n} sessions"),
        }
    }

    fn add_session(&mut self, handle: SessionHandle) -> bool {
        if !handle.synthetic && self.sessions.iter().any(|s| s.session_id == handle.session_id) {
            return false;
        }
        self.sessions.push(handle);
        true
    }

    /// Append `handles`, skipping session IDs already present.
    fn merge_sessions(&mut self, handles: Vec<SessionHandle>) {
        let mut known: HashSet<SessionId> = self.sessions.iter().map(|s| s.session_id.clone()).collect();
        for handle in handles {
            if self.sessions.len() >= MAX_SESSIONS_PER_IDENTITY {
                break;
            }
            if handle.synthetic || known.insert(handle.session_id.clone()) {
                self.sessions.push(handle);
            }
        }
    }
}

/// A truncated presence listing for display.
#[derive(Clone, Debug, PartialEq)]
pub struct PresencePage {
    /// At most `limit` entries, in arrival order.
    pub entries: Vec<PresenceEntry>,
    /// Number of online identities.
    pub total: usize,
    /// `max(0, total - limit)`.
    pub remainder: usize,
}

/// Identity → sessions mirror.
pub struct PresenceRegistry {
    entries: HashMap<Identity, PresenceEntry>,
    next_seq: u64,
    next_synthetic: u64,
    stale: bool,
    tx: watch::Sender<Arc<Vec<PresenceEntry>>>,
}

impl PresenceRegistry {
    /// Create an empty registry. It starts stale until the first snapshot.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            next_synthetic: 0,
            stale: true,
            tx,
        }
    }

    /// Replace all state with a server snapshot.
    ///
    /// Entries whose resolved session count is zero are not online and are
    /// skipped. Repeated identities in one snapshot are merged.
    pub fn apply_snapshot(&mut self, snapshot: Vec<SnapshotEntry>, now: DateTime<Utc>) {
        self.entries.clear();
        for item in snapshot {
            let declared = item.session_count.unwrap_or(0);
            if declared.max(item.sessions.len()) > MAX_SESSIONS_PER_IDENTITY {
                warn!(
                    identity = %item.identity,
                    declared,
                    listed = item.sessions.len(),
                    max = MAX_SESSIONS_PER_IDENTITY,
                    "snapshot session count over limit, clamping"
                );
            }
            let mut handles: Vec<SessionHandle> = item
                .sessions
                .into_iter()
                .take(MAX_SESSIONS_PER_IDENTITY)
                .map(|s| SessionHandle {
                    session_id: s.session_id,
                    identity: item.identity.clone(),
                    connected_at: s.connected_at.unwrap_or(now),
                    synthetic: false,
                })
                .collect();
            while handles.len() < declared.min(MAX_SESSIONS_PER_IDENTITY) {
                handles.push(self.synthetic_handle(&item.identity, now));
            }
            if handles.is_empty() {
                continue;
            }

            let seq = self.next_seq;
            let entry = self
                .entries
                .entry(item.identity.clone())
                .or_insert_with(|| PresenceEntry {
                    identity: item.identity,
                    profile: Profile::default(),
                    sessions: Vec::new(),
                    seq,
                });
            if entry.seq == seq {
                self.next_seq += 1;
            }
            entry.profile = item.profile;
            entry.merge_sessions(handles);
        }
        self.stale = false;
        debug!(online = self.entries.len(), "presence snapshot applied");
        self.publish();
    }

    /// Record a session connecting. Returns whether anything changed.
    pub fn apply_online(
        &mut self,
        identity: Identity,
        profile: Profile,
        session: Option<SessionId>,
        now: DateTime<Utc>,
    ) -> bool {
        let handle = match session {
            Some(session_id) => SessionHandle {
                session_id,
                identity: identity.clone(),
                connected_at: now,
                synthetic: false,
            },
            None => self.synthetic_handle(&identity, now),
        };

        let seq = self.next_seq;
        let entry = self
            .entries
            .entry(identity.clone())
            .or_insert_with(|| PresenceEntry {
                identity,
                profile: profile.clone(),
                sessions: Vec::new(),
                seq,
            });
        if entry.seq == seq && entry.sessions.is_empty() {
            self.next_seq += 1;
        }
        let profile_changed = entry.profile != profile;
        entry.profile = profile;
        let added = entry.add_session(handle);

        let changed = added || profile_changed;
        if changed {
            self.publish();
        }
        changed
    }

    /// Record a session disconnecting. Returns whether anything changed.
    ///
    /// Unknown identities and unknown session IDs are ignored, so a count
    /// can never go below zero.
    pub fn apply_offline(&mut self, identity: &Identity, session: Option<&SessionId>) -> bool {
        let Some(entry) = self.entries.get_mut(identity) else {
            return false;
        };
        let index = match session {
            Some(id) => entry.sessions.iter().position(|s| &s.session_id == id),
            None => entry
                .sessions
                .iter()
                .rposition(|s| s.synthetic)
                .or_else(|| entry.sessions.len().checked_sub(1)),
        };
        let Some(index) = index else {
            return false;
        };
        let _ = entry.sessions.remove(index);
        if entry.sessions.is_empty() {
            let _ = self.entries.remove(identity);
        }
        self.publish();
        true
    }

    /// Number of online identities (multi-session identities count once).
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Up to `limit` entries in arrival order plus the truncated remainder.
    pub fn list(&self, limit: usize) -> PresencePage {
        let all = self.current();
        let total = all.len();
        PresencePage {
            entries: all.iter().take(limit).cloned().collect(),
            total,
            remainder: total.saturating_sub(limit),
        }
    }

    /// Look up one identity.
    pub fn get(&self, identity: &Identity) -> Option<&PresenceEntry> {
        self.entries.get(identity)
    }

    /// Whether `identity` has at least one open session.
    pub fn is_online(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Session count for `identity` (zero when offline).
    pub fn session_count(&self, identity: &Identity) -> usize {
        self.entries.get(identity).map_or(0, PresenceEntry::session_count)
    }

    /// Flag the projection as untrustworthy until the next snapshot.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Whether a snapshot is still outstanding.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// The last published listing, in arrival order.
    pub fn current(&self) -> Arc<Vec<PresenceEntry>> {
        self.tx.borrow().clone()
    }

    /// Receive a new listing after every change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<PresenceEntry>>> {
        self.tx.subscribe()
    }

    fn synthetic_handle(&mut self, identity: &Identity, now: DateTime<Utc>) -> SessionHandle {
        let n = self.next_synthetic;
        self.next_synthetic += 1;
        SessionHandle {
            session_id: SessionId::from_string(format!("{identity}~{n}")),
            identity: identity.clone(),
            connected_at: now,
            synthetic: true,
        }
    }

    fn publish(&self) {
        let mut all: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        all.sort_by_key(|e| e.seq);
        let _ = self.tx.send_replace(Arc::new(all));
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
