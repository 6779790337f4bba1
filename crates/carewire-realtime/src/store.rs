//! Entity collections: users, organizations, tenants and patients.
//!
//! Each collection is an `id → record` map published through a
//! [`watch`] channel as an immutable [`Arc<Collection>`]. A mutation builds
//! the complete next collection before it is published, so subscribers never
//! observe a partial update and can detect changes with [`Arc::ptr_eq`].
//!
//! ## Bulk fetch vs push reconciliation
//!
//! A bulk fetch is bracketed by [`EntityStore::begin_fetch`] and
//! [`EntityStore::complete_fetch`]. The fetched array replaces the collection
//! wholesale, except for IDs that were upserted or removed by push events
//! after the fetch began: those keep their pushed state. Push events are
//! newer than any response to a request issued before them.
//!
//! A fetch superseded by a later `begin_fetch`, `replace_all` or
//! `mark_all_stale` is ignored when it completes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use carewire_core::{EntityId, EntityKind, EntityRecord};
use tokio::sync::watch;
use tracing::debug;

/// Load state of one collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectionStatus {
    /// Contents may predate a connection gap.
    Stale,
    /// A bulk fetch is outstanding.
    Loading,
    /// Seeded by a bulk fetch or snapshot.
    Fresh,
    /// The last bulk fetch failed; contents are whatever pushes delivered.
    Failed(String),
}

impl CollectionStatus {
    /// Whether the collection can be rendered as authoritative.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Immutable view of one entity collection.
#[derive(Clone, Debug, PartialEq)]
pub struct Collection {
    kind: EntityKind,
    records: HashMap<EntityId, EntityRecord>,
    status: CollectionStatus,
}

impl Collection {
    fn empty(kind: EntityKind) -> Self {
        Self {
            kind,
            records: HashMap::new(),
            status: CollectionStatus::Stale,
        }
    }

    /// Which collection this is.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Load state.
    pub fn status(&self) -> &CollectionStatus {
        &self.status
    }

    /// Look up a record.
    pub fn get(&self, id: &EntityId) -> Option<&EntityRecord> {
        self.records.get(id)
    }

    /// Whether `id` is present.
    pub fn contains(&self, id: &EntityId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the collection has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    /// Records ordered by ID, for stable display.
    pub fn sorted(&self) -> Vec<&EntityRecord> {
        let mut records: Vec<&EntityRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }
}

/// Handle for one outstanding bulk fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchTicket {
    kind: EntityKind,
    generation: u64,
}

impl FetchTicket {
    /// Collection being fetched.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }
}

struct Slot {
    data: Arc<Collection>,
    generation: u64,
    in_flight: Option<u64>,
    touched: HashSet<EntityId>,
    tx: watch::Sender<Arc<Collection>>,
}

impl Slot {
    fn new(kind: EntityKind) -> Self {
        let data = Arc::new(Collection::empty(kind));
        let (tx, _rx) = watch::channel(Arc::clone(&data));
        Self {
            data,
            generation: 0,
            in_flight: None,
            touched: HashSet::new(),
            tx,
        }
    }

    fn publish(&self) {
        let _ = self.tx.send_replace(Arc::clone(&self.data));
    }

    fn cancel_fetch(&mut self) {
        self.in_flight = None;
        self.touched.clear();
    }
}

/// The four entity collections.
pub struct EntityStore {
    slots: HashMap<EntityKind, Slot>,
}

impl EntityStore {
    /// Create a store with four empty, stale collections.
    pub fn new() -> Self {
        Self {
            slots: EntityKind::ALL.into_iter().map(|k| (k, Slot::new(k))).collect(),
        }
    }

    /// Replace a collection wholesale and mark it fresh.
    ///
    /// Cancels any outstanding fetch for the same collection.
    pub fn replace_all(&mut self, kind: EntityKind, records: Vec<EntityRecord>) {
        let slot = self.slot_mut(kind);
        slot.cancel_fetch();
        slot.data = Arc::new(Collection {
            kind,
            records: index(records),
            status: CollectionStatus::Fresh,
        });
        slot.publish();
    }

    /// Insert or wholesale-replace one record. Returns whether it changed.
    pub fn upsert(&mut self, kind: EntityKind, record: EntityRecord) -> bool {
        let slot = self.slot_mut(kind);
        let id = record.id().clone();
        if slot.in_flight.is_some() {
            let _ = slot.touched.insert(id.clone());
        }
        if slot.data.records.get(&id) == Some(&record) {
            return false;
        }
        let _ = Arc::make_mut(&mut slot.data).records.insert(id, record);
        slot.publish();
        true
    }

    /// Remove one record. Returns whether it was present.
    pub fn remove(&mut self, kind: EntityKind, id: &EntityId) -> bool {
        let slot = self.slot_mut(kind);
        if slot.in_flight.is_some() {
            let _ = slot.touched.insert(id.clone());
        }
        if !slot.data.records.contains_key(id) {
            return false;
        }
        let _ = Arc::make_mut(&mut slot.data).records.remove(id);
        slot.publish();
        true
    }

    /// Look up one record.
    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<EntityRecord> {
        self.slot(kind).data.get(id).cloned()
    }

    /// Current view of a collection.
    pub fn collection(&self, kind: EntityKind) -> Arc<Collection> {
        Arc::clone(&self.slot(kind).data)
    }

    /// Load state of a collection.
    pub fn status(&self, kind: EntityKind) -> CollectionStatus {
        self.slot(kind).data.status.clone()
    }

    /// Start a bulk fetch; supersedes any fetch already outstanding.
    pub fn begin_fetch(&mut self, kind: EntityKind) -> FetchTicket {
        let slot = self.slot_mut(kind);
        slot.generation += 1;
        slot.in_flight = Some(slot.generation);
        slot.touched.clear();
        set_status(slot, CollectionStatus::Loading);
        FetchTicket {
            kind,
            generation: slot.generation,
        }
    }

    /// Apply a bulk fetch response. Returns `false` if the ticket was
    /// superseded and the response was discarded.
    pub fn complete_fetch(&mut self, ticket: FetchTicket, records: Vec<EntityRecord>) -> bool {
        let slot = self.slot_mut(ticket.kind);
        if slot.in_flight != Some(ticket.generation) {
            debug!(kind = %ticket.kind, "discarding superseded bulk fetch");
            return false;
        }

        let mut next = index(records);
        let mut kept = 0usize;
        for id in slot.touched.drain() {
            match slot.data.records.get(&id) {
                Some(pushed) => {
                    let _ = next.insert(id, pushed.clone());
                }
                None => {
                    let _ = next.remove(&id);
                }
            }
            kept += 1;
        }
        slot.in_flight = None;
        slot.data = Arc::new(Collection {
            kind: ticket.kind,
            records: next,
            status: CollectionStatus::Fresh,
        });
        debug!(kind = %ticket.kind, records = slot.data.len(), pushed_kept = kept, "bulk fetch applied");
        slot.publish();
        true
    }

    /// Record a failed bulk fetch. Returns `false` if the ticket was
    /// superseded.
    pub fn fail_fetch(&mut self, ticket: FetchTicket, reason: impl Into<String>) -> bool {
        let slot = self.slot_mut(ticket.kind);
        if slot.in_flight != Some(ticket.generation) {
            return false;
        }
        slot.cancel_fetch();
        set_status(slot, CollectionStatus::Failed(reason.into()));
        true
    }

    /// Mark every collection stale and discard outstanding fetches.
    pub fn mark_all_stale(&mut self) {
        for slot in self.slots.values_mut() {
            slot.cancel_fetch();
            set_status(slot, CollectionStatus::Stale);
        }
    }

    /// Receive a new collection reference after every change.
    pub fn subscribe(&self, kind: EntityKind) -> watch::Receiver<Arc<Collection>> {
        self.slot(kind).tx.subscribe()
    }

    fn slot(&self, kind: EntityKind) -> &Slot {
        // Every kind is inserted in `new` and never removed.
        &self.slots[&kind]
    }

    fn slot_mut(&mut self, kind: EntityKind) -> &mut Slot {
        self.slots.entry(kind).or_insert_with(|| Slot::new(kind))
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

fn set_status(slot: &mut Slot, status: CollectionStatus) {
    if slot.data.status == status {
        return;
    }
    Arc::make_mut(&mut slot.data).status = status;
    slot.publish();
}

fn index(records: Vec<EntityRecord>) -> HashMap<EntityId, EntityRecord> {
    records.into_iter().map(|r| (r.id().clone(), r)).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
