//! Inbound event routing.
//!
//! Every decoded frame is routed by [`InboundKind`] to the handlers
//! registered for that kind, in registration order. The default handlers
//! (installed by [`install_default_handlers`]) apply the state effects of
//! each message; listeners registered later observe the state after those
//! effects.
//!
//! Registration returns a [`Subscription`]; [`ListenerRegistry::unsubscribe_all`]
//! removes everything and is safe to call repeatedly.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use carewire_core::{Identity, ProtocolError, ScopeId};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{ConnectionState, ConnectionStatus};
use crate::heartbeat::HeartbeatMonitor;
use crate::presence::PresenceRegistry;
use crate::protocol::{self, Inbound, InboundKind};
use crate::store::EntityStore;
use crate::typing::{TypingKey, TypingTracker};

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Everything one connection mirrors from the server.
///
/// Handlers receive `&mut SyncState`, but only crate code can mutate it:
/// the public surface is read-only.
pub struct SyncState {
    pub(crate) identity: Identity,
    pub(crate) status: watch::Sender<ConnectionStatus>,
    pub(crate) presence: PresenceRegistry,
    pub(crate) typing: TypingTracker,
    pub(crate) store: EntityStore,
    pub(crate) heartbeat: HeartbeatMonitor,
    pub(crate) rooms: BTreeSet<ScopeId>,
}

impl SyncState {
    /// Fresh state for `identity`.
    pub fn new(identity: Identity, max_missed_heartbeats: u32) -> Self {
        let (status, _rx) = watch::channel(ConnectionStatus::default());
        Self {
            identity,
            status,
            presence: PresenceRegistry::new(),
            typing: TypingTracker::new(),
            store: EntityStore::new(),
            heartbeat: HeartbeatMonitor::new(max_missed_heartbeats),
            rooms: BTreeSet::new(),
        }
    }

    /// Identity this connection belongs to.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Presence projection.
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Typing indicators.
    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    /// Entity collections.
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Rooms joined through the emitter, re-joined after every reconnect.
    pub fn rooms(&self) -> impl Iterator<Item = &ScopeId> {
        self.rooms.iter()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.status.borrow().state.is_connected()
    }

    pub(crate) fn update_status<F>(&self, f: F)
    where
        F: FnOnce(&mut ConnectionStatus),
    {
        let _ = self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.update_status(|s| s.state = state);
    }

    /// Discard everything that may have gone stale across a connection gap.
    pub(crate) fn invalidate(&mut self) {
        self.presence.mark_stale();
        let _ = self.typing.clear();
        self.store.mark_all_stale();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listeners
// ─────────────────────────────────────────────────────────────────────────────

/// A handler for one inbound message kind.
///
/// Handlers run while the connection's state lock is held: they must not
/// call back into the owning [`ConnectionHandle`](crate::ConnectionHandle).
pub trait EventHandler: Send + Sync {
    /// Apply `event`.
    fn handle(&self, event: &Inbound, state: &mut SyncState);
}

impl<F> EventHandler for F
where
    F: Fn(&Inbound, &mut SyncState) + Send + Sync,
{
    fn handle(&self, event: &Inbound, state: &mut SyncState) {
        self(event, state);
    }
}

/// Token returned by [`ListenerRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: InboundKind,
    id: u64,
}

impl Subscription {
    /// Kind this subscription listens to.
    pub fn kind(&self) -> InboundKind {
        self.kind
    }
}

/// Handlers by message kind.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: u64,
    handlers: HashMap<InboundKind, Vec<(u64, Arc<dyn EventHandler>)>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `kind`.
    pub fn register<H>(&mut self, kind: InboundKind, handler: H) -> Subscription
    where
        H: EventHandler + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    /// Remove one handler. Returns whether it was registered.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let Some(list) = self.handlers.get_mut(&subscription.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        list.len() != before
    }

    /// Remove every handler. Returns how many were removed; a second call
    /// returns zero.
    pub fn unsubscribe_all(&mut self) -> usize {
        let removed = self.len();
        self.handlers.clear();
        removed
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler registered for the event's kind. Returns how many ran.
    pub fn dispatch(&self, event: &Inbound, state: &mut SyncState) -> usize {
        let Some(list) = self.handlers.get(&event.kind()) else {
            return 0;
        };
        for (_, handler) in list {
            handler.handle(event, state);
        }
        list.len()
    }
}

/// Decode one text frame and dispatch it.
///
/// Unknown or malformed frames are logged and dropped; the decoded event is
/// returned so the caller can perform transport-level follow-ups.
pub fn handle_frame(registry: &ListenerRegistry, state: &mut SyncState, text: &str) -> Option<Inbound> {
    let event = match protocol::decode(text) {
        Ok(event) => event,
        Err(ProtocolError::UnknownKind(kind)) => {
            warn!(kind = %kind, "dropping unknown message kind");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame");
            return None;
        }
    };
    let handled = registry.dispatch(&event, state);
    debug!(kind = %event.kind(), handlers = handled, "dispatched event");
    Some(event)
}

// ─────────────────────────────────────────────────────────────────────────────
// Default handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Register the state effects of every inbound message kind.
pub fn install_default_handlers(registry: &mut ListenerRegistry) {
    let _ = registry.register(InboundKind::ConnectionAck, on_connection_ack);
    let _ = registry.register(InboundKind::ConnectionClosed, on_connection_closed);
    let _ = registry.register(InboundKind::ConnectionError, on_connection_error);
    let _ = registry.register(InboundKind::PresenceSnapshot, on_presence_snapshot);
    let _ = registry.register(InboundKind::PresenceOnline, on_presence_online);
    let _ = registry.register(InboundKind::PresenceOffline, on_presence_offline);
    let _ = registry.register(InboundKind::TypingStarted, on_typing_started);
    let _ = registry.register(InboundKind::TypingStopped, on_typing_stopped);
    let _ = registry.register(InboundKind::HeartbeatAck, on_heartbeat_ack);
    let _ = registry.register(InboundKind::EntityUpdated, on_entity_updated);
    let _ = registry.register(InboundKind::EntityRemoved, on_entity_removed);
}

fn on_connection_ack(event: &Inbound, state: &mut SyncState) {
    let Inbound::ConnectionAck { session_id } = event else {
        return;
    };
    state.heartbeat.reset();
    state.update_status(|s| {
        s.state = ConnectionState::Connected;
        s.session_id.clone_from(session_id);
        s.reconnect_attempt = 0;
    });
}

fn on_connection_closed(event: &Inbound, state: &mut SyncState) {
    let Inbound::ConnectionClosed { reason } = event else {
        return;
    };
    state.set_state(ConnectionState::Disconnected {
        reason: reason.clone(),
    });
}

fn on_connection_error(event: &Inbound, state: &mut SyncState) {
    let Inbound::ConnectionError { message } = event else {
        return;
    };
    state.set_state(ConnectionState::Error(message.clone()));
}

fn on_presence_snapshot(event: &Inbound, state: &mut SyncState) {
    let Inbound::PresenceSnapshot { entries } = event else {
        return;
    };
    state.presence.apply_snapshot(entries.clone(), Utc::now());
}

fn on_presence_online(event: &Inbound, state: &mut SyncState) {
    let Inbound::PresenceOnline {
        identity,
        profile,
        session_id,
    } = event
    else {
        return;
    };
    let _ = state.presence.apply_online(
        identity.clone(),
        profile.clone(),
        session_id.clone(),
        Utc::now(),
    );
}

fn on_presence_offline(event: &Inbound, state: &mut SyncState) {
    let Inbound::PresenceOffline {
        identity,
        session_id,
    } = event
    else {
        return;
    };
    let _ = state.presence.apply_offline(identity, session_id.as_ref());
}

fn on_typing_started(event: &Inbound, state: &mut SyncState) {
    let Inbound::TypingStarted {
        identity,
        context,
        context_id,
        profile,
    } = event
    else {
        return;
    };
    let key = TypingKey::new(context.clone(), context_id.clone(), identity.clone());
    let _ = state.typing.start(key, profile.clone(), Instant::now());
}

fn on_typing_stopped(event: &Inbound, state: &mut SyncState) {
    let Inbound::TypingStopped {
        identity,
        context,
        context_id,
    } = event
    else {
        return;
    };
    let key = TypingKey::new(context.clone(), context_id.clone(), identity.clone());
    let _ = state.typing.stop(&key);
}

fn on_heartbeat_ack(_event: &Inbound, state: &mut SyncState) {
    if let Some(rtt) = state.heartbeat.ack(Instant::now()) {
        state.update_status(|s| s.last_rtt = Some(rtt));
    }
}

fn on_entity_updated(event: &Inbound, state: &mut SyncState) {
    let Inbound::EntityUpdated { kind, record } = event else {
        return;
    };
    let _ = state.store.upsert(*kind, record.clone());
}

fn on_entity_removed(event: &Inbound, state: &mut SyncState) {
    let Inbound::EntityRemoved { kind, id } = event else {
        return;
    };
    let _ = state.store.remove(*kind, id);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
