//! Connection ownership and the read-only handle exposed to callers.
//!
//! A [`ConnectionManager`] keeps at most one live connection per identity.
//! Each connection is a [`ConnectionHandle`] backed by a driver task and a
//! single lock around everything it mirrors.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use carewire_core::{
    ContextId, EntityId, EntityKind, EntityRecord, Identity, RealtimeError,
};
use carewire_settings::CarewireSettings;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::dispatcher::{EventHandler, ListenerRegistry, Subscription, SyncState, install_default_handlers};
use crate::emitter::Emitter;
use crate::fetch::{BulkFetcher, HttpBulkFetcher};
use crate::presence::{PresenceEntry, PresencePage};
use crate::protocol::{self, InboundKind, Outbound};
use crate::store::{Collection, CollectionStatus, FetchTicket};
use crate::transport::{Connector, WsConnector};
use crate::typing::{TypingContext, TypingEntry};

// ─────────────────────────────────────────────────────────────────────────────
// Shared connection state
// ─────────────────────────────────────────────────────────────────────────────

/// Everything guarded by a connection's lock.
pub(crate) struct Shared {
    pub(crate) state: SyncState,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) outbound: Option<mpsc::Sender<String>>,
    pub(crate) closed: bool,
    /// The driver gave up and will not reconnect.
    pub(crate) stopped: bool,
}

impl Shared {
    /// Queue one outbound message. Dropped (returns `false`) unless the
    /// handshake has been acknowledged and the queue has room.
    pub(crate) fn send(&self, message: &Outbound) -> bool {
        let Some(tx) = self.outbound.as_ref().filter(|_| self.state.is_connected()) else {
            debug!(kind = message.as_str(), "not connected, dropping outbound message");
            return false;
        };
        let text = protocol::encode(message);
        if text.is_empty() {
            return false;
        }
        match tx.try_send(text) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = message.as_str(), error = %e, "outbound queue unavailable, dropping message");
                false
            }
        }
    }
}

pub(crate) struct Inner {
    pub(crate) identity: Identity,
    pub(crate) config: ClientConfig,
    pub(crate) cancel: CancellationToken,
    shared: Mutex<Shared>,
    fetcher: Arc<dyn BulkFetcher>,
    manager: Weak<ManagerInner>,
}

impl Inner {
    /// Run `f` under the lock unless the connection is closed.
    pub(crate) fn with_live<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return None;
        }
        Some(f(&mut shared))
    }

    fn with_state<R>(&self, f: impl FnOnce(&SyncState) -> R) -> R {
        f(&self.shared.lock().state)
    }

    pub(crate) async fn refresh(&self, kind: EntityKind) -> Result<usize, RealtimeError> {
        let Some(ticket) = self.with_live(|s| s.state.store.begin_fetch(kind)) else {
            return Err(RealtimeError::transport("connection closed"));
        };
        self.fetch_into(ticket).await
    }

    pub(crate) async fn refresh_all(&self) -> Vec<(EntityKind, Result<usize, RealtimeError>)> {
        match self.with_live(|s| begin_all(&mut s.state)) {
            Some(tickets) => self.fetch_all(tickets).await,
            None => EntityKind::ALL
                .into_iter()
                .map(|kind| (kind, Err(RealtimeError::transport("connection closed"))))
                .collect(),
        }
    }

    /// Run already-started fetches concurrently.
    pub(crate) async fn fetch_all(
        &self,
        tickets: Vec<FetchTicket>,
    ) -> Vec<(EntityKind, Result<usize, RealtimeError>)> {
        join_all(
            tickets
                .into_iter()
                .map(|ticket| async move { (ticket.kind(), self.fetch_into(ticket).await) }),
        )
        .await
    }

    /// Fetch one collection and apply the result under `ticket`.
    async fn fetch_into(&self, ticket: FetchTicket) -> Result<usize, RealtimeError> {
        let kind = ticket.kind();
        let timeout = self.config.fetch_timeout;
        let result = match tokio::time::timeout(timeout, self.fetcher.fetch(kind)).await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::BulkFetch {
                kind,
                message: format!("timed out after {}ms", timeout.as_millis()),
                timed_out: true,
            }),
        };

        let applied = self.with_live(|s| match result {
            Ok(records) => {
                let count = records.len();
                if s.state.store.complete_fetch(ticket, records) {
                    Ok(count)
                } else {
                    Ok(0)
                }
            }
            Err(e) => {
                warn!(%kind, error = %e, "bulk fetch failed");
                let _ = s.state.store.fail_fetch(ticket, e.to_string());
                Err(e)
            }
        });
        applied.unwrap_or_else(|| Err(RealtimeError::transport("connection closed")))
    }
}

/// Start a fetch of every collection. Pushes applied after this call
/// survive the responses.
pub(crate) fn begin_all(state: &mut SyncState) -> Vec<FetchTicket> {
    EntityKind::ALL
        .into_iter()
        .map(|kind| state.store.begin_fetch(kind))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// One identity's connection.
///
/// Cloning is cheap; every clone refers to the same connection. Reads take
/// the connection lock briefly and return owned values or `Arc` snapshots.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    fn spawn(
        identity: Identity,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        fetcher: Arc<dyn BulkFetcher>,
        manager: Weak<ManagerInner>,
    ) -> Self {
        let mut listeners = ListenerRegistry::new();
        install_default_handlers(&mut listeners);
        let state = SyncState::new(identity.clone(), config.max_missed_heartbeats());

        let inner = Arc::new(Inner {
            identity,
            config,
            cancel: CancellationToken::new(),
            shared: Mutex::new(Shared {
                state,
                listeners,
                outbound: None,
                closed: false,
                stopped: false,
            }),
            fetcher,
            manager,
        });
        drop(tokio::spawn(crate::driver::run(Arc::clone(&inner), connector)));
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Identity this connection belongs to.
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.with_state(SyncState::status)
    }

    /// Status updates.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.with_state(|s| s.status.subscribe())
    }

    /// Number of online identities.
    pub fn presence_count(&self) -> usize {
        self.inner.with_state(|s| s.presence().count())
    }

    /// Up to `limit` online identities plus the remainder.
    pub fn presence_list(&self, limit: usize) -> PresencePage {
        self.inner.with_state(|s| s.presence().list(limit))
    }

    /// Presence of one identity.
    pub fn presence_of(&self, identity: &Identity) -> Option<PresenceEntry> {
        self.inner.with_state(|s| s.presence().get(identity).cloned())
    }

    /// Whether presence may predate a connection gap.
    pub fn presence_is_stale(&self) -> bool {
        self.inner.with_state(|s| s.presence().is_stale())
    }

    /// Who is typing in one context.
    pub fn typing_in(&self, context: &TypingContext, context_id: &ContextId) -> Vec<TypingEntry> {
        self.inner.with_state(|s| s.typing().in_context(context, context_id))
    }

    /// One entity record.
    pub fn entity(&self, kind: EntityKind, id: &EntityId) -> Option<EntityRecord> {
        self.inner.with_state(|s| s.store().get(kind, id))
    }

    /// One entity collection.
    pub fn entities(&self, kind: EntityKind) -> Arc<Collection> {
        self.inner.with_state(|s| s.store().collection(kind))
    }

    /// Load state of one collection.
    pub fn collection_status(&self, kind: EntityKind) -> CollectionStatus {
        self.inner.with_state(|s| s.store().status(kind))
    }

    /// Presence listing updates.
    pub fn subscribe_presence(&self) -> watch::Receiver<Arc<Vec<PresenceEntry>>> {
        self.inner.with_state(|s| s.presence().subscribe())
    }

    /// Typing indicator updates.
    pub fn subscribe_typing(&self) -> watch::Receiver<Arc<Vec<TypingEntry>>> {
        self.inner.with_state(|s| s.typing().subscribe())
    }

    /// Collection updates.
    pub fn subscribe_entities(&self, kind: EntityKind) -> watch::Receiver<Arc<Collection>> {
        self.inner.with_state(|s| s.store().subscribe(kind))
    }

    /// Run `f` with read access to the whole mirrored state.
    pub fn with_state<R>(&self, f: impl FnOnce(&SyncState) -> R) -> R {
        self.inner.with_state(f)
    }

    /// Register a listener for `kind`; it runs after the state effects of
    /// each matching message. Returns `None` once the connection is closed.
    pub fn on<H>(&self, kind: InboundKind, handler: H) -> Option<Subscription>
    where
        H: EventHandler + 'static,
    {
        self.inner.with_live(|s| s.listeners.register(kind, handler))
    }

    /// Remove one listener.
    pub fn off(&self, subscription: Subscription) -> bool {
        self.inner
            .with_live(|s| s.listeners.unsubscribe(subscription))
            .unwrap_or(false)
    }

    /// Re-fetch one collection. Returns how many records were applied.
    pub async fn refresh(&self, kind: EntityKind) -> Result<usize, RealtimeError> {
        self.inner.refresh(kind).await
    }

    /// Re-fetch all four collections concurrently.
    pub async fn refresh_all(&self) -> Vec<(EntityKind, Result<usize, RealtimeError>)> {
        self.inner.refresh_all().await
    }

    /// Outbound operations on this connection.
    pub fn emitter(&self) -> Emitter {
        Emitter::new(self.clone())
    }

    /// Tear the connection down.
    ///
    /// Synchronous and idempotent: when it returns, every listener is
    /// deregistered, nothing further is dispatched and any pending reconnect
    /// is cancelled.
    pub fn close(&self) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.closed {
                return;
            }
            shared.closed = true;
            let listeners = shared.listeners.unsubscribe_all();
            shared.outbound = None;
            shared.state.set_state(ConnectionState::Disconnected {
                reason: Some("closed".to_string()),
            });
            info!(identity = %self.inner.identity, listeners, "connection closed");
        }
        self.inner.cancel.cancel();
        if let Some(manager) = self.inner.manager.upgrade() {
            manager.forget(&self.inner);
        }
    }

    /// Whether [`ConnectionHandle::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.lock().closed
    }

    /// Whether the connection gave up for good: the identity was rejected
    /// or reconnect attempts ran out. The last error stays readable through
    /// [`ConnectionHandle::status`]; [`ConnectionManager::open`] replaces a
    /// stopped connection with a new one.
    pub fn is_stopped(&self) -> bool {
        self.inner.shared.lock().stopped
    }

    fn is_live(&self) -> bool {
        let shared = self.inner.shared.lock();
        !shared.closed && !shared.stopped
    }

    /// Sign-out path: clear the manager's current identity (if it is this
    /// one) and close.
    pub(crate) fn sign_out_local(&self) {
        if let Some(manager) = self.inner.manager.upgrade() {
            let mut registry = manager.registry.lock();
            if registry.current.as_ref() == Some(&self.inner.identity) {
                registry.current = None;
            }
        }
        self.close();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("identity", &self.inner.identity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Registry {
    connections: HashMap<Identity, ConnectionHandle>,
    current: Option<Identity>,
}

struct ManagerInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    fetcher: Arc<dyn BulkFetcher>,
    registry: Mutex<Registry>,
}

impl ManagerInner {
    fn forget(&self, inner: &Arc<Inner>) {
        let mut registry = self.registry.lock();
        let same = registry
            .connections
            .get(&inner.identity)
            .is_some_and(|h| Arc::ptr_eq(&h.inner, inner));
        if same {
            let _ = registry.connections.remove(&inner.identity);
        }
    }
}

/// Owns one connection per identity.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Manager opening connections through `connector` and seeding
    /// collections through `fetcher`.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>, fetcher: Arc<dyn BulkFetcher>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                connector,
                fetcher,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Manager using the WebSocket transport and HTTP bulk fetches.
    pub fn from_settings(settings: &CarewireSettings) -> Result<Self, RealtimeError> {
        let config = ClientConfig::from(settings);
        let connector = Arc::new(WsConnector::new(config.server_url.clone(), config.outbound_buffer));
        let fetcher = Arc::new(HttpBulkFetcher::new(config.api_base_url.clone(), config.fetch_timeout)?);
        Ok(Self::new(config, connector, fetcher))
    }

    /// Runtime configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Open a connection for `identity`, or return the live one if it exists.
    ///
    /// A closed or stopped connection for `identity` is replaced (and
    /// closed, if it was only stopped). Must be called from within a Tokio
    /// runtime.
    pub fn open(&self, identity: Identity) -> ConnectionHandle {
        let (handle, replaced) = {
            let mut registry = self.inner.registry.lock();
            if let Some(existing) = registry.connections.get(&identity).filter(|h| h.is_live()) {
                debug!(identity = %identity, "reusing open connection");
                return existing.clone();
            }
            let replaced = registry.connections.remove(&identity);
            info!(identity = %identity, "opening connection");
            let handle = ConnectionHandle::spawn(
                identity.clone(),
                self.inner.config.clone(),
                Arc::clone(&self.inner.connector),
                Arc::clone(&self.inner.fetcher),
                Arc::downgrade(&self.inner),
            );
            let _ = registry.connections.insert(identity, handle.clone());
            (handle, replaced)
        };
        if let Some(old) = replaced {
            old.close();
        }
        handle
    }

    /// Close a connection. Same as [`ConnectionHandle::close`].
    pub fn close(&self, handle: &ConnectionHandle) {
        handle.close();
    }

    /// Live connection for `identity`, if any.
    pub fn get(&self, identity: &Identity) -> Option<ConnectionHandle> {
        self.inner
            .registry
            .lock()
            .connections
            .get(identity)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Switch the signed-in identity.
    ///
    /// Opens (or reuses) a connection for the new identity and closes the
    /// previous identity's connection. `None` signs out.
    pub fn set_identity(&self, identity: Option<Identity>) -> Option<ConnectionHandle> {
        let previous = {
            let mut registry = self.inner.registry.lock();
            std::mem::replace(&mut registry.current, identity.clone())
        };
        if let Some(previous) = previous.filter(|p| Some(p) != identity.as_ref()) {
            if let Some(handle) = self.get(&previous) {
                handle.close();
            }
        }
        identity.map(|id| self.open(id))
    }

    /// Connection of the current identity.
    pub fn current(&self) -> Option<ConnectionHandle> {
        let registry = self.inner.registry.lock();
        let identity = registry.current.as_ref()?;
        registry
            .connections
            .get(identity)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Close every connection.
    pub fn close_all(&self) {
        let handles: Vec<ConnectionHandle> = {
            let mut registry = self.inner.registry.lock();
            registry.current = None;
            registry.connections.values().cloned().collect()
        };
        for handle in handles {
            handle.close();
        }
    }
}
