//! Outbound operations.
//!
//! Every method returns whether the message was queued. Nothing is queued
//! while the connection is not acknowledged: calls made while disconnected
//! are dropped, never buffered for later delivery and never an error.

use carewire_core::{ContextId, EntityRef, ScopeId};
use tokio::time::Instant;
use tracing::debug;

use crate::manager::ConnectionHandle;
use crate::protocol::Outbound;
use crate::typing::{TypingContext, TypingKey};

/// Sends client messages over one connection.
#[derive(Clone, Debug)]
pub struct Emitter {
    handle: ConnectionHandle,
}

impl Emitter {
    pub(crate) fn new(handle: ConnectionHandle) -> Self {
        Self { handle }
    }

    fn send(&self, message: &Outbound) -> bool {
        self.handle
            .inner()
            .with_live(|shared| shared.send(message))
            .unwrap_or(false)
    }

    /// Announce that the local identity started typing.
    ///
    /// On success the local indicator is shown immediately as pending until
    /// the server echoes it.
    pub fn start_typing(&self, context: TypingContext, context_id: impl Into<ContextId>) -> bool {
        let context_id = context_id.into();
        self.handle
            .inner()
            .with_live(|shared| {
                let sent = shared.send(&Outbound::TypingStarted {
                    context: context.clone(),
                    context_id: context_id.clone(),
                });
                if sent {
                    let identity = shared.state.identity.clone();
                    let profile = shared
                        .state
                        .presence
                        .get(&identity)
                        .map(|e| e.profile.clone())
                        .unwrap_or_default();
                    let key = TypingKey::new(context, context_id, identity);
                    let _ = shared.state.typing.start_local(key, profile, Instant::now());
                }
                sent
            })
            .unwrap_or(false)
    }

    /// Announce that the local identity stopped typing. The local indicator
    /// is removed either way.
    pub fn stop_typing(&self, context: TypingContext, context_id: impl Into<ContextId>) -> bool {
        let context_id = context_id.into();
        self.handle
            .inner()
            .with_live(|shared| {
                let sent = shared.send(&Outbound::TypingStopped {
                    context: context.clone(),
                    context_id: context_id.clone(),
                });
                let key = TypingKey::new(context, context_id, shared.state.identity.clone());
                let _ = shared.state.typing.stop(&key);
                sent
            })
            .unwrap_or(false)
    }

    /// Join a server-side room. Joined rooms are re-joined after reconnects.
    pub fn join_room(&self, scope_id: impl Into<ScopeId>) -> bool {
        let scope_id = scope_id.into();
        self.handle
            .inner()
            .with_live(|shared| {
                let sent = shared.send(&Outbound::JoinScope {
                    scope_id: scope_id.clone(),
                });
                if sent {
                    let _ = shared.state.rooms.insert(scope_id);
                }
                sent
            })
            .unwrap_or(false)
    }

    /// Leave a server-side room and stop re-joining it.
    pub fn leave_room(&self, scope_id: impl Into<ScopeId>) -> bool {
        let scope_id = scope_id.into();
        self.handle
            .inner()
            .with_live(|shared| {
                let _ = shared.state.rooms.remove(&scope_id);
                shared.send(&Outbound::LeaveScope { scope_id })
            })
            .unwrap_or(false)
    }

    /// Tell the server the local identity opened an entity.
    pub fn notify_viewed(&self, entity: EntityRef) -> bool {
        self.send(&Outbound::EntityViewed { entity })
    }

    /// Announce sign-out, then clear the identity and close the connection.
    ///
    /// The `sign_out` frame is flushed before the socket closes.
    pub fn sign_out(&self) -> bool {
        let sent = self.send(&Outbound::SignOut);
        debug!(identity = %self.handle.identity(), sent, "signing out");
        self.handle.sign_out_local();
        sent
    }

    /// Send a heartbeat now; the round-trip time is recorded on the ack.
    pub fn ping(&self) -> bool {
        self.handle
            .inner()
            .with_live(|shared| {
                let sent = shared.send(&Outbound::Heartbeat);
                if sent {
                    shared.state.heartbeat.ping_sent(Instant::now());
                }
                sent
            })
            .unwrap_or(false)
    }
}
