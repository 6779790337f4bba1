//! # carewire-realtime
//!
//! Client side of the carewire realtime channel: one persistent connection
//! per signed-in identity, mirrored presence, typing indicators and entity
//! collections kept in sync with server pushes.
//!
//! ## Module layout
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`manager`] | `ConnectionManager` and the read-only `ConnectionHandle` |
//! | [`emitter`] | Outbound operations (typing, rooms, sign-out) |
//! | [`dispatcher`] | Routes decoded messages to handlers that mutate `SyncState` |
//! | [`presence`] | Session-counted presence registry |
//! | [`typing`] | Typing indicators keyed by context and identity |
//! | [`store`] | Entity collections with bulk-fetch reconciliation |
//! | [`protocol`] | Wire message types and codec |
//! | [`heartbeat`] | Missed-heartbeat accounting |
//! | [`transport`] | `Connector` seam with WebSocket and in-memory transports |
//! | [`fetch`] | `BulkFetcher` seam with HTTP and in-memory fetchers |
//!
//! Snapshots are published through `tokio::sync::watch` channels and only
//! when something changed.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod dispatcher;
mod driver;
pub mod emitter;
pub mod fetch;
pub mod heartbeat;
pub mod manager;
pub mod presence;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod typing;

pub use config::ClientConfig;
pub use connection::{ConnectionState, ConnectionStatus};
pub use dispatcher::{EventHandler, ListenerRegistry, Subscription, SyncState};
pub use emitter::Emitter;
pub use fetch::{BulkFetcher, HttpBulkFetcher, MemoryFetcher};
pub use manager::{ConnectionHandle, ConnectionManager};
pub use presence::{PresenceEntry, PresencePage, PresenceRegistry, SessionHandle};
pub use protocol::{Inbound, InboundKind, Outbound, SnapshotEntry, SnapshotSession, decode, encode};
pub use store::{Collection, CollectionStatus, EntityStore};
pub use transport::{Channel, Connector, MemoryConnector, MemoryServer, ServerConn, TransportFrame, WsConnector};
pub use typing::{TypingContext, TypingEntry, TypingKey, TypingState, TypingTracker};
