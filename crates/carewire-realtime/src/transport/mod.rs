//! Transport seam between the connection driver and the wire.
//!
//! A [`Connector`] opens one physical connection and hands back a
//! [`Channel`]: a queue of outbound text frames and a stream of inbound
//! [`TransportFrame`]s. Dropping the outbound sender closes the connection
//! once queued frames are flushed.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use carewire_core::{Identity, RealtimeError};
use tokio::sync::mpsc;

pub use memory::{MemoryConnector, MemoryServer, ServerConn};
pub use ws::WsConnector;

/// Something read from the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportFrame {
    /// One text frame.
    Text(String),
    /// The connection ended; no further frames follow.
    Closed(Option<String>),
}

/// Both directions of an open connection.
#[derive(Debug)]
pub struct Channel {
    /// Outbound text frames.
    pub outbound: mpsc::Sender<String>,
    /// Inbound frames, in wire order.
    pub inbound: mpsc::Receiver<TransportFrame>,
}

/// Opens connections on behalf of an identity.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection for `identity`.
    ///
    /// Returns [`RealtimeError::Auth`] when the server rejects the identity
    /// and [`RealtimeError::Transport`] for every other failure.
    async fn connect(&self, identity: &Identity) -> Result<Channel, RealtimeError>;
}
