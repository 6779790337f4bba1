//! In-process transport.
//!
//! [`MemoryConnector`] hands each accepted connection's server side to a
//! [`MemoryServer`], so a test (or a local demo) can play the server:
//! push inbound messages, read what the client emitted and drop the
//! connection to simulate a network gap.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use carewire_core::{Identity, RealtimeError};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Channel, Connector, TransportFrame};
use crate::protocol::{Inbound, Outbound};

/// Queue capacity of in-memory channels.
const BUFFER: usize = 256;

#[derive(Default)]
struct Script {
    failures: VecDeque<RealtimeError>,
    attempts: usize,
}

/// Connector whose connections terminate in a [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    script: Arc<Mutex<Script>>,
    accepted: mpsc::UnboundedSender<ServerConn>,
}

/// Receives the server side of every connection a [`MemoryConnector`] opens.
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl MemoryConnector {
    /// Create a connected connector/server pair.
    pub fn pair() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Arc::new(Mutex::new(Script::default())),
                accepted: tx,
            },
            MemoryServer { accepted: rx },
        )
    }

    /// Make the next connection attempt fail with `error`.
    pub fn fail_next(&self, error: RealtimeError) {
        self.script.lock().failures.push_back(error);
    }

    /// Connection attempts so far, including failed ones.
    pub fn attempts(&self) -> usize {
        self.script.lock().attempts
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, identity: &Identity) -> Result<Channel, RealtimeError> {
        {
            let mut script = self.script.lock();
            script.attempts += 1;
            if let Some(error) = script.failures.pop_front() {
                return Err(error);
            }
        }

        let (out_tx, out_rx) = mpsc::channel(BUFFER);
        let (in_tx, in_rx) = mpsc::channel(BUFFER);
        let server = ServerConn {
            identity: identity.clone(),
            from_client: out_rx,
            to_client: in_tx,
        };
        self.accepted
            .send(server)
            .map_err(|_| RealtimeError::transport("memory server dropped"))?;
        Ok(Channel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl MemoryServer {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<ServerConn> {
        self.accepted.recv().await
    }
}

/// Server side of one in-memory connection.
pub struct ServerConn {
    identity: Identity,
    from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<TransportFrame>,
}

impl ServerConn {
    /// Identity the client connected as.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Push a message to the client. Returns `false` once the client is gone.
    pub async fn send(&self, message: &Inbound) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_raw(text).await,
            Err(e) => {
                warn!(error = %e, "failed to serialize inbound message");
                false
            }
        }
    }

    /// Push a raw text frame to the client.
    pub async fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(TransportFrame::Text(text.into()))
            .await
            .is_ok()
    }

    /// Next message the client emitted, or `None` once it closed the
    /// connection. Frames that do not decode are skipped.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            let text = self.from_client.recv().await?;
            match serde_json::from_str(&text) {
                Ok(message) => return Some(message),
                Err(e) => warn!(error = %e, "client sent undecodable frame"),
            }
        }
    }

    /// Close the connection with a reason.
    pub async fn close(self, reason: Option<String>) {
        let _ = self.to_client.send(TransportFrame::Closed(reason)).await;
    }
}
