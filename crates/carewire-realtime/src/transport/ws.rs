//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use carewire_core::{Identity, RealtimeError};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::{Channel, Connector, TransportFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Request header carrying the opaque identity.
pub const IDENTITY_HEADER: &str = "x-carewire-identity";

/// Opens WebSocket connections to one endpoint.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
    buffer: usize,
}

impl WsConnector {
    /// Connector for `url` with queues of `buffer` frames each way.
    pub fn new(url: impl Into<String>, buffer: usize) -> Self {
        Self {
            url: url.into(),
            buffer: buffer.max(1),
        }
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, identity: &Identity) -> Result<Channel, RealtimeError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::transport(format!("invalid server url: {e}")))?;
        let value = HeaderValue::from_str(identity.as_str())
            .map_err(|_| RealtimeError::auth("identity is not a valid header value"))?;
        let _ = request.headers_mut().insert(IDENTITY_HEADER, value);

        let (ws, _response) = connect_async(request).await.map_err(classify_connect_error)?;
        debug!(url = %self.url, identity = %identity, "websocket connected");

        let (out_tx, out_rx) = mpsc::channel(self.buffer);
        let (in_tx, in_rx) = mpsc::channel(self.buffer);
        drop(tokio::spawn(pump(ws, out_rx, in_tx)));

        Ok(Channel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// HTTP 401/403 during the upgrade means the identity was rejected.
fn classify_connect_error(error: tungstenite::Error) -> RealtimeError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                RealtimeError::auth(format!("server rejected identity (HTTP {status})"))
            } else {
                RealtimeError::transport(format!("handshake failed (HTTP {status})"))
            }
        }
        other => RealtimeError::transport(other.to_string()),
    }
}

/// Move frames between the socket and the channel until either side ends.
async fn pump(
    ws: WsStream,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<TransportFrame>,
) {
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(text) = msg else {
                    let _ = sink.send(Message::Close(None)).await;
                    break None;
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "websocket write failed");
                    break Some(e.to_string());
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(TransportFrame::Text(text.as_str().to_owned())).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read failed");
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            }
        }
    };

    let _ = inbound.send(TransportFrame::Closed(reason)).await;
}
