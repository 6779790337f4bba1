//! Connection driver task.
//!
//! One task per [`ConnectionHandle`](crate::ConnectionHandle). It connects,
//! waits for `connection_ack` within the handshake timeout, then pumps
//! inbound frames through the dispatcher while sending heartbeats. When the
//! connection is lost it invalidates everything mirrored from the server and
//! reconnects with exponential backoff.
//!
//! After every acknowledged (re)connect it requests a presence snapshot,
//! re-joins remembered rooms and re-fetches all four collections.
//!
//! A rejected identity or an exhausted reconnect budget stops the task and
//! marks the connection stopped, so the manager opens a fresh one on the
//! next request for that identity.

use std::sync::Arc;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionState;
use crate::dispatcher::handle_frame;
use crate::heartbeat::HeartbeatAction;
use crate::manager::{Inner, Shared, begin_all};
use crate::protocol::{Inbound, Outbound};
use crate::transport::{Channel, Connector, TransportFrame};

/// Why one connection ended.
#[derive(Debug)]
enum SessionEnd {
    /// Closed by the client; stop.
    Cancelled,
    /// Closed by the server or the transport.
    Closed(Option<String>),
    /// Failed (handshake or heartbeat timeout, connect error, or a
    /// `connection_error` from the server).
    Failed(String),
}

pub(crate) async fn run(inner: Arc<Inner>, connector: Arc<dyn Connector>) {
    let identity = inner.identity.clone();
    let mut attempt: u32 = 0;

    loop {
        let live = inner.with_live(|s| {
            s.state.update_status(|st| {
                st.state = ConnectionState::Connecting;
                st.reconnect_attempt = attempt;
            });
        });
        if live.is_none() {
            break;
        }
        info!(identity = %identity, attempt, "connecting");

        let connected = tokio::select! {
            result = connector.connect(&identity) => result,
            () = inner.cancel.cancelled() => break,
        };

        let end = match connected {
            Ok(channel) => run_session(&inner, channel, &mut attempt).await,
            Err(e) if e.is_fatal() => {
                error!(identity = %identity, error = %e, "connection rejected");
                let _ = inner.with_live(|s| {
                    s.state.set_state(ConnectionState::Error(e.to_string()));
                    s.stopped = true;
                });
                break;
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "connect failed");
                SessionEnd::Failed(e.to_string())
            }
        };

        let next_state = match end {
            SessionEnd::Cancelled => break,
            SessionEnd::Closed(reason) => ConnectionState::Disconnected { reason },
            SessionEnd::Failed(reason) => ConnectionState::Error(reason),
        };
        info!(identity = %identity, state = %next_state, "connection lost");
        let live = inner.with_live(|s| {
            s.outbound = None;
            s.state.invalidate();
            s.state.set_state(next_state);
        });
        if live.is_none() {
            break;
        }

        let policy = &inner.config.reconnect;
        if policy.exhausted(attempt) {
            warn!(identity = %identity, attempts = attempt, "giving up reconnecting");
            let _ = inner.with_live(|s| {
                s.state.set_state(ConnectionState::Error(format!(
                    "gave up after {attempt} reconnect attempts"
                )));
                s.stopped = true;
            });
            break;
        }
        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(identity = %identity, delay_ms = delay.as_millis(), attempt, "reconnect scheduled");

        tokio::select! {
            () = time::sleep(delay) => {}
            () = inner.cancel.cancelled() => break,
        }
    }

    debug!(identity = %identity, "driver stopped");
}

async fn run_session(inner: &Arc<Inner>, channel: Channel, attempt: &mut u32) -> SessionEnd {
    let Channel { outbound, mut inbound } = channel;
    let config = &inner.config;

    let handshake = time::sleep(config.handshake_timeout);
    tokio::pin!(handshake);
    let mut ticker = time::interval(config.heartbeat_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut acked = false;

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return SessionEnd::Cancelled,

            () = &mut handshake, if !acked => {
                warn!(identity = %inner.identity, "handshake not acknowledged in time");
                return SessionEnd::Failed(format!(
                    "handshake not acknowledged within {}ms",
                    config.handshake_timeout.as_millis()
                ));
            }

            _ = ticker.tick(), if acked => {
                match inner.with_live(|s| on_tick(inner, s)) {
                    None => return SessionEnd::Cancelled,
                    Some(HeartbeatAction::TimedOut) => {
                        warn!(identity = %inner.identity, "heartbeat timed out");
                        return SessionEnd::Failed("heartbeat timed out".to_string());
                    }
                    Some(HeartbeatAction::SendPing) => {}
                }
            }

            frame = inbound.recv() => {
                let text = match frame {
                    Some(TransportFrame::Text(text)) => text,
                    Some(TransportFrame::Closed(reason)) => return SessionEnd::Closed(reason),
                    None => return SessionEnd::Closed(None),
                };
                let event = inner.with_live(|s| {
                    let event = handle_frame(&s.listeners, &mut s.state, &text);
                    let tickets = matches!(event, Some(Inbound::ConnectionAck { .. })).then(|| {
                        s.outbound = Some(outbound.clone());
                        resync(s);
                        begin_all(&mut s.state)
                    });
                    (event, tickets)
                });
                match event {
                    None => return SessionEnd::Cancelled,
                    Some((_, Some(tickets))) => {
                        info!(identity = %inner.identity, "connected");
                        acked = true;
                        *attempt = 0;
                        ticker.reset();
                        let refresher = Arc::clone(inner);
                        drop(tokio::spawn(async move {
                            let _ = refresher.fetch_all(tickets).await;
                        }));
                    }
                    Some((Some(Inbound::ConnectionClosed { reason }), None)) => {
                        return SessionEnd::Closed(reason);
                    }
                    Some((Some(Inbound::ConnectionError { message }), None)) => {
                        warn!(identity = %inner.identity, error = %message, "server reported a connection error");
                        return SessionEnd::Failed(message);
                    }
                    Some(_) => {}
                }
            }
        }
    }
}

/// Request a presence snapshot and re-join remembered rooms.
fn resync(shared: &mut Shared) {
    let _ = shared.send(&Outbound::PresenceSync);
    let rooms: Vec<_> = shared.state.rooms().cloned().collect();
    for scope_id in rooms {
        let _ = shared.send(&Outbound::JoinScope { scope_id });
    }
}

/// One heartbeat interval: sweep expired typing indicators, then ping.
fn on_tick(inner: &Inner, shared: &mut Shared) -> HeartbeatAction {
    let now = Instant::now();
    if let Some(ttl) = inner.config.typing_ttl {
        let expired = shared.state.typing.expire(now, ttl);
        if expired > 0 {
            debug!(identity = %inner.identity, expired, "expired typing indicators");
        }
    }
    let action = shared.state.heartbeat.on_tick();
    if action == HeartbeatAction::SendPing && shared.send(&Outbound::Heartbeat) {
        shared.state.heartbeat.ping_sent(now);
    }
    action
}
