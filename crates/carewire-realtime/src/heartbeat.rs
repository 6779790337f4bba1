//! Heartbeat liveness monitoring.
//!
//! The connection driver calls [`HeartbeatMonitor::on_tick`] at every
//! heartbeat interval. If no `heartbeat_ack` arrived since the previous tick
//! the missed counter increments; once `max_missed` consecutive ticks pass
//! unanswered the connection is considered dead.

use std::time::Duration;

use tokio::time::Instant;

/// What the driver should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a `heartbeat` frame.
    SendPing,
    /// The server stopped answering within the timeout window.
    TimedOut,
}

/// Missed-ack counter and round-trip timer.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    max_missed: u32,
    missed: u32,
    alive: bool,
    pending_since: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Create a monitor that times out after `max_missed` silent ticks
    /// (clamped to at least 1).
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed: max_missed.max(1),
            missed: 0,
            alive: true,
            pending_since: None,
        }
    }

    /// Advance one interval.
    pub fn on_tick(&mut self) -> HeartbeatAction {
        if self.alive {
            self.missed = 0;
        } else {
            self.missed += 1;
            if self.missed >= self.max_missed {
                return HeartbeatAction::TimedOut;
            }
        }
        // Not alive until the next ack.
        self.alive = false;
        HeartbeatAction::SendPing
    }

    /// Record that a heartbeat was written at `now`.
    ///
    /// Only the oldest unanswered ping is timed.
    pub fn ping_sent(&mut self, now: Instant) {
        if self.pending_since.is_none() {
            self.pending_since = Some(now);
        }
    }

    /// Record an acknowledgment; returns the round-trip time when a ping
    /// was outstanding.
    pub fn ack(&mut self, now: Instant) -> Option<Duration> {
        self.alive = true;
        self.pending_since
            .take()
            .map(|sent| now.saturating_duration_since(sent))
    }

    /// Forget all history (new connection).
    pub fn reset(&mut self) {
        self.missed = 0;
        self.alive = true;
        self.pending_since = None;
    }

    /// Consecutive unanswered ticks so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }
}
