//! Runtime configuration for the connection manager.

use std::time::Duration;

use carewire_core::retry::BackoffConfig;
use carewire_settings::CarewireSettings;

/// Shortest interval or timeout the driver will use; zero periods are
/// raised to this.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Connection and fetch parameters, in runtime units.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// WebSocket endpoint.
    pub server_url: String,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Time without an acknowledgment before the connection is declared dead.
    pub heartbeat_timeout: Duration,
    /// Time allowed between socket open and `connection_ack`.
    pub handshake_timeout: Duration,
    /// Reconnect backoff policy.
    pub reconnect: BackoffConfig,
    /// Typing indicator lifetime without a refresh (`None` disables expiry).
    pub typing_ttl: Option<Duration>,
    /// Capacity of the outbound queue.
    pub outbound_buffer: usize,
    /// Base URL of the bulk-fetch API.
    pub api_base_url: String,
    /// Per-collection bulk fetch timeout.
    pub fetch_timeout: Duration,
}

impl ClientConfig {
    /// Consecutive unanswered heartbeats tolerated before timing out
    /// (`timeout / interval`, at least 1).
    #[must_use]
    pub fn max_missed_heartbeats(&self) -> u32 {
        let interval = self.heartbeat_interval.as_millis().max(1);
        let missed = (self.heartbeat_timeout.as_millis() / interval).max(1);
        u32::try_from(missed).unwrap_or(u32::MAX)
    }

    /// Heartbeat interval, never zero.
    #[must_use]
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(MIN_PERIOD)
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms).max(MIN_PERIOD)
}

impl From<&CarewireSettings> for ClientConfig {
    fn from(settings: &CarewireSettings) -> Self {
        let rt = &settings.realtime;
        Self {
            server_url: rt.server_url.clone(),
            heartbeat_interval: millis(rt.heartbeat_interval_ms),
            heartbeat_timeout: millis(rt.heartbeat_timeout_ms),
            handshake_timeout: millis(rt.handshake_timeout_ms),
            reconnect: rt.reconnect.clone(),
            typing_ttl: (rt.typing_ttl_ms > 0).then(|| Duration::from_millis(rt.typing_ttl_ms)),
            outbound_buffer: rt.outbound_buffer.max(1),
            api_base_url: settings.api.base_url.clone(),
            fetch_timeout: millis(settings.api.fetch_timeout_ms),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&CarewireSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
        assert_eq!(cfg.typing_ttl, Some(Duration::from_secs(8)));
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(15));
        assert_eq!(cfg.outbound_buffer, 64);
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let mut settings = CarewireSettings::default();
        settings.realtime.typing_ttl_ms = 0;
        assert!(ClientConfig::from(&settings).typing_ttl.is_none());
    }

    #[test]
    fn zero_buffer_is_clamped() {
        let mut settings = CarewireSettings::default();
        settings.realtime.outbound_buffer = 0;
        assert_eq!(ClientConfig::from(&settings).outbound_buffer, 1);
    }

    #[test]
    fn zero_durations_are_clamped() {
        let mut settings = CarewireSettings::default();
        settings.realtime.heartbeat_interval_ms = 0;
        settings.realtime.heartbeat_timeout_ms = 0;
        settings.realtime.handshake_timeout_ms = 0;
        settings.api.fetch_timeout_ms = 0;
        let cfg = ClientConfig::from(&settings);
        assert_eq!(cfg.heartbeat_interval, MIN_PERIOD);
        assert_eq!(cfg.heartbeat_timeout, MIN_PERIOD);
        assert_eq!(cfg.handshake_timeout, MIN_PERIOD);
        assert_eq!(cfg.fetch_timeout, MIN_PERIOD);
        assert_eq!(cfg.max_missed_heartbeats(), 1);
    }

    #[test]
    fn heartbeat_period_is_never_zero() {
        let cfg = ClientConfig {
            heartbeat_interval: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert_eq!(cfg.heartbeat_period(), MIN_PERIOD);
    }

    #[test]
    fn max_missed_from_timeout_and_interval() {
        let mut cfg = ClientConfig::default();
        assert_eq!(cfg.max_missed_heartbeats(), 2);
        cfg.heartbeat_interval = Duration::from_millis(100);
        cfg.heartbeat_timeout = Duration::from_millis(300);
        assert_eq!(cfg.max_missed_heartbeats(), 3);
        cfg.heartbeat_timeout = Duration::from_millis(50);
        assert_eq!(cfg.max_missed_heartbeats(), 1);
    }
}
