//! Realtime connection settings.

use carewire_core::retry::BackoffConfig;
use serde::{Deserialize, Serialize};

/// Settings for the persistent server connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    /// WebSocket endpoint.
    pub server_url: String,
    /// Interval between heartbeats in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Time without a heartbeat acknowledgment before the connection is
    /// considered dead, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Time allowed between socket open and `connection_ack`, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Reconnect backoff policy.
    pub reconnect: BackoffConfig,
    /// Typing indicators not refreshed within this window are dropped.
    /// `0` disables expiry.
    pub typing_ttl_ms: u64,
    /// Capacity of the outbound message queue.
    pub outbound_buffer: usize,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/realtime".to_string(),
            heartbeat_interval_ms: 25_000,
            heartbeat_timeout_ms: 60_000,
            handshake_timeout_ms: 10_000,
            reconnect: BackoffConfig::default(),
            typing_ttl_ms: 8_000,
            outbound_buffer: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = RealtimeSettings::default();
        assert_eq!(s.heartbeat_interval_ms, 25_000);
        assert_eq!(s.heartbeat_timeout_ms, 60_000);
        assert_eq!(s.typing_ttl_ms, 8_000);
        assert_eq!(s.reconnect.base_delay_ms, 500);
    }

    #[test]
    fn partial_reconnect_keeps_other_defaults() {
        let s: RealtimeSettings =
            serde_json::from_str(r#"{"reconnect": {"maxAttempts": 4}}"#).unwrap();
        assert_eq!(s.reconnect.max_attempts, Some(4));
        assert_eq!(s.reconnect.max_delay_ms, 30_000);
        assert_eq!(s.outbound_buffer, 64);
    }
}
