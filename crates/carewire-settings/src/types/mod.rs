//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so partial JSON files are accepted; missing fields keep their defaults.

mod api;
mod realtime;

pub use api::*;
pub use realtime::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "realtime": { "serverUrl": "wss://console.example/ws" },
///   "api": { "baseUrl": "https://console.example/api" },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CarewireSettings {
    /// Realtime connection settings.
    pub realtime: RealtimeSettings,
    /// Bulk-fetch HTTP API settings.
    pub api: ApiSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level passed to the tracing `EnvFilter`.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
