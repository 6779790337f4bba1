//! Bulk-fetch HTTP API settings.

use serde::{Deserialize, Serialize};

/// Settings for the REST collaborator serving `GET /entities/{kind}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    /// Base URL the entity paths are appended to.
    pub base_url: String,
    /// Per-request timeout in milliseconds.
    pub fetch_timeout_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            fetch_timeout_ms: 15_000,
        }
    }
}
