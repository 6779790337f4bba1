//! Bulk collection fetches.
//!
//! A [`BulkFetcher`] returns every record of one entity collection. The HTTP
//! implementation issues `GET {base}/entities/{collection}` and treats any
//! response body that is not a JSON array as an empty collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carewire_core::{EntityKind, EntityRecord, RealtimeError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Source of full collections.
#[async_trait]
pub trait BulkFetcher: Send + Sync {
    /// Fetch every record of `kind`.
    async fn fetch(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, RealtimeError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// Fetches collections from the console REST API.
#[derive(Clone, Debug)]
pub struct HttpBulkFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBulkFetcher {
    /// Fetcher for `base_url` whose requests give up after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RealtimeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RealtimeError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(base_url, client))
    }

    /// Fetcher using an existing client.
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, kind: EntityKind) -> String {
        format!("{}/entities/{}", self.base_url, kind.collection_path())
    }
}

#[async_trait]
impl BulkFetcher for HttpBulkFetcher {
    async fn fetch(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, RealtimeError> {
        let url = self.url(kind);
        let fail = |e: reqwest::Error| RealtimeError::BulkFetch {
            kind,
            message: e.to_string(),
            timed_out: e.is_timeout(),
        };

        let response = self.client.get(&url).send().await.map_err(fail)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RealtimeError::bulk_fetch(kind, format!("HTTP {}", status.as_u16())));
        }
        let body: Value = response.json().await.map_err(fail)?;
        let records = parse_records(kind, body);
        debug!(%kind, %url, records = records.len(), "bulk fetch complete");
        Ok(records)
    }
}

/// Interpret a response body. Non-arrays become empty; elements without a
/// usable `id` are skipped.
pub fn parse_records(kind: EntityKind, body: Value) -> Vec<EntityRecord> {
    let Value::Array(items) = body else {
        warn!(%kind, "bulk fetch response is not an array, treating as empty");
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match EntityRecord::from_value(item) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(%kind, error = %e, "skipping record without a usable id");
                None
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// Fetcher serving canned collections, with a gate for holding responses.
#[derive(Clone)]
pub struct MemoryFetcher {
    collections: Arc<Mutex<HashMap<EntityKind, Vec<EntityRecord>>>>,
    failures: Arc<Mutex<HashMap<EntityKind, String>>>,
    gate: watch::Sender<bool>,
}

impl MemoryFetcher {
    /// Empty collections, gate open.
    pub fn new() -> Self {
        let (gate, _rx) = watch::channel(true);
        Self {
            collections: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            gate,
        }
    }

    /// Set what `kind` returns.
    pub fn set(&self, kind: EntityKind, records: Vec<EntityRecord>) {
        let _ = self.failures.lock().remove(&kind);
        let _ = self.collections.lock().insert(kind, records);
    }

    /// Make fetches of `kind` fail until [`MemoryFetcher::set`] is called
    /// again for it.
    pub fn fail(&self, kind: EntityKind, message: impl Into<String>) {
        let _ = self.failures.lock().insert(kind, message.into());
    }

    /// Hold every response until [`MemoryFetcher::release`].
    pub fn hold(&self) {
        let _ = self.gate.send_replace(false);
    }

    /// Let held responses through.
    pub fn release(&self) {
        let _ = self.gate.send_replace(true);
    }
}

impl Default for MemoryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BulkFetcher for MemoryFetcher {
    async fn fetch(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, RealtimeError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if let Some(message) = self.failures.lock().get(&kind) {
            return Err(RealtimeError::bulk_fetch(kind, message.clone()));
        }
        Ok(self.collections.lock().get(&kind).cloned().unwrap_or_default())
    }
}
