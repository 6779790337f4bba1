//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CarewireSettings::default()`]
//! 2. If `~/.carewire/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::CarewireSettings;

/// Resolve the path to the settings file (`~/.carewire/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".carewire").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CarewireSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<CarewireSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the user file, without env overrides.
fn load_file_layer(path: &Path) -> Result<CarewireSettings> {
    let defaults = serde_json::to_value(CarewireSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CAREWIRE_*` environment variable overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut CarewireSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within range; invalid values are ignored
/// with a warning and the file/default value is kept.
pub fn apply_overrides_from<F>(settings: &mut CarewireSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let millis = |name: &str, min: u64, max: u64| {
        let val = lookup(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid millisecond env var, ignoring");
        }
        result
    };

    // ── Realtime ────────────────────────────────────────────────────
    if let Some(v) = string("CAREWIRE_SERVER_URL") {
        settings.realtime.server_url = v;
    }
    if let Some(v) = millis("CAREWIRE_HEARTBEAT_INTERVAL_MS", 1_000, 600_000) {
        settings.realtime.heartbeat_interval_ms = v;
    }
    if let Some(v) = millis("CAREWIRE_HEARTBEAT_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.realtime.heartbeat_timeout_ms = v;
    }
    if let Some(v) = millis("CAREWIRE_TYPING_TTL_MS", 0, 600_000) {
        settings.realtime.typing_ttl_ms = v;
    }

    // ── API ─────────────────────────────────────────────────────────
    if let Some(v) = string("CAREWIRE_API_URL") {
        settings.api.base_url = v;
    }
    if let Some(v) = millis("CAREWIRE_FETCH_TIMEOUT_MS", 100, 600_000) {
        settings.api.fetch_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("CAREWIRE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
