//! Options loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`EngineOptions::default()`]
//! 2. If an options file exists, deep-merge its values over the defaults
//! 3. Apply `RELAY_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{EngineOptions, OfflinePolicy};

/// Environment variable naming the options file.
pub const OPTIONS_FILE_ENV: &str = "RELAY_OPTIONS_FILE";

/// Load options from the file named by `RELAY_OPTIONS_FILE` (if set) with env overrides.
pub fn load_options() -> Result<EngineOptions> {
    match read_env_string(OPTIONS_FILE_ENV) {
        Some(path) => load_options_from_path(&PathBuf::from(path)),
        None => {
            let mut options = EngineOptions::default();
            apply_env_overrides(&mut options);
            options.validate()?;
            Ok(options)
        }
    }
}

/// Load options from a specific path with env overrides.
///
/// A missing file yields defaults. Invalid JSON or invalid values are errors.
pub fn load_options_from_path(path: &Path) -> Result<EngineOptions> {
    let defaults = serde_json::to_value(EngineOptions::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading options from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "options file not found, using defaults");
        defaults
    };

    let mut options: EngineOptions = serde_json::from_value(merged)?;
    apply_env_overrides(&mut options);
    options.validate()?;
    Ok(options)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply environment variable overrides.
///
/// Out-of-range or unparsable values are ignored with a warning.
pub fn apply_env_overrides(options: &mut EngineOptions) {
    if let Some(v) = read_env_u64("RELAY_SEND_TIMEOUT_MS", 1, 60_000) {
        options.send_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("RELAY_HEARTBEAT_INTERVAL_MS", 10, 600_000) {
        options.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u64("RELAY_MAX_RETRY_PER_CONNECTION", 0, 10) {
        options.max_retry_per_connection = v as u32;
    }
    if let Some(v) = read_env_bool("RELAY_FAILOVER_ENABLED") {
        options.failover_enabled = v;
    }
    if let Some(v) = read_env_u64("RELAY_HANDSHAKE_TIMEOUT_MS", 1, 600_000) {
        options.handshake_timeout_ms = v;
    }
    if let Some(v) = read_env_usize("RELAY_REGISTRY_SHARDS", 1, 4096) {
        options.registry_shards = v;
    }
    if let Some(v) = read_env_string("RELAY_OFFLINE_POLICY") {
        match v.to_lowercase().as_str() {
            "buffer" => options.offline_policy = OfflinePolicy::Buffer,
            "drop" => options.offline_policy = OfflinePolicy::Drop,
            _ => tracing::warn!(key = "RELAY_OFFLINE_POLICY", value = %v, "invalid policy, ignoring"),
        }
    }
    if let Some(v) = read_env_usize("RELAY_OFFLINE_BUFFER_CAPACITY", 0, 1_000_000) {
        options.offline_buffer_capacity = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
