//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If `~/.ensemble/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ClientSettings;

/// Resolve the path to the settings file (`~/.ensemble/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".ensemble").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or invalid values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    load_with(path, |name| std::env::var(name).ok())
}

fn load_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ClientSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
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

/// Apply `ENSEMBLE_*` environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (file/default value is kept).
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

fn apply_overrides(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    // ── Connection target ───────────────────────────────────────────
    if let Some(v) = env("ENSEMBLE_URL").filter(|v| !v.trim().is_empty()) {
        settings.connect_string = Some(v);
    }
    if let Some(v) = read_u64(&env, "ENSEMBLE_SESSION_TIMEOUT_MS", 1, 3_600_000) {
        settings.session_timeout_ms = v;
    }

    // ── Supervision ─────────────────────────────────────────────────
    if let Some(v) = read_u64(&env, "ENSEMBLE_RECONNECT_INTERVAL_MS", 1, 3_600_000) {
        settings.reconnect_interval_ms = v;
    }
    if let Some(v) = read_u64(&env, "ENSEMBLE_OPERATION_TIMEOUT_MS", 1, 3_600_000) {
        settings.operation_timeout_ms = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_u64(env: &impl Fn(&str) -> Option<String>, name: &str, min: u64, max: u64) -> Option<u64> {
    let val = env(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
