//! Settings loading with deep merge, environment overrides and validation.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If `~/.relay/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `RELAY_*` environment variable overrides (highest priority)
//! 4. Validate ranges
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::RelaySettings;

/// Resolve the path to the settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or out-of-range values are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("RELAY_LOG_JSON") {
        settings.logging.json = v;
    }

    // ── Selection ───────────────────────────────────────────────────
    if let Some(v) = read_env_f64("RELAY_MIN_CONFIDENCE", 0.0, 1.0) {
        settings.selection.min_confidence = v;
    }
    if let Some(v) = read_env_f64("RELAY_SATISFIED_BONUS", 0.0, 1.0) {
        settings.selection.satisfied_bonus = v;
    }

    // ── Resolution ──────────────────────────────────────────────────
    if let Some(v) = read_env_usize("RELAY_MAX_DEPTH", 1, 1024) {
        settings.resolution.max_depth = v;
    }
    if let Some(v) = read_env_u64("RELAY_FALLBACK_RETRIES", 0, 64) {
        settings.resolution.fallback_retries = v as u32;
    }

    // ── Execution ───────────────────────────────────────────────────
    if let Some(v) = read_env_usize("RELAY_CHUNK_BUFFER", 1, 65_536) {
        settings.execution.chunk_buffer = v;
    }
    if let Some(v) = read_env_u64("RELAY_AGENT_TIMEOUT_MS", 1, 86_400_000) {
        settings.execution.agent_timeout_ms = v;
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("RELAY_STRATEGY") {
        match v.parse() {
            Ok(strategy) => settings.session.default_strategy = strategy,
            Err(e) => tracing::warn!(
                key = "RELAY_STRATEGY",
                value = %v,
                error = %e,
                "invalid strategy env var, ignoring"
            ),
        }
    }
}

/// Reject settings the engine cannot run with.
pub fn validate(settings: &RelaySettings) -> Result<()> {
    let unit = 0.0..=1.0;
    if !unit.contains(&settings.selection.min_confidence) {
        return Err(SettingsError::InvalidValue(format!(
            "selection.minConfidence must be within [0, 1], got {}",
            settings.selection.min_confidence
        )));
    }
    if !unit.contains(&settings.selection.satisfied_bonus) {
        return Err(SettingsError::InvalidValue(format!(
            "selection.satisfiedBonus must be within [0, 1], got {}",
            settings.selection.satisfied_bonus
        )));
    }
    if settings.resolution.max_depth == 0 {
        return Err(SettingsError::InvalidValue(
            "resolution.maxDepth must be at least 1".into(),
        ));
    }
    if settings.execution.chunk_buffer == 0 {
        return Err(SettingsError::InvalidValue(
            "execution.chunkBuffer must be at least 1".into(),
        ));
    }
    if settings.execution.agent_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "execution.agentTimeoutMs must be at least 1".into(),
        ));
    }
    Ok(())
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

/// Parse a string as a finite `f64` within a range.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.trim().parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
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

fn read_env_f64(name: &str, min: f64, max: f64) -> Option<f64> {
    let val = std::env::var(name).ok()?;
    let result = parse_f64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid float env var, ignoring");
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
