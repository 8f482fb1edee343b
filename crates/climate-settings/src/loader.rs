//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the config file exists, deep-merge its values over defaults
//! 3. Apply `CLIMATE_*` environment variable overrides
//!
//! Flags in the binary override the loaded result per field.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::SettingsError;
use crate::types::Settings;

/// Default config file path (`~/.climate/config.json`).
pub fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".climate").join("config.json")
}

/// Load settings from the default path with env overrides.
pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from_path(&config_path())
}

/// Load settings from a specific path with env overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.ts_state_dir = expand_home(&settings.ts_state_dir);
    Ok(settings)
}

/// Recursive deep merge: objects merge per key, everything else is replaced
/// by the source, null source values preserve the target.
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

/// Apply `CLIMATE_*` environment overrides. Invalid values are ignored with
/// a warning, falling back to the file/default value.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = read_env_string("CLIMATE_CODEX_BIN") {
        settings.codex_bin = v;
    }
    if let Some(v) = read_env_string("CLIMATE_BIND_IP") {
        settings.bind_ip = v;
    }
    if let Some(v) = read_env_u16("CLIMATE_PORT") {
        settings.port = v;
    }
    if let Some(v) = read_env_string("CLIMATE_TS_AUTH_KEY") {
        settings.ts_auth_key = v;
    }
    if let Some(v) = read_env_string("CLIMATE_TS_HOSTNAME") {
        settings.ts_hostname = v;
    }
    if let Some(v) = read_env_string("CLIMATE_TS_STATE_DIR") {
        settings.ts_state_dir = v;
    }
}

/// Expand a leading `~`/`~/` to the invoking user's home directory.
pub fn expand_home(path: &str) -> String {
    let path = path.trim();
    if path != "~" && !path.starts_with("~/") {
        return path.to_owned();
    }
    let Ok(home) = std::env::var("HOME") else {
        return path.to_owned();
    };
    if home.is_empty() {
        return path.to_owned();
    }
    if path == "~" {
        return home;
    }
    format!("{}/{}", home.trim_end_matches('/'), &path[2..])
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let parsed = val.parse().ok();
    if parsed.is_none() {
        tracing::warn!(key = name, value = %val, "invalid port env var, ignoring");
    }
    parsed
}
