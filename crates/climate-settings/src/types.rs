//! Settings structs with compiled defaults.

use serde::{Deserialize, Serialize};

/// Server settings.
///
/// Field names match the config file keys (`snake_case` JSON).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Path to the codex binary.
    pub codex_bin: String,
    /// Loopback listener address.
    pub bind_ip: String,
    /// Port for both the loopback and tailnet listeners.
    pub port: u16,
    /// Tailnet pre-auth key; non-empty enables the tailnet listener.
    pub ts_auth_key: String,
    /// Hostname advertised to the tailnet.
    pub ts_hostname: String,
    /// Tailnet node state directory (`~` expands to the user's home).
    pub ts_state_dir: String,
    /// Concurrency cap over live codex sessions.
    pub max_sessions: usize,
    /// Idle session eviction TTL, in seconds.
    pub idle_ttl_secs: u64,
    /// Per-client event replay window.
    pub ring_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            codex_bin: "codex".into(),
            bind_ip: "127.0.0.1".into(),
            port: 4500,
            ts_auth_key: String::new(),
            ts_hostname: "climate-server".into(),
            ts_state_dir: "~/.climate/tsnet".into(),
            max_sessions: 16,
            idle_ttl_secs: 600,
            ring_capacity: 1024,
        }
    }
}

impl Settings {
    /// Whether the tailnet listener is enabled.
    pub fn tailnet_enabled(&self) -> bool {
        !self.ts_auth_key.trim().is_empty()
    }
}
