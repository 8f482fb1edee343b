//! # climate-settings
//!
//! Server configuration: compiled defaults, deep-merged JSON config file,
//! `CLIMATE_*` environment overrides. Command-line flags (applied by the
//! binary) take precedence over everything here.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::SettingsError;
pub use loader::{config_path, load_settings, load_settings_from_path};
pub use types::Settings;
