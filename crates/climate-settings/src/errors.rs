//! Settings error type.

/// Errors from loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The config file exists but could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file or merged settings did not parse.
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}
