//! Error type for session spawning and RPC dispatch.

use std::time::Duration;

/// Errors surfaced by the session layer. The HTTP bridge is the only place
/// these are translated to status codes.
#[derive(Debug, thiserror::Error)]
pub enum CodexError {
    /// The caller supplied an empty client key.
    #[error("missing client key")]
    MissingKey,

    /// Admitting a new session would exceed the concurrency cap.
    #[error("max sessions reached")]
    MaxSessions,

    /// The codex app-server process is not running (never started, exited,
    /// or a send raced with its death).
    #[error("codex app-server process is not running")]
    NotRunning,

    /// A pending request outlived its deadline.
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),

    /// The child binary could not be started.
    #[error("failed to start `{bin} app-server`: {source}")]
    Spawn {
        /// Configured child binary path.
        bin: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing the request line to the child's stdin failed. The session is
    /// marked dead when this happens.
    #[error("failed to write to codex app-server stdin: {0}")]
    Stdin(#[source] std::io::Error),

    /// The rpc payload could not be serialized to a line.
    #[error("failed to serialize rpc payload: {0}")]
    Serialize(#[from] serde_json::Error),
}
