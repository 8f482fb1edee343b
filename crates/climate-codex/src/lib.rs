//! # climate-codex
//!
//! Child-process sessions for `codex app-server` — one per authenticated
//! client, at most one live at a time.
//!
//! A [`Session`] owns the child's stdin write path, demultiplexes its
//! line-delimited stdout into responses for pending requests and into hub
//! events, and transitions to dead exactly once when the child exits. The
//! [`SessionManager`] maps client keys to `(hub, session)` entries, spawns
//! sessions lazily, enforces a global admission cap, and sweeps idle
//! sessions in the background.

#![deny(unsafe_code)]

pub mod errors;
pub mod manager;
pub mod session;

pub use errors::CodexError;
pub use manager::{ManagerConfig, SessionManager, SessionSnapshot};
pub use session::{Session, RPC_ACK, STDOUT_EVENT_KIND};
