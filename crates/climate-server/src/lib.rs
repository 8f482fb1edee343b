//! # climate-server
//!
//! The HTTP bridge in front of per-client codex sessions.
//!
//! Three routes carry the whole protocol: `GET /healthz`, `POST /rpc`
//! (JSON-RPC passthrough to the client's child process), and `GET /events`
//! (a resumable SSE stream of the client's hub). The same router is served
//! on the loopback listener and on the tailnet listener; only the identity
//! provider differs per listener, which is what keeps tailnet identity
//! whois-derived and immune to client-supplied headers.

#![deny(unsafe_code)]

pub mod error;
pub mod identity;
pub mod metrics;
pub mod server;
pub mod supervisor;

pub use error::error_response;
pub use identity::{HeaderIdentity, IdentityError, IdentityProvider, StaticIdentity, TailnetIdentity};
pub use server::{router, AppState};
