//! Per-listener client identity.
//!
//! Which provider a listener uses is decided at construction and never
//! globally: the loopback listener trusts the `X-Client-ID` header (with a
//! remote-address fallback), the tailnet listener asks the tailnet who the
//! peer is and ignores request headers entirely.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use climate_tailnet::{PeerResolver, TailnetError};

/// Default header carrying the client id on the loopback listener.
pub const CLIENT_ID_HEADER: &str = "X-Client-ID";

/// Identity resolution failures; the bridge maps every one to 401.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// No usable identity in the request.
    #[error("missing client identity")]
    Missing,

    /// The tailnet could not identify the peer.
    #[error("tailnet whois failed: {0}")]
    Whois(#[from] TailnetError),
}

/// Extracts a stable per-client key from an HTTP request.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve the client key for a request.
    async fn client_key(
        &self,
        remote_addr: SocketAddr,
        headers: &HeaderMap,
    ) -> Result<String, IdentityError>;
}

/// Fixed key, for tests and single-tenant setups.
pub struct StaticIdentity {
    /// The key handed to every request.
    pub key: String,
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn client_key(
        &self,
        _remote_addr: SocketAddr,
        _headers: &HeaderMap,
    ) -> Result<String, IdentityError> {
        let key = self.key.trim();
        if key.is_empty() {
            return Err(IdentityError::Missing);
        }
        Ok(key.to_owned())
    }
}

/// Header-based identity with a remote-address fallback.
pub struct HeaderIdentity {
    /// Header to read; empty means [`CLIENT_ID_HEADER`].
    pub header_name: String,
}

impl Default for HeaderIdentity {
    fn default() -> Self {
        Self {
            header_name: CLIENT_ID_HEADER.to_owned(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HeaderIdentity {
    async fn client_key(
        &self,
        remote_addr: SocketAddr,
        headers: &HeaderMap,
    ) -> Result<String, IdentityError> {
        let name = match self.header_name.trim() {
            "" => CLIENT_ID_HEADER,
            name => name,
        };
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Ok(value.to_owned());
            }
        }

        // Best-effort fallback: stable per-source address (drops the port).
        Ok(remote_addr.ip().to_string())
    }
}

/// Whois-backed identity for the tailnet listener.
pub struct TailnetIdentity {
    resolver: Arc<dyn PeerResolver>,
}

impl TailnetIdentity {
    /// Build from any peer resolver.
    pub fn new(resolver: Arc<dyn PeerResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl IdentityProvider for TailnetIdentity {
    async fn client_key(
        &self,
        remote_addr: SocketAddr,
        _headers: &HeaderMap,
    ) -> Result<String, IdentityError> {
        let peer = self.resolver.whois(&remote_addr.to_string()).await?;
        if !peer.stable_id.is_empty() {
            return Ok(peer.stable_id);
        }
        Ok(peer.node_id.to_string())
    }
}
