//! Client identity for rate limiting.
//!
//! Which request headers can be trusted to carry the real client address
//! depends on the proxy or edge runtime in front of the service, so the
//! resolver is pluggable. [`TrustedHeaderIdentity`] is the default.

use anyhow::{Context, Result};
use axum::http::{HeaderMap, HeaderName};
use std::net::SocketAddr;

pub trait IdentityResolver: Send + Sync {
    /// Identity to count the request under, or `None` when the client
    /// cannot be identified.
    fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String>;
}

/// First comma-separated entry of the first configured header that is
/// present and non-empty, falling back to the peer IP address.
#[derive(Debug, Clone)]
pub struct TrustedHeaderIdentity {
    headers: Vec<HeaderName>,
}

impl TrustedHeaderIdentity {
    pub fn new<I, S>(headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let headers = headers
            .into_iter()
            .map(|h| {
                let name = h.as_ref().trim().to_ascii_lowercase();
                HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("Invalid identity header name: '{}'", h.as_ref()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { headers })
    }

    /// Only the transport peer address; ignores all headers.
    pub fn peer_only() -> Self {
        Self {
            headers: Vec::new(),
        }
    }
}

impl IdentityResolver for TrustedHeaderIdentity {
    fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
        self.headers
            .iter()
            .filter_map(|name| headers.get(name))
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(',').next())
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
    }
}
