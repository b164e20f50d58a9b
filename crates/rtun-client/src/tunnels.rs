//! Tunnel bindings: which local service backs which server-assigned URL.
//!
//! The control session registers a binding when it requests a tunnel and
//! fills in the URL when `NewTunnel` arrives. Proxy sessions only read the
//! table, to map a `StartProxy` URL back to a local port.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use rtun_core::Protocol;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelBinding {
    pub protocol: Protocol,
    pub hostname: String,
    pub subdomain: String,
    pub http_auth: String,
    pub local_port: u16,
    /// Id sent in the `ReqTunnel` that created this binding.
    pub req_id: String,
    /// Public URL, once the server has confirmed the tunnel.
    pub assigned_url: Option<String>,
}

/// Outcome of [`TunnelTable::assign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Bound,
    /// No tunnel was requested for this protocol.
    NotRequested,
    /// The binding already has a URL; it is kept.
    AlreadyBound(String),
}

#[derive(Debug, Default)]
pub struct TunnelTable {
    inner: RwLock<HashMap<Protocol, TunnelBinding>>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a requested (not yet assigned) tunnel.
    pub fn register(&self, binding: TunnelBinding) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.insert(binding.protocol, binding);
    }

    /// Bind the server-assigned URL. A URL is set at most once per binding.
    pub fn assign(&self, protocol: Protocol, url: &str) -> Assignment {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.get_mut(&protocol) {
            None => Assignment::NotRequested,
            Some(binding) => match &binding.assigned_url {
                Some(existing) => Assignment::AlreadyBound(existing.clone()),
                None => {
                    binding.assigned_url = Some(url.to_string());
                    Assignment::Bound
                }
            },
        }
    }

    pub fn get(&self, protocol: Protocol) -> Option<TunnelBinding> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.get(&protocol).cloned()
    }

    pub fn assigned_url(&self, protocol: Protocol) -> Option<String> {
        self.get(protocol).and_then(|b| b.assigned_url)
    }

    /// Find the binding whose assigned URL is exactly `url`.
    pub fn resolve(&self, url: &str) -> Option<TunnelBinding> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        [Protocol::Http, Protocol::Https]
            .iter()
            .filter_map(|p| inner.get(p))
            .find(|b| b.assigned_url.as_deref() == Some(url))
            .cloned()
    }

    /// All bindings, HTTP first.
    pub fn snapshot(&self) -> Vec<TunnelBinding> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        [Protocol::Http, Protocol::Https]
            .iter()
            .filter_map(|p| inner.get(p).cloned())
            .collect()
    }
}
