//! tether control-plane access: catalog registration, ACL credentials and
//! server discovery.
//!
//! Callers depend on the [`ControlPlane`] trait; [`HttpControlPlane`] talks to
//! a Consul-compatible HTTP API and [`MockControlPlane`] keeps state in memory
//! for tests.

#![forbid(unsafe_code)]

use tether_core::{CatalogEntry, Credential, CredentialRequest};

pub mod discovery;
mod follow;
mod http;
mod mock;

pub use discovery::{
    DiscoveryError, DiscoverySettings, LoginParams, MockProbe, ServerProbe, ServerSnapshot, Watcher,
};
pub use follow::{Connector, FollowingControlPlane};
pub use http::{ClientSettings, HttpControlPlane, HttpServerProbe};
pub use mock::MockControlPlane;

/// Body fragment the control plane returns for a missing ACL token.
const ACL_NOT_FOUND: &str = "ACL not found";

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    /// The addressed object does not exist. An expected control condition,
    /// not a fault.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unexpected response code: {status} ({body})")]
    Status { status: u16, body: String },
    #[error("request to {url} failed: {source}")]
    Transport { url: String, #[source] source: reqwest::Error },
    #[error("decoding response from {url}: {source}")]
    Decode { url: String, #[source] source: reqwest::Error },
    #[error("client setup: {0}")]
    Setup(String),
}

impl ControlPlaneError {
    pub fn is_not_found(&self) -> bool { matches!(self, ControlPlaneError::NotFound(_)) }

    /// Translate a non-success response. This is the only place response
    /// bodies are inspected: the token endpoints answer a missing accessor
    /// with `403 ACL not found` rather than a 404.
    pub fn from_response(status: u16, body: &str, what: &str) -> Self {
        let body = body.trim();
        if status == 404 || (status == 403 && body.contains(ACL_NOT_FOUND)) {
            return ControlPlaneError::NotFound(what.to_string());
        }
        ControlPlaneError::Status { status, body: body.to_string() }
    }
}

/// Catalog and ACL operations consumed by the bootstrap and controller flows.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    /// Idempotent upsert keyed by the entry's service id.
    async fn register(&self, entry: &CatalogEntry) -> Result<(), ControlPlaneError>;

    async fn list_credentials(&self) -> Result<Vec<Credential>, ControlPlaneError>;

    async fn create_credential(&self, req: &CredentialRequest) -> Result<Credential, ControlPlaneError>;

    /// `Err(NotFound)` when no credential has this accessor.
    async fn read_credential(&self, accessor_id: &str) -> Result<Credential, ControlPlaneError>;

    async fn delete_credential(&self, accessor_id: &str) -> Result<(), ControlPlaneError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_not_found_is_typed() {
        let e = ControlPlaneError::from_response(403, "ACL not found\n", "token abc");
        assert!(e.is_not_found());
        assert_eq!(e.to_string(), "not found: token abc");
    }

    #[test]
    fn plain_404_is_not_found() {
        assert!(ControlPlaneError::from_response(404, "", "x").is_not_found());
    }

    #[test]
    fn permission_denied_is_not_not_found() {
        let e = ControlPlaneError::from_response(403, "Permission denied", "x");
        assert!(!e.is_not_found());
        assert_eq!(e.to_string(), "unexpected response code: 403 (Permission denied)");
        assert!(!ControlPlaneError::from_response(500, "ACL not found", "x").is_not_found());
    }
}
