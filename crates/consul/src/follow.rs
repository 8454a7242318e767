//! A control plane client that tracks the discovery watcher.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use metrics::counter;
use tracing::info;

use tether_core::{CatalogEntry, Credential, CredentialRequest};

use crate::discovery::{ServerSnapshot, Watcher};
use crate::{ControlPlane, ControlPlaneError};

/// Builds a control plane client for a discovered server.
pub type Connector = Box<dyn Fn(&ServerSnapshot) -> Result<Arc<dyn ControlPlane>, ControlPlaneError> + Send + Sync>;

struct Bound {
    snapshot: Arc<ServerSnapshot>,
    client: Arc<dyn ControlPlane>,
}

/// Forwards every call to a client for the watcher's current server,
/// reconnecting when the watcher publishes a different one.
pub struct FollowingControlPlane {
    watcher: Watcher,
    connect: Connector,
    bound: ArcSwapOption<Bound>,
}

impl FollowingControlPlane {
    pub fn new(watcher: Watcher, connect: Connector) -> Self {
        Self { watcher, connect, bound: ArcSwapOption::empty() }
    }

    pub fn watcher(&self) -> &Watcher { &self.watcher }

    fn client(&self) -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
        let snapshot = self
            .watcher
            .current()
            .ok_or_else(|| ControlPlaneError::Setup("no healthy control plane server discovered".into()))?;
        if let Some(bound) = self.bound.load_full() {
            if bound.snapshot == snapshot {
                return Ok(Arc::clone(&bound.client));
            }
        }
        let client = (self.connect)(&snapshot)?;
        info!(server = %snapshot.address, "control plane client bound");
        counter!("control_plane_reconnects_total", 1u64);
        self.bound.store(Some(Arc::new(Bound { snapshot, client: Arc::clone(&client) })));
        Ok(client)
    }

    /// Cancel discovery and wait for its task to exit.
    pub async fn stop(self) { self.watcher.stop().await }
}

#[async_trait::async_trait]
impl ControlPlane for FollowingControlPlane {
    async fn register(&self, entry: &CatalogEntry) -> Result<(), ControlPlaneError> {
        self.client()?.register(entry).await
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, ControlPlaneError> {
        self.client()?.list_credentials().await
    }

    async fn create_credential(&self, req: &CredentialRequest) -> Result<Credential, ControlPlaneError> {
        self.client()?.create_credential(req).await
    }

    async fn read_credential(&self, accessor_id: &str) -> Result<Credential, ControlPlaneError> {
        self.client()?.read_credential(accessor_id).await
    }

    async fn delete_credential(&self, accessor_id: &str) -> Result<(), ControlPlaneError> {
        self.client()?.delete_credential(accessor_id).await
    }
}
