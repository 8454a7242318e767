//! tether kubehub: the cluster side of both flows.
//!
//! Three collaborators, each a trait with a Kubernetes binding and a mock:
//! [`Inventory`] pages through running instances, [`SecretStore`] holds one
//! opaque blob per name, [`InstanceMetadata`] describes the pod we run in.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::Result;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use tether_core::{WorkloadFamily, WorkloadInstance};

mod kube_impl;
mod mock;

pub use kube_impl::{KubeInstanceMetadata, KubeInventory, KubeSecretStore};
pub use mock::{MockInventory, MockSecretStore, StaticMetadata};

/// Tag marking an instance as a mesh participant.
pub const MESH_TAG_KEY: &str = "tether.io/mesh";
pub const MESH_TAG_VALUE: &str = "true";
/// Explicit family override on a pod.
pub const FAMILY_LABEL: &str = "tether.io/family";
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// One running instance as seen by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterInstance {
    /// `namespace/name`.
    pub id: String,
    /// `None` when the family cannot be derived.
    pub family: Option<WorkloadFamily>,
    pub tags: BTreeMap<String, String>,
}

impl ClusterInstance {
    pub fn is_mesh_tagged(&self) -> bool {
        self.tags.get(MESH_TAG_KEY).map(|v| v == MESH_TAG_VALUE).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancePage {
    pub instances: Vec<ClusterInstance>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

#[async_trait::async_trait]
pub trait Inventory: Send + Sync {
    async fn list_instances(&self, cursor: Option<String>) -> Result<InstancePage>;
}

#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when the secret does not exist.
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite.
    async fn put(&self, name: &str, value: &[u8]) -> Result<()>;
}

#[async_trait::async_trait]
pub trait InstanceMetadata: Send + Sync {
    async fn fetch(&self) -> Result<WorkloadInstance>;
}

/// Family of a pod: the explicit label, else its controlling owner. Pods of a
/// Deployment are owned by a ReplicaSet named `{deployment}-{hash}`; the hash
/// suffix is dropped so every revision maps to the same family.
pub fn family_from_meta(meta: &ObjectMeta) -> Option<WorkloadFamily> {
    let labels = meta.labels.as_ref();
    if let Some(f) = labels.and_then(|l| l.get(FAMILY_LABEL)).filter(|f| !f.is_empty()) {
        return Some(WorkloadFamily::new(f.clone()));
    }
    let owner = meta
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller.unwrap_or(false))?;
    if owner.kind != "ReplicaSet" {
        return Some(WorkloadFamily::new(owner.name.clone()));
    }
    let hash = labels.and_then(|l| l.get(POD_TEMPLATE_HASH_LABEL));
    let name = match hash {
        Some(h) => owner.name.strip_suffix(&format!("-{}", h)).unwrap_or(&owner.name),
        None => owner.name.rsplit_once('-').map(|(head, _)| head).unwrap_or(&owner.name),
    };
    Some(WorkloadFamily::new(name))
}

/// Inventory view of a pod.
pub fn instance_from_meta(meta: &ObjectMeta) -> ClusterInstance {
    ClusterInstance {
        id: format!("{}/{}", meta.namespace.as_deref().unwrap_or(""), meta.name.as_deref().unwrap_or("")),
        family: family_from_meta(meta),
        tags: meta.labels.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference { kind: kind.into(), name: name.into(), controller: Some(true), ..Default::default() }
    }

    fn meta(labels: &[(&str, &str)], owners: Vec<OwnerReference>) -> ObjectMeta {
        ObjectMeta {
            name: Some("web-5d8f7-x2x9q".into()),
            namespace: Some("shop".into()),
            labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            owner_references: Some(owners),
            ..Default::default()
        }
    }

    #[test]
    fn label_overrides_owner() {
        let m = meta(&[(FAMILY_LABEL, "checkout")], vec![owner("ReplicaSet", "web-5d8f7")]);
        assert_eq!(family_from_meta(&m), Some(WorkloadFamily::new("checkout")));
    }

    #[test]
    fn replicaset_hash_is_stripped() {
        let m = meta(&[(POD_TEMPLATE_HASH_LABEL, "5d8f7")], vec![owner("ReplicaSet", "web-api-5d8f7")]);
        assert_eq!(family_from_meta(&m), Some(WorkloadFamily::new("web-api")));
        let m = meta(&[], vec![owner("ReplicaSet", "web-api-5d8f7")]);
        assert_eq!(family_from_meta(&m), Some(WorkloadFamily::new("web-api")));
    }

    #[test]
    fn statefulset_owner_is_used_verbatim() {
        let m = meta(&[], vec![owner("StatefulSet", "db")]);
        assert_eq!(family_from_meta(&m), Some(WorkloadFamily::new("db")));
    }

    #[test]
    fn unowned_pod_has_no_family() {
        let mut o = owner("ReplicaSet", "web-1");
        o.controller = None;
        assert_eq!(family_from_meta(&meta(&[], vec![o])), None);
        let bare = ObjectMeta { name: Some("x".into()), ..Default::default() };
        assert_eq!(family_from_meta(&bare), None);
    }

    #[test]
    fn instance_carries_tags() {
        let inst = instance_from_meta(&meta(&[(MESH_TAG_KEY, "true")], vec![owner("StatefulSet", "db")]));
        assert_eq!(inst.id, "shop/web-5d8f7-x2x9q");
        assert!(inst.is_mesh_tagged());
    }
}
