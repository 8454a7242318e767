use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use metrics::histogram;
use tracing::{debug, warn};

use tether_core::WorkloadInstance;

use crate::{family_from_meta, instance_from_meta, InstanceMetadata, InstancePage, Inventory, SecretStore, MESH_TAG_KEY, MESH_TAG_VALUE};

/// Data key holding the record inside the Secret.
pub const RECORD_KEY: &str = "record";
const FIELD_MANAGER: &str = "tether";
const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
const REGION_LABEL: &str = "topology.kubernetes.io/region";

/// Mesh-tagged pods, listed a page at a time.
pub struct KubeInventory {
    pods: Api<Pod>,
    page_size: u32,
}

impl KubeInventory {
    /// `namespace = None` lists across all namespaces.
    pub fn new(client: Client, namespace: Option<&str>, page_size: u32) -> Self {
        let pods = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self { pods, page_size: page_size.max(1) }
    }
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(pod.status.as_ref().and_then(|s| s.phase.as_deref()), Some("Succeeded") | Some("Failed"))
}

#[async_trait::async_trait]
impl Inventory for KubeInventory {
    async fn list_instances(&self, cursor: Option<String>) -> Result<InstancePage> {
        let started = Instant::now();
        let mut lp = ListParams::default()
            .labels(&format!("{}={}", MESH_TAG_KEY, MESH_TAG_VALUE))
            .limit(self.page_size);
        if let Some(tok) = cursor.as_deref() {
            lp = lp.continue_token(tok);
        }
        let list = self.pods.list(&lp).await.context("listing pods")?;
        histogram!("inventory_page_ms", started.elapsed().as_secs_f64() * 1000.0);
        let next_cursor = list.metadata.continue_.filter(|c| !c.is_empty());
        let instances = list
            .items
            .iter()
            .filter(|p| !is_terminal(p))
            .map(|p| instance_from_meta(&p.metadata))
            .collect::<Vec<_>>();
        debug!(count = instances.len(), more = next_cursor.is_some(), "inventory page");
        Ok(InstancePage { instances, next_cursor })
    }
}

/// Secrets in one namespace, one record per Secret under [`RECORD_KEY`].
pub struct KubeSecretStore {
    secrets: Api<Secret>,
    namespace: String,
}

impl KubeSecretStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { secrets: Api::namespaced(client, namespace), namespace: namespace.to_string() }
    }
}

#[async_trait::async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let secret = self
            .secrets
            .get_opt(name)
            .await
            .with_context(|| format!("reading secret {}/{}", self.namespace, name))?;
        Ok(secret.map(|s| {
            s.data
                .and_then(|mut d| d.remove(RECORD_KEY))
                .map(|b| b.0)
                .unwrap_or_default()
        }))
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<()> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string());
        let mut data = BTreeMap::new();
        data.insert(RECORD_KEY.to_string(), ByteString(value.to_vec()));
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.secrets
            .patch(name, &pp, &Patch::Apply(&secret))
            .await
            .with_context(|| format!("writing secret {}/{}", self.namespace, name))?;
        Ok(())
    }
}

/// Metadata of the pod this process runs in, plus its node's topology labels.
pub struct KubeInstanceMetadata {
    client: Client,
    cluster: String,
    pod_name: String,
    namespace: String,
}

impl KubeInstanceMetadata {
    pub fn new(client: Client, cluster: &str, namespace: &str, pod_name: &str) -> Self {
        Self { client, cluster: cluster.to_string(), pod_name: pod_name.to_string(), namespace: namespace.to_string() }
    }

    /// Pod identity from the downward API (`POD_NAME`, `POD_NAMESPACE`).
    pub fn from_env(client: Client, cluster: &str) -> Result<Self> {
        let pod_name = std::env::var("POD_NAME").map_err(|_| anyhow!("POD_NAME is not set"))?;
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
        Ok(Self::new(client, cluster, &namespace, &pod_name))
    }

    async fn topology(&self, node_name: &str) -> (Option<String>, Option<String>) {
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.get(node_name).await {
            Ok(node) => {
                let labels = node.metadata.labels.unwrap_or_default();
                (labels.get(ZONE_LABEL).cloned(), labels.get(REGION_LABEL).cloned())
            }
            Err(e) => {
                warn!(node = %node_name, error = %e, "node topology unavailable");
                (None, None)
            }
        }
    }
}

#[async_trait::async_trait]
impl InstanceMetadata for KubeInstanceMetadata {
    async fn fetch(&self) -> Result<WorkloadInstance> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pod = pods
            .get(&self.pod_name)
            .await
            .with_context(|| format!("reading pod {}/{}", self.namespace, self.pod_name))?;
        let family = family_from_meta(&pod.metadata)
            .ok_or_else(|| anyhow!("pod {}/{} has no workload family", self.namespace, self.pod_name))?;
        let status = pod.status.unwrap_or_default();
        let node_address = status
            .pod_ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| anyhow!("pod {}/{} has no IP yet", self.namespace, self.pod_name))?;
        let (zone, region) = match pod.spec.and_then(|s| s.node_name) {
            Some(node) => self.topology(&node).await,
            None => (None, None),
        };
        Ok(WorkloadInstance {
            instance_id: self.pod_name.clone(),
            family,
            cluster: self.cluster.clone(),
            node_address,
            zone,
            region,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    #[test]
    fn terminal_phases_are_skipped() {
        let mut pod = Pod::default();
        assert!(!is_terminal(&pod));
        pod.status = Some(PodStatus { phase: Some("Succeeded".into()), ..Default::default() });
        assert!(is_terminal(&pod));
        pod.status = Some(PodStatus { phase: Some("Running".into()), ..Default::default() });
        assert!(!is_terminal(&pod));
    }
}
