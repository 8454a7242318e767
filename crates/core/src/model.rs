//! Domain and wire types.
//!
//! Catalog and ACL types serialize with the control plane's field names
//! (`ID`, `CheckID`, `TaggedAddresses`, ...), so they can be sent as-is.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Node meta key marking catalog nodes that stand for a whole cluster.
pub const SYNTHETIC_NODE_META: &str = "synthetic-node";
pub const TAGGED_ADDRESS_LAN: &str = "lan";
pub const TAGGED_ADDRESS_WAN: &str = "wan";
pub const HEALTH_CRITICAL: &str = "critical";
pub const HEALTH_PASSING: &str = "passing";

// ---------------- Workload identity ----------------

/// Name shared by every instance of one deployment definition.
/// Credentials are issued per family, never per instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadFamily(String);

impl WorkloadFamily {
    pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Secret store key holding this family's [`SecretRecord`].
    pub fn secret_name(&self, prefix: &str) -> String { format!("{}-{}", prefix, self.0) }
}

impl fmt::Display for WorkloadFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for WorkloadFamily {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for WorkloadFamily {
    fn from(s: String) -> Self { Self(s) }
}

/// Snapshot of the instance this process runs in. Read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadInstance {
    pub instance_id: String,
    pub family: WorkloadFamily,
    /// Cluster identifier; also the synthetic catalog node name.
    pub cluster: String,
    pub node_address: String,
    pub zone: Option<String>,
    pub region: Option<String>,
}

impl WorkloadInstance {
    /// Locality is only emitted when a region is known.
    pub fn locality(&self) -> Option<Locality> {
        let region = self.region.as_deref().filter(|r| !r.is_empty())?;
        Some(Locality {
            region: region.to_string(),
            zone: self.zone.clone().unwrap_or_default(),
        })
    }
}

// ---------------- Catalog ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceKind {
    #[default]
    #[serde(rename = "")]
    Typical,
    #[serde(rename = "connect-proxy")]
    ConnectProxy,
    #[serde(rename = "mesh-gateway")]
    MeshGateway,
    #[serde(rename = "terminating-gateway")]
    TerminatingGateway,
    #[serde(rename = "api-gateway")]
    ApiGateway,
}

impl ServiceKind {
    pub fn is_typical(&self) -> bool { matches!(self, ServiceKind::Typical) }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Typical => "",
            ServiceKind::ConnectProxy => "connect-proxy",
            ServiceKind::MeshGateway => "mesh-gateway",
            ServiceKind::TerminatingGateway => "terminating-gateway",
            ServiceKind::ApiGateway => "api-gateway",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Locality {
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceAddress {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Weights {
    pub passing: i32,
    pub warning: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeshGatewayConfig {
    #[serde(default)]
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Upstream {
    #[serde(default)]
    pub destination_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_partition: String,
    pub destination_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub datacenter: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_bind_address: String,
    pub local_bind_port: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_gateway: Option<MeshGatewayConfig>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyConfig {
    pub destination_service_name: String,
    #[serde(rename = "DestinationServiceID")]
    pub destination_service_id: String,
    pub local_service_port: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_gateway: Option<MeshGatewayConfig>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(default, skip_serializing_if = "ServiceKind::is_typical")]
    pub kind: ServiceKind,
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    pub port: u16,
    pub address: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tagged_addresses: BTreeMap<String, ServiceAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Weights>,
    #[serde(default)]
    pub enable_tag_override: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<Locality>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheckDefinition {
    #[serde(rename = "HTTP", default, skip_serializing_if = "String::is_empty")]
    pub http: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(rename = "TLSServerName", default, skip_serializing_if = "String::is_empty")]
    pub tls_server_name: String,
    #[serde(rename = "TLSSkipVerify", default)]
    pub tls_skip_verify: bool,
    #[serde(rename = "TCP", default, skip_serializing_if = "String::is_empty")]
    pub tcp: String,
    #[serde(rename = "GRPC", default, skip_serializing_if = "String::is_empty")]
    pub grpc: String,
    #[serde(rename = "GRPCUseTLS", default)]
    pub grpc_use_tls: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
}

/// Catalog-level health check attached to a registration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    pub service_name: String,
    #[serde(rename = "Type", default, skip_serializing_if = "String::is_empty")]
    pub check_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub definition: HealthCheckDefinition,
}

/// Wire-level registration: one synthetic node hosting one service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogEntry {
    pub node: String,
    pub node_meta: BTreeMap<String, String>,
    pub address: String,
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partition: String,
    pub skip_node_update: bool,
}

impl CatalogEntry {
    /// Wrap a service under the instance's synthetic node. Node name and node
    /// address come only from the instance, so every entry of one instance
    /// lands on the same logical node.
    pub fn for_instance(service: AgentService, checks: Vec<HealthCheck>, instance: &WorkloadInstance) -> Self {
        let mut node_meta = BTreeMap::new();
        node_meta.insert(SYNTHETIC_NODE_META.to_string(), "true".to_string());
        Self {
            node: instance.cluster.clone(),
            node_meta,
            address: instance.node_address.clone(),
            partition: service.partition.clone(),
            service,
            checks,
            skip_node_update: true,
        }
    }
}

/// Desired registrations for one instance, before they are wrapped into
/// catalog entries. A workload registers itself plus its sidecar proxy; a
/// gateway registers only itself.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationIntent {
    Workload {
        service: AgentService,
        service_checks: Vec<HealthCheck>,
        proxy: AgentService,
        proxy_checks: Vec<HealthCheck>,
    },
    Gateway {
        gateway: AgentService,
        checks: Vec<HealthCheck>,
    },
}

impl RegistrationIntent {
    pub fn is_gateway(&self) -> bool { matches!(self, RegistrationIntent::Gateway { .. }) }

    /// The service entry (plain workloads only).
    pub fn service(&self) -> Option<&AgentService> {
        match self {
            RegistrationIntent::Workload { service, .. } => Some(service),
            RegistrationIntent::Gateway { .. } => None,
        }
    }

    /// The proxy-side entry: the sidecar proxy, or the gateway itself.
    pub fn proxy(&self) -> &AgentService {
        match self {
            RegistrationIntent::Workload { proxy, .. } => proxy,
            RegistrationIntent::Gateway { gateway, .. } => gateway,
        }
    }

    /// Split into `(service entry, proxy entry)`.
    pub fn into_entries(self, instance: &WorkloadInstance) -> (Option<CatalogEntry>, CatalogEntry) {
        match self {
            RegistrationIntent::Workload { service, service_checks, proxy, proxy_checks } => (
                Some(CatalogEntry::for_instance(service, service_checks, instance)),
                CatalogEntry::for_instance(proxy, proxy_checks, instance),
            ),
            RegistrationIntent::Gateway { gateway, checks } => {
                (None, CatalogEntry::for_instance(gateway, checks, instance))
            }
        }
    }
}

// ---------------- Credentials ----------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceIdentity {
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datacenters: Vec<String>,
}

/// Control-plane identity object. Created and deleted, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Credential {
    #[serde(rename = "AccessorID")]
    pub accessor_id: String,
    #[serde(rename = "SecretID", default)]
    pub secret_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub service_identities: Vec<ServiceIdentity>,
}

impl Credential {
    /// Family of a controller-owned credential: exactly one service identity.
    /// Credentials with zero or several identities are not ours to touch.
    pub fn owned_family(&self) -> Option<WorkloadFamily> {
        match self.service_identities.as_slice() {
            [only] => Some(WorkloadFamily::new(only.service_name.clone())),
            _ => None,
        }
    }
}

/// Body of a credential creation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CredentialRequest {
    pub description: String,
    pub service_identities: Vec<ServiceIdentity>,
}

impl CredentialRequest {
    /// Request scoped to exactly one service identity for `family`.
    pub fn for_family(family: &WorkloadFamily) -> Self {
        Self {
            description: format!("Token for {} service", family),
            service_identities: vec![ServiceIdentity { service_name: family.as_str().to_string(), datacenters: Vec::new() }],
        }
    }
}

/// Durable pointer from a family to its current credential, stored as JSON in
/// the secret store. `{}` is the canonical "no credential" value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecretRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub accessor_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

impl SecretRecord {
    pub fn empty() -> Self { Self::default() }

    pub fn for_credential(c: &Credential) -> Self {
        Self { accessor_id: c.accessor_id.clone(), token: c.secret_id.clone() }
    }

    pub fn is_empty(&self) -> bool { self.accessor_id.is_empty() && self.token.is_empty() }

    /// Blank input (no secret value yet) parses as the empty record.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::empty());
        }
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Two string fields; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(region: Option<&str>) -> WorkloadInstance {
        WorkloadInstance {
            instance_id: "web-7d9f8-abcde".into(),
            family: "web".into(),
            cluster: "prod-east".into(),
            node_address: "10.1.2.3".into(),
            zone: Some("us-east-1a".into()),
            region: region.map(|s| s.to_string()),
        }
    }

    #[test]
    fn locality_requires_region() {
        assert_eq!(instance(None).locality(), None);
        assert_eq!(instance(Some("")).locality(), None);
        let loc = instance(Some("us-east-1")).locality().expect("locality");
        assert_eq!(loc.region, "us-east-1");
        assert_eq!(loc.zone, "us-east-1a");
    }

    #[test]
    fn secret_name_joins_prefix_and_family() {
        assert_eq!(WorkloadFamily::new("web").secret_name("tether"), "tether-web");
    }

    #[test]
    fn empty_record_serializes_as_empty_object() {
        assert_eq!(SecretRecord::empty().to_bytes(), b"{}".to_vec());
        assert_eq!(SecretRecord::parse(b"{}").unwrap(), SecretRecord::empty());
        assert_eq!(SecretRecord::parse(b"").unwrap(), SecretRecord::empty());
        assert_eq!(SecretRecord::parse(b"  \n").unwrap(), SecretRecord::empty());
        assert!(SecretRecord::parse(b"{not json").is_err());
    }

    #[test]
    fn record_uses_snake_case_keys() {
        let r = SecretRecord { accessor_id: "a-1".into(), token: "s-1".into() };
        let v: serde_json::Value = serde_json::from_slice(&r.to_bytes()).unwrap();
        assert_eq!(v, serde_json::json!({"accessor_id": "a-1", "token": "s-1"}));
    }

    #[test]
    fn only_single_identity_credentials_are_owned() {
        let mut c = Credential { accessor_id: "a".into(), ..Default::default() };
        assert_eq!(c.owned_family(), None);
        c.service_identities.push(ServiceIdentity { service_name: "web".into(), datacenters: vec![] });
        assert_eq!(c.owned_family(), Some(WorkloadFamily::new("web")));
        c.service_identities.push(ServiceIdentity { service_name: "api".into(), datacenters: vec![] });
        assert_eq!(c.owned_family(), None);
    }

    #[test]
    fn credential_decodes_control_plane_fields() {
        let raw = r#"{"AccessorID":"acc","SecretID":"sec","Description":"d","ServiceIdentities":[{"ServiceName":"web"}],"Local":false}"#;
        let c: Credential = serde_json::from_str(raw).unwrap();
        assert_eq!(c.accessor_id, "acc");
        assert_eq!(c.secret_id, "sec");
        assert_eq!(c.owned_family().unwrap().as_str(), "web");
    }

    #[test]
    fn catalog_entry_uses_instance_node_identity() {
        let inst = instance(Some("us-east-1"));
        let svc = AgentService { id: "web-1".into(), service: "web".into(), address: "10.9.9.9".into(), partition: "p1".into(), ..Default::default() };
        let entry = CatalogEntry::for_instance(svc, vec![], &inst);
        assert_eq!(entry.node, "prod-east");
        assert_eq!(entry.address, "10.1.2.3");
        assert_eq!(entry.partition, "p1");
        assert!(entry.skip_node_update);
        assert_eq!(entry.node_meta.get(SYNTHETIC_NODE_META).map(String::as_str), Some("true"));

        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["Service"]["ID"], "web-1");
        assert_eq!(v["NodeMeta"]["synthetic-node"], "true");
        assert!(v["Service"].get("Kind").is_none(), "typical services omit Kind");
    }
}
