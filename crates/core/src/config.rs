//! Pre-parsed configuration handed to both subcommands.
//!
//! The document is camelCase JSON, read from `TETHER_CONFIG_JSON` or a file.
//! `validate` collects every problem before any network call is made.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{MeshGatewayConfig, ServiceKind, Weights};

pub const CONFIG_ENV_VAR: &str = "TETHER_CONFIG_JSON";
pub const GRPC_CA_CERT_PEM_ENV_VAR: &str = "TETHER_GRPC_CACERT_PEM";

pub const DEFAULT_HTTP_PORT: u16 = 8500;
pub const DEFAULT_GRPC_PORT: u16 = 8502;
pub const DEFAULT_PUBLIC_LISTENER_PORT: u16 = 20000;
pub const DEFAULT_HEALTH_CHECK_PORT: u16 = 22000;
pub const DEFAULT_GATEWAY_PORT: u16 = 8443;
pub const DEFAULT_BEARER_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

static SERVICE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("static regex"));

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    MissingEnv(&'static str),
    #[error("reading config file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Which subcommand the config is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    MeshInit,
    Controller,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Cluster identifier; the synthetic node name in the catalog.
    pub cluster: String,
    /// Shared volume the bootstrap artifacts are written to.
    pub bootstrap_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    /// Containers whose health is mirrored into TTL checks on the service.
    pub health_sync_containers: Vec<String>,
    pub consul_servers: ConsulServers,
    pub consul_login: ConsulLogin,
    pub service: ServiceSettings,
    pub proxy: ProxySettings,
    pub gateway: Option<GatewaySettings>,
    pub controller: ControllerSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsulServers {
    /// DNS name or IP address, optionally several separated by spaces.
    pub hosts: String,
    pub skip_server_watch: bool,
    pub defaults: TlsDefaults,
    pub grpc: TransportSettings,
    pub http: HttpSettings,
    pub discovery: DiscoverySettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsDefaults {
    pub tls: bool,
    pub ca_cert_file: Option<String>,
    pub tls_server_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    pub port: Option<u16>,
    pub tls: Option<bool>,
    pub ca_cert_file: Option<String>,
    pub tls_server_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    pub port: Option<u16>,
    pub https: bool,
    pub tls: Option<bool>,
    pub ca_cert_file: Option<String>,
    pub tls_server_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoverySettings {
    pub timeout_secs: Option<u64>,
    pub refresh_secs: Option<u64>,
}

/// Effective TLS settings for one transport after applying defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub enabled: bool,
    pub ca_cert_file: Option<String>,
    pub tls_server_name: Option<String>,
}

impl ConsulServers {
    pub fn http_port(&self) -> u16 { self.http.port.unwrap_or(DEFAULT_HTTP_PORT) }

    pub fn grpc_port(&self) -> u16 { self.grpc.port.unwrap_or(DEFAULT_GRPC_PORT) }

    pub fn host_list(&self) -> Vec<String> {
        self.hosts.split_whitespace().map(|s| s.to_string()).collect()
    }

    pub fn grpc_tls(&self) -> TlsSettings {
        TlsSettings {
            enabled: self.grpc.tls.unwrap_or(self.defaults.tls),
            ca_cert_file: self.grpc.ca_cert_file.clone().or_else(|| self.defaults.ca_cert_file.clone()),
            tls_server_name: self.grpc.tls_server_name.clone().or_else(|| self.defaults.tls_server_name.clone()),
        }
    }

    pub fn http_tls(&self) -> TlsSettings {
        TlsSettings {
            enabled: self.http.https && self.http.tls.unwrap_or(self.defaults.tls),
            ca_cert_file: self.http.ca_cert_file.clone().or_else(|| self.defaults.ca_cert_file.clone()),
            tls_server_name: self.http.tls_server_name.clone().or_else(|| self.defaults.tls_server_name.clone()),
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.timeout_secs.unwrap_or(60))
    }

    pub fn discovery_refresh(&self) -> Duration {
        Duration::from_secs(self.discovery.refresh_secs.unwrap_or(30).max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsulLogin {
    pub enabled: bool,
    /// Auth method name on the control plane.
    pub method: Option<String>,
    pub datacenter: Option<String>,
    pub bearer_token_file: PathBuf,
    pub meta: BTreeMap<String, String>,
}

impl Default for ConsulLogin {
    fn default() -> Self {
        Self {
            enabled: false,
            method: None,
            datacenter: None,
            bearer_token_file: PathBuf::from(DEFAULT_BEARER_TOKEN_FILE),
            meta: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSettings {
    /// Defaults to the lower-cased family name.
    pub name: Option<String>,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
    pub enable_tag_override: bool,
    pub weights: Option<Weights>,
    pub namespace: Option<String>,
    pub partition: Option<String>,
    pub checks: Vec<CheckSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckSettings {
    pub check_id: Option<String>,
    pub name: String,
    pub notes: String,
    pub http: String,
    pub method: String,
    pub header: BTreeMap<String, Vec<String>>,
    pub body: String,
    pub tcp: String,
    pub grpc: String,
    pub grpc_use_tls: bool,
    pub tls_server_name: String,
    pub tls_skip_verify: bool,
    pub interval: String,
    pub timeout: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    pub public_listener_port: Option<u16>,
    pub health_check_port: Option<u16>,
    pub upstreams: Vec<UpstreamSettings>,
    pub config: BTreeMap<String, serde_json::Value>,
    pub mesh_gateway: Option<MeshGatewayConfig>,
}

impl ProxySettings {
    pub fn public_listener_port(&self) -> u16 {
        self.public_listener_port.unwrap_or(DEFAULT_PUBLIC_LISTENER_PORT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    pub destination_type: Option<String>,
    pub destination_name: String,
    pub destination_namespace: Option<String>,
    pub destination_partition: Option<String>,
    pub datacenter: Option<String>,
    pub local_bind_address: Option<String>,
    pub local_bind_port: u16,
    pub config: BTreeMap<String, serde_json::Value>,
    pub mesh_gateway: Option<MeshGatewayConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayKind {
    #[serde(rename = "mesh-gateway")]
    MeshGateway,
    #[serde(rename = "terminating-gateway")]
    TerminatingGateway,
    #[serde(rename = "api-gateway")]
    ApiGateway,
}

impl GatewayKind {
    pub fn service_kind(&self) -> ServiceKind {
        match self {
            GatewayKind::MeshGateway => ServiceKind::MeshGateway,
            GatewayKind::TerminatingGateway => ServiceKind::TerminatingGateway,
            GatewayKind::ApiGateway => ServiceKind::ApiGateway,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayAddress {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySettings {
    pub kind: GatewayKind,
    #[serde(default)]
    pub name: Option<String>,
    /// Listener port for gateway kinds without address logic.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub lan_address: Option<GatewayAddress>,
    #[serde(default)]
    pub wan_address: Option<GatewayAddress>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub health_check_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerSettings {
    /// Secret names are `{secretPrefix}-{family}`.
    pub secret_prefix: Option<String>,
    /// Restrict inventory and secrets to one namespace; all namespaces when unset.
    pub namespace: Option<String>,
    pub polling_interval_secs: Option<u64>,
    pub page_size: Option<u32>,
    pub concurrency: Option<usize>,
}

impl ControllerSettings {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs.unwrap_or(10).max(1))
    }

    pub fn page_size(&self) -> u32 { self.page_size.unwrap_or(100).max(1) }

    pub fn concurrency(&self) -> usize { self.concurrency.unwrap_or(4).max(1) }
}

impl Config {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingEnv(CONFIG_ENV_VAR))?;
        Self::from_json(&raw)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_json(&raw)
    }

    pub fn is_gateway(&self) -> bool { self.gateway.is_some() }

    /// Ready-probe port the sidecar exposes for health checks.
    pub fn health_check_port(&self) -> u16 {
        let configured = match &self.gateway {
            Some(gw) => gw.health_check_port,
            None => self.proxy.health_check_port,
        };
        configured.filter(|p| *p > 0).unwrap_or(DEFAULT_HEALTH_CHECK_PORT)
    }

    pub fn log_level(&self) -> String {
        self.log_level.as_deref().unwrap_or("info").to_ascii_uppercase()
    }

    pub fn validate(&self, mode: Mode) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.cluster.trim().is_empty() {
            problems.push("cluster is required".to_string());
        }
        if self.consul_servers.hosts.trim().is_empty() {
            problems.push("consulServers.hosts is required".to_string());
        }
        if self.consul_login.enabled && self.consul_login.method.as_deref().unwrap_or("").is_empty() {
            problems.push("consulLogin.method is required when login is enabled".to_string());
        }
        match mode {
            Mode::MeshInit => self.validate_mesh_init(&mut problems),
            Mode::Controller => {
                if self.controller.secret_prefix.as_deref().unwrap_or("").is_empty() {
                    problems.push("controller.secretPrefix is required".to_string());
                }
            }
        }
        if problems.is_empty() { Ok(()) } else { Err(ConfigError::Invalid(problems)) }
    }

    fn validate_mesh_init(&self, problems: &mut Vec<String>) {
        if self.bootstrap_dir.as_ref().map(|p| p.as_os_str().is_empty()).unwrap_or(true) {
            problems.push("bootstrapDir is required".to_string());
        }
        let configured_name = match &self.gateway {
            Some(gw) => gw.name.as_deref(),
            None => self.service.name.as_deref(),
        };
        if let Some(name) = configured_name {
            if !SERVICE_NAME_RE.is_match(name) {
                problems.push(format!("service name {:?} must be a lower-case DNS label", name));
            }
        }
        for (i, up) in self.proxy.upstreams.iter().enumerate() {
            if up.destination_name.is_empty() {
                problems.push(format!("proxy.upstreams[{}].destinationName is required", i));
            }
            if up.local_bind_port == 0 {
                problems.push(format!("proxy.upstreams[{}].localBindPort is required", i));
            }
        }
        for (i, c) in self.service.checks.iter().enumerate() {
            let probes = [&c.http, &c.tcp, &c.grpc].iter().filter(|s| !s.is_empty()).count();
            if probes != 1 {
                problems.push(format!("service.checks[{}] must set exactly one of http, tcp, grpc", i));
            }
        }
        if let Some(gw) = &self.gateway {
            let has_lan = gw.lan_address.as_ref().map(|a| !a.address.is_empty()).unwrap_or(false);
            let has_wan = gw.wan_address.as_ref().map(|a| !a.address.is_empty()).unwrap_or(false);
            if gw.kind != GatewayKind::MeshGateway && (has_lan || has_wan) {
                problems.push("gateway.lanAddress/wanAddress are only supported for mesh-gateway".to_string());
            }
        }
    }
}
