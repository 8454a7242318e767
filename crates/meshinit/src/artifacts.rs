//! Files left on the shared volume for the sidecar containers.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use tether_core::{CatalogEntry, Config};

pub const BINARY_FILE: &str = "tether";
pub const CA_CERT_FILE: &str = "consul-grpc-ca-cert.pem";
pub const DATAPLANE_CONFIG_FILE: &str = "consul-dataplane.json";

const EXECUTABLE_MODE: u32 = 0o755;
const READ_ONLY_MODE: u32 = 0o444;
const LOCALHOST: &str = "127.0.0.1";

/// Replace `path` with `bytes`. Earlier runs leave read-only files behind,
/// so the old file is removed rather than truncated.
pub fn replace_file(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut f = opts.open(path)?;
    f.write_all(bytes)?;
    f.sync_all()
}

pub fn copy_binary(exe: &Path, dir: &Path) -> io::Result<PathBuf> {
    let bytes = fs::read(exe)?;
    let dest = dir.join(BINARY_FILE);
    replace_file(&dest, &bytes, EXECUTABLE_MODE)?;
    Ok(dest)
}

/// CA bundle path for the dataplane's gRPC connection. With TLS on, a PEM
/// from the environment is written to the volume; without one the
/// configured CA file is referenced as-is. `None` when TLS is off.
pub fn write_grpc_ca_cert(cfg: &Config, dir: &Path, pem: Option<&str>) -> io::Result<Option<String>> {
    let tls = cfg.consul_servers.grpc_tls();
    if !tls.enabled {
        return Ok(None);
    }
    match pem.filter(|p| !p.trim().is_empty()) {
        Some(pem) => {
            let dest = dir.join(CA_CERT_FILE);
            replace_file(&dest, pem.as_bytes(), READ_ONLY_MODE)?;
            Ok(Some(dest.to_string_lossy().into_owned()))
        }
        None => Ok(tls.ca_cert_file),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataplaneConfig {
    pub consul: ConsulSection,
    pub proxy: ProxySection,
    pub xds_server: XdsSection,
    pub envoy: EnvoySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsulSection {
    pub addresses: String,
    pub grpc_port: u16,
    pub server_watch_disabled: bool,
    pub tls: TlsSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialsSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSection {
    pub disabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ca_certs_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_server_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsSection {
    #[serde(rename = "type")]
    pub kind: String,
    pub login: LoginSection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginSection {
    pub auth_method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub partition: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub datacenter: String,
    pub bearer_token_path: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySection {
    pub node_name: String,
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub partition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XdsSection {
    pub bind_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvoySection {
    pub ready_bind_address: String,
    pub ready_bind_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSection {
    pub log_level: String,
}

impl DataplaneConfig {
    /// Config for the dataplane fronting `proxy` (the sidecar or gateway entry).
    pub fn build(cfg: &Config, proxy: &CatalogEntry, ca_certs_path: Option<&str>) -> Self {
        let servers = &cfg.consul_servers;
        let tls = servers.grpc_tls();
        let credentials = cfg.consul_login.enabled.then(|| CredentialsSection {
            kind: "login".to_string(),
            login: LoginSection {
                auth_method: cfg.consul_login.method.clone().unwrap_or_default(),
                namespace: proxy.service.namespace.clone(),
                partition: proxy.service.partition.clone(),
                datacenter: cfg.consul_login.datacenter.clone().unwrap_or_default(),
                bearer_token_path: cfg.consul_login.bearer_token_file.to_string_lossy().into_owned(),
                meta: cfg.consul_login.meta.clone(),
            },
        });
        Self {
            consul: ConsulSection {
                addresses: servers.hosts.clone(),
                grpc_port: servers.grpc_port(),
                server_watch_disabled: servers.skip_server_watch,
                tls: TlsSection {
                    disabled: !tls.enabled,
                    ca_certs_path: if tls.enabled { ca_certs_path.unwrap_or_default().to_string() } else { String::new() },
                    tls_server_name: if tls.enabled { tls.tls_server_name.unwrap_or_default() } else { String::new() },
                },
                credentials,
            },
            proxy: ProxySection {
                node_name: proxy.node.clone(),
                id: proxy.service.id.clone(),
                namespace: proxy.service.namespace.clone(),
                partition: proxy.service.partition.clone(),
            },
            xds_server: XdsSection { bind_address: LOCALHOST.to_string() },
            envoy: EnvoySection { ready_bind_address: LOCALHOST.to_string(), ready_bind_port: cfg.health_check_port() },
            logging: LoggingSection { log_level: cfg.log_level() },
        }
    }

    pub fn write(&self, dir: &Path) -> io::Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(self).map_err(io::Error::from)?;
        let dest = dir.join(DATAPLANE_CONFIG_FILE);
        replace_file(&dest, &bytes, READ_ONLY_MODE)?;
        Ok(dest)
    }
}
