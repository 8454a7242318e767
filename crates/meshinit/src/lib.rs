//! tether mesh-init: one-shot bootstrap of a workload instance.
//!
//! Discover a healthy server, register the service and its proxy (or the
//! gateway) under the cluster's synthetic node, then leave the artifacts the
//! sidecar needs on the shared volume. The discovery task lives only for the
//! duration of [`MeshInit::execute`].

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use metrics::counter;
use tracing::{error, info};

use tether_consul::{
    ControlPlane, ControlPlaneError, DiscoveryError, DiscoverySettings, LoginParams, ServerProbe,
    Watcher,
};
use tether_core::{retry_notify, Backoff, CatalogEntry, Config, ConfigError, Mode, WorkloadInstance};
use tether_kubehub::InstanceMetadata;

pub mod artifacts;
pub mod payload;

pub use artifacts::DataplaneConfig;

#[derive(Debug, thiserror::Error)]
pub enum MeshInitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("reading instance metadata: {0:#}")]
    Metadata(anyhow::Error),
    #[error("reading bearer token {path}: {source}")]
    BearerToken { path: PathBuf, #[source] source: std::io::Error },
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("building control plane client: {0}")]
    Connect(#[source] ControlPlaneError),
    #[error("registering {what}: {source}")]
    Register { what: &'static str, #[source] source: ControlPlaneError },
    #[error("writing {path}: {source}")]
    Artifact { path: PathBuf, #[source] source: std::io::Error },
}

fn artifact_err(path: PathBuf) -> impl FnOnce(std::io::Error) -> MeshInitError {
    move |source| MeshInitError::Artifact { path, source }
}

pub use tether_consul::Connector;

/// What a successful run registered and wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshInitReport {
    pub service_id: Option<String>,
    pub proxy_id: String,
    pub artifacts: Vec<PathBuf>,
    /// Failed registration attempts that were retried.
    pub registration_retries: u32,
}

pub struct MeshInit {
    config: Config,
    metadata: Arc<dyn InstanceMetadata>,
    probe: Arc<dyn ServerProbe>,
    connect: Connector,
    backoff: Backoff,
    executable: Option<PathBuf>,
    grpc_ca_pem: Option<String>,
}

impl MeshInit {
    pub fn new(config: Config, metadata: Arc<dyn InstanceMetadata>, probe: Arc<dyn ServerProbe>, connect: Connector) -> Self {
        Self {
            config,
            metadata,
            probe,
            connect,
            backoff: Backoff::default(),
            executable: None,
            grpc_ca_pem: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Binary copied to the shared volume; defaults to the running executable.
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// gRPC CA bundle from the environment.
    pub fn with_grpc_ca_pem(mut self, pem: Option<String>) -> Self {
        self.grpc_ca_pem = pem;
        self
    }

    /// Process exit status: 0 on success, 1 on any failure.
    pub async fn run(&self) -> i32 {
        match self.execute().await {
            Ok(report) => {
                info!(proxy = %report.proxy_id, artifacts = report.artifacts.len(), "instance initialized for the mesh");
                0
            }
            Err(e) => {
                error!(error = %e, "mesh-init failed");
                counter!("meshinit_failures_total", 1u64);
                1
            }
        }
    }

    pub async fn execute(&self) -> Result<MeshInitReport, MeshInitError> {
        self.config.validate(Mode::MeshInit)?;
        let instance = self.metadata.fetch().await.map_err(MeshInitError::Metadata)?;
        info!(instance = %instance.instance_id, family = %instance.family, cluster = %instance.cluster, "instance metadata loaded");

        let settings = self.discovery_settings().await?;
        let watcher = Watcher::spawn(settings, Arc::clone(&self.probe));
        let result = self.with_watcher(&watcher, &instance).await;
        watcher.stop().await;
        result
    }

    async fn discovery_settings(&self) -> Result<DiscoverySettings, MeshInitError> {
        let servers = &self.config.consul_servers;
        let login = if self.config.consul_login.enabled {
            let path = &self.config.consul_login.bearer_token_file;
            let bearer_token = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| MeshInitError::BearerToken { path: path.clone(), source })?;
            Some(LoginParams {
                method: self.config.consul_login.method.clone().unwrap_or_default(),
                bearer_token: bearer_token.trim().to_string(),
                datacenter: self.config.consul_login.datacenter.clone(),
                meta: self.config.consul_login.meta.clone(),
            })
        } else {
            None
        };
        Ok(DiscoverySettings {
            hosts: servers.host_list(),
            port: servers.http_port(),
            refresh: servers.discovery_refresh(),
            login,
        })
    }

    async fn with_watcher(&self, watcher: &Watcher, instance: &WorkloadInstance) -> Result<MeshInitReport, MeshInitError> {
        let snapshot = watcher.first_snapshot(self.config.consul_servers.discovery_timeout()).await?;
        info!(server = %snapshot.address, "using control plane server");
        let control_plane = (self.connect)(&snapshot).map_err(MeshInitError::Connect)?;

        let intent = payload::build_intent(&self.config, instance);
        let (service_entry, proxy_entry) = intent.into_entries(instance);

        let mut registration_retries = 0;
        let service_id = match &service_entry {
            Some(entry) => {
                registration_retries += self.register(control_plane.as_ref(), entry, "service").await?;
                Some(entry.service.id.clone())
            }
            None => None,
        };
        let what = if self.config.is_gateway() { "gateway" } else { "proxy" };
        registration_retries += self.register(control_plane.as_ref(), &proxy_entry, what).await?;

        let artifacts = self.write_artifacts(&proxy_entry)?;
        Ok(MeshInitReport { service_id, proxy_id: proxy_entry.service.id.clone(), artifacts, registration_retries })
    }

    /// Register with retries; returns how many attempts failed first.
    async fn register(&self, cp: &dyn ControlPlane, entry: &CatalogEntry, what: &'static str) -> Result<u32, MeshInitError> {
        let id = entry.service.id.as_str();
        let mut retries = 0u32;
        retry_notify(
            &self.backoff,
            || {
                info!(%id, kind = entry.service.kind.as_str(), "registering {}", what);
                cp.register(entry)
            },
            |e, wait| {
                retries += 1;
                counter!("meshinit_registration_retries_total", 1u64);
                error!(%id, error = %e, retry_in = ?wait, "registering {} failed", what);
            },
        )
        .await
        .map_err(|source| MeshInitError::Register { what, source })?;
        info!(%id, name = %entry.service.service, retries, "{} registered", what);
        Ok(retries)
    }

    fn write_artifacts(&self, proxy_entry: &CatalogEntry) -> Result<Vec<PathBuf>, MeshInitError> {
        let dir = self.config.bootstrap_dir.as_deref().unwrap_or_else(|| Path::new("."));
        let exe = match &self.executable {
            Some(p) => p.clone(),
            None => std::env::current_exe().map_err(artifact_err(PathBuf::from("current executable")))?,
        };
        let mut written = vec![artifacts::copy_binary(&exe, dir).map_err(artifact_err(dir.join(artifacts::BINARY_FILE)))?];
        info!(file = %written[0].display(), "copied binary");

        let ca = artifacts::write_grpc_ca_cert(&self.config, dir, self.grpc_ca_pem.as_deref())
            .map_err(artifact_err(dir.join(artifacts::CA_CERT_FILE)))?;
        if let Some(path) = ca.as_deref().filter(|p| Path::new(p).starts_with(dir)) {
            written.push(PathBuf::from(path));
        }

        let dataplane = DataplaneConfig::build(&self.config, proxy_entry, ca.as_deref());
        let path = dataplane.write(dir).map_err(artifact_err(dir.join(artifacts::DATAPLANE_CONFIG_FILE)))?;
        info!(file = %path.display(), "wrote dataplane config");
        written.push(path);
        Ok(written)
    }
}
