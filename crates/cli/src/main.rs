use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use tether_consul::{
    ClientSettings, Connector, ControlPlane, ControlPlaneError, DiscoverySettings, FollowingControlPlane, HttpControlPlane,
    HttpServerProbe, ServerSnapshot, Watcher,
};
use tether_controller::{Controller, Reconciler};
use tether_core::config::GRPC_CA_CERT_PEM_ENV_VAR;
use tether_core::{Config, Mode};
use tether_kubehub::{KubeInstanceMetadata, KubeInventory, KubeSecretStore};
use tether_meshinit::MeshInit;

/// ACL token for the controller when login is disabled.
const TOKEN_ENV_VAR: &str = "TETHER_CONSUL_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Service mesh bootstrap and credential controller")]
struct Cli {
    /// Config file (JSON). Defaults to the TETHER_CONFIG_JSON environment variable.
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register this instance with the mesh and write sidecar artifacts
    MeshInit,
    /// Reconcile per-family mesh credentials until interrupted
    Controller,
}

fn init_tracing(config_level: &str) {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| config_level.to_ascii_lowercase());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: Option<&PathBuf>, mode: Mode) -> Result<Config> {
    let cfg = match path {
        Some(p) => Config::from_file(p)?,
        None => Config::from_env()?,
    };
    cfg.validate(mode)?;
    Ok(cfg)
}

fn http_connector(cfg: &Config, fallback_token: Option<String>) -> Connector {
    let tls = cfg.consul_servers.http_tls();
    Box::new(move |snap: &ServerSnapshot| -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
        let token = snap.token.clone().or_else(|| fallback_token.clone());
        let cp = HttpControlPlane::new(ClientSettings::for_address(snap.address, &tls, token))?;
        Ok(Arc::new(cp) as Arc<dyn ControlPlane>)
    })
}

async fn mesh_init(cfg: Config) -> Result<i32> {
    let client = kube::Client::try_default().await.context("connecting to the cluster")?;
    let metadata = KubeInstanceMetadata::from_env(client, &cfg.cluster)?;
    let probe = HttpServerProbe::new(&cfg.consul_servers.http_tls())?;
    let connect = http_connector(&cfg, None);
    let grpc_ca_pem = std::env::var(GRPC_CA_CERT_PEM_ENV_VAR).ok();
    let mi = MeshInit::new(cfg, Arc::new(metadata), Arc::new(probe), connect).with_grpc_ca_pem(grpc_ca_pem);
    Ok(mi.run().await)
}

async fn controller(cfg: Config) -> Result<()> {
    let client = kube::Client::try_default().await.context("connecting to the cluster")?;
    let settings = &cfg.controller;
    let secret_ns = settings
        .namespace
        .clone()
        .or_else(|| std::env::var("POD_NAMESPACE").ok())
        .unwrap_or_else(|| "default".to_string());

    let servers = &cfg.consul_servers;
    let probe = HttpServerProbe::new(&servers.http_tls())?;
    let discovery = DiscoverySettings {
        hosts: servers.host_list(),
        port: servers.http_port(),
        refresh: servers.discovery_refresh(),
        login: None,
    };
    let watcher = Watcher::spawn(discovery, Arc::new(probe));
    let snapshot = watcher.first_snapshot(servers.discovery_timeout()).await?;
    info!(server = %snapshot.address, secret_namespace = %secret_ns, "controller connected");
    let control_plane = Arc::new(FollowingControlPlane::new(watcher, http_connector(&cfg, std::env::var(TOKEN_ENV_VAR).ok())));

    let reconciler = Reconciler::new(
        control_plane.clone(),
        Arc::new(KubeSecretStore::new(client.clone(), &secret_ns)),
        Arc::new(KubeInventory::new(client, settings.namespace.as_deref(), settings.page_size())),
        settings.secret_prefix.clone().unwrap_or_default(),
    )
    .with_concurrency(settings.concurrency());
    let controller = Controller::new(reconciler, settings.polling_interval());
    controller
        .run(async {
            let _ = signal::ctrl_c().await;
            info!("Ctrl-C received; stopping controller");
        })
        .await;
    drop(controller);
    if let Ok(control_plane) = Arc::try_unwrap(control_plane) {
        control_plane.stop().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Commands::MeshInit => Mode::MeshInit,
        Commands::Controller => Mode::Controller,
    };
    let cfg = load_config(cli.config.as_ref(), mode)?;
    init_tracing(&cfg.log_level());
    init_metrics();

    match cli.command {
        Commands::MeshInit => {
            let code = mesh_init(cfg).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Controller => controller(cfg).await?,
    }
    Ok(())
}
