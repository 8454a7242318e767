use std::cell::RefCell;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tether_consul::{ControlPlane, ControlPlaneError, MockControlPlane, MockProbe, ServerSnapshot};
use tether_core::{retry_notify, Backoff, Config, WorkloadInstance, TAGGED_ADDRESS_LAN, TAGGED_ADDRESS_WAN};
use tether_kubehub::StaticMetadata;
use tether_meshinit::{artifacts, Connector, MeshInit, MeshInitError};

const SERVER: &str = "10.0.0.1";

fn instance() -> WorkloadInstance {
    WorkloadInstance {
        instance_id: "web-5d8f7-x2x9q".into(),
        family: "web".into(),
        cluster: "prod-east".into(),
        node_address: "10.1.2.3".into(),
        zone: Some("us-east-1a".into()),
        region: Some("us-east-1".into()),
    }
}

fn config(dir: &Path, extra: serde_json::Value) -> Config {
    let mut doc = serde_json::json!({
        "cluster": "prod-east",
        "bootstrapDir": dir,
        "consulServers": { "hosts": SERVER, "discovery": { "timeoutSecs": 1 } },
        "service": { "port": 8080 }
    });
    if let (Some(base), Some(extra)) = (doc.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    Config::from_json(&doc.to_string()).expect("config")
}

struct Fixture {
    dir: tempfile::TempDir,
    exe: std::path::PathBuf,
    cp: Arc<MockControlPlane>,
    probe: Arc<MockProbe>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("source-binary");
        std::fs::write(&exe, b"\x7fELF fake").unwrap();
        let probe = Arc::new(MockProbe::new());
        probe.set_healthy(format!("{}:8500", SERVER).parse::<SocketAddr>().unwrap(), true);
        Self { dir, exe, cp: Arc::new(MockControlPlane::new()), probe }
    }

    fn bootstrap_dir(&self) -> std::path::PathBuf { self.dir.path().join("bootstrap") }

    fn mesh_init(&self, cfg: Config) -> MeshInit {
        std::fs::create_dir_all(self.bootstrap_dir()).unwrap();
        let cp = self.cp.clone();
        let connect: Connector = Box::new(move |_snap: &ServerSnapshot| -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
            Ok(cp.clone())
        });
        MeshInit::new(cfg, Arc::new(StaticMetadata(instance())), self.probe.clone(), connect)
            .with_backoff(Backoff::constant(Duration::from_millis(5)))
            .with_executable(&self.exe)
    }
}

#[tokio::test]
async fn registers_service_and_proxy_on_one_node() {
    let fx = Fixture::new();
    let cfg = config(&fx.bootstrap_dir(), serde_json::json!({}));
    let report = fx.mesh_init(cfg).execute().await.expect("mesh-init");

    assert_eq!(report.service_id.as_deref(), Some("web-web-5d8f7-x2x9q"));
    let entries = fx.cp.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.node == "prod-east" && e.address == "10.1.2.3"));
    assert!(entries.iter().all(|e| e.service.locality.as_ref().map(|l| l.region.as_str()) == Some("us-east-1")));

    let proxy = fx.cp.entry(&report.proxy_id).expect("proxy entry");
    assert_eq!(proxy.service.proxy.as_ref().unwrap().destination_service_id, "web-web-5d8f7-x2x9q");

    let dir = fx.bootstrap_dir();
    assert_eq!(std::fs::read(dir.join(artifacts::BINARY_FILE)).unwrap(), b"\x7fELF fake");
    let dp: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join(artifacts::DATAPLANE_CONFIG_FILE)).unwrap()).unwrap();
    assert_eq!(dp["proxy"]["id"], report.proxy_id.as_str());
    assert_eq!(dp["proxy"]["nodeName"], "prod-east");
    assert!(!dir.join(artifacts::CA_CERT_FILE).exists());
}

#[tokio::test]
async fn rerun_replaces_read_only_artifacts() {
    let fx = Fixture::new();
    let cfg = config(&fx.bootstrap_dir(), serde_json::json!({}));
    let mi = fx.mesh_init(cfg);
    assert_eq!(mi.run().await, 0);
    assert_eq!(mi.run().await, 0);
    assert_eq!(fx.cp.entries().len(), 2);
}

#[tokio::test]
async fn mesh_gateway_with_lan_address() {
    let fx = Fixture::new();
    let cfg = config(
        &fx.bootstrap_dir(),
        serde_json::json!({
            "gateway": { "kind": "mesh-gateway", "lanAddress": { "address": "10.0.0.5", "port": 8443 } }
        }),
    );
    let report = fx.mesh_init(cfg).execute().await.expect("mesh-init");
    assert_eq!(report.service_id, None);

    let entries = fx.cp.entries();
    assert_eq!(entries.len(), 1, "gateways register a single entry");
    let gw = &entries[0];
    assert_eq!(gw.address, "10.1.2.3", "node address stays the instance's");
    assert_eq!(gw.service.address, "10.0.0.5");
    assert_eq!(gw.service.port, 8443);
    assert_eq!(gw.service.tagged_addresses.len(), 1);
    assert!(gw.service.tagged_addresses.contains_key(TAGGED_ADDRESS_LAN));
    assert!(!gw.service.tagged_addresses.contains_key(TAGGED_ADDRESS_WAN));
    assert_eq!(gw.checks.len(), 1);
}

#[tokio::test]
async fn registration_retries_until_success() {
    let cp = MockControlPlane::new();
    cp.fail_next_registrations(2);
    let entry = tether_core::CatalogEntry {
        service: tether_core::AgentService { id: "web-1".into(), ..Default::default() },
        ..Default::default()
    };
    let notified = RefCell::new(Vec::new());
    let backoff = Backoff::constant(Duration::from_millis(3));
    retry_notify(&backoff, || cp.register(&entry), |_e: &ControlPlaneError, wait| notified.borrow_mut().push(wait))
        .await
        .expect("eventually registered");
    assert_eq!(notified.into_inner(), vec![Duration::from_millis(3); 2]);
    assert_eq!(cp.register_attempts(), 3);
    assert_eq!(cp.entries().len(), 1);
}

#[tokio::test]
async fn transient_failures_do_not_fail_the_run() {
    let fx = Fixture::new();
    fx.cp.fail_next_registrations(3);
    let cfg = config(&fx.bootstrap_dir(), serde_json::json!({}));
    assert_eq!(fx.mesh_init(cfg).run().await, 0);
    assert_eq!(fx.cp.register_attempts(), 5);
    assert_eq!(fx.cp.entries().len(), 2);
}

#[tokio::test]
async fn each_failed_registration_is_retried_and_reported() {
    let fx = Fixture::new();
    fx.cp.fail_next_registrations(2);
    let cfg = config(&fx.bootstrap_dir(), serde_json::json!({}));
    let report = fx.mesh_init(cfg).execute().await.expect("mesh-init");
    assert_eq!(report.registration_retries, 2);
    assert_eq!(fx.cp.register_attempts(), 4, "two failures, then service and proxy");
    assert!(fx.cp.entry(&report.proxy_id).is_some());
}

#[tokio::test]
async fn no_healthy_server_fails_without_side_effects() {
    let fx = Fixture::new();
    fx.probe.set_healthy(format!("{}:8500", SERVER).parse().unwrap(), false);
    let cfg = config(&fx.bootstrap_dir(), serde_json::json!({}));
    let err = fx.mesh_init(cfg).execute().await.unwrap_err();
    assert!(matches!(err, MeshInitError::Discovery(_)), "{}", err);
    assert_eq!(fx.cp.register_attempts(), 0);
    assert!(!fx.bootstrap_dir().join(artifacts::DATAPLANE_CONFIG_FILE).exists());
}

#[tokio::test]
async fn invalid_config_exits_one() {
    let fx = Fixture::new();
    let mut cfg = config(&fx.bootstrap_dir(), serde_json::json!({}));
    cfg.cluster.clear();
    let mi = fx.mesh_init(cfg);
    assert!(matches!(mi.execute().await, Err(MeshInitError::Config(_))));
    assert_eq!(mi.run().await, 1);
    assert_eq!(fx.probe.checks(), 0);
}

#[tokio::test]
async fn grpc_ca_pem_is_written_when_tls_enabled() {
    let fx = Fixture::new();
    let cfg = config(
        &fx.bootstrap_dir(),
        serde_json::json!({
            "consulServers": { "hosts": SERVER, "grpc": { "tls": true } }
        }),
    );
    let report = fx
        .mesh_init(cfg)
        .with_grpc_ca_pem(Some("-----BEGIN CERTIFICATE-----\n".into()))
        .execute()
        .await
        .expect("mesh-init");
    let ca = fx.bootstrap_dir().join(artifacts::CA_CERT_FILE);
    assert!(report.artifacts.contains(&ca));
    let dp: serde_json::Value = serde_json::from_slice(
        &std::fs::read(fx.bootstrap_dir().join(artifacts::DATAPLANE_CONFIG_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(dp["consul"]["tls"]["disabled"], false);
    assert_eq!(dp["consul"]["tls"]["caCertsPath"], &*ca.to_string_lossy());
}
