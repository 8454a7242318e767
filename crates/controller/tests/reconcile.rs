use std::sync::Arc;
use std::time::Duration;

use tether_consul::MockControlPlane;
use tether_controller::{Controller, ReconcileError, Reconciler};
use tether_core::{Credential, SecretRecord, ServiceIdentity};
use tether_kubehub::{ClusterInstance, MockInventory, MockSecretStore};

struct Harness {
    cp: Arc<MockControlPlane>,
    store: Arc<MockSecretStore>,
    inventory: Arc<MockInventory>,
}

impl Harness {
    fn new(pages: Vec<Vec<ClusterInstance>>) -> Self {
        Self {
            cp: Arc::new(MockControlPlane::new()),
            store: Arc::new(MockSecretStore::new()),
            inventory: Arc::new(MockInventory::with_pages(pages)),
        }
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.cp.clone(), self.store.clone(), self.inventory.clone(), "tether")
    }

    fn record(&self, family: &str) -> SecretRecord {
        let raw = self.store.value(&format!("tether-{}", family)).expect("secret written");
        SecretRecord::parse(&raw).expect("valid record")
    }
}

fn tagged(id: &str, family: &str) -> ClusterInstance { MockInventory::tagged(id, family) }

#[tokio::test]
async fn issues_once_and_is_idempotent() {
    let h = Harness::new(vec![vec![tagged("a", "web"), tagged("b", "web")]]);
    let first = h.reconciler().reconcile().await.unwrap();
    assert_eq!(first.created, 1);

    let rec = h.record("web");
    let live = h.cp.live_for("web");
    assert_eq!(live.len(), 1);
    assert_eq!(rec, SecretRecord::for_credential(&live[0]));

    let puts = h.store.puts();
    let second = h.reconciler().reconcile().await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.converged, 1);
    assert_eq!(h.cp.created_total(), 1);
    assert_eq!(h.store.puts(), puts, "converged pass writes nothing");
    assert_eq!(h.record("web"), rec);
}

#[tokio::test]
async fn paginates_and_ignores_untagged() {
    let h = Harness::new(vec![
        vec![tagged("p0a", "f0"), tagged("p0b", "f1"), MockInventory::untagged("u0", "plain0")],
        vec![tagged("p1a", "f2"), tagged("p1b", "f3")],
        vec![tagged("p2a", "f4"), tagged("p2b", "f5"), MockInventory::untagged("u2", "plain2")],
    ]);
    let r = h.reconciler();
    let want: Vec<String> = r.want_families().await.unwrap().iter().map(|f| f.to_string()).collect();
    assert_eq!(want, vec!["f0", "f1", "f2", "f3", "f4", "f5"]);
    assert_eq!(
        h.inventory.cursors_seen(),
        vec![None, Some("page-1".to_string()), Some("page-2".to_string())]
    );

    let summary = r.reconcile().await.unwrap();
    assert_eq!(summary.created, 6);
    for f in ["f0", "f1", "f2", "f3", "f4", "f5"] {
        assert_eq!(h.cp.live_for(f).len(), 1, "{}", f);
    }
    assert!(h.cp.live_for("plain0").is_empty());
    assert!(h.store.value("tether-plain2").is_none());
}

#[tokio::test]
async fn orphans_are_revoked_and_secret_cleared() {
    let h = Harness::new(vec![vec![tagged("a", "web")]]);
    let old = h.cp.seed_family_credential("retired");
    h.store.insert("tether-retired", &SecretRecord::for_credential(&old).to_bytes());

    let summary = h.reconciler().reconcile().await.unwrap();
    assert_eq!(summary.orphaned, 1);
    assert!(h.cp.live_for("retired").is_empty());
    assert_eq!(h.store.value("tether-retired").unwrap(), b"{}".to_vec());
}

#[tokio::test]
async fn stale_record_self_heals() {
    let h = Harness::new(vec![vec![tagged("a", "web")]]);
    h.store.insert(
        "tether-web",
        &SecretRecord { accessor_id: "deleted-out-of-band".into(), token: "old".into() }.to_bytes(),
    );
    let summary = h.reconciler().reconcile().await.unwrap();
    assert_eq!(summary.created, 1);
    let live = h.cp.live_for("web");
    assert_eq!(live.len(), 1);
    assert_eq!(h.record("web").accessor_id, live[0].accessor_id);
}

#[tokio::test]
async fn secret_write_failure_recovers_without_second_credential() {
    let h = Harness::new(vec![vec![tagged("a", "web")]]);
    h.store.fail_puts_of("tether-web", true);
    let err = h.reconciler().reconcile().await.unwrap_err();
    assert_eq!(err.family_errors().len(), 1);
    assert_eq!(h.cp.live_for("web").len(), 1);

    h.store.fail_puts_of("tether-web", false);
    let summary = h.reconciler().reconcile().await.unwrap();
    assert_eq!(summary.adopted, 1);
    assert_eq!(summary.created, 0);
    let live = h.cp.live_for("web");
    assert_eq!(live.len(), 1, "at most one live credential");
    assert_eq!(h.record("web").accessor_id, live[0].accessor_id);
}

#[tokio::test]
async fn duplicates_are_collapsed_to_the_recorded_one() {
    let h = Harness::new(vec![vec![tagged("a", "web")]]);
    let kept = h.cp.seed_family_credential("web");
    let _dup = h.cp.seed_family_credential("web");
    h.store.insert("tether-web", &SecretRecord::for_credential(&kept).to_bytes());

    let summary = h.reconciler().reconcile().await.unwrap();
    assert_eq!(summary.converged, 1);
    assert_eq!(summary.revoked, 1);
    assert_eq!(h.cp.live_for("web"), vec![kept]);
}

#[tokio::test]
async fn record_pointing_at_another_family_is_replaced() {
    let h = Harness::new(vec![vec![tagged("a", "web"), tagged("b", "api")]]);
    let web = h.cp.seed_family_credential("web");
    let api = h.cp.seed_family_credential("api");
    h.store.insert("tether-web", &SecretRecord::for_credential(&api).to_bytes());

    let summary = h.reconciler().reconcile().await.unwrap();
    assert_eq!(summary.converged, 0);
    assert_eq!(summary.adopted, 2);
    assert_eq!(summary.revoked, 0);
    assert_eq!(h.cp.live_for("web"), vec![web.clone()]);
    assert_eq!(h.cp.live_for("api"), vec![api.clone()]);
    assert_eq!(h.record("web"), SecretRecord::for_credential(&web));
    assert_eq!(h.record("api"), SecretRecord::for_credential(&api));
}

#[tokio::test]
async fn record_pointing_at_multi_identity_credential_is_replaced() {
    let h = Harness::new(vec![vec![tagged("a", "web")]]);
    let shared = Credential {
        accessor_id: "shared".into(),
        secret_id: "shared-secret".into(),
        service_identities: vec![
            ServiceIdentity { service_name: "web".into(), datacenters: vec![] },
            ServiceIdentity { service_name: "api".into(), datacenters: vec![] },
        ],
        ..Default::default()
    };
    h.cp.insert_credential(shared.clone());
    h.store.insert("tether-web", &SecretRecord::for_credential(&shared).to_bytes());

    let summary = h.reconciler().reconcile().await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.revoked, 0);
    let live = h.cp.live_for("web");
    assert_eq!(live.len(), 1);
    assert_eq!(h.record("web").accessor_id, live[0].accessor_id);
    assert!(h.cp.credentials().iter().any(|c| c.accessor_id == "shared"), "shared credential untouched");
}

#[tokio::test]
async fn family_errors_do_not_stop_other_families() {
    let h = Harness::new(vec![vec![tagged("a", "web"), tagged("b", "api"), tagged("c", "db")]]);
    h.store.fail_gets_of("tether-api");
    let err = h.reconciler().with_concurrency(2).reconcile().await.unwrap_err();
    let failed: Vec<String> = err.family_errors().iter().map(|e| e.family().to_string()).collect();
    assert_eq!(failed, vec!["api"]);
    assert_eq!(h.cp.live_for("web").len(), 1);
    assert_eq!(h.cp.live_for("db").len(), 1);
    assert!(h.cp.live_for("api").is_empty());
}

#[tokio::test]
async fn list_failures_are_fatal() {
    let h = Harness::new(vec![vec![tagged("a", "web")]]);
    h.cp.fail_list(Some(500));
    let err = h.reconciler().reconcile().await.unwrap_err();
    assert!(matches!(err, ReconcileError::ListCredentials(_)));
    assert!(h.store.names().is_empty());

    h.cp.fail_list(None);
    h.inventory.fail_with(Some("apiserver down"));
    let err = h.reconciler().reconcile().await.unwrap_err();
    assert!(matches!(err, ReconcileError::Inventory(_)));
    assert!(err.to_string().contains("apiserver down"));
}

#[tokio::test]
async fn tagged_instance_without_family_fails_listing() {
    let mut inst = tagged("lonely", "x");
    inst.family = None;
    let h = Harness::new(vec![vec![inst]]);
    let err = h.reconciler().reconcile().await.unwrap_err();
    assert!(err.to_string().contains("lonely"), "{}", err);
}

#[tokio::test]
async fn multi_identity_credentials_are_left_alone() {
    let h = Harness::new(vec![vec![]]);
    h.cp.insert_credential(Credential {
        accessor_id: "shared".into(),
        service_identities: vec![
            ServiceIdentity { service_name: "a".into(), datacenters: vec![] },
            ServiceIdentity { service_name: "b".into(), datacenters: vec![] },
        ],
        ..Default::default()
    });
    let summary = h.reconciler().reconcile().await.unwrap();
    assert_eq!(summary.orphaned, 0);
    assert_eq!(h.cp.credentials().len(), 1);
}

#[tokio::test]
async fn polling_loop_stops_on_shutdown() {
    let h = Harness::new(vec![vec![tagged("a", "web")]]);
    let controller = Controller::new(h.reconciler(), Duration::from_millis(10));
    let passes = controller.run(tokio::time::sleep(Duration::from_millis(55))).await;
    assert!(passes >= 2, "passes = {}", passes);
    assert_eq!(h.cp.created_total(), 1);
}
