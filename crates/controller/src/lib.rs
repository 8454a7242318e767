//! tether controller: keeps exactly one mesh credential per running workload
//! family and revokes credentials of families that stopped running.
//!
//! One pass ([`Reconciler::reconcile`]):
//! - page through the inventory and collect the mesh-tagged families (want)
//! - list credentials and group the controller-owned ones by family (have)
//! - converge every want family as an upsert, every have-only family as a revoke
//!
//! Families are independent; a failing family never stops the others.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use tether_consul::{ControlPlane, ControlPlaneError};
use tether_core::{Credential, WorkloadFamily};
use tether_kubehub::{Inventory, SecretStore};

mod resource;
mod run;

pub use resource::{ConvergeCtx, FamilyResource, OrphanResource, Outcome, ReconcileResource};
pub use run::Controller;

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FamilyError {
    #[error("{family}: reading secret {secret}: {source:#}")]
    SecretRead { family: WorkloadFamily, secret: String, #[source] source: anyhow::Error },
    #[error("{family}: secret {secret} does not hold a valid record: {source}")]
    SecretDecode { family: WorkloadFamily, secret: String, #[source] source: serde_json::Error },
    #[error("{family}: reading credential {accessor}: {source}")]
    ReadCredential { family: WorkloadFamily, accessor: String, #[source] source: ControlPlaneError },
    #[error("{family}: creating credential: {source}")]
    Create { family: WorkloadFamily, #[source] source: ControlPlaneError },
    #[error("{family}: deleting credential {accessor}: {source}")]
    Delete { family: WorkloadFamily, accessor: String, #[source] source: ControlPlaneError },
    #[error("{family}: writing secret {secret}: {source:#}")]
    SecretWrite { family: WorkloadFamily, secret: String, #[source] source: anyhow::Error },
}

impl FamilyError {
    pub fn family(&self) -> &WorkloadFamily {
        match self {
            FamilyError::SecretRead { family, .. }
            | FamilyError::SecretDecode { family, .. }
            | FamilyError::ReadCredential { family, .. }
            | FamilyError::Create { family, .. }
            | FamilyError::Delete { family, .. }
            | FamilyError::SecretWrite { family, .. } => family,
        }
    }
}

/// Family errors of one pass, in processing order.
#[derive(Debug)]
pub struct FamilyErrors(pub Vec<FamilyError>);

impl fmt::Display for FamilyErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} family(ies) failed to converge", self.0.len())?;
        for e in &self.0 {
            write!(f, "; {}", e)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("listing cluster instances: {0:#}")]
    Inventory(anyhow::Error),
    #[error("listing credentials: {0}")]
    ListCredentials(#[source] ControlPlaneError),
    #[error("{0}")]
    Families(FamilyErrors),
}

impl ReconcileError {
    /// Per-family errors, empty for fatal errors.
    pub fn family_errors(&self) -> &[FamilyError] {
        match self {
            ReconcileError::Families(errs) => &errs.0,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub wanted: usize,
    pub orphaned: usize,
    pub converged: usize,
    pub created: usize,
    pub adopted: usize,
    /// Credentials deleted, duplicates and orphans together.
    pub revoked: usize,
}

impl ReconcileSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Converged { revoked } => { self.converged += 1; self.revoked += revoked; }
            Outcome::Adopted { revoked } => { self.adopted += 1; self.revoked += revoked; }
            Outcome::Created => self.created += 1,
            Outcome::Revoked { credentials } => self.revoked += credentials,
        }
    }
}

pub struct Reconciler {
    control_plane: Arc<dyn ControlPlane>,
    secrets: Arc<dyn SecretStore>,
    inventory: Arc<dyn Inventory>,
    secret_prefix: String,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        secrets: Arc<dyn SecretStore>,
        inventory: Arc<dyn Inventory>,
        secret_prefix: impl Into<String>,
    ) -> Self {
        Self { control_plane, secrets, inventory, secret_prefix: secret_prefix.into(), concurrency: DEFAULT_CONCURRENCY }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Families of every mesh-tagged instance across all pages, first
    /// occurrence first.
    pub async fn want_families(&self) -> Result<Vec<WorkloadFamily>, ReconcileError> {
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        let mut cursor = None;
        let mut pages = 0usize;
        loop {
            let page = self.inventory.list_instances(cursor.take()).await.map_err(ReconcileError::Inventory)?;
            pages += 1;
            for inst in page.instances.into_iter().filter(|i| i.is_mesh_tagged()) {
                let family = inst.family.ok_or_else(|| {
                    ReconcileError::Inventory(anyhow::anyhow!("cannot determine workload family of instance {}", inst.id))
                })?;
                if seen.insert(family.clone()) {
                    out.push(family);
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        debug!(pages, families = out.len(), "inventory listed");
        Ok(out)
    }

    /// Controller-owned credentials grouped by family.
    pub async fn have_families(&self) -> Result<BTreeMap<WorkloadFamily, Vec<Credential>>, ReconcileError> {
        let creds = self.control_plane.list_credentials().await.map_err(ReconcileError::ListCredentials)?;
        let mut have: BTreeMap<WorkloadFamily, Vec<Credential>> = BTreeMap::new();
        for c in creds {
            if let Some(family) = c.owned_family() {
                have.entry(family).or_default().push(c);
            }
        }
        Ok(have)
    }

    /// Upserts for `want` in order, then revokes for families only in `have`.
    pub fn plan(want: &[WorkloadFamily], mut have: BTreeMap<WorkloadFamily, Vec<Credential>>) -> Vec<ReconcileResource> {
        let mut out = Vec::with_capacity(want.len() + have.len());
        for family in want {
            let existing = have.remove(family).unwrap_or_default();
            out.push(ReconcileResource::Upsert(FamilyResource { family: family.clone(), existing }));
        }
        for (family, credentials) in have {
            out.push(ReconcileResource::Revoke(OrphanResource { family, credentials }));
        }
        out
    }

    fn ctx(&self) -> ConvergeCtx<'_> {
        ConvergeCtx {
            control_plane: self.control_plane.as_ref(),
            secrets: self.secrets.as_ref(),
            secret_prefix: &self.secret_prefix,
        }
    }

    /// One full pass. Inventory and credential listing failures abort the
    /// pass; per-family failures are collected into
    /// [`ReconcileError::Families`] after every family was attempted.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, ReconcileError> {
        let started = Instant::now();
        let want = self.want_families().await?;
        let have = self.have_families().await?;
        let plan = Self::plan(&want, have);

        let mut summary = ReconcileSummary { wanted: want.len(), ..Default::default() };
        summary.orphaned = plan.iter().filter(|r| matches!(r, ReconcileResource::Revoke(_))).count();

        let ctx = self.ctx();
        let results: Vec<Result<Outcome, FamilyError>> = stream::iter(plan.iter())
            .map(|r| r.converge(ctx))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut errors = Vec::new();
        for res in results {
            match res {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    warn!(family = %e.family(), error = %e, "family failed to converge");
                    counter!("controller_family_errors_total", 1u64);
                    errors.push(e);
                }
            }
        }
        histogram!("controller_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        if !errors.is_empty() {
            return Err(ReconcileError::Families(FamilyErrors(errors)));
        }
        info!(
            wanted = summary.wanted,
            orphaned = summary.orphaned,
            created = summary.created,
            adopted = summary.adopted,
            revoked = summary.revoked,
            "reconcile pass complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ServiceIdentity;

    fn cred(id: &str, families: &[&str]) -> Credential {
        Credential {
            accessor_id: id.into(),
            service_identities: families
                .iter()
                .map(|f| ServiceIdentity { service_name: f.to_string(), datacenters: vec![] })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn plan_orders_upserts_before_revokes() {
        let want = vec![WorkloadFamily::new("web"), WorkloadFamily::new("api")];
        let mut have = BTreeMap::new();
        have.insert(WorkloadFamily::new("api"), vec![cred("a1", &["api"])]);
        have.insert(WorkloadFamily::new("old"), vec![cred("o1", &["old"]), cred("o2", &["old"])]);
        let plan = Reconciler::plan(&want, have);
        let families: Vec<_> = plan.iter().map(|r| r.family().as_str().to_string()).collect();
        assert_eq!(families, vec!["web", "api", "old"]);
        match &plan[1] {
            ReconcileResource::Upsert(r) => assert_eq!(r.existing.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        match &plan[2] {
            ReconcileResource::Revoke(r) => assert_eq!(r.credentials.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn family_errors_display_lists_each() {
        let errs = FamilyErrors(vec![FamilyError::Create {
            family: "web".into(),
            source: ControlPlaneError::Status { status: 500, body: "boom".into() },
        }]);
        assert_eq!(
            errs.to_string(),
            "1 family(ies) failed to converge; web: creating credential: unexpected response code: 500 (boom)"
        );
    }
}
