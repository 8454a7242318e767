use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tether_core::{CatalogEntry, Credential, CredentialRequest, WorkloadFamily};

use crate::{ControlPlane, ControlPlaneError};

#[derive(Default)]
struct State {
    credentials: BTreeMap<String, Credential>,
    /// Keyed by service id, so repeated registration is an upsert.
    entries: BTreeMap<String, CatalogEntry>,
    register_attempts: usize,
    fail_registrations: usize,
    fail_reads: HashMap<String, u16>,
    fail_deletes: HashMap<String, u16>,
    fail_list: Option<u16>,
    fail_create: Option<u16>,
    next_id: u64,
}

/// In-memory control plane for tests.
#[derive(Default)]
pub struct MockControlPlane {
    state: Mutex<State>,
}

impl MockControlPlane {
    pub fn new() -> Self { Self::default() }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Seed a credential as if it had been created out of band.
    pub fn insert_credential(&self, cred: Credential) {
        self.with(|s| { s.credentials.insert(cred.accessor_id.clone(), cred); });
    }

    /// Seed a credential bound to exactly one service identity.
    pub fn seed_family_credential(&self, family: &str) -> Credential {
        let req = CredentialRequest::for_family(&WorkloadFamily::new(family));
        self.with(|s| mint(s, &req))
    }

    pub fn remove_credential(&self, accessor_id: &str) {
        self.with(|s| { s.credentials.remove(accessor_id); });
    }

    /// The next `n` registrations fail with a 500.
    pub fn fail_next_registrations(&self, n: usize) { self.with(|s| s.fail_registrations = n); }

    pub fn fail_reads_of(&self, accessor_id: &str, status: u16) {
        self.with(|s| { s.fail_reads.insert(accessor_id.to_string(), status); });
    }

    pub fn fail_deletes_of(&self, accessor_id: &str, status: u16) {
        self.with(|s| { s.fail_deletes.insert(accessor_id.to_string(), status); });
    }

    pub fn fail_list(&self, status: Option<u16>) { self.with(|s| s.fail_list = status); }

    pub fn fail_create(&self, status: Option<u16>) { self.with(|s| s.fail_create = status); }

    pub fn credentials(&self) -> Vec<Credential> { self.with(|s| s.credentials.values().cloned().collect()) }

    /// Live credentials owned by `family`.
    pub fn live_for(&self, family: &str) -> Vec<Credential> {
        self.with(|s| {
            s.credentials
                .values()
                .filter(|c| c.owned_family().map(|f| f.as_str() == family).unwrap_or(false))
                .cloned()
                .collect()
        })
    }

    pub fn entries(&self) -> Vec<CatalogEntry> { self.with(|s| s.entries.values().cloned().collect()) }

    pub fn entry(&self, service_id: &str) -> Option<CatalogEntry> { self.with(|s| s.entries.get(service_id).cloned()) }

    pub fn register_attempts(&self) -> usize { self.with(|s| s.register_attempts) }

    pub fn created_total(&self) -> u64 { self.with(|s| s.next_id) }
}

fn mint(s: &mut State, req: &CredentialRequest) -> Credential {
    s.next_id += 1;
    let cred = Credential {
        accessor_id: format!("accessor-{}", s.next_id),
        secret_id: format!("secret-{}", s.next_id),
        description: req.description.clone(),
        service_identities: req.service_identities.clone(),
    };
    s.credentials.insert(cred.accessor_id.clone(), cred.clone());
    cred
}

fn status(code: u16, body: &str) -> ControlPlaneError {
    ControlPlaneError::Status { status: code, body: body.to_string() }
}

#[async_trait::async_trait]
impl ControlPlane for MockControlPlane {
    async fn register(&self, entry: &CatalogEntry) -> Result<(), ControlPlaneError> {
        self.with(|s| {
            s.register_attempts += 1;
            if s.fail_registrations > 0 {
                s.fail_registrations -= 1;
                return Err(status(500, "rpc error: no leader"));
            }
            s.entries.insert(entry.service.id.clone(), entry.clone());
            Ok(())
        })
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, ControlPlaneError> {
        self.with(|s| match s.fail_list {
            Some(code) => Err(status(code, "list failed")),
            None => Ok(s.credentials.values().cloned().collect()),
        })
    }

    async fn create_credential(&self, req: &CredentialRequest) -> Result<Credential, ControlPlaneError> {
        self.with(|s| match s.fail_create {
            Some(code) => Err(status(code, "create failed")),
            None => Ok(mint(s, req)),
        })
    }

    async fn read_credential(&self, accessor_id: &str) -> Result<Credential, ControlPlaneError> {
        self.with(|s| {
            if let Some(code) = s.fail_reads.get(accessor_id) {
                return Err(status(*code, "read failed"));
            }
            s.credentials
                .get(accessor_id)
                .cloned()
                .ok_or_else(|| ControlPlaneError::from_response(403, "ACL not found", &format!("token {}", accessor_id)))
        })
    }

    async fn delete_credential(&self, accessor_id: &str) -> Result<(), ControlPlaneError> {
        self.with(|s| {
            if let Some(code) = s.fail_deletes.get(accessor_id) {
                return Err(status(*code, "delete failed"));
            }
            match s.credentials.remove(accessor_id) {
                Some(_) => Ok(()),
                None => Err(ControlPlaneError::from_response(403, "ACL not found", &format!("token {}", accessor_id))),
            }
        })
    }
}
