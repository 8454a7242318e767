use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};

use tether_core::{WorkloadFamily, WorkloadInstance};

use crate::{ClusterInstance, InstanceMetadata, InstancePage, Inventory, SecretStore, MESH_TAG_KEY, MESH_TAG_VALUE};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fixed pages served in order. Cursors are `page-{n}`.
#[derive(Default)]
pub struct MockInventory {
    pages: Vec<Vec<ClusterInstance>>,
    fail: Mutex<Option<String>>,
    cursors_seen: Mutex<Vec<Option<String>>>,
}

impl MockInventory {
    pub fn with_pages(pages: Vec<Vec<ClusterInstance>>) -> Self {
        Self { pages, ..Default::default() }
    }

    /// Instance with the mesh tag set.
    pub fn tagged(id: &str, family: &str) -> ClusterInstance {
        let mut tags = BTreeMap::new();
        tags.insert(MESH_TAG_KEY.to_string(), MESH_TAG_VALUE.to_string());
        ClusterInstance { id: id.to_string(), family: Some(WorkloadFamily::new(family)), tags }
    }

    pub fn untagged(id: &str, family: &str) -> ClusterInstance {
        ClusterInstance { id: id.to_string(), family: Some(WorkloadFamily::new(family)), tags: BTreeMap::new() }
    }

    pub fn fail_with(&self, msg: Option<&str>) { *lock(&self.fail) = msg.map(|s| s.to_string()); }

    /// Cursor passed to each call, in order.
    pub fn cursors_seen(&self) -> Vec<Option<String>> { lock(&self.cursors_seen).clone() }
}

#[async_trait::async_trait]
impl Inventory for MockInventory {
    async fn list_instances(&self, cursor: Option<String>) -> Result<InstancePage> {
        lock(&self.cursors_seen).push(cursor.clone());
        if let Some(msg) = lock(&self.fail).clone() {
            return Err(anyhow!(msg));
        }
        let idx = match cursor.as_deref() {
            None => 0,
            Some(c) => c
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| anyhow!("bad cursor {}", c))?,
        };
        let instances = self.pages.get(idx).cloned().unwrap_or_default();
        let next_cursor = if idx + 1 < self.pages.len() { Some(format!("page-{}", idx + 1)) } else { None };
        Ok(InstancePage { instances, next_cursor })
    }
}

#[derive(Default)]
struct SecretState {
    data: BTreeMap<String, Vec<u8>>,
    fail_puts: HashSet<String>,
    fail_gets: HashSet<String>,
    puts: usize,
}

/// In-memory secret store.
#[derive(Default)]
pub struct MockSecretStore {
    state: Mutex<SecretState>,
}

impl MockSecretStore {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, name: &str, value: &[u8]) { lock(&self.state).data.insert(name.to_string(), value.to_vec()); }

    pub fn value(&self, name: &str) -> Option<Vec<u8>> { lock(&self.state).data.get(name).cloned() }

    pub fn names(&self) -> Vec<String> { lock(&self.state).data.keys().cloned().collect() }

    pub fn fail_puts_of(&self, name: &str, fail: bool) {
        let mut s = lock(&self.state);
        if fail { s.fail_puts.insert(name.to_string()); } else { s.fail_puts.remove(name); }
    }

    pub fn fail_gets_of(&self, name: &str) { lock(&self.state).fail_gets.insert(name.to_string()); }

    /// Successful writes so far.
    pub fn puts(&self) -> usize { lock(&self.state).puts }
}

#[async_trait::async_trait]
impl SecretStore for MockSecretStore {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let s = lock(&self.state);
        if s.fail_gets.contains(name) {
            return Err(anyhow!("secret store unavailable: {}", name));
        }
        Ok(s.data.get(name).cloned())
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<()> {
        let mut s = lock(&self.state);
        if s.fail_puts.contains(name) {
            return Err(anyhow!("secret store rejected write: {}", name));
        }
        s.data.insert(name.to_string(), value.to_vec());
        s.puts += 1;
        Ok(())
    }
}

/// Metadata source returning a fixed instance.
pub struct StaticMetadata(pub WorkloadInstance);

#[async_trait::async_trait]
impl InstanceMetadata for StaticMetadata {
    async fn fetch(&self) -> Result<WorkloadInstance> { Ok(self.0.clone()) }
}
