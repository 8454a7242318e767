//! Background discovery of a healthy control-plane server.
//!
//! A [`Watcher`] owns one spawned task that periodically confirms the current
//! server is healthy and otherwise picks a new one from the configured hosts.
//! The latest [`ServerSnapshot`] is published through a single-slot
//! `ArcSwapOption`; readers wait on an epoch `watch` channel.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use metrics::counter;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ControlPlaneError;

/// A healthy server plus the ACL token obtained from it, if login is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub address: SocketAddr,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginParams {
    pub method: String,
    pub bearer_token: String,
    pub datacenter: Option<String>,
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// DNS names or IP literals.
    pub hosts: Vec<String>,
    pub port: u16,
    pub refresh: Duration,
    pub login: Option<LoginParams>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no healthy server after {waited:?}: {last_error}")]
    Timeout { waited: Duration, last_error: String },
    #[error("discovery stopped before a server was found: {last_error}")]
    Stopped { last_error: String },
}

#[async_trait::async_trait]
pub trait ServerProbe: Send + Sync {
    async fn check(&self, addr: SocketAddr) -> Result<(), ControlPlaneError>;

    /// Exchange the bearer token for an ACL token.
    async fn login(&self, addr: SocketAddr, params: &LoginParams) -> Result<String, ControlPlaneError>;
}

struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    fn cancel(&mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// Scoped handle on the discovery task. Dropping it cancels the task.
pub struct Watcher {
    snap: Arc<ArcSwapOption<ServerSnapshot>>,
    last_error: Arc<ArcSwapOption<String>>,
    epoch_rx: watch::Receiver<u64>,
    cancel: CancelHandle,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Spawn the refresh loop. The first round runs immediately.
    pub fn spawn(settings: DiscoverySettings, probe: Arc<dyn ServerProbe>) -> Self {
        let snap = Arc::new(ArcSwapOption::<ServerSnapshot>::empty());
        let last_error = Arc::new(ArcSwapOption::<String>::empty());
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let snap_task = Arc::clone(&snap);
        let err_task = Arc::clone(&last_error);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.refresh);
            let mut epoch = 0u64;
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = ticker.tick() => {}
                }
                let current = snap_task.load_full();
                let round = tokio::select! {
                    _ = &mut cancel_rx => break,
                    r = refresh(&settings, probe.as_ref(), current.as_deref()) => r,
                };
                match round {
                    Ok(Some(next)) => {
                        info!(server = %next.address, login = next.token.is_some(), "control plane server selected");
                        counter!("discovery_server_changes_total", 1u64);
                        snap_task.store(Some(Arc::new(next)));
                        err_task.store(None);
                        epoch += 1;
                        let _ = epoch_tx.send(epoch);
                    }
                    Ok(None) => debug!("current server still healthy"),
                    Err(e) => {
                        warn!(error = %e, "no healthy control plane server");
                        err_task.store(Some(Arc::new(e)));
                    }
                }
            }
            debug!("discovery loop stopped");
        });

        Self { snap, last_error, epoch_rx, cancel: CancelHandle { tx: Some(cancel_tx) }, task: Some(task) }
    }

    pub fn current(&self) -> Option<Arc<ServerSnapshot>> { self.snap.load_full() }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    fn last_error(&self) -> String {
        self.last_error.load_full().map(|e| e.as_ref().clone()).unwrap_or_else(|| "no attempt finished".into())
    }

    /// Block until the first snapshot is available or `timeout` elapses.
    pub async fn first_snapshot(&self, timeout: Duration) -> Result<Arc<ServerSnapshot>, DiscoveryError> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.epoch_rx.clone();
        loop {
            if let Some(s) = self.current() {
                return Ok(s);
            }
            let rem = deadline.saturating_duration_since(Instant::now());
            if rem.is_zero() {
                return Err(DiscoveryError::Timeout { waited: timeout, last_error: self.last_error() });
            }
            match tokio::time::timeout(rem, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(DiscoveryError::Stopped { last_error: self.last_error() }),
                Err(_) => return Err(DiscoveryError::Timeout { waited: timeout, last_error: self.last_error() }),
            }
        }
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One discovery round. `Ok(None)` keeps the current snapshot.
async fn refresh(
    settings: &DiscoverySettings,
    probe: &dyn ServerProbe,
    current: Option<&ServerSnapshot>,
) -> Result<Option<ServerSnapshot>, String> {
    if let Some(cur) = current {
        match probe.check(cur.address).await {
            Ok(()) => return Ok(None),
            Err(e) => warn!(server = %cur.address, error = %e, "current server failed health check"),
        }
    }
    let candidates = resolve(&settings.hosts, settings.port).await;
    if candidates.is_empty() {
        return Err(format!("no addresses resolved for {:?}", settings.hosts));
    }
    let mut last_error = String::new();
    for addr in candidates {
        if let Err(e) = probe.check(addr).await {
            debug!(server = %addr, error = %e, "server unhealthy");
            last_error = format!("{}: {}", addr, e);
            continue;
        }
        // The ACL token is cluster-wide; a server switch keeps it.
        let token = match (current.and_then(|c| c.token.clone()), &settings.login) {
            (Some(t), _) => Some(t),
            (None, Some(params)) => match probe.login(addr, params).await {
                Ok(t) => Some(t),
                Err(e) => {
                    last_error = format!("login at {}: {}", addr, e);
                    continue;
                }
            },
            (None, None) => None,
        };
        return Ok(Some(ServerSnapshot { address: addr, token }));
    }
    Err(last_error)
}

async fn resolve(hosts: &[String], port: u16) -> Vec<SocketAddr> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for host in hosts {
        if let Ok(ip) = host.parse::<IpAddr>() {
            let addr = SocketAddr::new(ip, port);
            if seen.insert(addr) { out.push(addr); }
            continue;
        }
        match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(addrs) => {
                for addr in addrs {
                    if seen.insert(addr) { out.push(addr); }
                }
            }
            Err(e) => warn!(%host, error = %e, "resolving control plane host failed"),
        }
    }
    out
}

#[derive(Default)]
struct ProbeState {
    healthy: HashSet<SocketAddr>,
    token: Option<String>,
    fail_login: bool,
    checks: usize,
    logins: usize,
}

/// Scriptable probe for tests: only addresses marked healthy pass.
#[derive(Default)]
pub struct MockProbe {
    state: Mutex<ProbeState>,
}

impl MockProbe {
    pub fn new() -> Self { Self::default() }

    fn with<R>(&self, f: impl FnOnce(&mut ProbeState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn set_healthy(&self, addr: SocketAddr, healthy: bool) {
        self.with(|s| { if healthy { s.healthy.insert(addr); } else { s.healthy.remove(&addr); } });
    }

    pub fn set_login_token(&self, token: &str) { self.with(|s| s.token = Some(token.to_string())); }

    pub fn fail_login(&self, fail: bool) { self.with(|s| s.fail_login = fail); }

    pub fn checks(&self) -> usize { self.with(|s| s.checks) }

    pub fn logins(&self) -> usize { self.with(|s| s.logins) }
}

#[async_trait::async_trait]
impl ServerProbe for MockProbe {
    async fn check(&self, addr: SocketAddr) -> Result<(), ControlPlaneError> {
        self.with(|s| {
            s.checks += 1;
            if s.healthy.contains(&addr) {
                Ok(())
            } else {
                Err(ControlPlaneError::Status { status: 503, body: "unhealthy".into() })
            }
        })
    }

    async fn login(&self, _addr: SocketAddr, _params: &LoginParams) -> Result<String, ControlPlaneError> {
        self.with(|s| {
            s.logins += 1;
            if s.fail_login {
                return Err(ControlPlaneError::Status { status: 403, body: "Permission denied".into() });
            }
            Ok(s.token.clone().unwrap_or_else(|| "login-token".into()))
        })
    }
}
