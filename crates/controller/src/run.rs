use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::{ReconcileError, ReconcileSummary, Reconciler};

/// Polling loop around a [`Reconciler`]. Passes never overlap.
pub struct Controller {
    reconciler: Reconciler,
    interval: Duration,
}

impl Controller {
    pub fn new(reconciler: Reconciler, interval: Duration) -> Self {
        Self { reconciler, interval }
    }

    pub fn reconciler(&self) -> &Reconciler { &self.reconciler }

    /// Reconcile now, then every interval until `shutdown` resolves. Failed
    /// passes are logged and the loop keeps going. Returns the number of
    /// passes run.
    pub async fn run<S>(&self, shutdown: S) -> u64
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = 0u64;
        info!(interval = ?self.interval, "controller started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }
            passes += 1;
            let outcome = tokio::select! {
                _ = &mut shutdown => break,
                r = self.reconciler.reconcile() => r,
            };
            log_pass(passes, outcome);
        }
        info!(passes, "controller stopped");
        passes
    }
}

fn log_pass(pass: u64, outcome: Result<ReconcileSummary, ReconcileError>) {
    match outcome {
        Ok(_) => counter!("controller_passes_total", 1u64, "result" => "ok"),
        Err(e) => {
            counter!("controller_passes_total", 1u64, "result" => "error");
            error!(pass, error = %e, "reconcile pass failed");
        }
    }
}
