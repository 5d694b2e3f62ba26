//! Reconciler loop
//!
//! Periodically brings the registry into agreement with the cluster:
//! pods unknown to the registry are adopted (this is how the gateway
//! survives a restart), known pods have their observed status and IP copied
//! in, and registry entries whose pod has vanished are dropped.
//!
//! Deletion uses a two-consecutive-miss rule: an entry absent from a single
//! pod list is only marked, and removed when the next pass misses it again.
//! On the first miss the pod is also probed directly, so a list that raced a
//! fresh create does not even start the two-pass countdown. This is what
//! keeps the reconciler from deleting an instance that was registered
//! moments before its pod became visible.

use crate::instance::{InstanceRegistry, InstanceStatus};
use crate::kubernetes::Orchestrator;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default cadence for reconcile passes
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

pub struct Reconciler {
    registry: Arc<InstanceRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
    /// Instance ids that were missing from the previous pod list
    missing: HashSet<String>,
}

impl Reconciler {
    pub fn new(registry: Arc<InstanceRegistry>, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            registry,
            orchestrator,
            missing: HashSet::new(),
        }
    }

    /// Run until the shutdown channel flips. Errors abort the pass and are
    /// retried on the next tick.
    pub async fn run(mut self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Starting instance reconciler");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sync_once().await {
                        error!(error = %e, "Failed to reconcile instances");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Stopping instance reconciler");
                        break;
                    }
                }
            }
        }
    }

    /// One reconcile pass.
    pub async fn sync_once(&mut self) -> anyhow::Result<()> {
        let observed = self.orchestrator.list_instance_pods().await?;

        let mut seen = HashSet::with_capacity(observed.len());
        for inst in observed {
            seen.insert(inst.instance_id.clone());

            if self.registry.find_by_id(&inst.instance_id).is_some() {
                // Known: copy the observed status and IP. The registry keeps
                // authority over last_active_at.
                self.registry
                    .refresh_status(&inst.instance_id, inst.status, inst.pod_ip.clone());
            } else {
                info!(instance_id = %inst.instance_id, user = %inst.user_id, "Adopting instance from cluster");
                self.registry.save(inst);
            }
        }

        let mut missing_now = HashSet::new();
        for entry in self.registry.list_all() {
            if seen.contains(&entry.instance_id) {
                continue;
            }
            if self.missing.contains(&entry.instance_id) {
                info!(instance_id = %entry.instance_id, "Dropping instance whose pod is gone");
                self.registry.delete(&entry.instance_id);
                continue;
            }
            // First miss: probe the pod directly before starting the
            // countdown, in case the list raced a create.
            match self.orchestrator.get_pod_status(&entry.pod_name).await {
                Ok((status, _)) if status != InstanceStatus::Terminating => {}
                Ok(_) => {
                    missing_now.insert(entry.instance_id);
                }
                Err(e) => {
                    warn!(instance_id = %entry.instance_id, error = %e, "Failed to probe missing pod");
                    missing_now.insert(entry.instance_id);
                }
            }
        }
        self.missing = missing_now;

        Ok(())
    }
}
