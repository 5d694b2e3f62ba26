//! Inactivity cleaner loop
//!
//! The only component allowed to retire instances the user did not
//! explicitly delete. Each pass lists instances idle past the timeout,
//! deletes their pods, and drops them from the registry. The pod delete
//! comes first: if it fails the registry entry is kept so the next pass
//! retries, which keeps cleanup crash-safe with respect to the cluster.

use crate::instance::InstanceRegistry;
use crate::kubernetes::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Default cadence for cleanup passes
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

pub struct InactivityCleaner {
    registry: Arc<InstanceRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
    timeout: Duration,
}

impl InactivityCleaner {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        orchestrator: Arc<dyn Orchestrator>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            timeout,
        }
    }

    pub async fn run(self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(timeout_secs = self.timeout.as_secs(), "Starting inactivity cleaner");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.cleanup_once().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Stopping inactivity cleaner");
                        break;
                    }
                }
            }
        }
    }

    /// One cleanup pass. A touch that lands after the listing merely widens
    /// the instance's life by one pass.
    pub async fn cleanup_once(&self) {
        let victims = self.registry.list_inactive(self.timeout);
        if victims.is_empty() {
            return;
        }
        info!(count = victims.len(), "Found inactive instances");

        for instance in victims {
            info!(
                instance_id = %instance.instance_id,
                user = %instance.user_id,
                pod = %instance.pod_name,
                "Cleaning up inactive instance"
            );

            if let Err(e) = self.orchestrator.delete_pod(&instance.pod_name).await {
                error!(pod = %instance.pod_name, error = %e, "Failed to delete pod, will retry next pass");
                continue;
            }

            self.registry.delete(&instance.instance_id);
        }
    }
}
