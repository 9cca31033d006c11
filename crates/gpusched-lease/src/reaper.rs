//! Lease reaper
//!
//! Background loop that reclaims reservation leases whose owning pod has
//! disappeared, finished, or been replaced by a new incarnation under the
//! same name. The reaper never creates leases; a Pending pod without a
//! lease has nothing to reap.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gpusched_core::names::MANAGED_SELECTOR;
use gpusched_store::{DeleteOutcome, LeaseRecord, LeaseStore, PodStore};

/// Reclaims orphaned reservation leases
pub struct LeaseReaper {
    leases: Arc<dyn LeaseStore>,
    pods: Arc<dyn PodStore>,
    period: Duration,
}

impl LeaseReaper {
    pub fn new(leases: Arc<dyn LeaseStore>, pods: Arc<dyn PodStore>, period: Duration) -> Self {
        Self {
            leases,
            pods,
            period,
        }
    }

    /// Run sweeps every period until cancelled
    ///
    /// An in-flight sweep completes before the loop exits; it is not
    /// retried.
    pub async fn run(self, cancel: CancellationToken) {
        info!(period_secs = self.period.as_secs(), "Lease reaper started");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Lease reaper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One pass over every managed lease
    pub async fn sweep(&self) {
        let leases = match self.leases.list(MANAGED_SELECTOR).await {
            Ok(leases) => leases,
            Err(e) => {
                warn!(error = %e, "Reaper failed to list leases");
                return;
            }
        };

        for lease in leases {
            let Some(pod_name) = lease.pod_name().map(str::to_string) else {
                continue;
            };

            let pod = match self.pods.get(&lease.namespace, &pod_name).await {
                Ok(pod) => pod,
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "Reaper failed to get pod");
                    continue;
                }
            };

            match pod {
                None => {
                    self.reap(&lease, "pod missing").await;
                }
                Some(pod) if pod.phase.is_terminal() => {
                    self.reap(&lease, "pod finished").await;
                }
                Some(pod) if pod.uid != lease.holder_uid => {
                    // A new pod incarnation reuses the name; the lease
                    // belongs to the dead one
                    self.reap(&lease, "holder UID mismatch").await;
                }
                Some(_) => {}
            }
        }
    }

    async fn reap(&self, lease: &LeaseRecord, why: &str) {
        match self
            .leases
            .delete(
                &lease.namespace,
                &lease.name,
                lease.resource_version.as_deref(),
            )
            .await
        {
            Ok(DeleteOutcome::Deleted) => {
                info!(lease = %lease.name, reason = why, "Reaped lease");
            }
            Ok(DeleteOutcome::Missing) | Ok(DeleteOutcome::Lost) => {
                debug!(lease = %lease.name, "Lease already handled");
            }
            Err(e) => {
                error!(lease = %lease.name, error = %e, "Reap delete failed");
            }
        }
    }
}
