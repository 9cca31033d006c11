//! Lease arbiter
//!
//! Commits or rejects a candidate device set atomically. Leases are
//! created in lexicographic (id, slot) order so two reservers racing for
//! overlapping sets resolve on the smallest contested device, which
//! bounds rollback work for the loser.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use gpusched_core::names::node_selector;
use gpusched_core::{DeviceRef, SchedResult};
use gpusched_store::{CreateOutcome, DeleteOutcome, LeaseRecord, LeaseStore, PodRecord};

/// Outcome of one reservation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    /// Every lease is held by the calling pod
    Committed,
    /// Another pod holds `device`; nothing from this call remains
    Conflict { device: DeviceRef },
    /// The store misbehaved; nothing from this call remains
    Transient { message: String },
}

/// Turns proposed device sets into durable reservations
pub struct LeaseArbiter {
    leases: Arc<dyn LeaseStore>,
    rollback_deadline: Duration,
}

impl LeaseArbiter {
    pub fn new(leases: Arc<dyn LeaseStore>, rollback_deadline: Duration) -> Self {
        Self {
            leases,
            rollback_deadline,
        }
    }

    /// Atomically reserve `devices` on `node` for `pod`
    ///
    /// A lease that already belongs to the calling pod UID counts as
    /// created, so re-reserving after a scheduler restart succeeds. On the
    /// first foreign conflict, store error, or deadline expiry, every
    /// lease created by this call is rolled back before returning.
    pub async fn reserve(
        &self,
        node: &str,
        pod: &PodRecord,
        claim: &str,
        devices: &[DeviceRef],
        deadline: Option<Instant>,
    ) -> ReserveOutcome {
        let mut ordered: Vec<DeviceRef> = devices.to_vec();
        ordered.sort();

        let mut created: Vec<LeaseRecord> = Vec::new();
        for device in &ordered {
            let lease = LeaseRecord::for_reservation(node, device, pod, claim);
            let attempt = match deadline {
                Some(at) => match timeout_at(at, self.leases.create(&lease)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            pod = %pod.name,
                            node = node,
                            device = %device,
                            "Reservation ran out of scheduling budget, rolling back"
                        );
                        self.rollback(&created).await;
                        return ReserveOutcome::Transient {
                            message: "scheduling deadline exceeded during reserve".to_string(),
                        };
                    }
                },
                None => self.leases.create(&lease).await,
            };

            match attempt {
                Ok(CreateOutcome::Created) => created.push(lease),
                Ok(CreateOutcome::Exists(existing)) if existing.holder_uid == pod.uid => {
                    debug!(
                        pod = %pod.name,
                        device = %device,
                        "Lease already held by this pod"
                    );
                }
                Ok(CreateOutcome::Exists(existing)) => {
                    debug!(
                        pod = %pod.name,
                        node = node,
                        device = %device,
                        holder = %existing.holder_uid,
                        "Reservation conflict, rolling back"
                    );
                    self.rollback(&created).await;
                    return ReserveOutcome::Conflict {
                        device: device.clone(),
                    };
                }
                Err(e) => {
                    warn!(
                        pod = %pod.name,
                        node = node,
                        device = %device,
                        error = %e,
                        "Lease create failed, rolling back"
                    );
                    self.rollback(&created).await;
                    return ReserveOutcome::Transient {
                        message: e.to_string(),
                    };
                }
            }
        }

        info!(
            pod = %pod.name,
            node = node,
            devices = ?ordered.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Reservation committed"
        );
        ReserveOutcome::Committed
    }

    /// Release the pod's leases for `devices` on `node`
    ///
    /// Missing leases are fine; a lease held by someone else is left
    /// untouched.
    pub async fn release(&self, node: &str, pod: &PodRecord, devices: &[DeviceRef]) {
        let mut ordered: Vec<DeviceRef> = devices.to_vec();
        ordered.sort();

        for device in &ordered {
            let name = gpusched_core::names::lease_name(node, device);
            let existing = match self.leases.get(&pod.namespace, &name).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!(device = %device, "No lease to release");
                    continue;
                }
                Err(e) => {
                    warn!(device = %device, error = %e, "Release lookup failed");
                    continue;
                }
            };
            if existing.holder_uid != pod.uid {
                warn!(
                    device = %device,
                    holder = %existing.holder_uid,
                    pod = %pod.name,
                    "Lease held by another pod, leaving it"
                );
                continue;
            }
            match self
                .leases
                .delete(&pod.namespace, &name, existing.resource_version.as_deref())
                .await
            {
                Ok(DeleteOutcome::Deleted) => debug!(device = %device, "Lease released"),
                Ok(_) => debug!(device = %device, "Lease already gone"),
                Err(e) => warn!(device = %device, error = %e, "Release failed"),
            }
        }
    }

    /// All reservation leases on `node`, across namespaces
    pub async fn enumerate(&self, node: &str) -> SchedResult<Vec<LeaseRecord>> {
        self.leases.list(&node_selector(node)).await
    }

    /// Delete everything this call created, under a detached short
    /// deadline so a cancelled reserve still cleans up after itself
    async fn rollback(&self, created: &[LeaseRecord]) {
        for lease in created.iter().rev() {
            let delete = self.leases.delete(&lease.namespace, &lease.name, None);
            match timeout(self.rollback_deadline, delete).await {
                Ok(Ok(_)) => debug!(lease = %lease.name, "Rolled back lease"),
                Ok(Err(e)) => warn!(lease = %lease.name, error = %e, "Rollback delete failed"),
                Err(_) => warn!(lease = %lease.name, "Rollback delete timed out"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusched_store::memory::MemoryLeaseStore;
    use gpusched_store::PodPhase;
    use std::collections::BTreeMap;

    fn pod(name: &str) -> PodRecord {
        PodRecord {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: uuid::Uuid::new_v4().to_string(),
            node: None,
            scheduler_name: None,
            phase: PodPhase::Pending,
            annotations: BTreeMap::new(),
        }
    }

    fn arbiter(store: Arc<MemoryLeaseStore>) -> LeaseArbiter {
        LeaseArbiter::new(store, Duration::from_secs(2))
    }

    fn exclusive(ids: &[&str]) -> Vec<DeviceRef> {
        ids.iter().map(|id| DeviceRef::exclusive(*id)).collect()
    }

    #[tokio::test]
    async fn test_reserve_commits_all_leases() {
        let store = Arc::new(MemoryLeaseStore::new());
        let arbiter = arbiter(store.clone());
        let owner = pod("train-0");

        let outcome = arbiter
            .reserve("n1", &owner, "train", &exclusive(&["g1", "g0"]), None)
            .await;
        assert_eq!(outcome, ReserveOutcome::Committed);
        assert_eq!(store.len().await, 2);
        for lease in store.all().await {
            assert_eq!(lease.holder_uid, owner.uid);
        }
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_partial_leases() {
        let store = Arc::new(MemoryLeaseStore::new());
        let arbiter = arbiter(store.clone());
        let first = pod("train-0");
        let second = pod("train-1");

        // First pod holds g1; second wants g0..g2 and must end with nothing
        assert_eq!(
            arbiter
                .reserve("n1", &first, "train", &exclusive(&["g1"]), None)
                .await,
            ReserveOutcome::Committed
        );
        let outcome = arbiter
            .reserve("n1", &second, "train", &exclusive(&["g0", "g1", "g2"]), None)
            .await;
        assert_eq!(
            outcome,
            ReserveOutcome::Conflict {
                device: DeviceRef::exclusive("g1")
            }
        );

        let remaining = store.all().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].holder_uid, first.uid);
    }

    #[tokio::test]
    async fn test_racing_reservers_one_winner() {
        let store = Arc::new(MemoryLeaseStore::new());
        let arbiter = Arc::new(arbiter(store.clone()));
        let a = pod("racer-a");
        let b = pod("racer-b");

        let devices_a = exclusive(&["g0", "g1"]);
        let devices_b = exclusive(&["g0", "g1"]);
        let (left, right) = tokio::join!(
            arbiter.reserve("n1", &a, "c", &devices_a, None),
            arbiter.reserve("n1", &b, "c", &devices_b, None),
        );

        let committed = [&left, &right]
            .iter()
            .filter(|o| ***o == ReserveOutcome::Committed)
            .count();
        assert_eq!(committed, 1);
        assert!(matches!(
            if left == ReserveOutcome::Committed { &right } else { &left },
            ReserveOutcome::Conflict { .. }
        ));

        // The loser holds nothing
        let winner_uid = if left == ReserveOutcome::Committed { &a.uid } else { &b.uid };
        for lease in store.all().await {
            assert_eq!(&lease.holder_uid, winner_uid);
        }
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent() {
        let store = Arc::new(MemoryLeaseStore::new());
        let arbiter = arbiter(store.clone());
        let owner = pod("train-0");
        let devices = exclusive(&["g0", "g1"]);

        assert_eq!(
            arbiter.reserve("n1", &owner, "c", &devices, None).await,
            ReserveOutcome::Committed
        );
        // Same pod again, as after a scheduler restart
        assert_eq!(
            arbiter.reserve("n1", &owner, "c", &devices, None).await,
            ReserveOutcome::Committed
        );
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_release_checks_ownership() {
        let store = Arc::new(MemoryLeaseStore::new());
        let arbiter = arbiter(store.clone());
        let owner = pod("train-0");
        let stranger = pod("train-1");
        let devices = exclusive(&["g0"]);

        arbiter.reserve("n1", &owner, "c", &devices, None).await;

        // A different pod cannot release the lease
        arbiter.release("n1", &stranger, &devices).await;
        assert_eq!(store.len().await, 1);

        arbiter.release("n1", &owner, &devices).await;
        assert_eq!(store.len().await, 0);

        // Releasing again is fine
        arbiter.release("n1", &owner, &devices).await;
    }

    #[tokio::test]
    async fn test_shared_slots_do_not_collide() {
        let store = Arc::new(MemoryLeaseStore::new());
        let arbiter = arbiter(store.clone());
        let a = pod("infer-0");
        let b = pod("infer-1");

        assert_eq!(
            arbiter
                .reserve("n1", &a, "c", &[DeviceRef::shared("g0", 0)], None)
                .await,
            ReserveOutcome::Committed
        );
        assert_eq!(
            arbiter
                .reserve("n1", &b, "c", &[DeviceRef::shared("g0", 1)], None)
                .await,
            ReserveOutcome::Committed
        );
        // Same slot is a conflict
        assert_eq!(
            arbiter
                .reserve("n1", &b, "c", &[DeviceRef::shared("g0", 0)], None)
                .await,
            ReserveOutcome::Conflict {
                device: DeviceRef::shared("g0", 0)
            }
        );
    }

    #[tokio::test]
    async fn test_enumerate_scopes_to_node() {
        let store = Arc::new(MemoryLeaseStore::new());
        let arbiter = arbiter(store.clone());
        let owner = pod("train-0");

        arbiter
            .reserve("n1", &owner, "c", &exclusive(&["g0"]), None)
            .await;
        arbiter
            .reserve("n2", &owner, "c", &exclusive(&["g0"]), None)
            .await;

        let on_n1 = arbiter.enumerate("n1").await.unwrap();
        assert_eq!(on_n1.len(), 1);
        assert_eq!(on_n1[0].device(), Some(DeviceRef::exclusive("g0")));
    }
}
