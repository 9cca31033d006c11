//! Scheduling cycle driver
//!
//! Runs one pod through filter, score, reserve, and bind against every
//! node with a published GPU inventory. The stock scheduler framework
//! would drive these phases itself; this driver is the compact stand-in
//! that makes the daemon a complete scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use gpusched_core::names::ANNOTATION_CLAIM;
use gpusched_core::SchedResult;
use gpusched_store::{EventSink, PodRecord, PodStore};

use crate::plugin::{FilterOutcome, GpuPlugin, ReserveStatus};

/// Result of one pod's scheduling cycle
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// The pod is bound
    Scheduled { node: String },
    /// No node could take the pod this cycle; reasons per rejected node
    Unschedulable { reasons: BTreeMap<String, String> },
    /// The pod carries no claim; not ours to place
    Skipped,
}

/// Drives pods through the plugin phases
pub struct Framework {
    plugin: Arc<GpuPlugin>,
    pods: Arc<dyn PodStore>,
    events: Arc<dyn EventSink>,
    reserve_retries: u32,
}

impl Framework {
    pub fn new(
        plugin: Arc<GpuPlugin>,
        pods: Arc<dyn PodStore>,
        events: Arc<dyn EventSink>,
        reserve_retries: u32,
    ) -> Self {
        Self {
            plugin,
            pods,
            events,
            reserve_retries,
        }
    }

    /// Run one pod through a full scheduling cycle
    ///
    /// Reservation conflicts re-run the cycle on refreshed snapshots, up
    /// to the retry budget; a bind failure releases the reservation and
    /// surfaces the error.
    pub async fn schedule_one(&self, pod: &PodRecord) -> SchedResult<ScheduleOutcome> {
        if !pod.annotations.contains_key(ANNOTATION_CLAIM) {
            return Ok(ScheduleOutcome::Skipped);
        }

        let mut reasons = BTreeMap::new();
        for attempt in 0..=self.reserve_retries {
            reasons.clear();
            let nodes = self.plugin.candidate_nodes().await?;
            if nodes.is_empty() {
                break;
            }

            let mut accepted: Vec<(String, i64)> = Vec::new();
            for node in &nodes {
                match self.plugin.filter(pod, node).await? {
                    FilterOutcome::Accept => {
                        let score = self.plugin.score(pod, node).await;
                        accepted.push((node.clone(), score));
                    }
                    FilterOutcome::Skip => return Ok(ScheduleOutcome::Skipped),
                    FilterOutcome::Reject { reason } => {
                        reasons.insert(node.clone(), reason);
                    }
                }
            }

            if accepted.is_empty() {
                break;
            }
            // Highest score wins; ties go to the first node name
            accepted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            let (best, score) = &accepted[0];
            debug!(pod = %pod.name, node = %best, score = score, attempt = attempt, "Node chosen");

            match self.plugin.reserve(pod, best).await? {
                ReserveStatus::Committed { .. } => {
                    if let Err(e) = self.pods.bind(&pod.namespace, &pod.name, best).await {
                        warn!(pod = %pod.name, node = %best, error = %e, "Bind failed");
                        self.plugin.unreserve(pod, best).await;
                        return Err(e);
                    }
                    self.plugin.finish(&pod.uid).await;
                    info!(pod = %pod.name, node = %best, "Pod scheduled");
                    self.events
                        .pod_event(
                            pod,
                            "Normal",
                            "Scheduled",
                            &format!("assigned to {}", best),
                        )
                        .await
                        .ok();
                    return Ok(ScheduleOutcome::Scheduled { node: best.clone() });
                }
                ReserveStatus::Retry { reason } => {
                    debug!(pod = %pod.name, node = %best, reason = %reason, "Re-running cycle");
                    reasons.insert(best.clone(), reason);
                }
            }
        }

        let summary = if reasons.is_empty() {
            "no nodes with gpu inventory".to_string()
        } else {
            reasons
                .iter()
                .map(|(node, reason)| format!("{}: {}", node, reason))
                .collect::<Vec<_>>()
                .join("; ")
        };
        self.events
            .pod_event(pod, "Warning", "FailedScheduling", &summary)
            .await
            .ok();
        Ok(ScheduleOutcome::Unschedulable { reasons })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusched_core::names::ANNOTATION_ALLOCATED;
    use gpusched_core::{
        Device, Exclusivity, GpuClaimSpec, GpuNodeStatusSpec, PlacementPolicy, SchedulerConfig,
        TopologyConstraint, TopologyEdge, TopologyMode,
    };
    use gpusched_lease::{LeaseArbiter, LeaseReaper};
    use gpusched_store::memory::{
        MemoryClaimStore, MemoryEventSink, MemoryLeaseStore, MemoryNodeStatusStore,
        MemoryPodStore,
    };
    use gpusched_store::{LeaseRecord, PodPhase};
    use crate::state::NodeStateCache;
    use gpusched_core::DeviceRef;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        framework: Framework,
        leases: Arc<MemoryLeaseStore>,
        pods: Arc<MemoryPodStore>,
        claims: Arc<MemoryClaimStore>,
        statuses: Arc<MemoryNodeStatusStore>,
    }

    fn fixture() -> Fixture {
        let leases = Arc::new(MemoryLeaseStore::new());
        let pods = Arc::new(MemoryPodStore::new());
        let claims = Arc::new(MemoryClaimStore::new());
        let statuses = Arc::new(MemoryNodeStatusStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let config = SchedulerConfig::default();
        let arbiter = Arc::new(LeaseArbiter::new(
            leases.clone(),
            config.cycle.rollback_deadline(),
        ));
        let cache = NodeStateCache::new(
            statuses.clone(),
            arbiter.clone(),
            config.shares.default_slots,
        );
        let retries = config.cycle.reserve_retries;
        let plugin = Arc::new(GpuPlugin::new(
            claims.clone(),
            pods.clone(),
            events.clone(),
            cache,
            arbiter,
            config,
        ));
        let framework = Framework::new(plugin, pods.clone(), events, retries);
        Fixture {
            framework,
            leases,
            pods,
            claims,
            statuses,
        }
    }

    fn pod(name: &str, claim: Option<&str>) -> PodRecord {
        let mut annotations = BTreeMap::new();
        if let Some(claim) = claim {
            annotations.insert(ANNOTATION_CLAIM.to_string(), claim.to_string());
        }
        PodRecord {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: uuid::Uuid::new_v4().to_string(),
            node: None,
            scheduler_name: None,
            phase: PodPhase::Pending,
            annotations,
        }
    }

    fn claim(count: u32) -> GpuClaimSpec {
        GpuClaimSpec {
            count,
            policy: PlacementPolicy::Any,
            exclusivity: Exclusivity::Exclusive,
            topology: TopologyConstraint::default(),
            device_ids: None,
        }
    }

    fn meshed_inventory(ids: &[&str], weight: f64) -> GpuNodeStatusSpec {
        let devices = ids
            .iter()
            .map(|id| Device {
                id: id.to_string(),
                model: "H100".to_string(),
                healthy: true,
                total_shares: 0,
            })
            .collect();
        let mut edges = Vec::new();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                edges.push(TopologyEdge {
                    a: a.to_string(),
                    b: b.to_string(),
                    weight,
                });
            }
        }
        GpuNodeStatusSpec { devices, edges }
    }

    #[tokio::test]
    async fn test_schedules_and_binds() {
        let f = fixture();
        f.statuses
            .insert("n1", meshed_inventory(&["g0", "g1", "g2", "g3"], 1.0))
            .await;
        f.claims.insert("default", "train", claim(1)).await;
        let pod = pod("train-0", Some("train"));
        f.pods.insert(pod.clone()).await;

        let outcome = f.framework.schedule_one(&pod).await.unwrap();
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                node: "n1".to_string()
            }
        );

        let bound = f.pods.get("default", "train-0").await.unwrap().unwrap();
        assert_eq!(bound.node.as_deref(), Some("n1"));
        assert_eq!(
            bound.annotations.get(ANNOTATION_ALLOCATED).map(String::as_str),
            Some("g0")
        );
        assert_eq!(f.leases.len().await, 1);
    }

    #[tokio::test]
    async fn test_pod_without_claim_is_skipped() {
        let f = fixture();
        let pod = pod("plain", None);
        assert_eq!(
            f.framework.schedule_one(&pod).await.unwrap(),
            ScheduleOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_prefers_better_connected_node() {
        let f = fixture();
        // n1 is an NVLink mesh, n2 has no interconnect worth scoring
        f.statuses
            .insert("n1", meshed_inventory(&["g0", "g1"], 1.0))
            .await;
        f.statuses
            .insert("n2", meshed_inventory(&["g0", "g1"], 0.1))
            .await;
        f.claims.insert("default", "train", claim(2)).await;
        let pod = pod("train-0", Some("train"));
        f.pods.insert(pod.clone()).await;

        let outcome = f.framework.schedule_one(&pod).await.unwrap();
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                node: "n1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_contiguous_required_rejects_broken_node() {
        let f = fixture();
        // n1's mesh is too slow to form a high-bandwidth component
        f.statuses
            .insert("n1", meshed_inventory(&["g0", "g1", "g2", "g3"], 0.5))
            .await;
        f.claims
            .insert(
                "default",
                "tight",
                GpuClaimSpec {
                    policy: PlacementPolicy::Contiguous,
                    topology: TopologyConstraint {
                        mode: TopologyMode::Required,
                    },
                    ..claim(4)
                },
            )
            .await;
        let pod = pod("train-0", Some("tight"));
        f.pods.insert(pod.clone()).await;

        let outcome = f.framework.schedule_one(&pod).await.unwrap();
        match outcome {
            ScheduleOutcome::Unschedulable { reasons } => {
                assert!(reasons["n1"].starts_with("NoContiguousGroup"));
            }
            other => panic!("expected unschedulable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_racing_pods_get_disjoint_devices() {
        let f = fixture();
        f.statuses
            .insert("n1", meshed_inventory(&["g0", "g1", "g2", "g3"], 1.0))
            .await;
        f.claims.insert("default", "pair", claim(2)).await;
        let a = pod("racer-a", Some("pair"));
        let b = pod("racer-b", Some("pair"));
        f.pods.insert(a.clone()).await;
        f.pods.insert(b.clone()).await;

        let (left, right) = tokio::join!(
            f.framework.schedule_one(&a),
            f.framework.schedule_one(&b)
        );
        assert_eq!(
            left.unwrap(),
            ScheduleOutcome::Scheduled {
                node: "n1".to_string()
            }
        );
        assert_eq!(
            right.unwrap(),
            ScheduleOutcome::Scheduled {
                node: "n1".to_string()
            }
        );

        // Between them the pods hold all four devices exactly once
        let leases = f.leases.all().await;
        assert_eq!(leases.len(), 4);
        let mut devices: Vec<String> =
            leases.iter().map(|l| l.device().unwrap().id).collect();
        devices.sort();
        assert_eq!(devices, vec!["g0", "g1", "g2", "g3"]);
        let a_holds = leases.iter().filter(|l| l.holder_uid == a.uid).count();
        let b_holds = leases.iter().filter(|l| l.holder_uid == b.uid).count();
        assert_eq!((a_holds, b_holds), (2, 2));
    }

    #[tokio::test]
    async fn test_oversubscribed_node_rejects_second_pod() {
        let f = fixture();
        f.statuses
            .insert("n1", meshed_inventory(&["g0", "g1"], 1.0))
            .await;
        f.claims.insert("default", "both", claim(2)).await;
        let first = pod("first", Some("both"));
        let second = pod("second", Some("both"));
        f.pods.insert(first.clone()).await;
        f.pods.insert(second.clone()).await;

        assert!(matches!(
            f.framework.schedule_one(&first).await.unwrap(),
            ScheduleOutcome::Scheduled { .. }
        ));
        match f.framework.schedule_one(&second).await.unwrap() {
            ScheduleOutcome::Unschedulable { reasons } => {
                assert!(reasons["n1"].starts_with("NotEnoughFree"));
            }
            other => panic!("expected unschedulable, got {:?}", other),
        }
        // The loser holds nothing
        for lease in f.leases.all().await {
            assert_eq!(lease.holder_uid, first.uid);
        }
    }

    #[tokio::test]
    async fn test_reaped_lease_frees_device_for_new_claim() {
        let f = fixture();
        f.statuses
            .insert("n1", meshed_inventory(&["g0", "g1", "g2", "g3"], 1.0))
            .await;
        f.claims.insert("default", "all", claim(4)).await;

        // A dead pod's lease still pins g2
        let victim = pod("victim", None);
        f.leases
            .insert(LeaseRecord::for_reservation(
                "n1",
                &DeviceRef::exclusive("g2"),
                &victim,
                "old",
            ))
            .await;

        let fresh = pod("train-0", Some("all"));
        f.pods.insert(fresh.clone()).await;
        assert!(matches!(
            f.framework.schedule_one(&fresh).await.unwrap(),
            ScheduleOutcome::Unschedulable { .. }
        ));

        // The reaper clears the orphan, then scheduling succeeds
        let reaper = LeaseReaper::new(f.leases.clone(), f.pods.clone(), Duration::from_secs(30));
        reaper.sweep().await;
        assert_eq!(
            f.framework.schedule_one(&fresh).await.unwrap(),
            ScheduleOutcome::Scheduled {
                node: "n1".to_string()
            }
        );
        assert_eq!(f.leases.len().await, 4);
    }
}
