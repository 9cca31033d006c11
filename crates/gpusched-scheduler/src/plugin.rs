//! Scheduler plugin phases
//!
//! Orchestrates the node-state cache, selector, and lease arbiter across
//! the filter/score/reserve/permit/unreserve lifecycle. Proposals live in
//! a per-cycle cache keyed by pod UID: written once by filter, read by
//! score and reserve, dropped when the cycle ends.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use gpusched_core::names::{join_allocated, ANNOTATION_ALLOCATED, ANNOTATION_CLAIM};
use gpusched_core::{DeviceRef, SchedResult, SchedulerConfig};
use gpusched_lease::{LeaseArbiter, ReserveOutcome};
use gpusched_store::{ClaimStore, EventSink, PodRecord, PodStore};

use crate::selector::{select, Selection, SelectorResult};
use crate::state::NodeStateCache;

/// Outcome of the filter phase for one node
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// The node can host the pod
    Accept,
    /// The pod carries no claim; this plugin has no opinion
    Skip,
    /// The node cannot host the pod this cycle
    Reject { reason: String },
}

/// Outcome of the reserve phase
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveStatus {
    /// Leases are held and the pod is stamped
    Committed { devices: Vec<DeviceRef> },
    /// Nothing is held; the framework should re-run the cycle
    Retry { reason: String },
}

struct CycleState {
    claim_name: String,
    proposals: HashMap<String, Selection>,
    committed: Option<(String, Vec<DeviceRef>)>,
}

/// The GPU claim scheduler plugin
pub struct GpuPlugin {
    claims: Arc<dyn ClaimStore>,
    pods: Arc<dyn PodStore>,
    events: Arc<dyn EventSink>,
    cache: NodeStateCache,
    arbiter: Arc<LeaseArbiter>,
    config: SchedulerConfig,
    cycles: RwLock<HashMap<String, CycleState>>,
}

impl GpuPlugin {
    pub fn new(
        claims: Arc<dyn ClaimStore>,
        pods: Arc<dyn PodStore>,
        events: Arc<dyn EventSink>,
        cache: NodeStateCache,
        arbiter: Arc<LeaseArbiter>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            claims,
            pods,
            events,
            cache,
            arbiter,
            config,
            cycles: RwLock::new(HashMap::new()),
        }
    }

    /// Filter phase: can `node` host `pod`?
    pub async fn filter(&self, pod: &PodRecord, node: &str) -> SchedResult<FilterOutcome> {
        let Some(claim_name) = pod.annotations.get(ANNOTATION_CLAIM).cloned() else {
            return Ok(FilterOutcome::Skip);
        };

        let Some(claim) = self.claims.get(&pod.namespace, &claim_name).await? else {
            self.events
                .pod_event(pod, "Warning", "ClaimNotFound", &format!("claim {} missing", claim_name))
                .await
                .ok();
            return Ok(FilterOutcome::Reject {
                reason: "claim missing".to_string(),
            });
        };
        if let Err(e) = claim.validate() {
            self.events
                .pod_event(pod, "Warning", "ClaimInvalid", &e.to_string())
                .await
                .ok();
            return Ok(FilterOutcome::Reject {
                reason: e.to_string(),
            });
        }

        let Some(state) = self.cache.snapshot(node).await? else {
            return Ok(FilterOutcome::Reject {
                reason: "no gpu inventory on node".to_string(),
            });
        };

        match select(&claim_name, &claim, &state, &self.config.topology) {
            SelectorResult::Selected(selection) => {
                debug!(
                    pod = %pod.name,
                    node = node,
                    score = selection.score,
                    "Node accepted"
                );
                let mut cycles = self.cycles.write().await;
                let cycle = cycles.entry(pod.uid.clone()).or_insert_with(|| CycleState {
                    claim_name,
                    proposals: HashMap::new(),
                    committed: None,
                });
                cycle.proposals.insert(node.to_string(), selection);
                Ok(FilterOutcome::Accept)
            }
            SelectorResult::Infeasible { kind, detail } => {
                debug!(pod = %pod.name, node = node, kind = %kind, "Node rejected");
                Ok(FilterOutcome::Reject {
                    reason: format!("{}: {}", kind, detail),
                })
            }
        }
    }

    /// Score phase: the stashed proposal's quality, 0 if none
    pub async fn score(&self, pod: &PodRecord, node: &str) -> i64 {
        let cycles = self.cycles.read().await;
        cycles
            .get(&pod.uid)
            .and_then(|c| c.proposals.get(node))
            .map(|s| s.score.round() as i64)
            .unwrap_or(0)
    }

    /// Reserve phase: commit the stashed proposal on `node`
    ///
    /// Store hiccups retry with backoff inside the cycle deadline; a
    /// conflict drops the node's proposal and asks the framework to re-run
    /// the cycle on refreshed state.
    pub async fn reserve(&self, pod: &PodRecord, node: &str) -> SchedResult<ReserveStatus> {
        let (claim_name, selection) = {
            let cycles = self.cycles.read().await;
            let Some(cycle) = cycles.get(&pod.uid) else {
                return Ok(ReserveStatus::Retry {
                    reason: "no proposal for this pod".to_string(),
                });
            };
            let Some(selection) = cycle.proposals.get(node) else {
                return Ok(ReserveStatus::Retry {
                    reason: "no proposal for this node".to_string(),
                });
            };
            (cycle.claim_name.clone(), selection.clone())
        };

        let deadline = Instant::now() + self.config.cycle.deadline();
        let mut backoff = Duration::from_millis(100);
        loop {
            let outcome = self
                .arbiter
                .reserve(node, pod, &claim_name, &selection.devices, Some(deadline))
                .await;
            match outcome {
                ReserveOutcome::Committed => break,
                ReserveOutcome::Conflict { device } => {
                    // The snapshot behind this proposal is stale
                    self.drop_proposal(&pod.uid, node).await;
                    self.events
                        .pod_event(
                            pod,
                            "Warning",
                            "ReserveConflict",
                            &format!("device {} on {} taken by another pod", device, node),
                        )
                        .await
                        .ok();
                    return Ok(ReserveStatus::Retry {
                        reason: format!("device {} already reserved", device),
                    });
                }
                ReserveOutcome::Transient { message } => {
                    if Instant::now() + backoff >= deadline {
                        return Ok(ReserveStatus::Retry { reason: message });
                    }
                    warn!(pod = %pod.name, error = %message, "Reserve hiccup, backing off");
                    sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        let allocated = join_allocated(&selection.devices);
        if let Err(e) = self
            .pods
            .annotate(&pod.namespace, &pod.name, ANNOTATION_ALLOCATED, &allocated)
            .await
        {
            // Committed leases must not outlive a failed stamp
            warn!(pod = %pod.name, error = %e, "Failed to stamp pod, releasing");
            self.arbiter.release(node, pod, &selection.devices).await;
            return Ok(ReserveStatus::Retry {
                reason: format!("failed to stamp allocation: {}", e),
            });
        }

        {
            let mut cycles = self.cycles.write().await;
            if let Some(cycle) = cycles.get_mut(&pod.uid) {
                cycle.committed = Some((node.to_string(), selection.devices.clone()));
            }
        }

        info!(pod = %pod.name, node = node, allocated = %allocated, "Reserved");
        self.events
            .pod_event(
                pod,
                "Normal",
                "Reserved",
                &format!("reserved {} on {}", allocated, node),
            )
            .await
            .ok();
        Ok(ReserveStatus::Committed {
            devices: selection.devices,
        })
    }

    /// Permit phase: reserved for preemption, currently a no-op
    pub async fn permit(&self, _pod: &PodRecord, _node: &str) -> SchedResult<()> {
        Ok(())
    }

    /// Unreserve phase: undo a commit after a later phase failed
    pub async fn unreserve(&self, pod: &PodRecord, node: &str) {
        let committed = {
            let mut cycles = self.cycles.write().await;
            match cycles.remove(&pod.uid) {
                Some(cycle) => cycle.committed,
                None => None,
            }
        };
        let Some((committed_node, devices)) = committed else {
            return;
        };
        if committed_node != node {
            warn!(
                pod = %pod.name,
                committed = %committed_node,
                node = node,
                "Unreserve node differs from committed node"
            );
        }
        info!(pod = %pod.name, node = %committed_node, "Releasing reservation");
        self.arbiter.release(&committed_node, pod, &devices).await;
    }

    /// Forget a pod's cycle after a successful bind
    pub async fn finish(&self, pod_uid: &str) {
        self.cycles.write().await.remove(pod_uid);
    }

    /// Nodes with a published GPU inventory
    pub async fn candidate_nodes(&self) -> SchedResult<Vec<String>> {
        self.cache.nodes().await
    }

    async fn drop_proposal(&self, pod_uid: &str, node: &str) {
        let mut cycles = self.cycles.write().await;
        if let Some(cycle) = cycles.get_mut(pod_uid) {
            cycle.proposals.remove(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusched_core::names::lease_name;
    use gpusched_core::{
        Device, Exclusivity, GpuClaimSpec, GpuNodeStatusSpec, PlacementPolicy,
        TopologyConstraint, TopologyEdge,
    };
    use gpusched_store::memory::{
        MemoryClaimStore, MemoryEventSink, MemoryLeaseStore, MemoryNodeStatusStore,
        MemoryPodStore,
    };
    use gpusched_store::{LeaseStore, PodPhase};
    use std::collections::BTreeMap;

    struct Fixture {
        plugin: GpuPlugin,
        leases: Arc<MemoryLeaseStore>,
        pods: Arc<MemoryPodStore>,
        claims: Arc<MemoryClaimStore>,
        statuses: Arc<MemoryNodeStatusStore>,
        events: Arc<MemoryEventSink>,
        arbiter: Arc<LeaseArbiter>,
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
        let plugin = GpuPlugin::new(
            claims.clone(),
            pods.clone(),
            events.clone(),
            cache,
            arbiter.clone(),
            config,
        );
        Fixture {
            plugin,
            leases,
            pods,
            claims,
            statuses,
            events,
            arbiter,
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

    /// Four devices, all NVLinked
    fn inventory() -> GpuNodeStatusSpec {
        let ids = ["g0", "g1", "g2", "g3"];
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
                    weight: 1.0,
                });
            }
        }
        GpuNodeStatusSpec { devices, edges }
    }

    #[tokio::test]
    async fn test_filter_skips_unclaimed_pod() {
        let f = fixture();
        let pod = pod("plain", None);
        assert_eq!(
            f.plugin.filter(&pod, "n1").await.unwrap(),
            FilterOutcome::Skip
        );
    }

    #[tokio::test]
    async fn test_filter_rejects_missing_claim() {
        let f = fixture();
        let pod = pod("train-0", Some("absent"));
        let outcome = f.plugin.filter(&pod, "n1").await.unwrap();
        assert_eq!(
            outcome,
            FilterOutcome::Reject {
                reason: "claim missing".to_string()
            }
        );
        let events = f.events.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "ClaimNotFound");
    }

    #[tokio::test]
    async fn test_filter_rejects_invalid_claim() {
        let f = fixture();
        f.claims.insert("default", "bad", claim(0)).await;
        let pod = pod("train-0", Some("bad"));
        let outcome = f.plugin.filter(&pod, "n1").await.unwrap();
        assert!(matches!(outcome, FilterOutcome::Reject { .. }));
        assert_eq!(f.events.events().await[0].reason, "ClaimInvalid");
    }

    #[tokio::test]
    async fn test_filter_rejects_node_without_inventory() {
        let f = fixture();
        f.claims.insert("default", "train", claim(1)).await;
        let pod = pod("train-0", Some("train"));
        let outcome = f.plugin.filter(&pod, "bare-node").await.unwrap();
        assert_eq!(
            outcome,
            FilterOutcome::Reject {
                reason: "no gpu inventory on node".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_single_gpu_reserve_stamps_pod() {
        let f = fixture();
        f.statuses.insert("n1", inventory()).await;
        f.claims.insert("default", "train", claim(1)).await;
        let pod = pod("train-0", Some("train"));
        f.pods.insert(pod.clone()).await;

        assert_eq!(
            f.plugin.filter(&pod, "n1").await.unwrap(),
            FilterOutcome::Accept
        );
        assert_eq!(f.plugin.score(&pod, "n1").await, 100);

        let status = f.plugin.reserve(&pod, "n1").await.unwrap();
        assert_eq!(
            status,
            ReserveStatus::Committed {
                devices: vec![DeviceRef::exclusive("g0")]
            }
        );

        let stamped = f.pods.get("default", "train-0").await.unwrap().unwrap();
        assert_eq!(
            stamped.annotations.get(ANNOTATION_ALLOCATED).map(String::as_str),
            Some("g0")
        );
        assert_eq!(f.leases.len().await, 1);
        assert!(f
            .leases
            .get("default", &lease_name("n1", &DeviceRef::exclusive("g0")))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_score_without_proposal_is_zero() {
        let f = fixture();
        let pod = pod("train-0", Some("train"));
        assert_eq!(f.plugin.score(&pod, "n1").await, 0);
    }

    #[tokio::test]
    async fn test_stale_proposal_conflicts_then_retries() {
        let f = fixture();
        f.statuses.insert("n1", inventory()).await;
        f.claims.insert("default", "train", claim(1)).await;
        let victim = pod("train-0", Some("train"));
        f.pods.insert(victim.clone()).await;

        assert_eq!(
            f.plugin.filter(&victim, "n1").await.unwrap(),
            FilterOutcome::Accept
        );

        // Another pod grabs g0 between filter and reserve
        let thief = pod("thief", None);
        f.arbiter
            .reserve("n1", &thief, "other", &[DeviceRef::exclusive("g0")], None)
            .await;

        let status = f.plugin.reserve(&victim, "n1").await.unwrap();
        assert!(matches!(status, ReserveStatus::Retry { .. }));
        // The victim holds nothing
        for lease in f.leases.all().await {
            assert_eq!(lease.holder_uid, thief.uid);
        }

        // A fresh cycle sees g0 taken and proposes g1
        assert_eq!(
            f.plugin.filter(&victim, "n1").await.unwrap(),
            FilterOutcome::Accept
        );
        let status = f.plugin.reserve(&victim, "n1").await.unwrap();
        assert_eq!(
            status,
            ReserveStatus::Committed {
                devices: vec![DeviceRef::exclusive("g1")]
            }
        );
    }

    #[tokio::test]
    async fn test_unreserve_releases_committed_leases() {
        let f = fixture();
        f.statuses.insert("n1", inventory()).await;
        f.claims.insert("default", "train", claim(2)).await;
        let pod = pod("train-0", Some("train"));
        f.pods.insert(pod.clone()).await;

        f.plugin.filter(&pod, "n1").await.unwrap();
        f.plugin.reserve(&pod, "n1").await.unwrap();
        assert_eq!(f.leases.len().await, 2);

        f.plugin.unreserve(&pod, "n1").await;
        assert_eq!(f.leases.len().await, 0);

        // A second unreserve has nothing to do
        f.plugin.unreserve(&pod, "n1").await;
    }

    #[tokio::test]
    async fn test_unreserve_without_commit_is_noop() {
        let f = fixture();
        let pod = pod("train-0", Some("train"));
        f.plugin.unreserve(&pod, "n1").await;
        assert_eq!(f.leases.len().await, 0);
    }
}
