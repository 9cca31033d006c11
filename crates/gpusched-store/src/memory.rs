//! In-memory store fakes
//!
//! Back every capability trait with tokio-guarded maps so the arbiter,
//! reaper, cache, and plugin test without a cluster. Create observes the
//! same create-if-not-exists semantics as the API server, including
//! resource versions for delete preconditions.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use gpusched_core::{GpuClaimSpec, GpuNodeStatusSpec, SchedResult};
use tokio::sync::RwLock;

use crate::traits::{
    ClaimStore, CreateOutcome, DeleteOutcome, EventSink, LeaseRecord, LeaseStore, NodeStatusStore,
    PodRecord, PodStore,
};

/// Whether `labels` satisfies a comma-joined `key=value` selector
fn matches_selector(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => false,
        })
}

/// In-memory lease storage
#[derive(Default)]
pub struct MemoryLeaseStore {
    inner: RwLock<LeaseMap>,
}

#[derive(Default)]
struct LeaseMap {
    leases: HashMap<(String, String), LeaseRecord>,
    next_version: u64,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leases held, for test assertions
    pub async fn len(&self) -> usize {
        self.inner.read().await.leases.len()
    }

    /// All leases, for test assertions
    pub async fn all(&self) -> Vec<LeaseRecord> {
        self.inner.read().await.leases.values().cloned().collect()
    }

    /// Seed a lease directly, bypassing create semantics
    pub async fn insert(&self, lease: LeaseRecord) {
        let mut inner = self.inner.write().await;
        inner.next_version += 1;
        let mut lease = lease;
        lease.resource_version = Some(inner.next_version.to_string());
        inner
            .leases
            .insert((lease.namespace.clone(), lease.name.clone()), lease);
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn create(&self, lease: &LeaseRecord) -> SchedResult<CreateOutcome> {
        let mut inner = self.inner.write().await;
        let key = (lease.namespace.clone(), lease.name.clone());
        if let Some(existing) = inner.leases.get(&key) {
            return Ok(CreateOutcome::Exists(existing.clone()));
        }
        inner.next_version += 1;
        let mut stored = lease.clone();
        stored.resource_version = Some(inner.next_version.to_string());
        inner.leases.insert(key, stored);
        Ok(CreateOutcome::Created)
    }

    async fn get(&self, namespace: &str, name: &str) -> SchedResult<Option<LeaseRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .leases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> SchedResult<DeleteOutcome> {
        let mut inner = self.inner.write().await;
        let key = (namespace.to_string(), name.to_string());
        let Some(existing) = inner.leases.get(&key) else {
            return Ok(DeleteOutcome::Missing);
        };
        if let Some(expected) = resource_version {
            if existing.resource_version.as_deref() != Some(expected) {
                return Ok(DeleteOutcome::Lost);
            }
        }
        inner.leases.remove(&key);
        Ok(DeleteOutcome::Deleted)
    }

    async fn list(&self, selector: &str) -> SchedResult<Vec<LeaseRecord>> {
        let inner = self.inner.read().await;
        let mut leases: Vec<LeaseRecord> = inner
            .leases
            .values()
            .filter(|l| matches_selector(selector, &l.labels))
            .cloned()
            .collect();
        leases.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(leases)
    }
}

/// In-memory pod storage
#[derive(Default)]
pub struct MemoryPodStore {
    pods: RwLock<HashMap<(String, String), PodRecord>>,
}

impl MemoryPodStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pod
    pub async fn insert(&self, pod: PodRecord) {
        self.pods
            .write()
            .await
            .insert((pod.namespace.clone(), pod.name.clone()), pod);
    }

    /// Remove a pod, as deletion from the cluster would
    pub async fn remove(&self, namespace: &str, name: &str) {
        self.pods
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl PodStore for MemoryPodStore {
    async fn get(&self, namespace: &str, name: &str) -> SchedResult<Option<PodRecord>> {
        let pods = self.pods.read().await;
        Ok(pods.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn annotate(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> SchedResult<()> {
        let mut pods = self.pods.write().await;
        if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
            pod.annotations.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn bind(&self, namespace: &str, name: &str, node: &str) -> SchedResult<()> {
        let mut pods = self.pods.write().await;
        if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
            pod.node = Some(node.to_string());
        }
        Ok(())
    }
}

/// In-memory claim storage
#[derive(Default)]
pub struct MemoryClaimStore {
    claims: RwLock<HashMap<(String, String), GpuClaimSpec>>,
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a claim
    pub async fn insert(&self, namespace: &str, name: &str, spec: GpuClaimSpec) {
        self.claims
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), spec);
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn get(&self, namespace: &str, name: &str) -> SchedResult<Option<GpuClaimSpec>> {
        let claims = self.claims.read().await;
        Ok(claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

/// In-memory node inventory
#[derive(Default)]
pub struct MemoryNodeStatusStore {
    nodes: RwLock<BTreeMap<String, GpuNodeStatusSpec>>,
}

impl MemoryNodeStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an inventory, as the node agent would
    pub async fn insert(&self, node: &str, spec: GpuNodeStatusSpec) {
        self.nodes.write().await.insert(node.to_string(), spec);
    }
}

#[async_trait]
impl NodeStatusStore for MemoryNodeStatusStore {
    async fn snapshot(&self, node: &str) -> SchedResult<Option<GpuNodeStatusSpec>> {
        Ok(self.nodes.read().await.get(node).cloned())
    }

    async fn node_names(&self) -> SchedResult<Vec<String>> {
        Ok(self.nodes.read().await.keys().cloned().collect())
    }
}

/// One recorded pod event
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub pod: String,
    pub event_type: String,
    pub reason: String,
    pub message: String,
}

/// In-memory event sink
#[derive(Default)]
pub struct MemoryEventSink {
    events: RwLock<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, for test assertions
    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn pod_event(
        &self,
        pod: &PodRecord,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> SchedResult<()> {
        self.events.write().await.push(RecordedEvent {
            pod: pod.name.clone(),
            event_type: event_type.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusched_core::names::node_selector;
    use gpusched_core::DeviceRef;
    use crate::traits::PodPhase;

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

    #[tokio::test]
    async fn test_create_if_not_exists() {
        let store = MemoryLeaseStore::new();
        let owner = pod("train-0");
        let lease = LeaseRecord::for_reservation("n1", &DeviceRef::exclusive("g0"), &owner, "c");

        assert_eq!(store.create(&lease).await.unwrap(), CreateOutcome::Created);
        match store.create(&lease).await.unwrap() {
            CreateOutcome::Exists(existing) => assert_eq!(existing.holder_uid, owner.uid),
            other => panic!("expected Exists, got {:?}", other),
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_precondition() {
        let store = MemoryLeaseStore::new();
        let owner = pod("train-0");
        let lease = LeaseRecord::for_reservation("n1", &DeviceRef::exclusive("g0"), &owner, "c");
        store.create(&lease).await.unwrap();

        let stored = store.get("default", &lease.name).await.unwrap().unwrap();
        assert_eq!(
            store
                .delete("default", &lease.name, Some("stale"))
                .await
                .unwrap(),
            DeleteOutcome::Lost
        );
        assert_eq!(
            store
                .delete(
                    "default",
                    &lease.name,
                    stored.resource_version.as_deref()
                )
                .await
                .unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            store.delete("default", &lease.name, None).await.unwrap(),
            DeleteOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_list_by_selector() {
        let store = MemoryLeaseStore::new();
        let owner = pod("train-0");
        for node in ["n1", "n2"] {
            let lease =
                LeaseRecord::for_reservation(node, &DeviceRef::exclusive("g0"), &owner, "c");
            store.create(&lease).await.unwrap();
        }

        let on_n1 = store.list(&node_selector("n1")).await.unwrap();
        assert_eq!(on_n1.len(), 1);
        assert_eq!(on_n1[0].node(), Some("n1"));

        let managed = store.list("gpu.scheduling/managed=true").await.unwrap();
        assert_eq!(managed.len(), 2);
    }
}
