//! Capability traits over the cluster store
//!
//! The arbiter, reaper, cache, and plugin see the cluster only through
//! these traits and the plain records they exchange, which keeps all of
//! them unit-testable against the in-memory fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gpusched_core::names::{
    LABEL_CLAIM, LABEL_DEVICE, LABEL_MANAGED, LABEL_NODE, LABEL_POD, LABEL_SLOT,
};
use gpusched_core::{DeviceRef, GpuClaimSpec, GpuNodeStatusSpec, SchedResult};

/// A reservation lease as the arbiter and reaper see it
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRecord {
    /// Lease object name
    pub name: String,
    /// Namespace the lease lives in (the owning pod's namespace)
    pub namespace: String,
    /// UID of the owning pod
    pub holder_uid: String,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Store revision, used as a delete precondition
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// Build the lease that reserves `device` on `node` for `pod`
    pub fn for_reservation(
        node: &str,
        device: &DeviceRef,
        pod: &PodRecord,
        claim: &str,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_POD.to_string(), pod.name.clone());
        labels.insert(LABEL_CLAIM.to_string(), claim.to_string());
        labels.insert(LABEL_NODE.to_string(), node.to_string());
        labels.insert(LABEL_DEVICE.to_string(), device.id.clone());
        if let Some(slot) = device.slot {
            labels.insert(LABEL_SLOT.to_string(), slot.to_string());
        }
        Self {
            name: gpusched_core::names::lease_name(node, device),
            namespace: pod.namespace.clone(),
            holder_uid: pod.uid.clone(),
            labels,
            resource_version: None,
        }
    }

    /// Name of the holding pod, from the lease labels
    pub fn pod_name(&self) -> Option<&str> {
        self.labels.get(LABEL_POD).map(String::as_str)
    }

    /// Name of the claim the lease was committed for
    pub fn claim(&self) -> Option<&str> {
        self.labels.get(LABEL_CLAIM).map(String::as_str)
    }

    /// Node the leased device sits on
    pub fn node(&self) -> Option<&str> {
        self.labels.get(LABEL_NODE).map(String::as_str)
    }

    /// The leased device, with its share slot if the lease is slotted
    pub fn device(&self) -> Option<DeviceRef> {
        let id = self.labels.get(LABEL_DEVICE)?;
        let slot = match self.labels.get(LABEL_SLOT) {
            Some(raw) => Some(raw.parse().ok()?),
            None => None,
        };
        Some(DeviceRef {
            id: id.clone(),
            slot,
        })
    }
}

/// Pod fields the scheduler needs
#[derive(Debug, Clone, PartialEq)]
pub struct PodRecord {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod UID; the holder identity of every lease committed for it
    pub uid: String,
    /// Node the pod is bound to, if any
    pub node: Option<String>,
    /// `spec.schedulerName`
    pub scheduler_name: Option<String>,
    /// Lifecycle phase
    pub phase: PodPhase,
    /// Object annotations
    pub annotations: BTreeMap<String, String>,
}

/// Pod lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Whether the pod has finished and will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Result of a create-if-not-exists
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The lease was created by this call
    Created,
    /// A lease with this name already exists
    Exists(LeaseRecord),
}

/// Result of a lease delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The lease was deleted by this call
    Deleted,
    /// No lease with this name exists
    Missing,
    /// The precondition failed; someone else acted first
    Lost,
}

/// Reservation lease storage
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the lease if no lease with its name exists
    async fn create(&self, lease: &LeaseRecord) -> SchedResult<CreateOutcome>;

    /// Fetch one lease
    async fn get(&self, namespace: &str, name: &str) -> SchedResult<Option<LeaseRecord>>;

    /// Delete one lease, optionally guarded by a resource version
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> SchedResult<DeleteOutcome>;

    /// List leases across all namespaces matching a label selector
    async fn list(&self, selector: &str) -> SchedResult<Vec<LeaseRecord>>;
}

/// Pod reads and the two writes the plugin performs
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Fetch one pod
    async fn get(&self, namespace: &str, name: &str) -> SchedResult<Option<PodRecord>>;

    /// Set one annotation on a pod
    async fn annotate(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> SchedResult<()>;

    /// Bind a pod to a node
    async fn bind(&self, namespace: &str, name: &str, node: &str) -> SchedResult<()>;
}

/// Read access to GpuClaim objects
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Fetch one claim spec
    async fn get(&self, namespace: &str, name: &str) -> SchedResult<Option<GpuClaimSpec>>;
}

/// Read access to the per-node GPU inventory
#[async_trait]
pub trait NodeStatusStore: Send + Sync {
    /// Fetch the inventory the agent published for `node`
    async fn snapshot(&self, node: &str) -> SchedResult<Option<GpuNodeStatusSpec>>;

    /// Names of all nodes with a published inventory
    async fn node_names(&self) -> SchedResult<Vec<String>>;
}

/// Scheduling event output on pods
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record an event against a pod
    async fn pod_event(
        &self,
        pod: &PodRecord,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> SchedResult<()>;
}
