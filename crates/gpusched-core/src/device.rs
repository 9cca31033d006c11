//! GpuNodeStatus custom resource and device identities

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Spec for the GpuNodeStatus custom resource
///
/// Cluster-scoped, named after the node, published by the per-node agent.
/// The scheduler only reads it.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default)]
#[kube(
    group = "gpu.scheduling",
    version = "v1alpha1",
    kind = "GpuNodeStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct GpuNodeStatusSpec {
    /// GPU inventory in agent-reported order
    #[serde(default)]
    pub devices: Vec<Device>,
    /// Interconnect adjacency, undirected
    #[serde(default)]
    pub edges: Vec<TopologyEdge>,
}

/// One physical GPU as reported by the node agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable identity, opaque to the scheduler; this is what reaches the
    /// container runtime
    pub id: String,
    /// Hardware model name
    #[serde(default)]
    pub model: String,
    /// Whether the device is usable
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    /// Share slots for Shared claims; 0 means the agent did not report one
    #[serde(default)]
    pub total_shares: u32,
}

fn default_healthy() -> bool {
    true
}

/// One undirected interconnect edge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologyEdge {
    /// First endpoint device id
    pub a: String,
    /// Second endpoint device id
    pub b: String,
    /// Interconnect quality class in [0, 1]
    pub weight: f64,
}

/// A selected device, with the share slot for Shared claims
///
/// Ordering is lexicographic on `(id, slot)`; the arbiter relies on it to
/// create leases in a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Device id
    pub id: String,
    /// Share slot index; `None` marks an exclusive hold
    pub slot: Option<u32>,
}

impl DeviceRef {
    /// Reference a device for exclusive use
    pub fn exclusive(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slot: None,
        }
    }

    /// Reference one share slot of a device
    pub fn shared(id: impl Into<String>, slot: u32) -> Self {
        Self {
            id: id.into(),
            slot: Some(slot),
        }
    }
}

impl std::fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.slot {
            Some(slot) => write!(f, "{}/s{}", self.id, slot),
            None => write!(f, "{}", self.id),
        }
    }
}
