//! GpuClaim custom resource

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::SchedError;

/// Spec for the GpuClaim custom resource
///
/// A pod references a claim through the `gpu.scheduling/claim` annotation;
/// the claim describes how many GPUs the pod needs and how they must be
/// placed relative to the node's interconnect topology.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "gpu.scheduling",
    version = "v1alpha1",
    kind = "GpuClaim",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct GpuClaimSpec {
    /// Number of physical GPUs required
    pub count: u32,
    /// Placement policy
    #[serde(default)]
    pub policy: PlacementPolicy,
    /// Whether other claims may share the selected devices
    #[serde(default)]
    pub exclusivity: Exclusivity,
    /// Topology constraint
    #[serde(default)]
    pub topology: TopologyConstraint,
    /// Pin the claim to exactly these device ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ids: Option<Vec<String>>,
}

impl GpuClaimSpec {
    /// Validate the invariants user input must satisfy
    pub fn validate(&self) -> Result<(), SchedError> {
        if self.count == 0 {
            return Err(SchedError::ClaimInvalid("count must be at least 1".to_string()));
        }
        if let Some(ids) = &self.device_ids {
            if ids.len() != self.count as usize {
                return Err(SchedError::ClaimInvalid(format!(
                    "count is {} but {} device ids are pinned",
                    self.count,
                    ids.len()
                )));
            }
            let mut seen = std::collections::HashSet::new();
            for id in ids {
                if !seen.insert(id) {
                    return Err(SchedError::ClaimInvalid(format!(
                        "device id {} pinned more than once",
                        id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether the selected set must form a high-bandwidth group
    pub fn requires_contiguous(&self) -> bool {
        self.policy == PlacementPolicy::Contiguous && self.topology.mode == TopologyMode::Required
    }

    /// Whether a high-bandwidth group is preferred but not required
    pub fn prefers_contiguous(&self) -> bool {
        self.policy == PlacementPolicy::Contiguous && self.topology.mode != TopologyMode::Required
    }
}

/// Placement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlacementPolicy {
    /// Any free devices will do
    #[default]
    Any,
    /// The selected set must sit inside one high-bandwidth component
    Contiguous,
}

/// Device exclusivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Exclusivity {
    /// No other claim may hold the same device
    #[default]
    Exclusive,
    /// Co-tenancy up to the device's share slot count
    Shared,
}

/// Topology constraint for a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TopologyConstraint {
    /// How strongly the contiguity policy binds
    #[serde(default)]
    pub mode: TopologyMode,
}

/// How strongly the contiguity policy binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TopologyMode {
    /// Contiguity is a hard requirement
    Required,
    /// Contiguity affects scoring only
    Preferred,
    /// No topology constraint
    #[default]
    None,
}
