//! Node-state cache
//!
//! Read-through view of a node's GPU inventory and the reservation leases
//! currently held against it. Each scheduling cycle takes one snapshot per
//! candidate node; the snapshot may be stale, because the arbiter is the
//! authority and a stale proposal costs one conflict retry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, warn};

use gpusched_core::{Device, SchedResult, TopologyGraph};
use gpusched_lease::LeaseArbiter;
use gpusched_store::NodeStatusStore;

/// One recorded hold on a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHold {
    /// UID of the holding pod
    pub holder_uid: String,
    /// Claim the hold was committed for
    pub claim: Option<String>,
    /// Share slot; `None` marks an exclusive hold
    pub slot: Option<u32>,
}

/// Snapshot of one node's GPU inventory and reservations
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Node name
    pub node: String,
    /// Devices as reported by the agent
    pub devices: Vec<Device>,
    /// Interconnect topology over all reported devices
    pub topology: TopologyGraph,
    /// Holds per device id
    pub holds: HashMap<String, Vec<DeviceHold>>,
    pub(crate) default_slots: u32,
}

impl NodeState {
    /// Look up a device by id
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Holds on one device
    pub fn holds_on(&self, id: &str) -> &[DeviceHold] {
        self.holds.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Share slots a device offers
    pub fn total_shares(&self, device: &Device) -> u32 {
        if device.total_shares == 0 {
            self.default_slots
        } else {
            device.total_shares
        }
    }

    /// Whether a device is healthy with no holds at all
    pub fn is_exclusively_free(&self, id: &str) -> bool {
        self.device(id).is_some_and(|d| d.healthy) && self.holds_on(id).is_empty()
    }

    /// Devices available to an Exclusive claim, sorted
    pub fn free_exclusive(&self) -> Vec<String> {
        let mut free: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.healthy && self.holds_on(&d.id).is_empty())
            .map(|d| d.id.clone())
            .collect();
        free.sort();
        free
    }

    /// Lowest unused share slot of a device, if it can take another tenant
    pub fn free_slot(&self, id: &str) -> Option<u32> {
        let device = self.device(id)?;
        if !device.healthy {
            return None;
        }
        let holds = self.holds_on(id);
        // An exclusive hold closes the device to co-tenancy
        if holds.iter().any(|h| h.slot.is_none()) {
            return None;
        }
        let total = self.total_shares(device);
        (0..total).find(|slot| !holds.iter().any(|h| h.slot == Some(*slot)))
    }

    /// Devices available to a Shared claim, sorted
    pub fn free_shared(&self) -> Vec<String> {
        let mut free: Vec<String> = self
            .devices
            .iter()
            .filter(|d| self.free_slot(&d.id).is_some())
            .map(|d| d.id.clone())
            .collect();
        free.sort();
        free
    }

    /// Whether a device has holds committed for a claim other than `claim`
    pub fn has_foreign_tenant(&self, id: &str, claim: &str) -> bool {
        self.holds_on(id)
            .iter()
            .any(|h| h.claim.as_deref() != Some(claim))
    }
}

/// Builds NodeState snapshots from the inventory store and the lease layer
pub struct NodeStateCache {
    statuses: Arc<dyn NodeStatusStore>,
    arbiter: Arc<LeaseArbiter>,
    default_slots: u32,
}

impl NodeStateCache {
    pub fn new(
        statuses: Arc<dyn NodeStatusStore>,
        arbiter: Arc<LeaseArbiter>,
        default_slots: u32,
    ) -> Self {
        Self {
            statuses,
            arbiter,
            default_slots,
        }
    }

    /// Nodes with a published inventory
    pub async fn nodes(&self) -> SchedResult<Vec<String>> {
        self.statuses.node_names().await
    }

    /// Materialize the state of one node; `None` if the agent has not
    /// published an inventory for it
    pub async fn snapshot(&self, node: &str) -> SchedResult<Option<NodeState>> {
        let Some(status) = self.statuses.snapshot(node).await? else {
            return Ok(None);
        };

        let topology = TopologyGraph::from_status(&status.devices, &status.edges);

        let mut holds: HashMap<String, Vec<DeviceHold>> = HashMap::new();
        for lease in self.arbiter.enumerate(node).await? {
            let Some(device) = lease.device() else {
                warn!(lease = %lease.name, "Managed lease without a device label");
                continue;
            };
            if !topology.contains(&device.id) {
                warn!(
                    node = node,
                    device = %device.id,
                    lease = %lease.name,
                    "Lease references a device the agent does not report"
                );
                continue;
            }
            holds.entry(device.id).or_default().push(DeviceHold {
                holder_uid: lease.holder_uid.clone(),
                claim: lease.claim().map(str::to_string),
                slot: device.slot,
            });
        }

        for (id, device_holds) in &holds {
            let exclusive = device_holds.iter().filter(|h| h.slot.is_none()).count();
            if exclusive > 1 || (exclusive == 1 && device_holds.len() > 1) {
                // The reaper resolves this on its next tick; never here
                error!(
                    node = node,
                    device = %id,
                    holds = device_holds.len(),
                    "Double booking detected on device"
                );
            }
        }

        Ok(Some(NodeState {
            node: node.to_string(),
            devices: status.devices,
            topology,
            holds,
            default_slots: self.default_slots,
        }))
    }
}
