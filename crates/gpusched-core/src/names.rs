//! Wire-level names shared with the webhook and node agent
//!
//! The admission webhook and the per-node agent parse these labels and
//! annotations; changing any value here breaks them.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::device::DeviceRef;

/// Pod annotation naming the GpuClaim to apply
pub const ANNOTATION_CLAIM: &str = "gpu.scheduling/claim";
/// Pod annotation carrying the committed device ids, comma-joined
pub const ANNOTATION_ALLOCATED: &str = "gpu.scheduling/allocated";

/// Marks a lease as owned by this scheduler
pub const LABEL_MANAGED: &str = "gpu.scheduling/managed";
/// Name of the pod holding the lease
pub const LABEL_POD: &str = "gpu.scheduling/pod";
/// Name of the claim the lease was committed for
pub const LABEL_CLAIM: &str = "gpu.scheduling/claim";
/// Node the leased device sits on
pub const LABEL_NODE: &str = "gpu.scheduling/node";
/// Device id the lease covers
pub const LABEL_DEVICE: &str = "gpu.scheduling/device";
/// Share slot index, present only on share-slotted leases
pub const LABEL_SLOT: &str = "gpu.scheduling/slot";

/// The scheduler name pods must set in `spec.schedulerName`
pub const SCHEDULER_NAME: &str = "gpusched";

/// Label selector matching every lease this scheduler manages
pub const MANAGED_SELECTOR: &str = "gpu.scheduling/managed=true";

/// Kubernetes object names are capped at 253 characters
const MAX_NAME_LEN: usize = 253;

/// Label selector matching the reservation leases of one node
pub fn node_selector(node: &str) -> String {
    format!("{},{}={}", MANAGED_SELECTOR, LABEL_NODE, node)
}

/// Deterministic lease name for a (node, device[, slot]) reservation
///
/// Exclusive holds use `gpu-<node>-<device>`; share slots append `-s<slot>`,
/// so a device with N slots yields up to N distinct lease names. Names are
/// sanitized to DNS-1123 and overlong names keep a hash suffix so distinct
/// inputs stay distinct.
pub fn lease_name(node: &str, device: &DeviceRef) -> String {
    let raw = match device.slot {
        Some(slot) => format!("gpu-{}-{}-s{}", node, device.id, slot),
        None => format!("gpu-{}-{}", node, device.id),
    };
    let name = sanitize(&raw);
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    format!("{}-{:016x}", &name[..MAX_NAME_LEN - 17], hasher.finish())
}

/// The `allocated` annotation value: device ids comma-joined in selector
/// order, exactly what the webhook projects into the container environment
pub fn join_allocated(devices: &[DeviceRef]) -> String {
    devices
        .iter()
        .map(|d| d.id.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn sanitize(raw: &str) -> String {
    let mapped: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    mapped.trim_matches('-').to_string()
}
