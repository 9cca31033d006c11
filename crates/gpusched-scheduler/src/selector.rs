//! Topology-aware device selection
//!
//! Pure function from (claim, node state) to a proposed device set with a
//! quality score, or an infeasibility verdict. Infeasibility is a value,
//! not an error; it tells the plugin to reject the node and lets other
//! nodes succeed.

use std::collections::BTreeSet;

use gpusched_core::{DeviceRef, Exclusivity, GpuClaimSpec, TopologyConfig, TopologyMode};

use crate::state::NodeState;

/// Why a node cannot satisfy a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfeasibleKind {
    /// Fewer free devices than the claim asks for
    NotEnoughFree,
    /// No high-bandwidth component is large enough
    NoContiguousGroup,
    /// A pinned device is held or absent
    PinnedUnavailable,
    /// A pinned device is unhealthy
    UnhealthyDevice,
    /// No share slot is available, or co-tenants belong to another claim
    ShareExhausted,
}

impl std::fmt::Display for InfeasibleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InfeasibleKind::NotEnoughFree => "NotEnoughFree",
            InfeasibleKind::NoContiguousGroup => "NoContiguousGroup",
            InfeasibleKind::PinnedUnavailable => "PinnedUnavailable",
            InfeasibleKind::UnhealthyDevice => "UnhealthyDevice",
            InfeasibleKind::ShareExhausted => "ShareExhausted",
        };
        f.write_str(name)
    }
}

/// A proposed placement
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Chosen devices, in the order the allocated annotation will carry
    pub devices: Vec<DeviceRef>,
    /// Quality score in [0, 100]
    pub score: f64,
}

/// Outcome of running the selector against one node
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorResult {
    /// The node can satisfy the claim with these devices
    Selected(Selection),
    /// The node cannot satisfy the claim
    Infeasible {
        kind: InfeasibleKind,
        detail: String,
    },
}

fn infeasible(kind: InfeasibleKind, detail: impl Into<String>) -> SelectorResult {
    SelectorResult::Infeasible {
        kind,
        detail: detail.into(),
    }
}

/// Propose a device set on `state` for `claim`
///
/// Deterministic: equal inputs produce equal devices and scores, so every
/// scheduler replica scores a node identically. Ties between equally good
/// groups break lexicographically on the sorted id list.
pub fn select(
    claim_name: &str,
    claim: &GpuClaimSpec,
    state: &NodeState,
    config: &TopologyConfig,
) -> SelectorResult {
    if let Some(pinned) = &claim.device_ids {
        return select_pinned(claim, state, pinned);
    }

    let count = claim.count as usize;
    let free = match claim.exclusivity {
        Exclusivity::Exclusive => state.free_exclusive(),
        Exclusivity::Shared => state.free_shared(),
    };
    if free.len() < count {
        return infeasible(
            InfeasibleKind::NotEnoughFree,
            format!("need {}, {} free", count, free.len()),
        );
    }

    let mut penalty = 0.0;
    if claim.requires_contiguous() || claim.prefers_contiguous() {
        match best_component_group(state, &free, count, config.high_bandwidth_threshold) {
            Some((chosen, score)) => {
                if claim.requires_contiguous() && claim.exclusivity == Exclusivity::Shared {
                    // Never build a contiguous group on top of another
                    // claim's tenants
                    for id in &chosen {
                        if state.has_foreign_tenant(id, claim_name) {
                            return infeasible(
                                InfeasibleKind::ShareExhausted,
                                format!("device {} is shared with another claim", id),
                            );
                        }
                    }
                }
                return finish(claim, state, chosen, score);
            }
            None => {
                if claim.requires_contiguous() {
                    return infeasible(
                        InfeasibleKind::NoContiguousGroup,
                        format!("no contiguous group of size {}", count),
                    );
                }
                if claim.topology.mode == TopologyMode::Preferred {
                    penalty = config.preferred_penalty;
                }
            }
        }
    }

    let chosen = greedy_group(state, &free, count);
    let score = 100.0 * state.topology.mean_pair_weight(&chosen) - penalty;
    finish(claim, state, chosen, score)
}

fn select_pinned(claim: &GpuClaimSpec, state: &NodeState, pinned: &[String]) -> SelectorResult {
    for id in pinned {
        let Some(device) = state.device(id) else {
            return infeasible(
                InfeasibleKind::PinnedUnavailable,
                format!("pinned device {} is not on this node", id),
            );
        };
        if !device.healthy {
            return infeasible(
                InfeasibleKind::UnhealthyDevice,
                format!("pinned device {} is unhealthy", id),
            );
        }
        match claim.exclusivity {
            Exclusivity::Exclusive => {
                if !state.is_exclusively_free(id) {
                    return infeasible(
                        InfeasibleKind::PinnedUnavailable,
                        format!("pinned device {} unavailable", id),
                    );
                }
            }
            Exclusivity::Shared => {
                if state.free_slot(id).is_none() {
                    return infeasible(
                        InfeasibleKind::ShareExhausted,
                        format!("pinned device {} has no free share slot", id),
                    );
                }
            }
        }
    }
    finish(claim, state, pinned.to_vec(), 100.0)
}

/// Pick the best group inside one high-bandwidth component, if any is
/// large enough
fn best_component_group(
    state: &NodeState,
    free: &[String],
    count: usize,
    threshold: f64,
) -> Option<(Vec<String>, f64)> {
    let keep: BTreeSet<String> = free.iter().cloned().collect();
    let restricted = state.topology.restrict(&keep);

    let mut best: Option<(Vec<String>, f64)> = None;
    for component in restricted.components(threshold) {
        if component.len() < count {
            continue;
        }
        // Components come sorted, so this is the lexicographic choice
        let chosen: Vec<String> = component[..count].to_vec();
        let score = 100.0 * restricted.min_pair_weight(&chosen);
        let better = match &best {
            None => true,
            Some((incumbent, incumbent_score)) => {
                score > *incumbent_score
                    || (score == *incumbent_score && chosen < *incumbent)
            }
        };
        if better {
            best = Some((chosen, score));
        }
    }
    best
}

/// Greedy pick maximizing adjacency to the already-chosen set, seeded with
/// the lexicographically smallest free id
fn greedy_group(state: &NodeState, free: &[String], count: usize) -> Vec<String> {
    let mut remaining: Vec<String> = free.to_vec();
    let mut chosen: Vec<String> = vec![remaining.remove(0)];

    while chosen.len() < count {
        let mut best_index = 0;
        let mut best_sum = -1.0;
        for (i, candidate) in remaining.iter().enumerate() {
            let sum: f64 = chosen
                .iter()
                .map(|c| state.topology.weight(c, candidate).unwrap_or(0.0))
                .sum();
            // Strictly greater, so ties keep the lexicographically
            // smallest candidate
            if sum > best_sum {
                best_sum = sum;
                best_index = i;
            }
        }
        chosen.push(remaining.remove(best_index));
    }
    chosen
}

/// Attach share slots and clamp the score
fn finish(
    claim: &GpuClaimSpec,
    state: &NodeState,
    ids: Vec<String>,
    score: f64,
) -> SelectorResult {
    let mut devices = Vec::with_capacity(ids.len());
    for id in ids {
        let device = match claim.exclusivity {
            Exclusivity::Exclusive => DeviceRef::exclusive(id),
            Exclusivity::Shared => match state.free_slot(&id) {
                Some(slot) => DeviceRef::shared(id, slot),
                None => {
                    return infeasible(
                        InfeasibleKind::ShareExhausted,
                        format!("device {} has no free share slot", id),
                    )
                }
            },
        };
        devices.push(device);
    }
    SelectorResult::Selected(Selection {
        devices,
        score: score.clamp(0.0, 100.0),
    })
}
