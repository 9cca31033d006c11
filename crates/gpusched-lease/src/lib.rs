//! gpusched-lease: Distributed reservation layer
//!
//! Reservations are coordination leases, one per (node, device) pair or
//! share slot. The arbiter turns a proposed device set into a durable,
//! conflict-free reservation through create-if-not-exists; the reaper
//! reclaims leases whose owning pods are gone.

pub mod arbiter;
pub mod reaper;

pub use arbiter::{LeaseArbiter, ReserveOutcome};
pub use reaper::LeaseReaper;
