//! gpusched-store: Cluster store capabilities
//!
//! The scheduler core touches the cluster through four narrow capability
//! traits: leases, pods, node statuses, and pod events. `kubernetes` holds
//! the real implementations; `memory` holds the in-memory fakes the test
//! suites run against.

pub mod kubernetes;
pub mod memory;
pub mod traits;

pub use traits::*;
