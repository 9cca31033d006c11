//! gpusched-scheduler: Scheduling core
//!
//! Materializes per-node GPU state, proposes device sets for claims, and
//! drives the filter/score/reserve/unreserve phases against the lease
//! arbiter.

pub mod framework;
pub mod plugin;
pub mod selector;
pub mod state;

pub use framework::{Framework, ScheduleOutcome};
pub use plugin::{FilterOutcome, GpuPlugin, ReserveStatus};
pub use selector::{select, InfeasibleKind, Selection, SelectorResult};
pub use state::{NodeState, NodeStateCache};
