//! gpusched-core: Core types for the gpusched scheduler
//!
//! This crate provides the fundamental types used throughout gpusched:
//! - GpuClaim and GpuNodeStatus custom resources
//! - The node-local interconnect topology model
//! - Configuration types
//! - Error handling
//! - Wire-level names shared with the webhook and node agent

pub mod claim;
pub mod config;
pub mod device;
pub mod error;
pub mod names;
pub mod topology;

pub use claim::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use topology::*;
