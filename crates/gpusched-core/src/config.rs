//! Configuration types for gpusched

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration, loaded from the TOML file passed via `--config`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Topology scoring configuration
    pub topology: TopologyConfig,
    /// Share slot configuration
    pub shares: ShareConfig,
    /// Lease reaper configuration
    pub reaper: ReaperConfig,
    /// Per-pod scheduling cycle configuration
    pub cycle: CycleConfig,
}

impl SchedulerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::SchedError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::SchedError::Config(format!("Failed to read config file: {}", e)))?;
        let config: SchedulerConfig = toml::from_str(&content)
            .map_err(|e| crate::SchedError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the selector and reaper cannot work with
    pub fn validate(&self) -> Result<(), crate::SchedError> {
        let tau = self.topology.high_bandwidth_threshold;
        if !(0.0..=1.0).contains(&tau) {
            return Err(crate::SchedError::Config(format!(
                "high_bandwidth_threshold must be within [0, 1], got {}",
                tau
            )));
        }
        if self.reaper.period_secs == 0 {
            return Err(crate::SchedError::Config(
                "reaper period must be non-zero".to_string(),
            ));
        }
        if self.shares.default_slots == 0 {
            return Err(crate::SchedError::Config(
                "default share slot count must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Topology scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Minimum edge weight for two devices to count as high-bandwidth peers
    pub high_bandwidth_threshold: f64,
    /// Score penalty when a contiguous-preferred claim falls back to a
    /// non-contiguous placement
    pub preferred_penalty: f64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            high_bandwidth_threshold: 0.75,
            preferred_penalty: 30.0,
        }
    }
}

/// Share slot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Share slots per device when the node agent does not report a count
    pub default_slots: u32,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self { default_slots: 1 }
    }
}

/// Lease reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between reaper sweeps
    pub period_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { period_secs: 30 }
    }
}

impl ReaperConfig {
    /// Sweep period as a `Duration`
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Per-pod scheduling cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Budget for one pod's scheduling cycle in seconds
    pub deadline_secs: u64,
    /// Reservation attempts before the pod is reported unschedulable
    pub reserve_retries: u32,
    /// Bound on lease rollback after a failed or cancelled reserve, in seconds
    pub rollback_deadline_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 5,
            reserve_retries: 3,
            rollback_deadline_secs: 2,
        }
    }
}

impl CycleConfig {
    /// Scheduling budget as a `Duration`
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Rollback bound as a `Duration`
    pub fn rollback_deadline(&self) -> Duration {
        Duration::from_secs(self.rollback_deadline_secs)
    }
}
