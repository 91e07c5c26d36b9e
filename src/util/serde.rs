//! Serializable value types shared by the task engine and the event bus.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique task identifier.
pub type TaskId = uuid::Uuid;

/// Unique event identifier.
pub type EventId = uuid::Uuid;

/// Free-form string tags attached to tasks and events.
pub type Tags = HashMap<String, String>;

/// Scheduling priority, most urgent first.
///
/// The same five levels order both task dispatch and event dispatch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Must run before anything else.
    Critical,
    /// Urgent work.
    High,
    /// Default level.
    #[default]
    Normal,
    /// Deferrable work.
    Low,
    /// Runs only when nothing else is waiting.
    Background,
}

impl Priority {
    /// All levels in dispatch order (most urgent first).
    pub const ALL: [Self; 5] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Background,
    ];

    /// Number of priority levels.
    pub const LEVELS: usize = 5;

    /// Zero-based queue index; 0 is the most urgent level.
    #[must_use]
    pub const fn level(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Background => 4,
        }
    }

    /// Whether `self` is strictly more urgent than `other`.
    #[must_use]
    pub const fn is_more_urgent_than(self, other: Self) -> bool {
        self.level() < other.level()
    }

    /// Lowercase name used in logs and persisted metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources a task needs while it runs.
///
/// Units: cpu in cores, memory and disk in MB, network in Mbps, gpu in devices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// CPU cores.
    pub cpu: f64,
    /// Memory in MB.
    pub memory: f64,
    /// Disk in MB.
    pub disk: f64,
    /// Network bandwidth in Mbps.
    pub network: f64,
    /// GPU devices.
    pub gpu: f64,
}

impl ResourceRequirement {
    /// Requirement with only a CPU component.
    #[must_use]
    pub const fn cpu(cpu: f64) -> Self {
        Self {
            cpu,
            memory: 0.0,
            disk: 0.0,
            network: 0.0,
            gpu: 0.0,
        }
    }

    /// Requirement that needs nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self::cpu(0.0)
    }

    /// Set the memory component.
    #[must_use]
    pub const fn with_memory(mut self, memory: f64) -> Self {
        self.memory = memory;
        self
    }

    /// Set the disk component.
    #[must_use]
    pub const fn with_disk(mut self, disk: f64) -> Self {
        self.disk = disk;
        self
    }

    /// Set the network component.
    #[must_use]
    pub const fn with_network(mut self, network: f64) -> Self {
        self.network = network;
        self
    }

    /// Set the gpu component.
    #[must_use]
    pub const fn with_gpu(mut self, gpu: f64) -> Self {
        self.gpu = gpu;
        self
    }

    /// Components in ledger order: cpu, memory, disk, network, gpu.
    #[must_use]
    pub const fn as_array(&self) -> [f64; 5] {
        [self.cpu, self.memory, self.disk, self.network, self.gpu]
    }

    /// True when every component is finite and non-negative.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite() && *v >= 0.0)
    }

    /// The requirement itself when well formed, otherwise the default.
    #[must_use]
    pub fn sanitized(self) -> Self {
        if self.is_well_formed() {
            self
        } else {
            tracing::warn!(requirement = ?self, "malformed resource requirement, using defaults");
            Self::default()
        }
    }
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 100.0,
            disk: 0.0,
            network: 0.0,
            gpu: 0.0,
        }
    }
}

/// Total budget tracked by the resource ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCapacity {
    /// CPU cores.
    pub cpu: f64,
    /// Memory in MB.
    pub memory: f64,
    /// Disk in MB.
    pub disk: f64,
    /// Network bandwidth in Mbps.
    pub network: f64,
    /// GPU devices.
    pub gpu: f64,
}

impl ResourceCapacity {
    /// Components in ledger order: cpu, memory, disk, network, gpu.
    #[must_use]
    pub const fn as_array(&self) -> [f64; 5] {
        [self.cpu, self.memory, self.disk, self.network, self.gpu]
    }

    /// Replace the cpu budget.
    #[must_use]
    pub const fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu = cpu;
        self
    }

    /// Replace the memory budget.
    #[must_use]
    pub const fn with_memory(mut self, memory: f64) -> Self {
        self.memory = memory;
        self
    }

    /// Replace the gpu budget.
    #[must_use]
    pub const fn with_gpu(mut self, gpu: f64) -> Self {
        self.gpu = gpu;
        self
    }
}

impl Default for ResourceCapacity {
    #[allow(clippy::cast_precision_loss)]
    fn default() -> Self {
        Self {
            cpu: num_cpus::get() as f64,
            memory: 8192.0,
            disk: 10240.0,
            network: 1000.0,
            gpu: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_levels_follow_urgency() {
        let levels: Vec<usize> = Priority::ALL.iter().map(|p| p.level()).collect();
        assert_eq!(levels, vec![0, 1, 2, 3, 4]);
        assert!(Priority::Critical.is_more_urgent_than(Priority::High));
        assert!(!Priority::Background.is_more_urgent_than(Priority::Low));
    }

    #[test]
    fn priority_serializes_snake_case() {
        let json = serde_json::to_string(&Priority::Background).unwrap();
        assert_eq!(json, "\"background\"");
    }

    #[test]
    fn malformed_requirement_falls_back_to_default() {
        let bad = ResourceRequirement::cpu(-1.0);
        assert_eq!(bad.sanitized(), ResourceRequirement::default());

        let nan = ResourceRequirement::cpu(0.5).with_memory(f64::NAN);
        assert_eq!(nan.sanitized(), ResourceRequirement::default());

        let ok = ResourceRequirement::cpu(0.5).with_gpu(1.0);
        assert_eq!(ok.sanitized(), ok);
    }
}
