use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Resource Types
// =============================================================================

/// A measurable resource of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Disk,
    Processes,
    FileHandles,
    NetworkBandwidth,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Disk => "disk",
            Self::Processes => "processes",
            Self::FileHandles => "file_handles",
            Self::NetworkBandwidth => "network_bandwidth",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource ceilings applied to a sandbox at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum memory in bytes.
    pub max_memory_bytes: u64,
    /// Maximum CPU usage as a percentage of one core (100.0 = one core).
    pub max_cpu_percent: f64,
    /// Maximum disk usage in bytes.
    pub max_disk_bytes: u64,
    /// Maximum number of processes.
    pub max_processes: u32,
    /// Maximum number of open file handles.
    pub max_file_handles: u32,
    /// Maximum network bandwidth in bytes per second.
    pub max_network_bandwidth_bps: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024, // 512MB
            max_cpu_percent: 100.0,              // 1 CPU core
            max_disk_bytes: 1024 * 1024 * 1024,  // 1GB
            max_processes: 100,
            max_file_handles: 1024,
            max_network_bandwidth_bps: 10 * 1024 * 1024,
        }
    }
}

/// A single ceiling that was crossed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitBreach {
    pub resource: ResourceKind,
    pub observed: f64,
    pub limit: f64,
}

impl std::fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} usage {} exceeds limit {}",
            self.resource, self.observed, self.limit
        )
    }
}

impl ResourceLimits {
    /// Compare a usage snapshot against these limits.
    ///
    /// Zero-valued measurements are treated as "not measured" and never breach.
    pub fn check(&self, usage: &ResourceUsage) -> Vec<LimitBreach> {
        let mut breaches = Vec::new();
        let mut check = |resource: ResourceKind, observed: f64, limit: f64| {
            if observed > 0.0 && observed > limit {
                breaches.push(LimitBreach {
                    resource,
                    observed,
                    limit,
                });
            }
        };

        check(
            ResourceKind::Memory,
            usage.memory_bytes as f64,
            self.max_memory_bytes as f64,
        );
        check(ResourceKind::Cpu, usage.cpu_percent, self.max_cpu_percent);
        check(
            ResourceKind::Disk,
            usage.disk_bytes as f64,
            self.max_disk_bytes as f64,
        );
        check(
            ResourceKind::Processes,
            usage.processes as f64,
            self.max_processes as f64,
        );
        check(
            ResourceKind::FileHandles,
            usage.file_handles as f64,
            self.max_file_handles as f64,
        );
        check(
            ResourceKind::NetworkBandwidth,
            usage.network_bandwidth_bps as f64,
            self.max_network_bandwidth_bps as f64,
        );
        breaches
    }

    /// Whether every ceiling fits within `capacity`.
    ///
    /// Returns the first resource that does not fit.
    pub fn exceeds(&self, capacity: &ResourceLimits) -> Option<ResourceKind> {
        if self.max_memory_bytes > capacity.max_memory_bytes {
            Some(ResourceKind::Memory)
        } else if self.max_cpu_percent > capacity.max_cpu_percent {
            Some(ResourceKind::Cpu)
        } else if self.max_disk_bytes > capacity.max_disk_bytes {
            Some(ResourceKind::Disk)
        } else if self.max_processes > capacity.max_processes {
            Some(ResourceKind::Processes)
        } else if self.max_file_handles > capacity.max_file_handles {
            Some(ResourceKind::FileHandles)
        } else if self.max_network_bandwidth_bps > capacity.max_network_bandwidth_bps {
            Some(ResourceKind::NetworkBandwidth)
        } else {
            None
        }
    }
}

/// Point-in-time resource usage snapshot. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    pub disk_bytes: u64,
    pub processes: u32,
    pub file_handles: u32,
    pub network_bandwidth_bps: u64,
    pub recorded_at: DateTime<Utc>,
}

impl ResourceUsage {
    /// An empty snapshot taken now.
    pub fn empty() -> Self {
        Self {
            memory_bytes: 0,
            cpu_percent: 0.0,
            disk_bytes: 0,
            processes: 0,
            file_handles: 0,
            network_bandwidth_bps: 0,
            recorded_at: Utc::now(),
        }
    }
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self::empty()
    }
}
