//! Shared value types flowing between the collector, dispatcher and the
//! on-demand engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

// ============================================================================
// Telemetry
// ============================================================================

/// Cumulative disk I/O counters since boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskIoCounters {
    pub read_bytes: u64,
    pub written_bytes: u64,
}

impl DiskIoCounters {
    pub fn total(&self) -> u64 {
        self.read_bytes.saturating_add(self.written_bytes)
    }
}

/// Cumulative network I/O counters since boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIoCounters {
    pub received_bytes: u64,
    pub transmitted_bytes: u64,
}

impl NetIoCounters {
    pub fn total(&self) -> u64 {
        self.received_bytes.saturating_add(self.transmitted_bytes)
    }
}

/// One immutable point-in-time reading of the host.
///
/// Fields are private: a snapshot is only built through [`MetricSnapshot::new`]
/// and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    timestamp: DateTime<Utc>,
    cpu_percent: f64,
    memory_percent: f64,
    disk_io: DiskIoCounters,
    net_io: NetIoCounters,
}

impl MetricSnapshot {
    /// Percentages are clamped into [0, 100]; NaN becomes 0.
    pub fn new(
        timestamp: DateTime<Utc>,
        cpu_percent: f64,
        memory_percent: f64,
        disk_io: DiskIoCounters,
        net_io: NetIoCounters,
    ) -> Self {
        Self {
            timestamp,
            cpu_percent: clamp_percent(cpu_percent),
            memory_percent: clamp_percent(memory_percent),
            disk_io,
            net_io,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn cpu_percent(&self) -> f64 {
        self.cpu_percent
    }

    pub fn memory_percent(&self) -> f64 {
        self.memory_percent
    }

    pub fn disk_io(&self) -> DiskIoCounters {
        self.disk_io
    }

    pub fn net_io(&self) -> NetIoCounters {
        self.net_io
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Static host facts that never change while the process runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub cpu_count: usize,
    pub total_memory_bytes: u64,
    /// Seconds since the Unix epoch
    pub boot_time: u64,
}

// ============================================================================
// Filesystem facts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One directory entry as reported by the adapter (never follows symlinks)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

/// Space on one mounted filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl DiskUsage {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// Size of one directory, with its growth since the previous snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathUsage {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Growth since the previous snapshot; `None` on the first snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_bytes: Option<i64>,
}
