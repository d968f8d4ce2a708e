use serde::{Deserialize, Serialize};

pub const REPORT_VERSION: &str = "1.0.0";

/// Immutable snapshot of one attached block device. Rebuilt from scratch on
/// every detection pass and discarded once the clone decision is made.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    /// Canonical device path; a stable `/dev/disk/by-id` alias when one
    /// exists, otherwise the transient `/dev/<name>` node.
    pub path: String,
    /// Kernel name as listed under `/sys/block` (e.g. `sda`, `mmcblk1`).
    pub kernel_name: String,
    /// Sector count times 512. Never read verbatim from a mutable field.
    pub size_bytes: u64,
    /// Decimal gigabytes rounded to two places. This, not `size_bytes`, is
    /// the comparison key so that independent passes classify identically.
    pub size_gb: f64,
    /// Best-effort model string, "Unknown" when sysfs has nothing.
    pub model: String,
}

/// A validated source/destination selection for one detection cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevicePair {
    pub source: DeviceInfo,
    pub destination: DeviceInfo,
    pub ok: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// One partition of the source device, paired with its destination
/// counterpart. Enumerated at clone time, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionDescriptor {
    pub source_path: String,
    pub dest_path: String,
    /// Probed filesystem type, lowercased; "unknown" when the probe fails.
    pub fs_type: String,
}

/// How a single partition gets cloned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloneStrategy {
    /// Fresh filesystem on the destination plus a content-level copy.
    FilesystemAware,
    /// Byte-for-byte copy. Always correct, slower, preserves nothing
    /// beyond raw bytes.
    RawBlockCopy,
}

/// Terminal result of one clone attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloneOutcome {
    pub succeeded: bool,
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl CloneOutcome {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            error_detail: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error_detail: Some(detail.into()),
        }
    }
}

/// Operator-facing state. Owned exclusively by the orchestrator; the
/// transition table in `orchestrator` is the only mutation path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperatorState {
    #[default]
    Ready,
    Detecting,
    Cloning,
    Done,
    Error,
}

/// Status lamps on the appliance front panel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    Ready,
    Cloning,
    Done,
}

impl Indicator {
    pub const ALL: [Indicator; 3] = [Indicator::Ready, Indicator::Cloning, Indicator::Done];
}

/// Structured record of one clone attempt, assembled by the orchestrator
/// and optionally written out as JSON by the front-end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloneReport {
    #[serde(default = "default_report_version")]
    pub report_version: String,
    pub attempt_id: String,
    pub started_at: String,
    pub finished_at: String,
    #[serde(default)]
    pub source: Option<DeviceInfo>,
    #[serde(default)]
    pub destination: Option<DeviceInfo>,
    pub outcome: CloneOutcome,
}

fn default_report_version() -> String {
    REPORT_VERSION.to_string()
}
