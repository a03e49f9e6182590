//! Region, process and usage state types
//!
//! All of these are stored in the shared region as plain integers, so each
//! enum carries an explicit discriminant and a lossy `From<i32>`.

use core::fmt;

use crate::constants::INIT_COMPLETE_MAGIC;

/// Initialization state of the shared region (`initialized_flag`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InitState {
    /// Fresh (zero-filled) region
    Uninitialized = 0,

    /// One process won the CAS and is populating the header
    InProgress = 1,

    /// Header populated and semaphores usable
    Complete = INIT_COMPLETE_MAGIC,
}

impl InitState {
    /// Decode a raw flag. Unknown values mean "someone else's data" and are
    /// reported as `None` so the caller can refuse to use the region.
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(InitState::Uninitialized),
            1 => Some(InitState::InProgress),
            INIT_COMPLETE_MAGIC => Some(InitState::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitState::Uninitialized => write!(f, "uninitialized"),
            InitState::InProgress => write!(f, "in-progress"),
            InitState::Complete => write!(f, "complete"),
        }
    }
}

/// Status of a registered process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ProcStatus {
    /// Slot is empty
    Free = 0,

    /// Normal operation (also set by the resume signal)
    Running = 1,

    /// Asked to release device memory (suspend signal)
    Suspended = 2,
}

impl From<i32> for ProcStatus {
    fn from(v: i32) -> Self {
        match v {
            1 => ProcStatus::Running,
            2 => ProcStatus::Suspended,
            _ => ProcStatus::Free,
        }
    }
}

impl From<ProcStatus> for i32 {
    fn from(status: ProcStatus) -> i32 {
        status as i32
    }
}

/// Usage category of an accounted byte count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UsageKind {
    /// Execution context overhead
    Context = 0,

    /// Loaded code modules
    Module = 1,

    /// User data buffers
    Data = 2,
}

impl UsageKind {
    pub const ALL: [UsageKind; 3] = [UsageKind::Context, UsageKind::Module, UsageKind::Data];
}

impl TryFrom<u8> for UsageKind {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(UsageKind::Context),
            1 => Ok(UsageKind::Module),
            2 => Ok(UsageKind::Data),
            other => Err(other),
        }
    }
}

impl fmt::Display for UsageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageKind::Context => write!(f, "context"),
            UsageKind::Module => write!(f, "module"),
            UsageKind::Data => write!(f, "data"),
        }
    }
}

/// How the compute-share limit is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UtilizationPolicy {
    /// Throttle only when the limit is set and the switch is on
    #[default]
    Default,

    /// Always throttle when a limit is set
    Force,

    /// Never throttle
    Disable,
}

impl UtilizationPolicy {
    /// Parse the `GPU_CORE_UTILIZATION_POLICY` value
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "force" => UtilizationPolicy::Force,
            "disable" => UtilizationPolicy::Disable,
            _ => UtilizationPolicy::Default,
        }
    }
}

/// Where an address points, from this process's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Inside a tracked device allocation
    Device,

    /// Anything else
    Host,
}

/// Memory figures as reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl MemoryInfo {
    /// Rewrite the physical figures so the application sees its quota
    ///
    /// With no limit only `used` changes; with a limit the device appears to
    /// have exactly `limit` bytes of which `usage` are taken.
    pub fn emulate(physical: MemoryInfo, limit: u64, usage: u64) -> MemoryInfo {
        if limit == 0 {
            return MemoryInfo {
                used: usage,
                ..physical
            };
        }
        MemoryInfo {
            total: limit,
            used: usage,
            free: limit.saturating_sub(usage),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
