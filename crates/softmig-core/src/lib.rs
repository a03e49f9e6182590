//! # softmig-core
//!
//! Core types and math for softmig, a soft GPU partitioning layer that lets
//! several co-located processes share one physical accelerator under
//! per-device memory quotas and compute-share targets.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Everything that touches mmap, semaphores, signals or `/proc` lives in
//! `softmig-runtime`.
//!
//! ## Modules
//!
//! - `status` - Region init states, process status and usage categories
//! - `seqlock` - Sequence counter guarding per-slot usage counters
//! - `slot` - Per-process slot layout (repr(C)) and its accounting ops
//! - `lock_state` - Coarse lock state and stale-holder recovery decisions
//! - `ratelimit` - Compute-share feedback math and the token bucket
//! - `tracking` - Per-process list of live device allocations
//! - `device_map` - Management-API to region device index mapping
//! - `traits` - Driver, management, liveness and host-pid seams
//! - `error` - Error types
//! - `env` - Environment variable and limit-string parsing

pub mod status;
pub mod seqlock;
pub mod slot;
pub mod lock_state;
pub mod ratelimit;
pub mod tracking;
pub mod device_map;
pub mod traits;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use status::{InitState, MemoryInfo, MemoryType, ProcStatus, UsageKind, UtilizationPolicy};
pub use seqlock::{SeqLock, SeqRead};
pub use slot::{DeviceMemory, DeviceUtil, ProcessSlot, UsageBreakdown};
pub use lock_state::{LockState, TimeoutAction};
pub use ratelimit::{CoreTokens, DeviceSpec};
pub use tracking::{AllocHandle, AllocationEntry, AllocationList};
pub use device_map::DeviceMap;
pub use traits::{
    DeviceDriver, DevicePtr, HostPidResolver, LargeAllocation, LivenessCheck, ManagementApi,
    ProcessMemorySample, StreamHandle, UtilizationSample,
};
pub use error::{CoreError, CoreResult, DriverError};
pub use env::{env_get, env_get_opt, env_get_str, parse_limit};

/// Constants for the shared region layout
pub mod constants {
    /// Maximum number of devices tracked per region
    pub const MAX_DEVICES: usize = 16;

    /// Number of process slots in the region
    pub const MAX_PROCS: usize = 1024;

    /// Length of a device UUID string buffer
    pub const UUID_LEN: usize = 96;

    /// Region layout version. A mismatch on attach is fatal.
    pub const MAJOR_VERSION: u32 = 1;
    pub const MINOR_VERSION: u32 = 1;

    /// Sentinel written to `initialized_flag` once the initializer finishes
    pub const INIT_COMPLETE_MAGIC: i32 = 19920718;

    /// Multiplier from threads to "cuda cores" used by the token bucket
    pub const FACTOR: i64 = 32;

    /// Allocations at or below this size go through the plain allocator
    pub const IPC_SIZE_THRESHOLD: u64 = 2 * 1024 * 1024;

    /// Granularity of large (virtual-memory backed) allocations
    pub const LARGE_ALLOC_ALIGN: u64 = 2 * 1024 * 1024;

    /// Added to every cross-process usage sum
    pub const INITIAL_OFFSET: u64 = 0;

    /// Reader retries before a seqlock read falls back to best effort
    pub const SEQLOCK_READ_RETRIES: u32 = 100;

    /// Writer spins on an odd counter before assuming a dead writer
    pub const SEQLOCK_WRITE_SPINS: u32 = 1 << 20;

    /// SM limit value meaning "no throttling"
    pub const SM_LIMIT_UNLIMITED: u64 = 100;

    /// Default value of the shared `recent_kernel` gate
    pub const RECENT_KERNEL_DEFAULT: i32 = 2;

    /// Default shared region path
    pub const DEFAULT_REGION_PATH: &str = "/tmp/cudevshr.cache";
}
