//! # softmig-runtime
//!
//! Linux implementation of softmig's cross-process GPU sharing.
//!
//! This crate provides:
//! - The shared region (file-backed `mmap`, one-time initialization)
//! - The region lock protocol with dead-holder recovery
//! - The process registry and per-slot usage accounting
//! - The admission-controlled allocator
//! - The launch rate limiter and its utilization watcher thread
//! - SIGUSR1/SIGUSR2 suspend and resume handling
//! - Configuration from the environment and per-job config files
//!
//! Vendor libraries are reached only through the `softmig_core` seam
//! traits; `sim` provides in-process stand-ins for them.

pub mod config;
pub mod error;
pub mod region;
pub mod lock;
pub mod registry;
pub mod accountant;
pub mod allocator;
pub mod limiter;
pub mod watcher;
pub mod liveness;
pub mod hostpid;
pub mod signal;
pub mod sim;

// Re-exports
pub use config::{ConfigError, JobConfig, LockConfig, RegionConfig, WatcherConfig};
pub use error::{AllocError, AllocResult, RegionError, RegionResult};
pub use region::{current_pid, DeviceSnapshot, RegionHandle, SlotSnapshot, REGION_SIZE};
pub use lock::{PostinitGuard, RegionLockGuard};
pub use accountant::UsageReading;
pub use allocator::{Allocator, FreeOutcome};
pub use limiter::RateLimiter;
pub use watcher::{IterationReport, UtilizationWatcher, WatcherHandle, WatcherStats};
pub use liveness::ProcLiveness;
pub use hostpid::NsPidResolver;

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("softmig-runtime supports Linux only");
    }
}
