//! Seams to the outside world
//!
//! The accounting core never calls a vendor API directly. The interception
//! layer hands it a `DeviceDriver` (allocation, topology) and the watcher a
//! `ManagementApi` (per-process observations). Liveness and host-pid
//! resolution are traits too so tests can simulate processes that come and
//! go without forking.

use crate::error::DriverError;
use crate::ratelimit::DeviceSpec;
use crate::tracking::AllocHandle;

/// Device virtual address
pub type DevicePtr = u64;

/// Opaque stream identifier for stream-ordered allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub u64);

/// Result of a virtual-memory backed allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeAllocation {
    pub address: DevicePtr,
    pub handle: AllocHandle,
}

/// Underlying device driver
pub trait DeviceDriver: Send + Sync {
    /// Device the calling thread's context is bound to
    fn current_device(&self) -> Result<usize, DriverError>;

    /// Plain allocation, used for sizes up to the IPC threshold
    fn mem_alloc(&self, size: u64) -> Result<DevicePtr, DriverError>;

    /// Reserve-and-map allocation for large sizes
    fn mem_alloc_large(&self, size: u64) -> Result<LargeAllocation, DriverError>;

    /// Release any allocation; `handle` is set for large ones
    fn mem_free(&self, ptr: DevicePtr, handle: Option<AllocHandle>) -> Result<(), DriverError>;

    /// Stream-ordered allocation from the device's default pool
    fn mem_alloc_async(&self, size: u64, stream: StreamHandle) -> Result<DevicePtr, DriverError>;

    fn mem_free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> Result<(), DriverError>;

    /// Reserved-memory high mark of the device's default pool
    fn pool_reserved_high(&self, dev: usize) -> Result<u64, DriverError>;

    /// SM count and max threads per SM
    fn device_spec(&self, dev: usize) -> Result<DeviceSpec, DriverError>;
}

/// Memory one process holds on a device, as the management API sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMemorySample {
    /// Host pid
    pub pid: u32,
    pub used_bytes: u64,
}

/// SM utilization of one process over a sampling window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtilizationSample {
    /// Host pid; 0 means the sample could not be attributed
    pub pid: u32,
    pub sm_util: u32,
}

/// Host-wide device management interface
pub trait ManagementApi: Send + Sync {
    fn device_count(&self) -> Result<usize, DriverError>;

    fn compute_processes(&self, dev: usize) -> Result<Vec<ProcessMemorySample>, DriverError>;

    /// Samples newer than `since_us` (microseconds since the epoch)
    fn process_utilization(
        &self,
        dev: usize,
        since_us: u64,
    ) -> Result<Vec<UtilizationSample>, DriverError>;
}

/// Is a pid still a live (non-zombie) process?
pub trait LivenessCheck: Send + Sync {
    fn is_alive(&self, pid: i32) -> bool;
}

/// Translate a container pid into the host pid namespace
pub trait HostPidResolver: Send + Sync {
    fn resolve(&self, container_pid: i32) -> Option<i32>;
}
