//! Simulated device, management API and process table
//!
//! Stand-ins for the vendor libraries so the accounting and throttling
//! logic can be driven end to end on a machine without an accelerator:
//! by the test suites, by `softmig-stress`, and by anyone embedding the
//! runtime who wants a dry run.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use softmig_core::constants::LARGE_ALLOC_ALIGN;
use softmig_core::{
    AllocHandle, DeviceDriver, DevicePtr, DeviceSpec, DriverError, HostPidResolver,
    LargeAllocation, LivenessCheck, ManagementApi, ProcessMemorySample, StreamHandle,
    UtilizationSample,
};

/// First address handed out by `SimDriver`
const SIM_BASE_ADDRESS: u64 = 0x7f00_0000_0000;

/// Allocation granularity of the plain path
const SIM_ALIGN: u64 = 256;

/// Status returned for an unknown pointer
const INVALID_VALUE: DriverError = DriverError::new(1);

#[inline]
fn round_up(v: u64, align: u64) -> u64 {
    v.div_ceil(align).saturating_mul(align)
}

#[derive(Debug, Default)]
struct SimState {
    next_address: u64,
    /// address -> physical bytes
    live: HashMap<DevicePtr, u64>,
    physical_used: u64,
    pool_used: u64,
    pool_reserved: u64,
    fail_next: Option<DriverError>,
}

/// Bump-pointer device with a finite physical capacity
#[derive(Debug)]
pub struct SimDriver {
    spec: DeviceSpec,
    capacity: u64,
    device: AtomicUsize,
    next_handle: AtomicU64,
    spec_available: AtomicBool,
    state: Mutex<SimState>,
}

impl SimDriver {
    /// Device with `capacity` bytes of physical memory
    pub fn new(spec: DeviceSpec, capacity: u64) -> Self {
        SimDriver {
            spec,
            capacity,
            device: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
            spec_available: AtomicBool::new(true),
            state: Mutex::new(SimState {
                next_address: SIM_BASE_ADDRESS,
                ..SimState::default()
            }),
        }
    }

    /// Switch the calling context's device
    pub fn set_device(&self, dev: usize) {
        self.device.store(dev, Ordering::Relaxed);
    }

    /// Make `device_spec` fail until turned back on
    pub fn set_spec_available(&self, available: bool) {
        self.spec_available.store(available, Ordering::Relaxed);
    }

    /// Make the next allocation fail with `err`
    pub fn fail_next(&self, err: DriverError) {
        self.state.lock().fail_next = Some(err);
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn physical_used(&self) -> u64 {
        self.state.lock().physical_used
    }

    fn carve(&self, length: u64) -> Result<DevicePtr, DriverError> {
        let mut st = self.state.lock();
        if let Some(err) = st.fail_next.take() {
            return Err(err);
        }
        if st.physical_used.saturating_add(length) > self.capacity {
            return Err(DriverError::OUT_OF_MEMORY);
        }
        let addr = st.next_address;
        st.next_address = st.next_address.saturating_add(round_up(length.max(1), SIM_ALIGN));
        st.physical_used += length;
        st.live.insert(addr, length);
        Ok(addr)
    }

    fn release(&self, ptr: DevicePtr) -> Result<u64, DriverError> {
        let mut st = self.state.lock();
        let length = st.live.remove(&ptr).ok_or(INVALID_VALUE)?;
        st.physical_used -= length;
        Ok(length)
    }
}

impl DeviceDriver for SimDriver {
    fn current_device(&self) -> Result<usize, DriverError> {
        Ok(self.device.load(Ordering::Relaxed))
    }

    fn mem_alloc(&self, size: u64) -> Result<DevicePtr, DriverError> {
        self.carve(size)
    }

    fn mem_alloc_large(&self, size: u64) -> Result<LargeAllocation, DriverError> {
        let length = round_up(size, LARGE_ALLOC_ALIGN);
        let address = self.carve(length)?;
        Ok(LargeAllocation {
            address,
            handle: AllocHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)),
        })
    }

    fn mem_free(&self, ptr: DevicePtr, _handle: Option<AllocHandle>) -> Result<(), DriverError> {
        self.release(ptr).map(|_| ())
    }

    fn mem_alloc_async(&self, size: u64, _stream: StreamHandle) -> Result<DevicePtr, DriverError> {
        let addr = self.carve(size)?;
        let mut st = self.state.lock();
        st.pool_used += size;
        if st.pool_used > st.pool_reserved {
            st.pool_reserved = round_up(st.pool_used, LARGE_ALLOC_ALIGN);
        }
        Ok(addr)
    }

    fn mem_free_async(&self, ptr: DevicePtr, _stream: StreamHandle) -> Result<(), DriverError> {
        let length = self.release(ptr)?;
        let mut st = self.state.lock();
        st.pool_used = st.pool_used.saturating_sub(length);
        Ok(())
    }

    fn pool_reserved_high(&self, _dev: usize) -> Result<u64, DriverError> {
        Ok(self.state.lock().pool_reserved)
    }

    fn device_spec(&self, _dev: usize) -> Result<DeviceSpec, DriverError> {
        if !self.spec_available.load(Ordering::Relaxed) {
            return Err(DriverError::NOT_SUPPORTED);
        }
        Ok(self.spec)
    }
}

#[derive(Debug, Default)]
struct SimDeviceView {
    processes: Vec<ProcessMemorySample>,
    utilization: Vec<UtilizationSample>,
}

/// Management API whose observations are set by the caller
#[derive(Debug)]
pub struct SimManagement {
    device_count: usize,
    devices: Mutex<HashMap<usize, SimDeviceView>>,
}

impl SimManagement {
    pub fn new(device_count: usize) -> Self {
        SimManagement {
            device_count,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_processes(&self, dev: usize, processes: Vec<ProcessMemorySample>) {
        self.devices.lock().entry(dev).or_default().processes = processes;
    }

    pub fn set_utilization(&self, dev: usize, samples: Vec<UtilizationSample>) {
        self.devices.lock().entry(dev).or_default().utilization = samples;
    }
}

impl ManagementApi for SimManagement {
    fn device_count(&self) -> Result<usize, DriverError> {
        Ok(self.device_count)
    }

    fn compute_processes(&self, dev: usize) -> Result<Vec<ProcessMemorySample>, DriverError> {
        Ok(self
            .devices
            .lock()
            .get(&dev)
            .map(|d| d.processes.clone())
            .unwrap_or_default())
    }

    fn process_utilization(
        &self,
        dev: usize,
        _since_us: u64,
    ) -> Result<Vec<UtilizationSample>, DriverError> {
        Ok(self
            .devices
            .lock()
            .get(&dev)
            .map(|d| d.utilization.clone())
            .unwrap_or_default())
    }
}

/// Every positive pid is alive
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAlive;

impl LivenessCheck for AlwaysAlive {
    fn is_alive(&self, pid: i32) -> bool {
        pid > 0
    }
}

/// Every positive pid is alive until marked dead
#[derive(Debug, Default)]
pub struct StaticLiveness {
    dead: Mutex<HashSet<i32>>,
}

impl StaticLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dead(&self, pid: i32) {
        self.dead.lock().insert(pid);
    }

    pub fn revive(&self, pid: i32) {
        self.dead.lock().remove(&pid);
    }
}

impl LivenessCheck for StaticLiveness {
    fn is_alive(&self, pid: i32) -> bool {
        pid > 0 && !self.dead.lock().contains(&pid)
    }
}

/// Resolver with a fixed answer
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedResolver(pub Option<i32>);

impl HostPidResolver for FixedResolver {
    fn resolve(&self, _container_pid: i32) -> Option<i32> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_capacity() {
        let d = SimDriver::new(DeviceSpec::new(4, 1024), 1024);
        let a = d.mem_alloc(1000).unwrap();
        assert_eq!(d.mem_alloc(100), Err(DriverError::OUT_OF_MEMORY));
        d.mem_free(a, None).unwrap();
        assert_eq!(d.mem_free(a, None), Err(INVALID_VALUE));
        assert_eq!(d.physical_used(), 0);
    }

    #[test]
    fn test_large_rounds_to_granularity() {
        let d = SimDriver::new(DeviceSpec::new(4, 1024), 1 << 30);
        let big = d.mem_alloc_large(3 << 20).unwrap();
        assert_eq!(d.physical_used(), 4 << 20);
        d.mem_free(big.address, Some(big.handle)).unwrap();
        assert_eq!(d.physical_used(), 0);
    }

    #[test]
    fn test_pool_reserved_is_high_mark() {
        let d = SimDriver::new(DeviceSpec::new(4, 1024), 1 << 30);
        let p = d.mem_alloc_async(1 << 20, StreamHandle(0)).unwrap();
        assert_eq!(d.pool_reserved_high(0).unwrap(), 2 << 20);
        d.mem_free_async(p, StreamHandle(0)).unwrap();
        assert_eq!(d.pool_reserved_high(0).unwrap(), 2 << 20);
    }

    #[test]
    fn test_fail_next() {
        let d = SimDriver::new(DeviceSpec::new(4, 1024), 1 << 30);
        d.fail_next(DriverError::new(999));
        assert_eq!(d.mem_alloc(1), Err(DriverError::new(999)));
        assert!(d.mem_alloc(1).is_ok());
    }

    #[test]
    fn test_static_liveness() {
        let p = StaticLiveness::new();
        assert!(p.is_alive(5));
        p.mark_dead(5);
        assert!(!p.is_alive(5));
        p.revive(5);
        assert!(p.is_alive(5));
        assert!(!p.is_alive(0));
    }
}
