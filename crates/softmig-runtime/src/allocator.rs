//! Admission-controlled device allocator
//!
//! Wraps a `DeviceDriver` so every allocation is charged to this process's
//! slot before it is allowed to stand. Charging is reserve-then-verify: the
//! bytes are added first and the aggregate is read after a full fence, so
//! of two processes racing toward the limit at least one sees the other's
//! reservation. Over the limit, the reservation is rolled back, dead slots
//! are reaped and the request is tried once more.
//!
//! The tracking lists are process-local; the shared region only ever sees
//! the byte counts.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use softmig_core::constants::IPC_SIZE_THRESHOLD;
use softmig_core::{
    AllocationEntry, AllocationList, DeviceDriver, DevicePtr, MemoryType, StreamHandle,
    UsageKind,
};
use tracing::{debug, trace, warn};

use crate::error::{AllocError, AllocResult};
use crate::region::RegionHandle;

/// Result of `Allocator::free`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Tracked allocation released; `bytes` were uncharged
    Freed { bytes: u64 },
    /// Pointer was not ours; the raw free was still forwarded
    NotFound,
}

#[derive(Debug, Default)]
struct Tracked {
    sync: AllocationList,
    pooled: AllocationList,
}

pub struct Allocator {
    region: Arc<RegionHandle>,
    driver: Arc<dyn DeviceDriver>,
    state: Mutex<Tracked>,
}

impl Allocator {
    pub fn new(region: Arc<RegionHandle>, driver: Arc<dyn DeviceDriver>) -> Self {
        Allocator {
            region,
            driver,
            state: Mutex::new(Tracked::default()),
        }
    }

    pub fn region(&self) -> &Arc<RegionHandle> {
        &self.region
    }

    /// Would `size` more bytes on `dev` fit under the limit?
    ///
    /// Read-only: nothing is charged. Reaps dead slots and re-checks once
    /// before refusing.
    pub fn admission_check(&self, dev: usize, size: u64) -> AllocResult<()> {
        let limit = self.region.configured_limit(dev)?;
        if limit == 0 {
            return Ok(());
        }
        let mut usage = self.region.total_usage(dev)?;
        if usage.saturating_add(size) > limit {
            if self.region.clear_dead_slots() == 0 {
                return Err(oom(dev, size, usage, limit));
            }
            usage = self.region.total_usage(dev)?;
            if usage.saturating_add(size) > limit {
                return Err(oom(dev, size, usage, limit));
            }
        }
        Ok(())
    }

    /// Charge `bytes` to this process unless that would exceed the limit
    fn reserve(&self, dev: usize, bytes: u64, kind: UsageKind) -> AllocResult<()> {
        let limit = self.region.configured_limit(dev)?;
        let pid = self.region.pid();
        let mut retried = false;
        loop {
            self.region.add_usage(pid, dev, bytes, kind)?;
            if limit == 0 {
                return Ok(());
            }
            fence(Ordering::SeqCst);
            let usage = self.region.total_usage(dev)?;
            if usage <= limit {
                trace!(pid, dev, bytes, usage, limit, "reserved");
                return Ok(());
            }

            self.region.remove_usage(pid, dev, bytes, kind)?;
            let others = usage.saturating_sub(bytes);
            if retried || self.region.clear_dead_slots() == 0 {
                return Err(oom(dev, bytes, others, limit));
            }
            retried = true;
        }
    }

    /// Undo a reservation after the driver refused the allocation
    fn unreserve(&self, dev: usize, bytes: u64, kind: UsageKind) {
        if let Err(e) = self.region.remove_usage(self.region.pid(), dev, bytes, kind) {
            warn!(dev, bytes, error = %e, "failed to roll back reservation");
        }
    }

    /// Allocate `size` bytes of data memory on the current device
    pub fn allocate(&self, size: u64) -> AllocResult<DevicePtr> {
        self.allocate_as(size, UsageKind::Data)
    }

    /// Allocate `size` bytes charged to `kind`
    pub fn allocate_as(&self, size: u64, kind: UsageKind) -> AllocResult<DevicePtr> {
        let dev = self.driver.current_device()?;
        let mut st = self.state.lock();
        self.reserve(dev, size, kind)?;

        let allocated = if size <= IPC_SIZE_THRESHOLD {
            self.driver.mem_alloc(size).map(|address| (address, None))
        } else {
            self.driver
                .mem_alloc_large(size)
                .map(|large| (large.address, Some(large.handle)))
        };
        let (address, handle) = match allocated {
            Ok(a) => a,
            Err(e) => {
                self.unreserve(dev, size, kind);
                debug!(dev, size, code = e.code, "driver allocation failed");
                return Err(e.into());
            }
        };

        st.sync.push(AllocationEntry {
            address,
            length: size,
            device: dev,
            kind,
            handle,
        });
        trace!(dev, size, address, "allocated");
        Ok(address)
    }

    /// Release an allocation made by `allocate`
    ///
    /// Unknown pointers are still handed to the driver: they come from paths
    /// this allocator cannot observe.
    pub fn free(&self, address: DevicePtr) -> AllocResult<FreeOutcome> {
        let mut st = self.state.lock();
        let Some(entry) = st.sync.remove(address) else {
            self.driver.mem_free(address, None)?;
            debug!(address, "freed untracked pointer");
            return Ok(FreeOutcome::NotFound);
        };

        if let Err(e) = self.driver.mem_free(address, entry.handle) {
            st.sync.push(entry);
            return Err(e.into());
        }
        self.region
            .remove_usage(self.region.pid(), entry.device, entry.length, entry.kind)?;
        Ok(FreeOutcome::Freed {
            bytes: entry.length,
        })
    }

    /// Stream-ordered allocation
    ///
    /// Only the growth of the pool's reserved-high mark is charged; memory
    /// the pool already holds is reused without touching the region.
    pub fn allocate_async(&self, size: u64, stream: StreamHandle) -> AllocResult<DevicePtr> {
        let dev = self.driver.current_device()?;
        let mut st = self.state.lock();
        self.admission_check(dev, size)?;

        let address = self.driver.mem_alloc_async(size, stream)?;
        let reserved = match self.driver.pool_reserved_high(dev) {
            Ok(r) => r,
            Err(e) => {
                warn!(dev, code = e.code, "pool query failed, charging full size");
                st.pooled.high_water().saturating_add(size)
            }
        };
        let charged = st.pooled.charge_pool(reserved, size);

        if charged > 0 {
            if let Err(e) = self.reserve(dev, charged, UsageKind::Data) {
                st.pooled.release_pool(charged);
                if let Err(free_err) = self.driver.mem_free_async(address, stream) {
                    warn!(address, code = free_err.code, "failed to return refused pool allocation");
                }
                return Err(e);
            }
        }

        st.pooled.push(AllocationEntry {
            address,
            length: charged,
            device: dev,
            kind: UsageKind::Data,
            handle: None,
        });
        trace!(dev, size, charged, address, "allocated from pool");
        Ok(address)
    }

    /// Release a stream-ordered allocation
    pub fn free_async(&self, address: DevicePtr, stream: StreamHandle) -> AllocResult<FreeOutcome> {
        let mut st = self.state.lock();
        let Some(entry) = st.pooled.remove(address) else {
            self.driver.mem_free_async(address, stream)?;
            return Ok(FreeOutcome::NotFound);
        };

        if let Err(e) = self.driver.mem_free_async(address, stream) {
            st.pooled.push(entry);
            return Err(e.into());
        }
        st.pooled.release_pool(entry.length);
        if entry.length > 0 {
            self.region
                .remove_usage(self.region.pid(), entry.device, entry.length, entry.kind)?;
        }
        Ok(FreeOutcome::Freed {
            bytes: entry.length,
        })
    }

    /// Account memory that was allocated behind our back
    pub fn register_external(&self, address: DevicePtr, size: u64) -> AllocResult<()> {
        let dev = self.driver.current_device()?;
        let mut st = self.state.lock();
        self.reserve(dev, size, UsageKind::Data)?;
        st.sync.push(AllocationEntry {
            address,
            length: size,
            device: dev,
            kind: UsageKind::Data,
            handle: None,
        });
        Ok(())
    }

    pub fn memory_type(&self, address: DevicePtr) -> MemoryType {
        self.state.lock().sync.memory_type(address)
    }

    /// Bytes currently charged through this allocator
    pub fn tracked_bytes(&self) -> u64 {
        let st = self.state.lock();
        st.sync.total_bytes().saturating_add(st.pooled.total_bytes())
    }
}

fn oom(dev: usize, requested: u64, usage: u64, limit: u64) -> AllocError {
    warn!(dev, requested, usage, limit, "device memory limit reached");
    AllocError::OutOfMemory {
        dev,
        requested,
        usage,
        limit,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::sim::{AlwaysAlive, SimDriver, StaticLiveness};
    use softmig_core::{DeviceSpec, DriverError, LivenessCheck};

    const MIB: u64 = 1 << 20;

    struct Fixture {
        _dir: tempfile::TempDir,
        cfg: RegionConfig,
    }

    impl Fixture {
        fn new(limit: u64) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cfg = RegionConfig::new()
                .path(dir.path().join("region.cache"))
                .memory_limit(0, limit);
            Fixture { _dir: dir, cfg }
        }

        fn process(&self, pid: i32, liveness: Arc<dyn LivenessCheck>) -> (Allocator, Arc<SimDriver>) {
            let region = Arc::new(RegionHandle::attach_with(self.cfg.clone(), pid, liveness).unwrap());
            region.register_self().unwrap();
            let driver = Arc::new(SimDriver::new(DeviceSpec::new(8, 1024), 1 << 40));
            (Allocator::new(region, driver.clone()), driver)
        }
    }

    #[test]
    fn test_allocate_free_round_trip() {
        let fx = Fixture::new(0);
        let (alloc, driver) = fx.process(4001, Arc::new(AlwaysAlive));
        let before = alloc.region().total_usage(0).unwrap();

        let small = alloc.allocate(4096).unwrap();
        let large = alloc.allocate(3 * MIB).unwrap();
        assert_eq!(alloc.region().total_usage(0).unwrap(), before + 4096 + 3 * MIB);
        assert_eq!(alloc.tracked_bytes(), 4096 + 3 * MIB);
        assert_eq!(driver.live_allocations(), 2);

        assert_eq!(alloc.free(large).unwrap(), FreeOutcome::Freed { bytes: 3 * MIB });
        assert_eq!(alloc.free(small).unwrap(), FreeOutcome::Freed { bytes: 4096 });
        assert_eq!(alloc.region().total_usage(0).unwrap(), before);
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn test_cross_process_limit() {
        let fx = Fixture::new(100);
        let (a, _) = fx.process(4001, Arc::new(AlwaysAlive));
        let (b, _) = fx.process(4002, Arc::new(AlwaysAlive));

        a.allocate(60).unwrap();
        let err = b.allocate(60).unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(matches!(
            err,
            AllocError::OutOfMemory { dev: 0, requested: 60, usage: 60, limit: 100 }
        ));
        // Refusal left nothing behind
        assert_eq!(b.region().total_usage(0).unwrap(), 60);
        b.allocate(40).unwrap();
        assert_eq!(a.region().total_usage(0).unwrap(), 100);
    }

    #[test]
    fn test_dead_process_usage_is_reclaimed() {
        let fx = Fixture::new(100);
        let liveness = Arc::new(StaticLiveness::new());
        let (a, _) = fx.process(4001, liveness.clone());
        let (b, _) = fx.process(4002, liveness.clone());

        b.allocate(80).unwrap();
        assert!(a.admission_check(0, 30).is_err());
        liveness.mark_dead(4002);
        a.allocate(30).unwrap();
        assert_eq!(a.region().total_usage(0).unwrap(), 30);
    }

    #[test]
    fn test_admission_check_is_read_only() {
        let fx = Fixture::new(100);
        let (a, _) = fx.process(4001, Arc::new(AlwaysAlive));
        a.admission_check(0, 100).unwrap();
        assert!(a.admission_check(0, 101).is_err());
        assert_eq!(a.region().total_usage(0).unwrap(), 0);
    }

    #[test]
    fn test_driver_failure_rolls_back() {
        let fx = Fixture::new(0);
        let (a, driver) = fx.process(4001, Arc::new(AlwaysAlive));
        driver.fail_next(DriverError::new(999));
        let err = a.allocate(4096).unwrap_err();
        assert!(matches!(err, AllocError::Driver(DriverError { code: 999 })));
        assert_eq!(a.region().total_usage(0).unwrap(), 0);
        assert_eq!(a.tracked_bytes(), 0);
    }

    #[test]
    fn test_untracked_free_is_forwarded() {
        let fx = Fixture::new(0);
        let (a, driver) = fx.process(4001, Arc::new(AlwaysAlive));
        let raw = driver.mem_alloc(512).unwrap();
        assert_eq!(a.free(raw).unwrap(), FreeOutcome::NotFound);
        assert_eq!(driver.live_allocations(), 0);
        assert!(a.free(raw).is_err());
    }

    #[test]
    fn test_async_charges_pool_growth_only() {
        let fx = Fixture::new(0);
        let (a, _) = fx.process(4001, Arc::new(AlwaysAlive));
        let s = StreamHandle(1);

        let p1 = a.allocate_async(MIB, s).unwrap();
        // Pool reserved 2 MiB; only the requested 1 MiB is new to us
        assert_eq!(a.region().total_usage(0).unwrap(), MIB);
        let p2 = a.allocate_async(MIB / 2, s).unwrap();
        assert_eq!(a.region().total_usage(0).unwrap(), MIB + MIB / 2);

        assert_eq!(a.free_async(p2, s).unwrap(), FreeOutcome::Freed { bytes: MIB / 2 });
        assert_eq!(a.free_async(p1, s).unwrap(), FreeOutcome::Freed { bytes: MIB });
        assert_eq!(a.region().total_usage(0).unwrap(), 0);
    }

    #[test]
    fn test_async_respects_limit() {
        let fx = Fixture::new(MIB);
        let (a, driver) = fx.process(4001, Arc::new(AlwaysAlive));
        assert!(a.allocate_async(2 * MIB, StreamHandle(0)).unwrap_err().is_out_of_memory());
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn test_register_external_and_memory_type() {
        let fx = Fixture::new(1000);
        let (a, _) = fx.process(4001, Arc::new(AlwaysAlive));
        a.register_external(0x10_0000, 600).unwrap();
        assert_eq!(a.memory_type(0x10_0100), MemoryType::Device);
        assert_eq!(a.memory_type(0x20_0000), MemoryType::Host);
        assert!(a.register_external(0x30_0000, 600).is_err());
        assert_eq!(a.tracked_bytes(), 600);
    }

    #[test]
    fn test_context_kind_is_kept() {
        let fx = Fixture::new(0);
        let (a, _) = fx.process(4001, Arc::new(AlwaysAlive));
        let p = a.allocate_as(128, UsageKind::Context).unwrap();
        let bd = a.region().slot_usage(4001, 0).unwrap().unwrap();
        assert_eq!((bd.context, bd.data), (128, 0));
        a.free(p).unwrap();
        assert_eq!(a.region().slot_usage(4001, 0).unwrap().unwrap().context, 0);
    }
}
