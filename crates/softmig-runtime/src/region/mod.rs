//! Shared region: layout, attach and one-time initialization
//!
//! Every cooperating process maps the same file `MAP_SHARED` and sees one
//! `SharedRegionLayout`. The first attacher wins a CAS on
//! `initialized_flag` and populates the header; everyone else polls until
//! the flag reads complete and then checks that their own configuration
//! agrees with what the winner stored.
//!
//! # Design
//!
//! The layout is `repr(C)` and valid when zero-filled, so a freshly
//! truncated file is a valid `Uninitialized` region. All mutable fields are
//! atomics, so `&SharedRegionLayout` is safe to hand out; the semaphores are
//! the one exception and are only touched through `Semaphore`.
//!
//! Slots are never compacted. `slot_high_water` bounds every scan, and a
//! process caches its own slot index for its lifetime.

pub mod sem;

pub use sem::{Semaphore, WaitOutcome};

use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use softmig_core::constants::{
    INIT_COMPLETE_MAGIC, MAJOR_VERSION, MAX_DEVICES, MAX_PROCS, MINOR_VERSION,
    RECENT_KERNEL_DEFAULT, UUID_LEN,
};
use softmig_core::{
    CoreError, InitState, LivenessCheck, ProcStatus, ProcessSlot, UsageBreakdown,
    UtilizationPolicy,
};
use tracing::{debug, info};

use crate::config::RegionConfig;
use crate::error::{RegionError, RegionResult};
use crate::liveness::ProcLiveness;

/// Marker for "own slot not cached yet"
const NO_SLOT: usize = usize::MAX;

/// The shared region, exactly as laid out in the backing file
#[repr(C)]
pub struct SharedRegionLayout {
    pub initialized_flag: AtomicI32,
    pub major_version: AtomicU32,
    pub minor_version: AtomicU32,
    pub sm_init_flag: AtomicI32,
    /// Pid recorded by the current holder of `sem`, 0 when released
    pub owner_pid: AtomicI32,
    _pad0: u32,
    /// Coarse lock over slot allocation and cross-slot scans
    pub sem: Semaphore,
    /// Serializes host-pid resolution
    pub sem_postinit: Semaphore,
    pub device_num: AtomicU64,
    _uuids: [[u8; UUID_LEN]; MAX_DEVICES],
    /// Memory limit per device in bytes, 0 = unlimited
    pub limit: [AtomicU64; MAX_DEVICES],
    /// SM limit per device in percent
    pub sm_limit: [AtomicU64; MAX_DEVICES],
    pub procs: [ProcessSlot; MAX_PROCS],
    /// Number of occupied slots
    pub proc_num: AtomicI32,
    /// One past the highest slot index ever handed out
    pub slot_high_water: AtomicI32,
    pub utilization_switch: AtomicI32,
    pub recent_kernel: AtomicI32,
    pub priority: AtomicI32,
    _pad1: u32,
    /// Seconds since the epoch of the latest recorded kernel launch
    pub last_kernel_time: AtomicU64,
    _reserved: [u64; 4],
}

/// Size of the backing file
pub const REGION_SIZE: usize = core::mem::size_of::<SharedRegionLayout>();

/// Owned copy of one slot, for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub index: usize,
    pub pid: i32,
    pub hostpid: i32,
    pub status: ProcStatus,
    pub devices: Vec<DeviceSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub dev: usize,
    pub usage: UsageBreakdown,
    /// False when the seqlock read fell back to best effort
    pub consistent: bool,
    pub monitor: u64,
    pub sm_util: u64,
}

/// This process's attachment to the shared region
///
/// Dropping the handle unmaps the region but leaves the slot in place, the
/// same as a crash; call `remove_self` for a clean exit.
pub struct RegionHandle {
    region: NonNull<SharedRegionLayout>,
    file: File,
    config: RegionConfig,
    pid: i32,
    my_slot: AtomicUsize,
    liveness: Arc<dyn LivenessCheck>,
}

// Safety: the mapping is process-wide and every field reachable through it
// is an atomic or a process-shared semaphore.
unsafe impl Send for RegionHandle {}
unsafe impl Sync for RegionHandle {}

/// Pid of the calling process
pub fn current_pid() -> i32 {
    nix::unistd::getpid().as_raw()
}

/// Seconds since the epoch
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RegionHandle {
    /// Attach as the calling process
    pub fn attach(config: RegionConfig) -> RegionResult<Self> {
        Self::attach_with(config, current_pid(), Arc::new(ProcLiveness))
    }

    /// Attach with an explicit identity and liveness check
    ///
    /// Lets one OS process stand in for several cooperating processes.
    pub fn attach_with(
        config: RegionConfig,
        pid: i32,
        liveness: Arc<dyn LivenessCheck>,
    ) -> RegionResult<Self> {
        config.validate()?;
        config.log();
        let path = config.path.clone();
        let handle = Self::map(&path, true, config, pid, liveness)?;
        handle.initialize()?;
        handle.validate()?;
        debug!(pid, path = %path.display(), "attached to shared region");
        Ok(handle)
    }

    /// Attach read-mostly to an existing region without checking limits
    ///
    /// For administration tools that do not share the workload's
    /// environment. The region must already be initialized.
    pub fn inspect(path: impl AsRef<Path>) -> RegionResult<Self> {
        let path = path.as_ref();
        let config = RegionConfig::new().path(path);
        let handle = Self::map(path, false, config, current_pid(), Arc::new(ProcLiveness))?;
        let flag = handle.region().initialized_flag.load(Ordering::Acquire);
        if flag != INIT_COMPLETE_MAGIC {
            return Err(RegionError::NotInitialized(flag));
        }
        handle.check_version()?;
        Ok(handle)
    }

    fn map(
        path: &Path,
        create: bool,
        config: RegionConfig,
        pid: i32,
        liveness: Arc<dyn LivenessCheck>,
    ) -> RegionResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .mode(0o666)
            .open(path)
            .map_err(|source| RegionError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        if file.metadata()?.len() < REGION_SIZE as u64 {
            // A short file was never initialized; inspection leaves it alone
            if !create {
                return Err(RegionError::NotInitialized(0));
            }
            file.set_len(REGION_SIZE as u64)?;
        }

        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                REGION_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RegionError::Os(Errno::last()));
        }
        let region = NonNull::new(base as *mut SharedRegionLayout)
            .ok_or(RegionError::Os(Errno::EFAULT))?;

        Ok(RegionHandle {
            region,
            file,
            config,
            pid,
            my_slot: AtomicUsize::new(NO_SLOT),
            liveness,
        })
    }

    /// Run or wait for the one-time initialization
    fn initialize(&self) -> RegionResult<()> {
        let r = self.region();
        if r.initialized_flag.load(Ordering::Acquire) == INIT_COMPLETE_MAGIC {
            return Ok(());
        }

        let uninit = InitState::Uninitialized as i32;
        let in_progress = InitState::InProgress as i32;
        if r
            .initialized_flag
            .compare_exchange(uninit, in_progress, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Err(e) = self.populate() {
                // Let the next attacher try again
                r.initialized_flag.store(uninit, Ordering::Release);
                return Err(e);
            }
            return Ok(());
        }

        let start = Instant::now();
        loop {
            let flag = r.initialized_flag.load(Ordering::Acquire);
            if flag == INIT_COMPLETE_MAGIC {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= self.config.init_wait {
                return Err(RegionError::InitTimeout { waited, flag });
            }
            thread::sleep(self.config.init_poll);
        }
    }

    fn populate(&self) -> RegionResult<()> {
        let r = self.region();
        let cfg = &self.config;

        r.sem.init(1)?;
        r.sem_postinit.init(1)?;

        r.major_version.store(MAJOR_VERSION, Ordering::Relaxed);
        r.minor_version.store(MINOR_VERSION, Ordering::Relaxed);
        r.device_num.store(cfg.device_count as u64, Ordering::Relaxed);
        for dev in 0..MAX_DEVICES {
            r.limit[dev].store(cfg.memory_limits[dev], Ordering::Relaxed);
            r.sm_limit[dev].store(cfg.sm_limits[dev], Ordering::Relaxed);
        }
        r.sm_init_flag.store(0, Ordering::Relaxed);
        r.owner_pid.store(0, Ordering::Relaxed);
        r.proc_num.store(0, Ordering::Relaxed);
        r.slot_high_water.store(0, Ordering::Relaxed);
        r.utilization_switch.store(1, Ordering::Relaxed);
        r.recent_kernel.store(RECENT_KERNEL_DEFAULT, Ordering::Relaxed);
        r.priority.store(cfg.priority, Ordering::Relaxed);
        r.last_kernel_time.store(now_secs(), Ordering::Relaxed);

        r.initialized_flag
            .store(INIT_COMPLETE_MAGIC, Ordering::Release);
        info!(
            pid = self.pid,
            path = %cfg.path.display(),
            devices = cfg.device_count,
            "initialized shared region"
        );
        Ok(())
    }

    fn check_version(&self) -> RegionResult<()> {
        let (found_major, found_minor) = self.version();
        if found_major != MAJOR_VERSION || found_minor != MINOR_VERSION {
            return Err(RegionError::VersionMismatch {
                expected_major: MAJOR_VERSION,
                expected_minor: MINOR_VERSION,
                found_major,
                found_minor,
            });
        }
        Ok(())
    }

    /// Our configuration must agree with whatever the initializer stored
    fn validate(&self) -> RegionResult<()> {
        self.check_version()?;
        let r = self.region();
        for dev in 0..MAX_DEVICES {
            let found = r.limit[dev].load(Ordering::Relaxed);
            let expected = self.config.memory_limits[dev];
            if found != expected {
                return Err(RegionError::LimitMismatch {
                    dev,
                    what: "memory",
                    expected,
                    found,
                });
            }
            let found = r.sm_limit[dev].load(Ordering::Relaxed);
            let expected = self.config.sm_limits[dev];
            if found != expected {
                return Err(RegionError::LimitMismatch {
                    dev,
                    what: "sm",
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn region(&self) -> &SharedRegionLayout {
        // Safety: mapped for REGION_SIZE bytes until Drop; every field is
        // valid for any bit pattern the protocol can produce.
        unsafe { self.region.as_ref() }
    }

    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub fn path(&self) -> &PathBuf {
        &self.config.path
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn liveness(&self) -> &dyn LivenessCheck {
        self.liveness.as_ref()
    }

    /// Address range of the mapping
    pub(crate) fn address_range(&self) -> Range<usize> {
        let start = self.region.as_ptr() as usize;
        start..start + REGION_SIZE
    }

    pub fn init_state(&self) -> Option<InitState> {
        InitState::from_raw(self.region().initialized_flag.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.init_state() == Some(InitState::Complete)
    }

    pub fn version(&self) -> (u32, u32) {
        let r = self.region();
        (
            r.major_version.load(Ordering::Relaxed),
            r.minor_version.load(Ordering::Relaxed),
        )
    }

    pub fn device_count(&self) -> usize {
        (self.region().device_num.load(Ordering::Relaxed) as usize).min(MAX_DEVICES)
    }

    /// Memory limit of `dev` in bytes, 0 = unlimited
    pub fn configured_limit(&self, dev: usize) -> RegionResult<u64> {
        self.region()
            .limit
            .get(dev)
            .map(|l| l.load(Ordering::Relaxed))
            .ok_or(RegionError::Core(CoreError::InvalidDevice(dev)))
    }

    /// SM limit of `dev` in percent
    pub fn configured_sm_limit(&self, dev: usize) -> RegionResult<u64> {
        self.region()
            .sm_limit
            .get(dev)
            .map(|l| l.load(Ordering::Relaxed))
            .ok_or(RegionError::Core(CoreError::InvalidDevice(dev)))
    }

    pub fn priority(&self) -> i32 {
        self.region().priority.load(Ordering::Relaxed)
    }

    pub fn recent_kernel(&self) -> i32 {
        self.region().recent_kernel.load(Ordering::Acquire)
    }

    pub fn set_recent_kernel(&self, value: i32) {
        self.region().recent_kernel.store(value, Ordering::Release);
    }

    /// Raw shared switch
    pub fn utilization_switch(&self) -> bool {
        self.region().utilization_switch.load(Ordering::Acquire) != 0
    }

    pub fn set_utilization_switch(&self, on: bool) {
        self.region()
            .utilization_switch
            .store(on as i32, Ordering::Release);
    }

    /// Switch after applying this process's policy override
    pub fn effective_utilization_switch(&self) -> bool {
        match self.config.utilization_policy {
            UtilizationPolicy::Force => true,
            UtilizationPolicy::Disable => false,
            UtilizationPolicy::Default => self.utilization_switch(),
        }
    }

    pub fn last_kernel_time(&self) -> u64 {
        self.region().last_kernel_time.load(Ordering::Acquire)
    }

    /// Occupied slot count
    pub fn proc_num(&self) -> i32 {
        self.region().proc_num.load(Ordering::Acquire)
    }

    /// Slots that may be occupied (below the high-water mark)
    pub(crate) fn slots(&self) -> &[ProcessSlot] {
        let r = self.region();
        let hwm = (r.slot_high_water.load(Ordering::Acquire).max(0) as usize).min(MAX_PROCS);
        &r.procs[..hwm]
    }

    pub(crate) fn cached_slot(&self) -> Option<usize> {
        match self.my_slot.load(Ordering::Acquire) {
            NO_SLOT => None,
            idx => Some(idx),
        }
    }

    pub(crate) fn cache_slot(&self, idx: Option<usize>) {
        self.my_slot.store(idx.unwrap_or(NO_SLOT), Ordering::Release);
    }

    /// Owned copy of every occupied slot
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let devices = self.device_count();
        self.slots()
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_free())
            .map(|(index, slot)| SlotSnapshot {
                index,
                pid: slot.pid(),
                hostpid: slot.hostpid(),
                status: slot.status(),
                devices: (0..devices)
                    .filter_map(|dev| {
                        let read = slot.breakdown(dev).ok()?;
                        Some(DeviceSnapshot {
                            dev,
                            usage: read.value,
                            consistent: read.consistent,
                            monitor: slot.monitor(dev),
                            sm_util: slot.sm_util(dev),
                        })
                    })
                    .collect(),
            })
            .collect()
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        crate::signal::clear_status_target_in(self.address_range());
        unsafe {
            libc::munmap(self.region.as_ptr() as *mut libc::c_void, REGION_SIZE);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::AlwaysAlive;

    fn config(dir: &tempfile::TempDir) -> RegionConfig {
        RegionConfig::new()
            .path(dir.path().join("region.cache"))
            .device_count(2)
            .memory_limit(0, 1 << 30)
    }

    fn attach(cfg: RegionConfig, pid: i32) -> RegionResult<RegionHandle> {
        RegionHandle::attach_with(cfg, pid, Arc::new(AlwaysAlive))
    }

    #[test]
    fn test_layout_is_stable() {
        assert_eq!(REGION_SIZE % 8, 0);
        assert_eq!(core::mem::align_of::<SharedRegionLayout>(), 8);
        assert!(REGION_SIZE > MAX_PROCS * core::mem::size_of::<ProcessSlot>());
    }

    #[test]
    fn test_first_attach_initializes() {
        let dir = tempfile::tempdir().unwrap();
        let h = attach(config(&dir), 1001).unwrap();
        assert!(h.is_initialized());
        assert_eq!(h.version(), (MAJOR_VERSION, MINOR_VERSION));
        assert_eq!(h.configured_limit(0).unwrap(), 1 << 30);
        assert_eq!(h.configured_limit(1).unwrap(), 0);
        assert_eq!(h.configured_sm_limit(0).unwrap(), 100);
        assert_eq!(h.device_count(), 2);
        assert_eq!(h.recent_kernel(), RECENT_KERNEL_DEFAULT);
        assert!(h.utilization_switch());
        assert_eq!(h.priority(), 1);
        assert_eq!(h.proc_num(), 0);
        assert!(h.configured_limit(MAX_DEVICES).is_err());

        let len = std::fs::metadata(h.path()).unwrap().len();
        assert_eq!(len, REGION_SIZE as u64);
    }

    #[test]
    fn test_second_attach_sees_complete() {
        let dir = tempfile::tempdir().unwrap();
        let a = attach(config(&dir), 1001).unwrap();
        a.set_recent_kernel(-1);
        let b = attach(config(&dir), 1002).unwrap();
        // Not re-initialized
        assert_eq!(b.recent_kernel(), -1);
    }

    #[test]
    fn test_limit_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _a = attach(config(&dir), 1001).unwrap();
        let err = attach(config(&dir).memory_limit(0, 1 << 20), 1002)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RegionError::LimitMismatch { dev: 0, what: "memory", .. }
        ));
        assert!(err.is_fatal());

        let err = attach(config(&dir).sm_limit(1, 30), 1003).err().unwrap();
        assert!(matches!(err, RegionError::LimitMismatch { dev: 1, what: "sm", .. }));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = attach(config(&dir), 1001).unwrap();
        a.region().major_version.store(MAJOR_VERSION + 1, Ordering::Relaxed);
        let err = attach(config(&dir), 1002).err().unwrap();
        assert!(matches!(err, RegionError::VersionMismatch { .. }));
    }

    #[test]
    fn test_stuck_initializer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let a = attach(config(&dir), 1001).unwrap();
        a.region()
            .initialized_flag
            .store(InitState::InProgress as i32, Ordering::Release);
        let cfg = config(&dir).init_wait(std::time::Duration::from_millis(20));
        let err = attach(cfg, 1002).err().unwrap();
        assert!(matches!(err, RegionError::InitTimeout { flag: 1, .. }));
    }

    #[test]
    fn test_inspect_requires_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.cache");
        assert!(matches!(RegionHandle::inspect(&path), Err(RegionError::Open { .. })));
        std::fs::File::create(&path).unwrap();
        assert!(matches!(
            RegionHandle::inspect(&path),
            Err(RegionError::NotInitialized(0))
        ));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        let _a = attach(config(&dir), 1001).unwrap();
        let i = RegionHandle::inspect(dir.path().join("region.cache")).unwrap();
        assert_eq!(i.configured_limit(0).unwrap(), 1 << 30);
    }

    #[test]
    fn test_policy_overrides_switch() {
        let dir = tempfile::tempdir().unwrap();
        let a = attach(config(&dir), 1001).unwrap();
        a.set_utilization_switch(false);
        assert!(!a.effective_utilization_switch());

        let forced = attach(
            config(&dir).utilization_policy(UtilizationPolicy::Force),
            1002,
        )
        .unwrap();
        assert!(forced.effective_utilization_switch());

        a.set_utilization_switch(true);
        let disabled = attach(
            config(&dir).utilization_policy(UtilizationPolicy::Disable),
            1003,
        )
        .unwrap();
        assert!(!disabled.effective_utilization_switch());
    }
}
