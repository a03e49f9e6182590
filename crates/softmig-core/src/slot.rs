//! Per-process slot layout
//!
//! One `ProcessSlot` per registered process lives in the shared region.
//! These structures have fixed layouts (repr(C)) because every process that
//! maps the region must agree on them byte for byte, and they must be valid
//! when zero-filled because a fresh region file is all zeroes.

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use tracing::warn;

use crate::constants::MAX_DEVICES;
use crate::error::{CoreError, CoreResult};
use crate::seqlock::{SeqLock, SeqRead};
use crate::status::{ProcStatus, UsageKind};

/// Memory counters of one process on one device
///
/// Layout (64 bytes):
/// ```text
/// 0x00: context_size (u64)
/// 0x08: module_size  (u64)
/// 0x10: data_size    (u64)
/// 0x18: offset       (u64) - reserved
/// 0x20: total        (u64) - context + module + data
/// 0x28: reserved     (24 bytes)
/// ```
#[repr(C)]
pub struct DeviceMemory {
    pub context_size: AtomicU64,
    pub module_size: AtomicU64,
    pub data_size: AtomicU64,
    _offset: u64,
    pub total: AtomicU64,
    _reserved: [u64; 3],
}

/// Utilization counters of one process on one device (48 bytes)
#[repr(C)]
pub struct DeviceUtil {
    pub dec_util: AtomicU64,
    pub enc_util: AtomicU64,
    pub sm_util: AtomicU64,
    _reserved: [u64; 3],
}

/// Registry entry for one process
///
/// Layout:
/// ```text
/// 0x000: pid         (i32) - container-visible pid, 0 = free slot
/// 0x004: hostpid     (i32) - pid as seen by the management API, 0 = unknown
/// 0x008: seqlock     (u64)
/// 0x010: used        ([DeviceMemory; 16])
/// 0x410: monitorused ([u64; 16]) - externally observed usage
/// 0x490: device_util ([DeviceUtil; 16])
/// 0x790: status      (i32)
/// 0x798: reserved    (16 bytes)
/// ```
#[repr(C)]
pub struct ProcessSlot {
    pub pid: AtomicI32,
    pub hostpid: AtomicI32,
    pub seqlock: SeqLock,
    pub used: [DeviceMemory; MAX_DEVICES],
    pub monitorused: [AtomicU64; MAX_DEVICES],
    pub device_util: [DeviceUtil; MAX_DEVICES],
    pub status: AtomicI32,
    _pad: u32,
    _reserved: [u64; 2],
}

const _: () = assert!(core::mem::size_of::<DeviceMemory>() == 64);
const _: () = assert!(core::mem::size_of::<DeviceUtil>() == 48);
const _: () = assert!(core::mem::size_of::<ProcessSlot>() == 0x7A8);

/// Typed view of one `DeviceMemory`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageBreakdown {
    pub context: u64,
    pub module: u64,
    pub data: u64,
    pub total: u64,
}

impl UsageBreakdown {
    /// Does `total` agree with the three components?
    pub fn is_balanced(&self) -> bool {
        self.context
            .checked_add(self.module)
            .and_then(|s| s.checked_add(self.data))
            == Some(self.total)
    }
}

impl DeviceMemory {
    pub const fn new() -> Self {
        DeviceMemory {
            context_size: AtomicU64::new(0),
            module_size: AtomicU64::new(0),
            data_size: AtomicU64::new(0),
            _offset: 0,
            total: AtomicU64::new(0),
            _reserved: [0; 3],
        }
    }

    #[inline]
    fn counter(&self, kind: UsageKind) -> &AtomicU64 {
        match kind {
            UsageKind::Context => &self.context_size,
            UsageKind::Module => &self.module_size,
            UsageKind::Data => &self.data_size,
        }
    }

    /// Raw loads; callers wanting a consistent view go through the seqlock
    pub fn breakdown(&self) -> UsageBreakdown {
        UsageBreakdown {
            context: self.context_size.load(Ordering::Relaxed),
            module: self.module_size.load(Ordering::Relaxed),
            data: self.data_size.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }

    fn zero(&self) {
        self.context_size.store(0, Ordering::Relaxed);
        self.module_size.store(0, Ordering::Relaxed);
        self.data_size.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
    }
}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceUtil {
    pub const fn new() -> Self {
        DeviceUtil {
            dec_util: AtomicU64::new(0),
            enc_util: AtomicU64::new(0),
            sm_util: AtomicU64::new(0),
            _reserved: [0; 3],
        }
    }

    fn zero(&self) {
        self.dec_util.store(0, Ordering::Relaxed);
        self.enc_util.store(0, Ordering::Relaxed);
        self.sm_util.store(0, Ordering::Relaxed);
    }
}

impl Default for DeviceUtil {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn check_device(dev: usize) -> CoreResult<()> {
    if dev < MAX_DEVICES {
        Ok(())
    } else {
        Err(CoreError::InvalidDevice(dev))
    }
}

impl ProcessSlot {
    pub const fn new() -> Self {
        ProcessSlot {
            pid: AtomicI32::new(0),
            hostpid: AtomicI32::new(0),
            seqlock: SeqLock::new(),
            used: [const { DeviceMemory::new() }; MAX_DEVICES],
            monitorused: [const { AtomicU64::new(0) }; MAX_DEVICES],
            device_util: [const { DeviceUtil::new() }; MAX_DEVICES],
            status: AtomicI32::new(0),
            _pad: 0,
            _reserved: [0; 2],
        }
    }

    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn hostpid(&self) -> i32 {
        self.hostpid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.pid() == 0
    }

    #[inline]
    pub fn status(&self) -> ProcStatus {
        ProcStatus::from(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_status(&self, status: ProcStatus) {
        self.status.store(status.into(), Ordering::Release);
    }

    /// Add `bytes` of `kind` on `dev`
    pub fn add_usage(&self, dev: usize, kind: UsageKind, bytes: u64) -> CoreResult<()> {
        check_device(dev)?;
        let mem = &self.used[dev];
        let _w = self.seqlock.write();
        mem.counter(kind).fetch_add(bytes, Ordering::Relaxed);
        mem.total.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Subtract `bytes` of `kind` on `dev`
    ///
    /// Callers only release what they previously added; an underflow is
    /// logged but not clamped so `total` stays the sum of its parts.
    pub fn remove_usage(&self, dev: usize, kind: UsageKind, bytes: u64) -> CoreResult<()> {
        check_device(dev)?;
        let mem = &self.used[dev];
        let _w = self.seqlock.write();
        let prev = mem.counter(kind).fetch_sub(bytes, Ordering::Relaxed);
        mem.total.fetch_sub(bytes, Ordering::Relaxed);
        if prev < bytes {
            warn!(dev, %kind, prev, bytes, "usage counter underflow");
        }
        Ok(())
    }

    /// Seqlock-protected total on `dev`
    pub fn total(&self, dev: usize) -> CoreResult<SeqRead<u64>> {
        check_device(dev)?;
        let mem = &self.used[dev];
        Ok(self.seqlock.read(|| mem.total.load(Ordering::Relaxed)))
    }

    /// Seqlock-protected per-category view on `dev`
    pub fn breakdown(&self, dev: usize) -> CoreResult<SeqRead<UsageBreakdown>> {
        check_device(dev)?;
        let mem = &self.used[dev];
        Ok(self.seqlock.read(|| mem.breakdown()))
    }

    pub fn monitor(&self, dev: usize) -> u64 {
        self.monitorused
            .get(dev)
            .map_or(0, |m| m.load(Ordering::Relaxed))
    }

    pub fn sm_util(&self, dev: usize) -> u64 {
        self.device_util
            .get(dev)
            .map_or(0, |u| u.sm_util.load(Ordering::Relaxed))
    }

    /// Zero the externally observed counters (watcher, once per iteration)
    pub fn reset_observed(&self) {
        for dev in 0..MAX_DEVICES {
            self.monitorused[dev].store(0, Ordering::Relaxed);
            self.device_util[dev].sm_util.store(0, Ordering::Relaxed);
        }
    }

    /// Take the slot for `pid`, discarding whatever it held
    ///
    /// Counters are zeroed before `pid` is published so a concurrent reader
    /// never attributes stale bytes to the new owner. Caller holds the
    /// region lock.
    pub fn reset_for(&self, pid: i32) {
        for dev in 0..MAX_DEVICES {
            self.used[dev].zero();
            self.device_util[dev].zero();
            self.monitorused[dev].store(0, Ordering::Relaxed);
        }
        self.seqlock.reset();
        self.hostpid.store(0, Ordering::Relaxed);
        self.set_status(ProcStatus::Running);
        self.pid.store(pid, Ordering::Release);
    }

    /// Release the slot
    ///
    /// `pid` is cleared first so scans stop counting this slot before its
    /// counters disappear. Caller holds the region lock.
    pub fn clear(&self) {
        self.pid.store(0, Ordering::Release);
        self.hostpid.store(0, Ordering::Relaxed);
        self.set_status(ProcStatus::Free);
        for dev in 0..MAX_DEVICES {
            self.used[dev].zero();
            self.device_util[dev].zero();
            self.monitorused[dev].store(0, Ordering::Relaxed);
        }
        self.seqlock.reset();
    }
}

impl Default for ProcessSlot {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
