//! Usage accountant
//!
//! Every process writes only its own slot, through the slot's seqlock.
//! Readers sum all occupied slots without taking the coarse lock; a slot
//! whose seqlock never settles is still counted, best effort, and reported
//! in `UsageReading::best_effort_slots`.

use std::sync::atomic::Ordering;

use softmig_core::constants::{INITIAL_OFFSET, MAX_DEVICES};
use softmig_core::{CoreError, ProcessSlot, UsageBreakdown, UsageKind};
use tracing::warn;

use crate::error::{RegionError, RegionResult};
use crate::region::RegionHandle;

/// Aggregate usage of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageReading {
    pub bytes: u64,
    /// Slots whose counters could not be read consistently
    pub best_effort_slots: u32,
}

impl UsageReading {
    pub fn is_exact(&self) -> bool {
        self.best_effort_slots == 0
    }
}

#[inline]
fn check_device(dev: usize) -> RegionResult<()> {
    if dev < MAX_DEVICES {
        Ok(())
    } else {
        Err(RegionError::Core(CoreError::InvalidDevice(dev)))
    }
}

impl RegionHandle {
    fn slot_for_write(&self, pid: i32) -> RegionResult<&ProcessSlot> {
        self.find_by_pid(pid).ok_or_else(|| {
            warn!(pid, "usage update for unregistered process");
            RegionError::SlotNotFound(pid)
        })
    }

    /// Charge `bytes` of `kind` on `dev` to `pid`
    pub fn add_usage(&self, pid: i32, dev: usize, bytes: u64, kind: UsageKind) -> RegionResult<()> {
        check_device(dev)?;
        self.slot_for_write(pid)?.add_usage(dev, kind, bytes)?;
        Ok(())
    }

    /// Release `bytes` of `kind` on `dev` from `pid`
    pub fn remove_usage(&self, pid: i32, dev: usize, bytes: u64, kind: UsageKind) -> RegionResult<()> {
        check_device(dev)?;
        self.slot_for_write(pid)?.remove_usage(dev, kind, bytes)?;
        Ok(())
    }

    /// Sum of every occupied slot's total on `dev`
    pub fn usage_reading(&self, dev: usize) -> RegionResult<UsageReading> {
        check_device(dev)?;
        let mut reading = UsageReading {
            bytes: INITIAL_OFFSET,
            best_effort_slots: 0,
        };
        for slot in self.slots() {
            let pid = slot.pid();
            if pid == 0 {
                continue;
            }
            let read = slot.total(dev)?;
            if !read.consistent {
                warn!(pid, dev, "usage counters unstable, using best-effort read");
                reading.best_effort_slots += 1;
            }
            reading.bytes = reading.bytes.saturating_add(read.value);
        }
        Ok(reading)
    }

    pub fn total_usage(&self, dev: usize) -> RegionResult<u64> {
        Ok(self.usage_reading(dev)?.bytes)
    }

    /// Per-category usage of one process
    pub fn slot_usage(&self, pid: i32, dev: usize) -> RegionResult<Option<UsageBreakdown>> {
        check_device(dev)?;
        match self.find_by_pid(pid) {
            Some(slot) => Ok(Some(slot.breakdown(dev)?.value)),
            None => Ok(None),
        }
    }

    /// Externally observed usage summed over every occupied slot
    pub fn monitor_usage(&self, dev: usize) -> RegionResult<u64> {
        check_device(dev)?;
        let _guard = self.lock();
        Ok(self
            .slots()
            .iter()
            .filter(|s| !s.is_free())
            .fold(0u64, |acc, s| acc.saturating_add(s.monitor(dev))))
    }

    /// Record usage the management API attributes to `hostpid`
    ///
    /// Returns false when no slot carries that host pid.
    pub fn set_monitor(&self, hostpid: i32, dev: usize, bytes: u64) -> RegionResult<bool> {
        check_device(dev)?;
        let _guard = self.lock();
        Ok(match self.find_by_hostpid(hostpid) {
            Some(slot) => {
                slot.monitorused[dev].store(bytes, Ordering::Relaxed);
                true
            }
            None => false,
        })
    }

    /// Record SM utilization of `hostpid`; lock-free
    pub fn set_sm_util(&self, hostpid: i32, dev: usize, util: u64) -> RegionResult<bool> {
        check_device(dev)?;
        Ok(match self.find_by_hostpid(hostpid) {
            Some(slot) => {
                slot.device_util[dev].sm_util.store(util, Ordering::Relaxed);
                true
            }
            None => false,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
