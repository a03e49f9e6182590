//! Process registry
//!
//! Maps pids to slots in the shared region. Allocation, removal and reaping
//! run under the coarse lock; lookups are lock-free scans below the
//! high-water mark that tolerate a slot changing underneath them.

use std::sync::atomic::Ordering;

use softmig_core::constants::MAX_PROCS;
use softmig_core::{ProcStatus, ProcessSlot};
use tracing::{debug, info, warn};

use crate::error::{RegionError, RegionResult};
use crate::lock::RegionLockGuard;
use crate::region::RegionHandle;
use crate::signal::send_status_signal;

impl RegionHandle {
    /// Register the calling process and cache its slot index
    pub fn register_self(&self) -> RegionResult<usize> {
        let idx = self.register_pid(self.pid())?;
        self.cache_slot(Some(idx));
        Ok(idx)
    }

    /// Register `pid`
    ///
    /// A pid that already owns a slot (restart after a crash, pid reuse)
    /// gets that slot back with every counter zeroed. Dead slots are reaped
    /// before the lock is released.
    pub fn register_pid(&self, pid: i32) -> RegionResult<usize> {
        let guard = self.lock();
        let idx = self.claim_slot(&guard, pid)?;
        let reaped = self.clear_dead_slots_locked(&guard);
        debug!(pid, idx, reaped, procs = self.proc_num(), "registered process");
        Ok(idx)
    }

    fn claim_slot(&self, guard: &RegionLockGuard<'_>, pid: i32) -> RegionResult<usize> {
        if let Some(idx) = self.slots().iter().position(|s| s.pid() == pid) {
            info!(pid, idx, "pid already registered, resetting its slot");
            self.region().procs[idx].reset_for(pid);
            return Ok(idx);
        }

        if let Some(idx) = self.occupy_free_slot(pid) {
            return Ok(idx);
        }

        // Table full: make room from dead processes before giving up
        if self.clear_dead_slots_locked(guard) > 0 {
            if let Some(idx) = self.occupy_free_slot(pid) {
                return Ok(idx);
            }
        }
        Err(RegionError::CapacityExhausted(MAX_PROCS))
    }

    fn occupy_free_slot(&self, pid: i32) -> Option<usize> {
        let r = self.region();
        let hwm = self.slots().len();
        let idx = match self.slots().iter().position(ProcessSlot::is_free) {
            Some(idx) => idx,
            None if hwm < MAX_PROCS => hwm,
            None => return None,
        };

        r.procs[idx].reset_for(pid);
        if idx >= hwm {
            r.slot_high_water.store(idx as i32 + 1, Ordering::Release);
        }
        r.proc_num.fetch_add(1, Ordering::AcqRel);
        Some(idx)
    }

    /// Reap slots whose owner is dead
    pub fn clear_dead_slots(&self) -> usize {
        let guard = self.lock();
        self.clear_dead_slots_locked(&guard)
    }

    pub(crate) fn clear_dead_slots_locked(&self, _guard: &RegionLockGuard<'_>) -> usize {
        let r = self.region();
        let mut reaped = 0;
        for (idx, slot) in self.slots().iter().enumerate() {
            let pid = slot.pid();
            if pid == 0 || pid == self.pid() || self.liveness().is_alive(pid) {
                continue;
            }
            warn!(pid, idx, "evicting slot of dead process");
            slot.clear();
            r.proc_num.fetch_sub(1, Ordering::AcqRel);
            reaped += 1;
        }

        // Trailing free slots no longer need scanning
        let mut hwm = self.slots().len();
        while hwm > 0 && r.procs[hwm - 1].is_free() {
            hwm -= 1;
        }
        r.slot_high_water.store(hwm as i32, Ordering::Release);
        reaped
    }

    /// Release this process's slot, giving up after the exit lock budget
    ///
    /// Returns false when the lock could not be taken in time; the slot is
    /// then left for the next reaper.
    pub fn remove_self(&self) -> bool {
        let wait = self.config().lock.exit_wait;
        let Some(guard) = self.try_lock_for(wait) else {
            warn!(pid = self.pid(), ?wait, "exit: region lock busy, leaving slot to be reaped");
            return false;
        };
        let removed = self.remove_pid_locked(&guard, self.pid());
        self.cache_slot(None);
        removed
    }

    fn remove_pid_locked(&self, _guard: &RegionLockGuard<'_>, pid: i32) -> bool {
        let Some(slot) = self.slots().iter().find(|s| s.pid() == pid) else {
            return false;
        };
        slot.clear();
        self.region().proc_num.fetch_sub(1, Ordering::AcqRel);
        debug!(pid, "removed process slot");
        true
    }

    /// This process's slot
    pub fn my_slot(&self) -> Option<&ProcessSlot> {
        let r = self.region();
        if let Some(idx) = self.cached_slot() {
            let slot = &r.procs[idx];
            if slot.pid() == self.pid() {
                return Some(slot);
            }
        }
        let idx = self.slots().iter().position(|s| s.pid() == self.pid())?;
        self.cache_slot(Some(idx));
        Some(&r.procs[idx])
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<&ProcessSlot> {
        if pid == 0 {
            return None;
        }
        if pid == self.pid() {
            return self.my_slot();
        }
        self.slots().iter().find(|s| s.pid() == pid)
    }

    /// Slot whose recorded host pid is `hostpid`
    ///
    /// Host pid 0 means "unknown" and never matches.
    pub fn find_by_hostpid(&self, hostpid: i32) -> Option<&ProcessSlot> {
        if hostpid == 0 {
            return None;
        }
        self.slots()
            .iter()
            .find(|s| !s.is_free() && s.hostpid() == hostpid)
    }

    /// Record the host pid of this process
    pub fn set_host_pid(&self, hostpid: i32) -> RegionResult<()> {
        let slot = self
            .my_slot()
            .ok_or(RegionError::SlotNotFound(self.pid()))?;
        slot.hostpid.store(hostpid, Ordering::Release);
        for m in &slot.monitorused {
            m.store(0, Ordering::Relaxed);
        }
        info!(pid = self.pid(), hostpid, "host pid resolved");
        Ok(())
    }

    /// Zero every slot's observed utilization and monitor counters
    pub fn reset_utilization(&self) {
        let _guard = self.lock();
        for slot in self.slots().iter().filter(|s| !s.is_free()) {
            slot.reset_observed();
        }
    }

    pub fn set_status(&self, status: ProcStatus) -> RegionResult<()> {
        let slot = self
            .my_slot()
            .ok_or(RegionError::SlotNotFound(self.pid()))?;
        slot.set_status(status);
        Ok(())
    }

    pub fn status_self(&self) -> Option<ProcStatus> {
        self.my_slot().map(ProcessSlot::status)
    }

    /// Is every other registered process in `status`?
    pub fn all_in_status(&self, status: ProcStatus) -> bool {
        self.slots()
            .iter()
            .filter(|s| !s.is_free() && s.pid() != self.pid())
            .all(|s| s.status() == status)
    }

    /// Ask every other registered process to suspend; returns how many
    /// were signalled
    pub fn suspend_all(&self) -> usize {
        self.signal_all(ProcStatus::Suspended)
    }

    pub fn resume_all(&self) -> usize {
        self.signal_all(ProcStatus::Running)
    }

    fn signal_all(&self, status: ProcStatus) -> usize {
        let mut sent = 0;
        for slot in self.slots() {
            let pid = slot.pid();
            if pid <= 0 || pid == self.pid() {
                continue;
            }
            match send_status_signal(pid, status) {
                Ok(()) => sent += 1,
                Err(e) => warn!(pid, ?status, error = %e, "failed to signal process"),
            }
        }
        sent
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::sim::{AlwaysAlive, StaticLiveness};
    use softmig_core::UsageKind;
    use std::sync::Arc;

    fn config(dir: &tempfile::TempDir) -> RegionConfig {
        RegionConfig::new().path(dir.path().join("region.cache"))
    }

    #[test]
    fn test_register_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let h = RegionHandle::attach_with(config(&dir), 3001, Arc::new(AlwaysAlive)).unwrap();
        let idx = h.register_self().unwrap();
        assert_eq!(idx, 0);
        assert_eq!(h.proc_num(), 1);
        assert_eq!(h.my_slot().unwrap().pid(), 3001);
        assert_eq!(h.status_self(), Some(ProcStatus::Running));

        assert!(h.remove_self());
        assert_eq!(h.proc_num(), 0);
        assert!(h.my_slot().is_none());
        assert!(!h.remove_self());
    }

    #[test]
    fn test_reregister_resets_slot() {
        let dir = tempfile::tempdir().unwrap();
        let h = RegionHandle::attach_with(config(&dir), 3001, Arc::new(AlwaysAlive)).unwrap();
        let idx = h.register_self().unwrap();
        h.my_slot().unwrap().add_usage(0, UsageKind::Data, 4096).unwrap();

        // Same pid comes back (crash + pid reuse)
        assert_eq!(h.register_pid(3001).unwrap(), idx);
        assert_eq!(h.proc_num(), 1);
        assert_eq!(h.my_slot().unwrap().total(0).unwrap().value, 0);
        assert_eq!(h.my_slot().unwrap().seqlock.sequence(), 0);
    }

    #[test]
    fn test_slots_reused_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(StaticLiveness::new());
        let h = RegionHandle::attach_with(config(&dir), 3001, liveness.clone()).unwrap();
        h.register_self().unwrap();
        assert_eq!(h.register_pid(3002).unwrap(), 1);
        assert_eq!(h.register_pid(3003).unwrap(), 2);

        liveness.mark_dead(3002);
        assert_eq!(h.clear_dead_slots(), 1);
        assert_eq!(h.proc_num(), 2);
        // Hole is refilled, own index untouched
        assert_eq!(h.register_pid(3004).unwrap(), 1);
        assert_eq!(h.my_slot().unwrap().pid(), 3001);
        assert_eq!(h.find_by_pid(3003).unwrap().pid(), 3003);
        assert!(h.find_by_pid(3002).is_none());
    }

    #[test]
    fn test_trailing_dead_slots_lower_high_water() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(StaticLiveness::new());
        let h = RegionHandle::attach_with(config(&dir), 3001, liveness.clone()).unwrap();
        h.register_self().unwrap();
        h.register_pid(3002).unwrap();
        h.register_pid(3003).unwrap();
        liveness.mark_dead(3003);
        liveness.mark_dead(3002);
        assert_eq!(h.clear_dead_slots(), 2);
        assert_eq!(h.region().slot_high_water.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_hostpid_lookup_skips_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let h = RegionHandle::attach_with(config(&dir), 3001, Arc::new(AlwaysAlive)).unwrap();
        h.register_self().unwrap();
        h.register_pid(3002).unwrap();
        assert!(h.find_by_hostpid(0).is_none());

        h.set_host_pid(90001).unwrap();
        assert_eq!(h.find_by_hostpid(90001).unwrap().pid(), 3001);
        assert!(h.find_by_hostpid(90002).is_none());
    }

    #[test]
    fn test_status_coordination() {
        let dir = tempfile::tempdir().unwrap();
        let a = RegionHandle::attach_with(config(&dir), 3001, Arc::new(AlwaysAlive)).unwrap();
        let b = RegionHandle::attach_with(config(&dir), 3002, Arc::new(AlwaysAlive)).unwrap();
        a.register_self().unwrap();
        b.register_self().unwrap();

        assert!(!a.all_in_status(ProcStatus::Suspended));
        b.set_status(ProcStatus::Suspended).unwrap();
        assert!(a.all_in_status(ProcStatus::Suspended));
        // Self is excluded
        assert!(!b.all_in_status(ProcStatus::Suspended));
    }

    #[test]
    fn test_reset_utilization() {
        let dir = tempfile::tempdir().unwrap();
        let h = RegionHandle::attach_with(config(&dir), 3001, Arc::new(AlwaysAlive)).unwrap();
        h.register_self().unwrap();
        let slot = h.my_slot().unwrap();
        slot.monitorused[0].store(10, Ordering::Relaxed);
        slot.device_util[0].sm_util.store(10, Ordering::Relaxed);
        h.reset_utilization();
        assert_eq!(slot.monitor(0), 0);
        assert_eq!(slot.sm_util(0), 0);
    }
}
