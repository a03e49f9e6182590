//! Process-shared POSIX semaphore living inside the region

use std::cell::UnsafeCell;
use std::time::Duration;

use nix::errno::Errno;

/// Outcome of a timed wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Acquired,
    TimedOut,
    Failed(Errno),
}

/// `sem_t` initialized with `pshared = 1`
///
/// Only valid inside a `MAP_SHARED` mapping after `init` ran once for the
/// lifetime of the region file.
#[repr(C)]
pub struct Semaphore {
    raw: UnsafeCell<libc::sem_t>,
}

// Safety: sem_t is designed for concurrent use from multiple threads and
// processes; all access goes through the sem_* functions.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Initialize with `value`. Called by the region initializer only.
    pub(crate) fn init(&self, value: u32) -> Result<(), Errno> {
        let ret = unsafe { libc::sem_init(self.raw.get(), 1, value) };
        if ret != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    /// Wait until acquired or `timeout` elapses
    ///
    /// The deadline is computed once per call on the realtime clock, as
    /// `sem_timedwait` requires; signal interruptions retry against the same
    /// deadline.
    pub(crate) fn timed_wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = match realtime_deadline(timeout) {
            Ok(ts) => ts,
            Err(e) => return WaitOutcome::Failed(e),
        };
        loop {
            let ret = unsafe { libc::sem_timedwait(self.raw.get(), &deadline) };
            if ret == 0 {
                return WaitOutcome::Acquired;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => return WaitOutcome::TimedOut,
                e => return WaitOutcome::Failed(e),
            }
        }
    }

    pub(crate) fn post(&self) {
        unsafe {
            libc::sem_post(self.raw.get());
        }
    }

    /// Current count (diagnostics)
    pub fn value(&self) -> i32 {
        let mut v: libc::c_int = 0;
        unsafe {
            libc::sem_getvalue(self.raw.get(), &mut v);
        }
        v
    }
}

fn realtime_deadline(timeout: Duration) -> Result<libc::timespec, Errno> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(Errno::last());
    }

    let mut sec = (now.tv_sec as i64).saturating_add(timeout.as_secs() as i64);
    let mut nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    if nsec >= 1_000_000_000 {
        sec = sec.saturating_add(1);
        nsec -= 1_000_000_000;
    }
    Ok(libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as _,
    })
}
