//! Region lock protocol
//!
//! A process-shared semaphore serializes slot allocation, reaping and
//! cross-slot scans. Because the semaphore cannot tell who holds it, the
//! holder also records its pid in `owner_pid`. A waiter whose timed wait
//! expires consults that pid:
//!
//! - holder is this process or is dead: take the lock over
//! - holder is alive: wait again, up to `LockConfig::retries` times, then
//!   recover anyway
//!
//! Takeover and forced release are decided under a `lockf` range lock on
//! the region file, so only one of several waiters performs the recovery.
//! The kernel drops that file lock when its holder dies, so the recovery
//! path itself cannot wedge.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::time::Duration;

use softmig_core::lock_state::{on_lock_timeout, takeover_allowed};
use softmig_core::{LockState, TimeoutAction};
use tracing::{debug, error, info, warn};

use crate::region::{RegionHandle, WaitOutcome, REGION_SIZE};

/// Holds the coarse region lock; released on drop
#[must_use = "the region lock is released when the guard is dropped"]
pub struct RegionLockGuard<'a> {
    handle: &'a RegionHandle,
}

impl Drop for RegionLockGuard<'_> {
    fn drop(&mut self) {
        self.handle.unlock_raw();
    }
}

/// Holds the post-init lock; released on drop
#[must_use = "the post-init lock is released when the guard is dropped"]
pub struct PostinitGuard<'a> {
    handle: &'a RegionHandle,
}

impl Drop for PostinitGuard<'_> {
    fn drop(&mut self) {
        self.handle.region().sem_postinit.post();
    }
}

/// Outcome of `fix_lock`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fix {
    /// We now own the semaphore without waiting on it
    TookOver,
    /// The recorded owner looks legitimate; caller force-posts
    Declined,
}

impl RegionHandle {
    /// Current lock state as recorded in the region
    pub fn lock_state(&self) -> LockState {
        LockState::from_owner(self.region().owner_pid.load(Ordering::Acquire))
    }

    /// Acquire the coarse lock
    ///
    /// Never fails: a dead or self-held lock is taken over, and after the
    /// retry budget a live holder's lock is forcibly released.
    pub fn lock(&self) -> RegionLockGuard<'_> {
        let r = self.region();
        let wait = self.config().lock.wait;
        let max_trials = self.config().lock.retries;
        let mut trials: u32 = 0;

        loop {
            match r.sem.timed_wait(wait) {
                WaitOutcome::Acquired => {
                    r.owner_pid.store(self.pid(), Ordering::Release);
                    return RegionLockGuard { handle: self };
                }
                WaitOutcome::Failed(e) => {
                    error!(pid = self.pid(), error = %e, "region lock wait failed");
                    std::thread::sleep(wait.min(Duration::from_millis(100)));
                    continue;
                }
                WaitOutcome::TimedOut => {}
            }

            trials = trials.saturating_add(1);
            let state = self.lock_state();
            let action = on_lock_timeout(
                state,
                self.pid(),
                |pid| self.liveness().is_alive(pid),
                trials,
                max_trials,
            );
            match action {
                TimeoutAction::KeepWaiting => {
                    debug!(pid = self.pid(), %state, trials, "region lock still held");
                }
                TimeoutAction::Recover { claim_unowned } => {
                    warn!(pid = self.pid(), %state, trials, "region lock timed out, recovering");
                    if claim_unowned {
                        let _ = r.owner_pid.compare_exchange(
                            0,
                            self.pid(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                    if self.fix_lock() == Fix::TookOver {
                        return RegionLockGuard { handle: self };
                    }
                    warn!(pid = self.pid(), "forcing region lock release");
                    r.sem.post();
                    trials = 0;
                }
            }
        }
    }

    /// Acquire the coarse lock within `timeout`, without recovery
    ///
    /// Used on exit paths where giving up is better than waiting.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<RegionLockGuard<'_>> {
        let r = self.region();
        match r.sem.timed_wait(timeout) {
            WaitOutcome::Acquired => {
                r.owner_pid.store(self.pid(), Ordering::Release);
                Some(RegionLockGuard { handle: self })
            }
            WaitOutcome::TimedOut => None,
            WaitOutcome::Failed(e) => {
                warn!(pid = self.pid(), error = %e, "region lock wait failed");
                None
            }
        }
    }

    /// Acquire the post-init lock, or report failure after the retry budget
    ///
    /// Makes one initial wait plus `postinit_retries` retries.
    /// Failure is not an error: the caller proceeds without host-pid
    /// resolution.
    pub fn lock_postinit(&self) -> Option<PostinitGuard<'_>> {
        let r = self.region();
        let cfg = &self.config().lock;
        for attempt in 0..=cfg.postinit_retries {
            match r.sem_postinit.timed_wait(cfg.postinit_wait) {
                WaitOutcome::Acquired => return Some(PostinitGuard { handle: self }),
                WaitOutcome::TimedOut => {
                    warn!(pid = self.pid(), attempt, "post-init lock timed out");
                }
                WaitOutcome::Failed(e) => {
                    warn!(pid = self.pid(), attempt, error = %e, "post-init lock wait failed");
                }
            }
        }
        None
    }

    /// Release path of `RegionLockGuard`
    fn unlock_raw(&self) {
        let r = self.region();
        r.owner_pid.store(0, Ordering::Release);
        r.sem.post();
    }

    /// Decide takeover under the file-range lock
    fn fix_lock(&self) -> Fix {
        let fd = self.file().as_raw_fd();
        let len = REGION_SIZE as libc::off_t;

        if unsafe { libc::lseek(fd, 0, libc::SEEK_SET) } < 0
            || unsafe { libc::lockf(fd, libc::F_LOCK, len) } != 0
        {
            warn!(pid = self.pid(), "failed to take region file lock");
            return Fix::Declined;
        }

        let r = self.region();
        let state = self.lock_state();
        let fix = if takeover_allowed(state, self.pid(), |pid| self.liveness().is_alive(pid)) {
            r.owner_pid.store(self.pid(), Ordering::Release);
            info!(pid = self.pid(), previous = ?state.owner(), "took over region lock");
            Fix::TookOver
        } else {
            Fix::Declined
        };

        unsafe {
            libc::lseek(fd, 0, libc::SEEK_SET);
            libc::lockf(fd, libc::F_ULOCK, len);
        }
        fix
    }
}

// ============================================================================
// Tests
// ============================================================================
