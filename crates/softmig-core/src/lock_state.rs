//! Coarse region lock state and stale-holder recovery
//!
//! The region lock is a process-shared semaphore plus an `owner_pid` word.
//! The semaphore itself cannot tell us who holds it, so `owner_pid` is what
//! lets a waiter decide whether the holder is gone. The decisions are kept
//! here as pure functions so they can be tested without real processes.

use core::fmt;

/// Observed lock state, derived from `owner_pid`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No recorded holder
    Unlocked,

    /// Held (or last held without a clean release) by this pid
    LockedBy(i32),
}

impl LockState {
    #[inline]
    pub const fn from_owner(owner_pid: i32) -> Self {
        if owner_pid == 0 {
            LockState::Unlocked
        } else {
            LockState::LockedBy(owner_pid)
        }
    }

    #[inline]
    pub const fn owner(&self) -> Option<i32> {
        match self {
            LockState::Unlocked => None,
            LockState::LockedBy(pid) => Some(*pid),
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unlocked => write!(f, "unlocked"),
            LockState::LockedBy(pid) => write!(f, "locked by {}", pid),
        }
    }
}

/// What a waiter does after one timed wait expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Holder looks legitimate; wait again
    KeepWaiting,

    /// Holder is stale (or the retry budget is spent); run recovery.
    /// `claim_unowned` asks the waiter to record itself as owner first when
    /// nobody is recorded, so the takeover check below succeeds.
    Recover { claim_unowned: bool },
}

/// Decide what to do after the `trials`-th timed wait expired
///
/// A holder that is this process, or that is no longer alive, is stale and
/// triggers recovery immediately. Otherwise the waiter keeps waiting until
/// the retry budget is exhausted, then recovers anyway.
pub fn on_lock_timeout(
    state: LockState,
    me: i32,
    is_alive: impl Fn(i32) -> bool,
    trials: u32,
    max_trials: u32,
) -> TimeoutAction {
    if let LockState::LockedBy(owner) = state {
        if owner == me || !is_alive(owner) {
            return TimeoutAction::Recover {
                claim_unowned: false,
            };
        }
    }

    if trials > max_trials {
        return TimeoutAction::Recover {
            claim_unowned: state == LockState::Unlocked,
        };
    }

    TimeoutAction::KeepWaiting
}

/// May `me` take ownership of a semaphore recorded as `state`?
///
/// Re-checked under the file-range lock, so only one waiter wins.
/// `false` means the waiter must force-post instead.
pub fn takeover_allowed(state: LockState, me: i32, is_alive: impl Fn(i32) -> bool) -> bool {
    match state {
        LockState::Unlocked => false,
        LockState::LockedBy(owner) => owner == me || !is_alive(owner),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ME: i32 = 100;

    #[test]
    fn test_from_owner() {
        assert_eq!(LockState::from_owner(0), LockState::Unlocked);
        assert_eq!(LockState::from_owner(5).owner(), Some(5));
    }

    #[test]
    fn test_dead_holder_recovers_immediately() {
        let action = on_lock_timeout(LockState::LockedBy(7), ME, |_| false, 1, 30);
        assert_eq!(action, TimeoutAction::Recover { claim_unowned: false });
    }

    #[test]
    fn test_self_holder_recovers_immediately() {
        let action = on_lock_timeout(LockState::LockedBy(ME), ME, |_| true, 1, 30);
        assert_eq!(action, TimeoutAction::Recover { claim_unowned: false });
    }

    #[test]
    fn test_live_holder_waits_until_budget() {
        let state = LockState::LockedBy(7);
        assert_eq!(on_lock_timeout(state, ME, |_| true, 30, 30), TimeoutAction::KeepWaiting);
        assert_eq!(
            on_lock_timeout(state, ME, |_| true, 31, 30),
            TimeoutAction::Recover { claim_unowned: false }
        );
    }

    #[test]
    fn test_unowned_claims_after_budget() {
        assert_eq!(
            on_lock_timeout(LockState::Unlocked, ME, |_| true, 1, 30),
            TimeoutAction::KeepWaiting
        );
        assert_eq!(
            on_lock_timeout(LockState::Unlocked, ME, |_| true, 31, 30),
            TimeoutAction::Recover { claim_unowned: true }
        );
    }

    #[test]
    fn test_takeover_allowed() {
        assert!(takeover_allowed(LockState::LockedBy(ME), ME, |_| true));
        assert!(takeover_allowed(LockState::LockedBy(7), ME, |_| false));
        assert!(!takeover_allowed(LockState::LockedBy(7), ME, |_| true));
        assert!(!takeover_allowed(LockState::Unlocked, ME, |_| false));
    }
}
