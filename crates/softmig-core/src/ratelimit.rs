//! Compute-share feedback math and the launch token bucket
//!
//! The watcher measures this container's SM utilization once per interval
//! and moves a "share" up or down toward the configured limit. The share is
//! then credited to a token bucket that kernel launches debit by their grid
//! size. When the bucket is negative, launches wait.
//!
//! All arithmetic saturates; the inputs come from hardware queries and
//! environment variables and are not trusted to stay small.

use core::sync::atomic::{AtomicI64, Ordering};

use crate::constants::FACTOR;

/// Minimum step applied by `delta`, in percent
const MIN_DIFF: i64 = 5;

/// Divisor of the step formula
const STEP_DIVISOR: i64 = 2560;

/// Topology of one device as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSpec {
    pub sm_count: i32,
    pub max_threads_per_sm: i32,
}

impl DeviceSpec {
    pub const fn new(sm_count: i32, max_threads_per_sm: i32) -> Self {
        DeviceSpec {
            sm_count,
            max_threads_per_sm,
        }
    }

    /// Bucket capacity: threads per SM × SMs × `FACTOR`
    pub fn total_cuda_cores(&self) -> i64 {
        (self.max_threads_per_sm as i64)
            .saturating_mul(self.sm_count as i64)
            .saturating_mul(FACTOR)
    }

    /// Compute the next share from the current one
    ///
    /// `up_limit` and `user_current` are percentages. The step grows with
    /// the distance to the target and is amplified further when that
    /// distance exceeds half the limit. The result stays in `[0, total]`.
    pub fn delta(&self, total: i64, up_limit: i32, user_current: i32, share: i64) -> i64 {
        let diff = ((up_limit as i64) - (user_current as i64)).abs().max(MIN_DIFF);
        let sm = self.sm_count as i64;

        let mut increment = sm
            .saturating_mul(sm)
            .saturating_mul(self.max_threads_per_sm as i64)
            .saturating_mul(diff)
            / STEP_DIVISOR;

        if diff > (up_limit as i64) / 2 {
            increment = increment.saturating_mul(diff).saturating_mul(2) / ((up_limit as i64) + 1).max(1);
        }

        let next = if user_current <= up_limit {
            share.saturating_add(increment).min(total)
        } else {
            share.saturating_sub(increment).max(0)
        };
        next.clamp(0, total.max(0))
    }
}

/// Launch token bucket
///
/// `current` may go negative: a launch debits its full grid size as long as
/// the balance was non-negative before the debit. Credits never raise the
/// balance above `total`.
#[derive(Debug, Default)]
pub struct CoreTokens {
    current: AtomicI64,
    total: AtomicI64,
}

impl CoreTokens {
    pub const fn new() -> Self {
        CoreTokens {
            current: AtomicI64::new(0),
            total: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    #[inline]
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn set_total(&self, total: i64) {
        self.total.store(total.max(0), Ordering::Release);
    }

    /// Double the capacity (the bucket stayed starved at full share)
    pub fn double_total(&self) -> i64 {
        let doubled = self.total().saturating_mul(2);
        self.total.store(doubled, Ordering::Release);
        doubled
    }

    /// Credit (or debit, if negative) `delta`, capped at `total`
    pub fn change(&self, delta: i64) -> i64 {
        let mut cur = self.current.load(Ordering::Acquire);
        loop {
            let total = self.total();
            let next = cur.saturating_add(delta).min(total);
            match self
                .current
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Debit `amount` if the balance is non-negative
    pub fn try_debit(&self, amount: i64) -> bool {
        let mut cur = self.current.load(Ordering::Acquire);
        loop {
            if cur < 0 {
                return false;
            }
            let next = cur.saturating_sub(amount);
            match self
                .current
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
