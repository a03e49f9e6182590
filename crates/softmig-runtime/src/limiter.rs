//! Kernel launch rate limiter
//!
//! Holds this process's token bucket and device topology. Launches debit
//! the bucket through `admit_launch`; the utilization watcher credits it
//! once per interval with the share computed by `delta`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use softmig_core::constants::SM_LIMIT_UNLIMITED;
use softmig_core::{CoreTokens, DeviceDriver, DeviceSpec, DriverError};
use tracing::{debug, info, trace};

use crate::config::WatcherConfig;
use crate::region::{now_secs, RegionHandle};

/// Device whose SM limit governs launches
const GOVERNED_DEVICE: usize = 0;

pub struct RateLimiter {
    region: Arc<RegionHandle>,
    driver: Arc<dyn DeviceDriver>,
    tokens: CoreTokens,
    spec: Mutex<DeviceSpec>,
    /// Share last computed by the watcher
    share: AtomicI64,
    /// Last kernel time this process wrote to the region
    last_kernel_note: AtomicU64,
    launch_backoff: Duration,
    recent_kernel_wait: Duration,
}

impl RateLimiter {
    pub fn new(
        region: Arc<RegionHandle>,
        driver: Arc<dyn DeviceDriver>,
        config: &WatcherConfig,
    ) -> Self {
        RateLimiter {
            region,
            driver,
            tokens: CoreTokens::new(),
            spec: Mutex::new(DeviceSpec::default()),
            share: AtomicI64::new(0),
            last_kernel_note: AtomicU64::new(now_secs()),
            launch_backoff: config.launch_backoff,
            recent_kernel_wait: config.recent_kernel_wait,
        }
    }

    /// Query the driver for the governed device's topology and size the
    /// bucket from it
    pub fn setspec(&self) -> Result<DeviceSpec, DriverError> {
        let spec = self.driver.device_spec(GOVERNED_DEVICE)?;
        self.set_spec(spec);
        Ok(spec)
    }

    pub fn set_spec(&self, spec: DeviceSpec) {
        *self.spec.lock() = spec;
        self.tokens.set_total(spec.total_cuda_cores());
        info!(
            sm_count = spec.sm_count,
            max_threads_per_sm = spec.max_threads_per_sm,
            total = self.tokens.total(),
            "device topology set"
        );
    }

    pub fn spec(&self) -> DeviceSpec {
        *self.spec.lock()
    }

    pub fn tokens(&self) -> &CoreTokens {
        &self.tokens
    }

    pub fn share(&self) -> i64 {
        self.share.load(Ordering::Acquire)
    }

    pub(crate) fn set_share(&self, share: i64) {
        self.share.store(share, Ordering::Release);
    }

    /// SM limit of the governed device, in percent
    pub fn up_limit(&self) -> u64 {
        self.region
            .configured_sm_limit(GOVERNED_DEVICE)
            .unwrap_or(SM_LIMIT_UNLIMITED)
    }

    /// Has `setspec` sized the bucket yet?
    pub fn has_spec(&self) -> bool {
        self.tokens.total() > 0
    }

    /// Are launches currently subject to the bucket?
    ///
    /// Never before the bucket is sized: nothing could refill it.
    pub fn throttling_enabled(&self) -> bool {
        let limit = self.up_limit();
        limit > 0
            && limit < SM_LIMIT_UNLIMITED
            && self.has_spec()
            && self.region.effective_utilization_switch()
    }

    /// Next share given the observed utilization
    pub fn delta(&self, up_limit: i32, user_current: i32, share: i64) -> i64 {
        self.spec()
            .delta(self.tokens.total(), up_limit, user_current, share)
    }

    /// Credit `delta` tokens, capped at the bucket capacity
    pub fn change_token(&self, delta: i64) -> i64 {
        let current = self.tokens.change(delta);
        trace!(delta, current, "tokens credited");
        current
    }

    /// Block until a kernel of `grid` blocks may be launched
    ///
    /// Waits out the shared recent-kernel gate first, then spins on the
    /// bucket with a short sleep between attempts. Returns immediately once
    /// throttling is off.
    pub fn admit_launch(&self, grid: u64) {
        while self.region.recent_kernel() < 0 {
            thread::sleep(self.recent_kernel_wait);
        }
        self.region.set_recent_kernel(2);

        let cost = i64::try_from(grid).unwrap_or(i64::MAX);
        while self.throttling_enabled() {
            if self.tokens.try_debit(cost) {
                trace!(grid, current = self.tokens.current(), "launch admitted");
                return;
            }
            thread::sleep(self.launch_backoff);
        }
    }

    /// Record a launch in the region's last-kernel timestamp
    ///
    /// At most once per `kernel_record_interval`; returns whether the region
    /// was written.
    pub fn note_kernel_launch(&self) -> bool {
        self.note_kernel_launch_at(now_secs())
    }

    pub(crate) fn note_kernel_launch_at(&self, now: u64) -> bool {
        let interval = self.region.config().kernel_record_interval.as_secs();
        let last = self.last_kernel_note.load(Ordering::Acquire);
        if now.saturating_sub(last) < interval {
            return false;
        }
        if self
            .last_kernel_note
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let _guard = self.region.lock();
        let shared = &self.region.region().last_kernel_time;
        if shared.load(Ordering::Acquire) < now {
            shared.store(now, Ordering::Release);
        }
        debug!(now, "recorded kernel launch time");
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
