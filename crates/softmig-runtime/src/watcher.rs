//! Utilization watcher thread
//!
//! One background thread per process that feeds the launch token bucket.
//!
//! # Design
//!
//! Each iteration:
//! 1. Makes sure this process's host pid is known (skips the iteration
//!    until it is, falling back to the container pid after a few failures)
//! 2. Zeroes every slot's observed counters and re-fills them from the
//!    management API, matching samples to slots by host pid
//! 3. Moves the share toward the SM limit with `delta` and credits it to
//!    the bucket
//!
//! The thread never exits on its own; errors degrade an iteration and the
//! next one tries again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use softmig_core::constants::MAX_DEVICES;
use softmig_core::{DeviceMap, DriverError, HostPidResolver, ManagementApi};
use tracing::{debug, info, warn};

use crate::config::WatcherConfig;
use crate::error::{RegionError, RegionResult};
use crate::limiter::RateLimiter;
use crate::region::RegionHandle;

/// Window of utilization samples requested per iteration
const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// What one iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterationReport {
    /// Host pid unresolved or the management API failed
    pub skipped: bool,
    /// Summed SM utilization of the governed device, percent
    pub utilization: i64,
    pub share: i64,
    pub current: i64,
    pub total: i64,
}

/// Statistics from watcher execution
#[derive(Debug, Clone, Default)]
pub struct WatcherStats {
    pub iterations: u64,
    pub skipped: u64,
    pub last: IterationReport,
}

pub struct UtilizationWatcher {
    region: Arc<RegionHandle>,
    limiter: Arc<RateLimiter>,
    mgmt: Arc<dyn ManagementApi>,
    resolver: Arc<dyn HostPidResolver>,
    map: DeviceMap,
    config: WatcherConfig,
    hostpid_ready: bool,
    hostpid_failures: u32,
}

impl UtilizationWatcher {
    pub fn new(
        region: Arc<RegionHandle>,
        limiter: Arc<RateLimiter>,
        mgmt: Arc<dyn ManagementApi>,
        resolver: Arc<dyn HostPidResolver>,
        config: WatcherConfig,
    ) -> Self {
        let map = DeviceMap::identity(region.device_count().max(1));
        UtilizationWatcher {
            region,
            limiter,
            mgmt,
            resolver,
            map,
            config,
            hostpid_ready: false,
            hostpid_failures: 0,
        }
    }

    pub fn with_device_map(mut self, map: DeviceMap) -> Self {
        self.map = map;
        self
    }

    /// Start the background thread
    pub fn spawn(self) -> RegionResult<WatcherHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let mut builder = thread::Builder::new().name(self.config.thread_name.clone());
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        info!(
            sm_limit = self.limiter.up_limit(),
            interval = ?self.config.interval,
            "starting utilization watcher"
        );
        let handle = builder
            .spawn(move || self.watch_loop(shutdown_clone))
            .map_err(RegionError::Spawn)?;

        Ok(WatcherHandle {
            handle: Some(handle),
            shutdown,
        })
    }

    fn watch_loop(mut self, shutdown: Arc<AtomicBool>) -> WatcherStats {
        let mut stats = WatcherStats::default();
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(self.config.interval);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let report = self.run_iteration();
            stats.iterations += 1;
            if report.skipped {
                stats.skipped += 1;
            }
            stats.last = report;
        }
        stats
    }

    /// One sampling and feedback step
    pub fn run_iteration(&mut self) -> IterationReport {
        if !self.ensure_host_pid() {
            return IterationReport {
                skipped: true,
                ..IterationReport::default()
            };
        }

        if !self.limiter.has_spec() {
            if let Err(e) = self.limiter.setspec() {
                debug!(code = e.code, "device topology still unavailable");
            }
        }

        self.region.reset_utilization();
        let util = match self.get_used_gpu_utilization() {
            Ok(u) => u,
            Err(e) => {
                warn!(code = e.code, "utilization query failed");
                return IterationReport {
                    skipped: true,
                    ..IterationReport::default()
                };
            }
        };
        let user = util[0];

        let tokens = self.limiter.tokens();
        let mut share = self.limiter.share();
        if share == tokens.total() && tokens.current() < 0 {
            // Full share and still starved: the bucket is too small
            share = tokens.double_total();
            debug!(total = share, "token bucket doubled");
        }
        if (0..=100).contains(&user) {
            let up_limit = i32::try_from(self.limiter.up_limit()).unwrap_or(i32::MAX);
            share = self.limiter.delta(up_limit, user as i32, share);
            self.limiter.change_token(share);
        }
        self.limiter.set_share(share);

        let report = IterationReport {
            skipped: false,
            utilization: user,
            share,
            current: tokens.current(),
            total: tokens.total(),
        };
        debug!(
            util = report.utilization,
            share = report.share,
            current = report.current,
            total = report.total,
            "watcher iteration"
        );
        report
    }

    /// Resolve and record this process's host pid if still unknown
    fn ensure_host_pid(&mut self) -> bool {
        if self.hostpid_ready {
            return true;
        }
        let Some(slot) = self.region.my_slot() else {
            warn!(pid = self.region.pid(), "watcher running without a registered slot");
            return false;
        };
        if slot.hostpid() != 0 {
            self.hostpid_ready = true;
            return true;
        }

        let pid = self.region.pid();
        let resolved = match self.region.lock_postinit() {
            Some(_guard) => self.resolver.resolve(pid),
            None => {
                warn!(pid, "post-init lock unavailable, host pid not resolved");
                None
            }
        };
        let hostpid = match resolved {
            Some(h) => h,
            None => {
                self.hostpid_failures += 1;
                if self.hostpid_failures < self.config.hostpid_attempts {
                    debug!(pid, failures = self.hostpid_failures, "host pid not resolved yet");
                    return false;
                }
                warn!(
                    pid,
                    failures = self.hostpid_failures,
                    "host pid unresolved, using container pid"
                );
                pid
            }
        };

        if let Err(e) = self.region.set_host_pid(hostpid) {
            warn!(pid, hostpid, error = %e, "failed to record host pid");
            return false;
        }
        if let Err(e) = self.limiter.setspec() {
            warn!(code = e.code, "device topology query failed");
        }
        self.hostpid_ready = true;
        true
    }

    /// Refill every slot's observed counters and sum SM utilization per
    /// region device
    ///
    /// Samples whose pid matches no slot's host pid are ignored; slots with
    /// an unknown host pid (0) never match.
    pub fn get_used_gpu_utilization(&self) -> Result<[i64; MAX_DEVICES], DriverError> {
        let mut util = [0i64; MAX_DEVICES];
        let count = self.mgmt.device_count()?;
        let since_us = sample_start_us();

        let _guard = self.region.lock();
        for mgmt_dev in 0..count {
            let Some(dev) = self.map.region_for(mgmt_dev) else {
                continue;
            };

            match self.mgmt.compute_processes(mgmt_dev) {
                Ok(procs) => {
                    for p in procs {
                        if let Some(slot) = self.slot_for_sample(p.pid) {
                            slot.monitorused[dev].fetch_add(p.used_bytes, Ordering::Relaxed);
                        }
                    }
                }
                Err(e) => debug!(mgmt_dev, code = e.code, "compute process query failed"),
            }

            let mut sum: i64 = 0;
            match self.mgmt.process_utilization(mgmt_dev, since_us) {
                Ok(samples) => {
                    for s in samples {
                        if let Some(slot) = self.slot_for_sample(s.pid) {
                            sum = sum.saturating_add(s.sm_util as i64);
                            slot.device_util[dev]
                                .sm_util
                                .fetch_add(s.sm_util as u64, Ordering::Relaxed);
                        }
                    }
                }
                Err(e) => debug!(mgmt_dev, code = e.code, "utilization query failed"),
            }
            util[dev] = sum.max(0);
        }
        Ok(util)
    }

    fn slot_for_sample(&self, pid: u32) -> Option<&softmig_core::ProcessSlot> {
        self.region.find_by_hostpid(i32::try_from(pid).ok()?)
    }
}

fn sample_start_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.saturating_sub(SAMPLE_WINDOW).as_micros() as u64)
        .unwrap_or(0)
}

/// Handle to a running watcher thread
pub struct WatcherHandle {
    handle: Option<JoinHandle<WatcherStats>>,
    shutdown: Arc<AtomicBool>,
}

impl WatcherHandle {
    /// Request shutdown and wait for the watcher thread to exit
    pub fn shutdown(mut self) -> WatcherStats {
        self.shutdown.store(true, Ordering::Release);
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                warn!("watcher thread panicked");
                WatcherStats::default()
            }
            None => WatcherStats::default(),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Request shutdown without waiting
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.request_shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::sim::{AlwaysAlive, FixedResolver, SimDriver, SimManagement};
    use softmig_core::{DeviceSpec, ProcessMemorySample, UtilizationSample};

    struct Rig {
        _dir: tempfile::TempDir,
        region: Arc<RegionHandle>,
        limiter: Arc<RateLimiter>,
        mgmt: Arc<SimManagement>,
        driver: Arc<SimDriver>,
    }

    fn rig(sm_limit: u64) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RegionConfig::new()
            .path(dir.path().join("region.cache"))
            .sm_limit(0, sm_limit);
        let region = Arc::new(RegionHandle::attach_with(cfg, 6001, Arc::new(AlwaysAlive)).unwrap());
        region.register_self().unwrap();
        let driver = Arc::new(SimDriver::new(DeviceSpec::new(108, 2048), 1 << 30));
        let limiter = Arc::new(RateLimiter::new(region.clone(), driver.clone(), &WatcherConfig::new()));
        Rig {
            _dir: dir,
            region,
            limiter,
            mgmt: Arc::new(SimManagement::new(1)),
            driver,
        }
    }

    fn watcher(rig: &Rig, resolver: FixedResolver) -> UtilizationWatcher {
        UtilizationWatcher::new(
            rig.region.clone(),
            rig.limiter.clone(),
            rig.mgmt.clone(),
            Arc::new(resolver),
            WatcherConfig::new().hostpid_attempts(3),
        )
    }

    #[test]
    fn test_over_limit_share_trends_down() {
        let rig = rig(50);
        rig.mgmt.set_utilization(0, vec![UtilizationSample { pid: 77001, sm_util: 90 }]);
        let mut w = watcher(&rig, FixedResolver(Some(77001)));

        let first = w.run_iteration();
        assert!(!first.skipped);
        let total = first.total;
        // Start from a full share
        rig.limiter.set_share(total);

        let mut last = total;
        for _ in 0..3 {
            let r = w.run_iteration();
            assert_eq!(r.utilization, 90);
            assert!(r.share <= last);
            assert!(r.share <= r.total);
            assert!(r.share >= 0);
            last = r.share;
        }
        assert!(last < total);
    }

    #[test]
    fn test_topology_retried_until_available() {
        let rig = rig(50);
        rig.driver.set_spec_available(false);
        rig.mgmt.set_utilization(0, vec![UtilizationSample { pid: 77001, sm_util: 0 }]);
        let mut w = watcher(&rig, FixedResolver(Some(77001)));

        rig.limiter.admit_launch(100);
        for _ in 0..5 {
            let r = w.run_iteration();
            assert!(!r.skipped);
            assert_eq!(r.total, 0);
        }
        assert_eq!(rig.limiter.tokens().current(), 0);

        rig.driver.set_spec_available(true);
        let r = w.run_iteration();
        assert_eq!(r.total, 108 * 2048 * 32);
        assert!(r.share > 0);
        assert!(rig.limiter.throttling_enabled());
        // The credited bucket admits the next launch
        rig.limiter.admit_launch(100);
        assert!(rig.limiter.tokens().current() < r.current);
    }

    #[test]
    fn test_unresolved_hostpid_skips_then_falls_back() {
        let rig = rig(50);
        let mut w = watcher(&rig, FixedResolver(None));
        assert!(w.run_iteration().skipped);
        assert!(w.run_iteration().skipped);
        // Third failure reaches the attempt budget
        assert!(!w.run_iteration().skipped);
        assert_eq!(rig.region.my_slot().unwrap().hostpid(), 6001);
        assert_eq!(rig.limiter.tokens().total(), 108 * 2048 * 32);
    }

    #[test]
    fn test_zero_hostpid_never_matches() {
        let rig = rig(50);
        // A second registered process whose host pid is still unknown
        rig.region.register_pid(6002).unwrap();
        rig.mgmt.set_utilization(
            0,
            vec![
                UtilizationSample { pid: 0, sm_util: 40 },
                UtilizationSample { pid: 77001, sm_util: 10 },
            ],
        );
        rig.mgmt.set_processes(0, vec![ProcessMemorySample { pid: 0, used_bytes: 999 }]);
        let mut w = watcher(&rig, FixedResolver(Some(77001)));

        let r = w.run_iteration();
        assert_eq!(r.utilization, 10);
        assert_eq!(rig.region.find_by_pid(6002).unwrap().sm_util(0), 0);
        assert_eq!(rig.region.monitor_usage(0).unwrap(), 0);
    }

    #[test]
    fn test_samples_accumulate_per_slot() {
        let rig = rig(50);
        rig.mgmt.set_processes(
            0,
            vec![
                ProcessMemorySample { pid: 77001, used_bytes: 100 },
                ProcessMemorySample { pid: 77001, used_bytes: 28 },
                ProcessMemorySample { pid: 88888, used_bytes: 1 << 20 },
            ],
        );
        let mut w = watcher(&rig, FixedResolver(Some(77001)));
        w.run_iteration();
        assert_eq!(rig.region.my_slot().unwrap().monitor(0), 128);
        // Counters are rebuilt, not accumulated across iterations
        w.run_iteration();
        assert_eq!(rig.region.my_slot().unwrap().monitor(0), 128);
    }

    #[test]
    fn test_device_map_routes_samples() {
        let rig = rig(50);
        let mgmt = Arc::new(SimManagement::new(3));
        mgmt.set_utilization(2, vec![UtilizationSample { pid: 77001, sm_util: 33 }]);
        let mut w = UtilizationWatcher::new(
            rig.region.clone(),
            rig.limiter.clone(),
            mgmt,
            Arc::new(FixedResolver(Some(77001))),
            WatcherConfig::new(),
        )
        .with_device_map(DeviceMap::from_visible("2").unwrap());
        assert_eq!(w.run_iteration().utilization, 33);
    }

    #[test]
    fn test_starved_full_share_doubles_total() {
        let rig = rig(50);
        let mut w = watcher(&rig, FixedResolver(Some(77001)));
        w.run_iteration();
        let total = rig.limiter.tokens().total();
        rig.limiter.set_share(total);
        rig.limiter.change_token(-(total * 3));

        let r = w.run_iteration();
        assert_eq!(r.total, total * 2);
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let rig = rig(50);
        rig.region.set_host_pid(77001).unwrap();
        let w = UtilizationWatcher::new(
            rig.region.clone(),
            rig.limiter.clone(),
            rig.mgmt.clone(),
            Arc::new(FixedResolver(None)),
            WatcherConfig::new().interval(Duration::from_millis(2)),
        );
        let handle = w.spawn().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_shutdown_requested());
        let stats = handle.shutdown();
        assert!(stats.iterations >= 1);
        assert_eq!(stats.skipped, 0);
    }
}
