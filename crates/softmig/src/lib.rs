//! # softmig - soft GPU partitioning
//!
//! Lets several processes share one accelerator under per-device memory
//! quotas and a compute-share target, coordinated through a file-backed
//! shared region instead of hardware partitioning.
//!
//! ## Quick Start
//!
//! ```ignore
//! use softmig::{ensure_initialized, Backend};
//!
//! // `driver` implements softmig::DeviceDriver over the vendor library
//! let ctx = ensure_initialized(&Backend::new(driver))?;
//!
//! let ptr = ctx.allocate(64 << 20)?;   // OutOfMemory past the quota
//! ctx.admit_launch(grid_blocks);        // waits while over the SM share
//! ctx.free(ptr)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Interception layer (caller)              │
//! │        allocate / free / admit_launch / memory_info      │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Softmig                           │
//! │        Allocator · RateLimiter · UtilizationWatcher      │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │            Shared region (mmap of one host file)         │
//! │   header · limits · 1024 process slots · token gate      │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod logging;

pub use logging::init_logging;

// Re-export core types
pub use softmig_core::{
    DeviceDriver, DeviceMap, DevicePtr, DeviceSpec, DriverError, HostPidResolver,
    LivenessCheck, ManagementApi, MemoryInfo, MemoryType, ProcStatus, StreamHandle, UsageKind,
    UtilizationPolicy,
};
pub use softmig_core::constants;

// Re-export runtime types
pub use softmig_runtime::{
    current_pid, AllocError, AllocResult, Allocator, ConfigError, FreeOutcome, LockConfig,
    NsPidResolver, RateLimiter, RegionConfig, RegionError, RegionHandle, RegionResult,
    UsageReading, UtilizationWatcher, WatcherConfig, WatcherHandle, WatcherStats,
};

use std::sync::{Arc, Once};

use parking_lot::Mutex;
use softmig_runtime::signal;
use tracing::{error, info, warn};

/// Vendor seams the context is built over
#[derive(Clone)]
pub struct Backend {
    pub driver: Arc<dyn DeviceDriver>,
    /// Without one no watcher runs and launches are never credited
    pub management: Option<Arc<dyn ManagementApi>>,
    pub resolver: Arc<dyn HostPidResolver>,
}

impl Backend {
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        Backend {
            driver,
            management: None,
            resolver: Arc::new(NsPidResolver),
        }
    }

    pub fn management(mut self, mgmt: Arc<dyn ManagementApi>) -> Self {
        self.management = Some(mgmt);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn HostPidResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// One process's view of softmig
pub struct Softmig {
    region: Arc<RegionHandle>,
    allocator: Allocator,
    limiter: Arc<RateLimiter>,
    watcher: Mutex<Option<WatcherHandle>>,
    watcher_config: WatcherConfig,
}

impl Softmig {
    /// Attach as the calling process and register its slot
    pub fn new(
        config: RegionConfig,
        driver: Arc<dyn DeviceDriver>,
        watcher_config: WatcherConfig,
    ) -> RegionResult<Self> {
        let region = Arc::new(RegionHandle::attach(config)?);
        Self::with_region(region, driver, watcher_config)
    }

    /// Build over an attached region; registers `region.pid()`
    pub fn with_region(
        region: Arc<RegionHandle>,
        driver: Arc<dyn DeviceDriver>,
        watcher_config: WatcherConfig,
    ) -> RegionResult<Self> {
        watcher_config.validate()?;
        region.register_self()?;
        signal::install_status_handlers(&region)?;

        let limiter = Arc::new(RateLimiter::new(region.clone(), driver.clone(), &watcher_config));
        if let Err(e) = limiter.setspec() {
            warn!(code = e.code, "device topology unavailable, launches unthrottled until resolved");
        }
        Ok(Softmig {
            allocator: Allocator::new(region.clone(), driver),
            region,
            limiter,
            watcher: Mutex::new(None),
            watcher_config,
        })
    }

    /// Start the utilization watcher if the SM limit calls for one
    ///
    /// Returns whether a watcher is running.
    pub fn start_watcher(
        &self,
        mgmt: Arc<dyn ManagementApi>,
        resolver: Arc<dyn HostPidResolver>,
        map: DeviceMap,
    ) -> RegionResult<bool> {
        let limit = self.limiter.up_limit();
        if limit == 0 || limit > constants::SM_LIMIT_UNLIMITED {
            return Ok(false);
        }
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(true);
        }
        let watcher = UtilizationWatcher::new(
            self.region.clone(),
            self.limiter.clone(),
            mgmt,
            resolver,
            self.watcher_config.clone(),
        )
        .with_device_map(map);
        *slot = Some(watcher.spawn()?);
        Ok(true)
    }

    pub fn stop_watcher(&self) -> Option<WatcherStats> {
        self.watcher.lock().take().map(WatcherHandle::shutdown)
    }

    pub fn region(&self) -> &Arc<RegionHandle> {
        &self.region
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    // ========================================================================
    // Entry points for the interception layer
    // ========================================================================

    pub fn allocate(&self, size: u64) -> AllocResult<DevicePtr> {
        self.allocator.allocate(size)
    }

    pub fn free(&self, ptr: DevicePtr) -> AllocResult<FreeOutcome> {
        self.allocator.free(ptr)
    }

    pub fn allocate_async(&self, size: u64, stream: StreamHandle) -> AllocResult<DevicePtr> {
        self.allocator.allocate_async(size, stream)
    }

    pub fn free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> AllocResult<FreeOutcome> {
        self.allocator.free_async(ptr, stream)
    }

    /// Context and module call sites charge their memory directly
    pub fn add_usage(&self, pid: i32, dev: usize, bytes: u64, kind: UsageKind) -> RegionResult<()> {
        self.region.add_usage(pid, dev, bytes, kind)
    }

    pub fn remove_usage(&self, pid: i32, dev: usize, bytes: u64, kind: UsageKind) -> RegionResult<()> {
        self.region.remove_usage(pid, dev, bytes, kind)
    }

    pub fn total_usage(&self, dev: usize) -> RegionResult<u64> {
        self.region.total_usage(dev)
    }

    pub fn configured_limit(&self, dev: usize) -> RegionResult<u64> {
        self.region.configured_limit(dev)
    }

    pub fn configured_sm_limit(&self, dev: usize) -> RegionResult<u64> {
        self.region.configured_sm_limit(dev)
    }

    /// Device memory as the application should see it
    pub fn memory_info(&self, dev: usize, physical: MemoryInfo) -> RegionResult<MemoryInfo> {
        let limit = self.region.configured_limit(dev)?;
        let usage = self.region.total_usage(dev)?;
        Ok(MemoryInfo::emulate(physical, limit, usage))
    }

    /// Gate a kernel launch of `grid` blocks
    pub fn admit_launch(&self, grid: u64) {
        self.limiter.admit_launch(grid);
        self.limiter.note_kernel_launch();
    }

    /// Record the host pid and size the token bucket now that device
    /// attributes can be queried
    pub fn set_host_pid(&self, hostpid: i32) -> RegionResult<()> {
        self.region.set_host_pid(hostpid)?;
        if let Err(e) = self.limiter.setspec() {
            warn!(code = e.code, "device topology query failed");
        }
        Ok(())
    }

    pub fn suspend_all(&self) -> usize {
        self.region.suspend_all()
    }

    pub fn resume_all(&self) -> usize {
        self.region.resume_all()
    }

    /// Stop the watcher and release this process's slot
    pub fn shutdown(&self) -> bool {
        if let Some(handle) = self.watcher.lock().as_ref() {
            handle.request_shutdown();
        }
        self.region.remove_self()
    }
}

// ============================================================================
// Process-wide context
// ============================================================================

struct Global {
    pid: i32,
    ctx: Arc<Softmig>,
}

static GLOBAL: Mutex<Option<Global>> = Mutex::new(None);
static EXIT_HOOK: Once = Once::new();

/// The process-wide context, created on first use
///
/// Reads configuration from the environment, attaches, registers this
/// process and starts the watcher when a management API is available.
/// Later calls return the same context; a forked child gets its own.
/// Deployment errors (layout or limit mismatch, full table) abort the
/// process.
pub fn ensure_initialized(backend: &Backend) -> RegionResult<Arc<Softmig>> {
    let pid = current_pid();
    let mut global = GLOBAL.lock();
    if let Some(g) = global.as_ref() {
        if g.pid == pid {
            return Ok(g.ctx.clone());
        }
        info!(parent = g.pid, pid, "forked child attaching with its own slot");
    }

    init_logging();
    let ctx = match init_process(backend) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) if e.is_fatal() => {
            error!(pid, error = %e, "softmig cannot run in this configuration");
            std::process::abort();
        }
        Err(e) => return Err(e),
    };

    EXIT_HOOK.call_once(|| {
        // Safety: registering a plain extern "C" fn
        if unsafe { libc::atexit(release_on_exit) } != 0 {
            warn!("failed to register exit hook, slot will be reaped instead");
        }
    });

    *global = Some(Global {
        pid,
        ctx: ctx.clone(),
    });
    Ok(ctx)
}

fn init_process(backend: &Backend) -> RegionResult<Softmig> {
    let config = RegionConfig::from_env()?;
    let ctx = Softmig::new(config, backend.driver.clone(), WatcherConfig::from_env())?;
    if let Some(mgmt) = &backend.management {
        let map = std::env::var("CUDA_VISIBLE_DEVICES")
            .ok()
            .and_then(|v| DeviceMap::from_visible(&v))
            .unwrap_or_else(|| DeviceMap::identity(ctx.region.device_count()));
        ctx.start_watcher(mgmt.clone(), backend.resolver.clone(), map)?;
    }
    Ok(ctx)
}

extern "C" fn release_on_exit() {
    // Never block process exit on our own mutex
    let Some(global) = GLOBAL.try_lock() else {
        return;
    };
    if let Some(g) = global.as_ref() {
        if g.pid == current_pid() {
            g.ctx.shutdown();
        }
    }
}
