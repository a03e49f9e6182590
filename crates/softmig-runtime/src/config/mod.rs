//! softmig configuration
//!
//! Provides library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Per-job config file (limit keys only, see `file`)
//! 2. Environment variables
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use softmig_runtime::config::RegionConfig;
//!
//! // Defaults with env overrides
//! let config = RegionConfig::from_env()?;
//!
//! // Or fully explicit, e.g. in tests
//! let config = RegionConfig::new()
//!     .path("/tmp/test.cache")
//!     .memory_limit(0, 1 << 30);
//! ```

pub mod defaults;
pub mod file;

pub use file::JobConfig;

use std::path::PathBuf;
use std::time::Duration;

use softmig_core::constants::{DEFAULT_REGION_PATH, MAX_DEVICES};
use softmig_core::env::{env_get, env_get_opt, env_get_str, parse_limit};
use softmig_core::{CoreError, UtilizationPolicy};
use thiserror::Error;
use tracing::debug;

/// Timings of the region lock protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// One timed wait on the coarse lock
    pub wait: Duration,
    /// Timed waits on a live holder before recovering anyway
    pub retries: u32,
    /// Wait budget of the exit hook
    pub exit_wait: Duration,
    /// One timed wait on the post-init lock
    pub postinit_wait: Duration,
    pub postinit_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LockConfig {
    /// Environment variables (all optional):
    /// - `SOFTMIG_LOCK_TIMEOUT_MS`
    /// - `SOFTMIG_LOCK_RETRIES`
    /// - `SOFTMIG_EXIT_LOCK_TIMEOUT_MS`
    /// - `SOFTMIG_POSTINIT_TIMEOUT_MS`
    /// - `SOFTMIG_POSTINIT_RETRIES`
    pub fn from_env() -> Self {
        Self {
            wait: Duration::from_millis(env_get("SOFTMIG_LOCK_TIMEOUT_MS", defaults::LOCK_TIMEOUT_MS)),
            retries: env_get("SOFTMIG_LOCK_RETRIES", defaults::LOCK_RETRIES),
            exit_wait: Duration::from_millis(env_get(
                "SOFTMIG_EXIT_LOCK_TIMEOUT_MS",
                defaults::EXIT_LOCK_TIMEOUT_MS,
            )),
            postinit_wait: Duration::from_millis(env_get(
                "SOFTMIG_POSTINIT_TIMEOUT_MS",
                defaults::POSTINIT_TIMEOUT_MS,
            )),
            postinit_retries: env_get("SOFTMIG_POSTINIT_RETRIES", defaults::POSTINIT_RETRIES),
        }
    }

    /// Library defaults, no env override
    pub fn new() -> Self {
        Self {
            wait: Duration::from_millis(defaults::LOCK_TIMEOUT_MS),
            retries: defaults::LOCK_RETRIES,
            exit_wait: Duration::from_millis(defaults::EXIT_LOCK_TIMEOUT_MS),
            postinit_wait: Duration::from_millis(defaults::POSTINIT_TIMEOUT_MS),
            postinit_retries: defaults::POSTINIT_RETRIES,
        }
    }

    pub fn wait(mut self, d: Duration) -> Self {
        self.wait = d;
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.retries = n;
        self
    }

    pub fn exit_wait(mut self, d: Duration) -> Self {
        self.exit_wait = d;
        self
    }

    pub fn postinit_wait(mut self, d: Duration) -> Self {
        self.postinit_wait = d;
        self
    }

    pub fn postinit_retries(mut self, n: u32) -> Self {
        self.postinit_retries = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait.is_zero() {
            return Err(ConfigError::InvalidValue("lock wait must be > 0"));
        }
        if self.postinit_wait.is_zero() {
            return Err(ConfigError::InvalidValue("postinit wait must be > 0"));
        }
        Ok(())
    }
}

/// Everything a process needs to attach to the shared region
///
/// Limits must agree across every process sharing a region; the first
/// attacher stores them and later attachers are checked against them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    /// Backing file of the region
    pub path: PathBuf,
    /// Devices recorded in the region header
    pub device_count: usize,
    /// Memory limit per device in bytes, 0 = unlimited
    pub memory_limits: [u64; MAX_DEVICES],
    /// SM limit per device in percent, 0 or 100 = unthrottled
    pub sm_limits: [u64; MAX_DEVICES],
    pub priority: i32,
    pub utilization_policy: UtilizationPolicy,
    /// Minimum spacing of shared last-kernel timestamp updates
    pub kernel_record_interval: Duration,
    /// How long a losing attacher waits for the initializer
    pub init_wait: Duration,
    pub init_poll: Duration,
    pub lock: LockConfig,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionConfig {
    /// Library defaults with environment and job-config overrides
    ///
    /// Environment variables (all optional):
    /// - `CUDA_DEVICE_MEMORY_SHARED_CACHE` - region file path
    /// - `CUDA_DEVICE_MEMORY_LIMIT`, `CUDA_DEVICE_MEMORY_LIMIT_<i>` - bytes, k/m/g suffix
    /// - `CUDA_DEVICE_SM_LIMIT`, `CUDA_DEVICE_SM_LIMIT_<i>` - percent
    /// - `CUDA_DEVICE_COUNT` - devices recorded in the header
    /// - `CUDA_TASK_PRIORITY`
    /// - `GPU_CORE_UTILIZATION_POLICY` - `force` / `disable`
    /// - `RECORD_KERNEL_INTERVAL` - seconds
    /// - `SOFTMIG_INIT_WAIT_MS`
    /// - plus everything `LockConfig::from_env` reads
    ///
    /// A limit that does not parse is an error; silently running
    /// unlimited would defeat the quota.
    pub fn from_env() -> Result<Self, ConfigError> {
        let job = JobConfig::from_env();
        let job = job.as_ref();

        let memory_fallback = read_limit(job, "CUDA_DEVICE_MEMORY_LIMIT")?.unwrap_or(0);
        let sm_fallback = match read_limit(job, "CUDA_DEVICE_SM_LIMIT")? {
            Some(0) | None => defaults::SM_LIMIT,
            Some(v) => v,
        };

        let mut memory_limits = [0u64; MAX_DEVICES];
        let mut sm_limits = [0u64; MAX_DEVICES];
        for dev in 0..MAX_DEVICES {
            memory_limits[dev] = read_limit(job, &format!("CUDA_DEVICE_MEMORY_LIMIT_{}", dev))?
                .filter(|&v| v > 0)
                .unwrap_or(memory_fallback);
            sm_limits[dev] = read_limit(job, &format!("CUDA_DEVICE_SM_LIMIT_{}", dev))?
                .filter(|&v| v > 0)
                .unwrap_or(sm_fallback);
        }

        let config = Self {
            path: PathBuf::from(env_get_str("CUDA_DEVICE_MEMORY_SHARED_CACHE", DEFAULT_REGION_PATH)),
            device_count: env_get("CUDA_DEVICE_COUNT", MAX_DEVICES).clamp(1, MAX_DEVICES),
            memory_limits,
            sm_limits,
            priority: env_get("CUDA_TASK_PRIORITY", defaults::PRIORITY),
            utilization_policy: env_get_opt::<String>("GPU_CORE_UTILIZATION_POLICY")
                .map(|s| UtilizationPolicy::parse(&s))
                .unwrap_or_default(),
            kernel_record_interval: Duration::from_secs(env_get(
                "RECORD_KERNEL_INTERVAL",
                defaults::KERNEL_RECORD_INTERVAL_SECS,
            )),
            init_wait: Duration::from_millis(env_get("SOFTMIG_INIT_WAIT_MS", defaults::INIT_WAIT_MS)),
            init_poll: Duration::from_millis(defaults::INIT_POLL_MS),
            lock: LockConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Library defaults, no env override
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_REGION_PATH),
            device_count: MAX_DEVICES,
            memory_limits: [0; MAX_DEVICES],
            sm_limits: [defaults::SM_LIMIT; MAX_DEVICES],
            priority: defaults::PRIORITY,
            utilization_policy: UtilizationPolicy::Default,
            kernel_record_interval: Duration::from_secs(defaults::KERNEL_RECORD_INTERVAL_SECS),
            init_wait: Duration::from_millis(defaults::INIT_WAIT_MS),
            init_poll: Duration::from_millis(defaults::INIT_POLL_MS),
            lock: LockConfig::new(),
        }
    }

    // Builder methods

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn device_count(mut self, n: usize) -> Self {
        self.device_count = n;
        self
    }

    pub fn memory_limit(mut self, dev: usize, bytes: u64) -> Self {
        if let Some(slot) = self.memory_limits.get_mut(dev) {
            *slot = bytes;
        }
        self
    }

    pub fn sm_limit(mut self, dev: usize, percent: u64) -> Self {
        if let Some(slot) = self.sm_limits.get_mut(dev) {
            *slot = percent;
        }
        self
    }

    pub fn priority(mut self, p: i32) -> Self {
        self.priority = p;
        self
    }

    pub fn utilization_policy(mut self, policy: UtilizationPolicy) -> Self {
        self.utilization_policy = policy;
        self
    }

    pub fn kernel_record_interval(mut self, d: Duration) -> Self {
        self.kernel_record_interval = d;
        self
    }

    pub fn init_wait(mut self, d: Duration) -> Self {
        self.init_wait = d;
        self
    }

    pub fn lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_count == 0 || self.device_count > MAX_DEVICES {
            return Err(ConfigError::InvalidValue("device_count must be in 1..=16"));
        }
        if self.sm_limits.iter().any(|&l| l > 100) {
            return Err(ConfigError::InvalidValue("sm limit must be <= 100"));
        }
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue("region path must not be empty"));
        }
        self.lock.validate()
    }

    /// Log the effective configuration at debug level
    pub fn log(&self) {
        let devices = self.device_count.min(MAX_DEVICES);
        debug!(
            path = %self.path.display(),
            device_count = self.device_count,
            memory_limits = ?&self.memory_limits[..devices],
            sm_limits = ?&self.sm_limits[..devices],
            priority = self.priority,
            utilization_policy = ?self.utilization_policy,
            kernel_record_interval = ?self.kernel_record_interval,
            init_wait = ?self.init_wait,
            lock_wait = ?self.lock.wait,
            lock_retries = self.lock.retries,
            exit_wait = ?self.lock.exit_wait,
            postinit_wait = ?self.lock.postinit_wait,
            postinit_retries = self.lock.postinit_retries,
            "region configuration"
        );
    }
}

/// Settings of the utilization watcher thread and launch admission
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Time between iterations
    pub interval: Duration,
    /// Sleep of a launch that found the bucket empty
    pub launch_backoff: Duration,
    /// Sleep of a launch held by the recent-kernel gate
    pub recent_kernel_wait: Duration,
    /// Failed host-pid resolutions before using the container pid
    pub hostpid_attempts: u32,
    /// Thread name
    pub thread_name: String,
    /// Stack size for the watcher thread (None = system default)
    pub stack_size: Option<usize>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherConfig {
    /// Environment variables (all optional):
    /// - `SOFTMIG_WATCH_INTERVAL_MS`
    /// - `SOFTMIG_LAUNCH_BACKOFF_MS`
    /// - `SOFTMIG_HOSTPID_ATTEMPTS`
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_millis(env_get(
                "SOFTMIG_WATCH_INTERVAL_MS",
                defaults::WATCH_INTERVAL_MS,
            )),
            launch_backoff: Duration::from_millis(env_get(
                "SOFTMIG_LAUNCH_BACKOFF_MS",
                defaults::LAUNCH_BACKOFF_MS,
            )),
            hostpid_attempts: env_get("SOFTMIG_HOSTPID_ATTEMPTS", defaults::HOSTPID_ATTEMPTS),
            ..Self::new()
        }
    }

    pub fn new() -> Self {
        Self {
            interval: Duration::from_millis(defaults::WATCH_INTERVAL_MS),
            launch_backoff: Duration::from_millis(defaults::LAUNCH_BACKOFF_MS),
            recent_kernel_wait: Duration::from_millis(defaults::RECENT_KERNEL_WAIT_MS),
            hostpid_attempts: defaults::HOSTPID_ATTEMPTS,
            thread_name: "softmig-watcher".into(),
            stack_size: None,
        }
    }

    pub fn interval(mut self, d: Duration) -> Self {
        self.interval = d;
        self
    }

    pub fn launch_backoff(mut self, d: Duration) -> Self {
        self.launch_backoff = d;
        self
    }

    pub fn recent_kernel_wait(mut self, d: Duration) -> Self {
        self.recent_kernel_wait = d;
        self
    }

    pub fn hostpid_attempts(mut self, n: u32) -> Self {
        self.hostpid_attempts = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidValue("watch interval must be > 0"));
        }
        Ok(())
    }
}

/// Look a key up in the job config first, then the environment
fn lookup(job: Option<&JobConfig>, key: &str) -> Option<String> {
    job.and_then(|j| j.get(key))
        .map(str::to_string)
        .or_else(|| std::env::var(key).ok())
}

fn read_limit(job: Option<&JobConfig>, key: &str) -> Result<Option<u64>, ConfigError> {
    match lookup(job, key) {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => parse_limit(&v).map(Some).map_err(|source| ConfigError::InvalidLimit {
            key: key.to_string(),
            value: v,
            source,
        }),
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),

    #[error("invalid limit {key}={value:?}: {source}")]
    InvalidLimit {
        key: String,
        value: String,
        #[source]
        source: CoreError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_valid() {
        let config = RegionConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.sm_limits[3], 100);
        assert_eq!(config.memory_limits[3], 0);
    }

    #[test]
    fn test_builder() {
        let config = RegionConfig::new()
            .path("/tmp/x")
            .memory_limit(1, 4096)
            .sm_limit(1, 50)
            .memory_limit(99, 1)
            .lock(LockConfig::new().wait(Duration::from_millis(5)).retries(2));

        assert_eq!(config.memory_limits[1], 4096);
        assert_eq!(config.sm_limits[1], 50);
        assert_eq!(config.lock.wait, Duration::from_millis(5));
        assert_eq!(config.lock.retries, 2);
    }

    #[test]
    fn test_validation() {
        assert!(RegionConfig::new().device_count(0).validate().is_err());
        assert!(RegionConfig::new().sm_limit(0, 101).validate().is_err());
        assert!(RegionConfig::new()
            .lock(LockConfig::new().wait(Duration::ZERO))
            .validate()
            .is_err());
        assert!(WatcherConfig::new().interval(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_job_config_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.conf");
        std::fs::write(&path, "__SOFTMIG_TEST_LIMIT__=2g\n").unwrap();
        let job = JobConfig::load(&path).unwrap();

        std::env::set_var("__SOFTMIG_TEST_LIMIT__", "1g");
        assert_eq!(read_limit(Some(&job), "__SOFTMIG_TEST_LIMIT__"), Ok(Some(2 << 30)));
        assert_eq!(read_limit(None, "__SOFTMIG_TEST_LIMIT__"), Ok(Some(1 << 30)));
        std::env::set_var("__SOFTMIG_TEST_LIMIT__", "lots");
        assert!(matches!(
            read_limit(None, "__SOFTMIG_TEST_LIMIT__"),
            Err(ConfigError::InvalidLimit { .. })
        ));
        std::env::remove_var("__SOFTMIG_TEST_LIMIT__");
        assert_eq!(read_limit(None, "__SOFTMIG_TEST_LIMIT__"), Ok(None));
    }
}
