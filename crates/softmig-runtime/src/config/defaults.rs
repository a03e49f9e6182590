//! Library defaults
//!
//! Every value here can be overridden through the environment; see
//! `RegionConfig::from_env` and `WatcherConfig::from_env`.

/// One timed wait on the region lock
pub const LOCK_TIMEOUT_MS: u64 = 10_000;

/// Timed waits on a live holder before recovering anyway
pub const LOCK_RETRIES: u32 = 30;

/// Lock wait budget of the exit hook
pub const EXIT_LOCK_TIMEOUT_MS: u64 = 3_000;

/// One timed wait on the post-init lock
pub const POSTINIT_TIMEOUT_MS: u64 = 30_000;

/// Timed waits on the post-init lock before giving up
pub const POSTINIT_RETRIES: u32 = 10;

/// How long a losing attacher waits for the initializer
pub const INIT_WAIT_MS: u64 = 10_000;

/// Poll period of a losing attacher
pub const INIT_POLL_MS: u64 = 1;

/// Watcher iteration period
pub const WATCH_INTERVAL_MS: u64 = 120;

/// Sleep of a launch waiting for tokens
pub const LAUNCH_BACKOFF_MS: u64 = 10;

/// Sleep of a launch waiting on the recent-kernel gate
pub const RECENT_KERNEL_WAIT_MS: u64 = 1_000;

/// Failed host-pid resolutions before the container pid is used instead
pub const HOSTPID_ATTEMPTS: u32 = 5;

/// Seconds between updates of the shared last-kernel timestamp
pub const KERNEL_RECORD_INTERVAL_SECS: u64 = 1;

/// Default SM limit (percent); 100 disables throttling
pub const SM_LIMIT: u64 = 100;

/// Default task priority
pub const PRIORITY: i32 = 1;

/// Directory holding per-job config files
pub const JOB_CONFIG_DIR: &str = "/var/run/softmig";
