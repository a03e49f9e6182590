//! Subscriber setup
//!
//! Verbosity comes from `LIBCUDA_LOG_LEVEL`, the variable workloads already
//! set for the vendor shim:
//!
//! | value | level |
//! |-------|-------|
//! | 0     | error |
//! | 1, 2  | warn  |
//! | 3     | info  |
//! | 4+    | debug |
//!
//! `RUST_LOG` takes precedence when set.

use std::sync::atomic::{AtomicBool, Ordering};

use softmig_core::env_get_opt;
use tracing_subscriber::EnvFilter;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Level directive for a `LIBCUDA_LOG_LEVEL` value
pub fn level_for(level: Option<i32>) -> &'static str {
    match level {
        Some(l) if l <= 0 => "error",
        Some(1 | 2) | None => "warn",
        Some(3) => "info",
        Some(_) => "debug",
    }
}

fn filter() -> EnvFilter {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        if let Ok(f) = EnvFilter::try_from_default_env() {
            return f;
        }
    }
    EnvFilter::new(level_for(env_get_opt("LIBCUDA_LOG_LEVEL")))
}

/// Install a stderr fmt subscriber once
///
/// An application that installed its own global subscriber keeps it.
pub fn init_logging() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
