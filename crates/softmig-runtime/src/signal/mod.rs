//! Signal handling for coordinated suspend and resume
//!
//! An administrator asks every registered process to release device memory
//! with SIGUSR2 and lets them continue with SIGUSR1. Handlers only flip the
//! status word of the process's own slot; acting on it is up to the
//! interception layer.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    }
}
