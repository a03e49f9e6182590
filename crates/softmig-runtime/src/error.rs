//! Error types for the runtime

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use softmig_core::{CoreError, DriverError};
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for region, lock and registry operations
pub type RegionResult<T> = Result<T, RegionError>;

/// Result type for allocator operations
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors raised while attaching to or operating on the shared region
#[derive(Debug, Error)]
pub enum RegionError {
    /// Backing file could not be opened or created
    #[error("failed to open shared region {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("shared region I/O error: {0}")]
    Io(#[from] io::Error),

    /// mmap, sem_init and friends
    #[error("system call failed: {0}")]
    Os(#[from] Errno),

    /// Region was laid out by an incompatible build
    #[error("region version {found_major}.{found_minor} does not match {expected_major}.{expected_minor}")]
    VersionMismatch {
        expected_major: u32,
        expected_minor: u32,
        found_major: u32,
        found_minor: u32,
    },

    /// This process was configured differently from the region's creator
    #[error("device {dev} {what} limit mismatch: region has {found}, this process configured {expected}")]
    LimitMismatch {
        dev: usize,
        what: &'static str,
        expected: u64,
        found: u64,
    },

    /// The initializer never finished
    #[error("region initialization did not complete within {waited:?} (flag {flag})")]
    InitTimeout { waited: Duration, flag: i32 },

    /// Inspection attach on a region nobody has initialized
    #[error("region is not initialized (flag {0})")]
    NotInitialized(i32),

    /// Every slot is held by a live process
    #[error("all {0} process slots are in use")]
    CapacityExhausted(usize),

    #[error("process {0} is not registered in the region")]
    SlotNotFound(i32),

    #[error("failed to spawn watcher thread: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RegionError {
    /// Is this a deployment error the process must not run past?
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegionError::VersionMismatch { .. }
                | RegionError::LimitMismatch { .. }
                | RegionError::InitTimeout { .. }
                | RegionError::CapacityExhausted(_)
                | RegionError::Config(_)
        )
    }
}

/// Errors returned by the allocator
#[derive(Debug, Error)]
pub enum AllocError {
    /// Admission control refused the request
    #[error("out of memory on device {dev}: requested {requested}, in use {usage}, limit {limit}")]
    OutOfMemory {
        dev: usize,
        requested: u64,
        usage: u64,
        limit: u64,
    },

    /// Underlying driver call failed; status passed through untouched
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Region(#[from] RegionError),
}

impl From<CoreError> for AllocError {
    fn from(e: CoreError) -> Self {
        AllocError::Region(RegionError::Core(e))
    }
}

impl AllocError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, AllocError::OutOfMemory { .. })
    }
}
