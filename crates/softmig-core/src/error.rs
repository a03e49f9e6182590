//! Error types for core operations

use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in platform-agnostic code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Device index beyond the region's fixed device table
    #[error("device index {0} out of range")]
    InvalidDevice(usize),

    /// Limit string is not a number with an optional k/m/g suffix
    #[error("invalid limit value {0:?}")]
    InvalidLimit(String),

    /// Limit string does not fit in 64 bits after scaling
    #[error("limit value {0:?} overflows")]
    LimitOverflow(String),
}

/// Non-success status returned by the device driver or management API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("driver call failed with status {code}")]
pub struct DriverError {
    pub code: i32,
}

impl DriverError {
    /// Status used when the driver reports out of memory
    pub const OUT_OF_MEMORY: DriverError = DriverError { code: 2 };

    /// Status used when a query is not supported
    pub const NOT_SUPPORTED: DriverError = DriverError { code: 801 };

    pub const fn new(code: i32) -> Self {
        DriverError { code }
    }
}
