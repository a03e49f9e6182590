//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults,
//! plus `parse_limit` for the byte-size strings used by memory limits.
//!
//! # Usage
//!
//! ```ignore
//! use softmig_core::env::{env_get, parse_limit};
//!
//! let retries: u32 = env_get("SOFTMIG_LOCK_RETRIES", 30);
//! let limit = parse_limit("4g")?; // 4 GiB
//! ```

use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse a byte-size limit such as `"512m"`, `"4G"` or `"0x1000"`
///
/// The numeric part follows C `strtoul` base detection: a `0x` prefix is
/// hexadecimal and a leading `0` is octal. An optional trailing `k`, `m` or
/// `g` (any case) scales by 1024, 1024² or 1024³.
pub fn parse_limit(s: &str) -> CoreResult<u64> {
    let trimmed = s.trim();
    let invalid = || CoreError::InvalidLimit(s.to_string());

    let (number, scale) = match trimmed.as_bytes().last() {
        Some(b'k' | b'K') => (&trimmed[..trimmed.len() - 1], 1u64 << 10),
        Some(b'm' | b'M') => (&trimmed[..trimmed.len() - 1], 1u64 << 20),
        Some(b'g' | b'G') => (&trimmed[..trimmed.len() - 1], 1u64 << 30),
        Some(_) => (trimmed, 1u64),
        None => return Err(invalid()),
    };

    let value = if let Some(hex) = number
        .strip_prefix("0x")
        .or_else(|| number.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else if number.len() > 1 && number.starts_with('0') {
        u64::from_str_radix(&number[1..], 8)
    } else {
        number.parse::<u64>()
    }
    .map_err(|e| match e.kind() {
        std::num::IntErrorKind::PosOverflow => CoreError::LimitOverflow(s.to_string()),
        _ => invalid(),
    })?;

    value
        .checked_mul(scale)
        .ok_or_else(|| CoreError::LimitOverflow(s.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
