//! Environment variable utilities
//!
//! Typed lookups with defaults, used by `ColliderConfig::from_env()` and the
//! logging layer.
//!
//! # Usage
//!
//! ```ignore
//! use collider_core::env::{env_get, env_get_bool, env_get_size};
//!
//! let threads: usize = env_get("COLLIDER_THREADS", 0);
//! let direct = env_get_bool("COLLIDER_DIRECT_BUFFERS", false);
//! let block = env_get_size("COLLIDER_INPUT_BLOCK", 64 * 1024); // accepts "64k"
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// A variable that is set but fails to parse also yields the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (case-insensitive) are true, any other set
/// value is false, unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

/// Get a byte size, accepting an optional `k`, `m` or `g` suffix (powers of 1024)
pub fn env_get_size(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_size(&v))
        .unwrap_or(default)
}

/// Parse "4096", "64k", "1M", "2g" into bytes. Overflow is rejected.
pub fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, c)) if c.eq_ignore_ascii_case(&'k') => (&s[..i], 10),
        Some((i, c)) if c.eq_ignore_ascii_case(&'m') => (&s[..i], 20),
        Some((i, c)) if c.eq_ignore_ascii_case(&'g') => (&s[..i], 30),
        Some(_) => (s, 0),
        None => return None,
    };
    let base: usize = digits.trim().parse().ok()?;
    base.checked_mul(1usize << shift)
}

// ============================================================================
// Tests
// ============================================================================
