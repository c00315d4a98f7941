//! Environment variable helpers
//!
//! ```ignore
//! use uring_core::env::{env_get, env_get_bool, env_get_flags};
//!
//! let entries: u32 = env_get("URING_ENTRIES", 256);
//! let sqpoll = env_get_bool("URING_SQPOLL", false);
//! let flags = env_get_flags("URING_SETUP_FLAGS", 0); // "0x4000" or "16384"
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default` when unset or malformed.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Flag word in decimal or `0x` hex.
pub fn env_get_flags(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_flags(&v))
        .unwrap_or(default)
}

/// Parse a decimal or `0x`-prefixed hex flag word.
pub fn parse_flags(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: u32 = env_get("__URING_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u32>("__URING_TEST_UNSET__").is_none());
        assert!(env_get_bool("__URING_TEST_UNSET__", true));
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__URING_TEST_NUM__", " 128 ");
        let val: u32 = env_get("__URING_TEST_NUM__", 0);
        assert_eq!(val, 128);

        std::env::set_var("__URING_TEST_NUM__", "lots");
        let val: u32 = env_get("__URING_TEST_NUM__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__URING_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (v, want) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("nope", false)] {
            std::env::set_var("__URING_TEST_BOOL__", v);
            assert_eq!(env_get_bool("__URING_TEST_BOOL__", !want), want, "value {v}");
        }
        std::env::remove_var("__URING_TEST_BOOL__");
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(parse_flags("16384"), Some(16384));
        assert_eq!(parse_flags("0x4000"), Some(0x4000));
        assert_eq!(parse_flags("0X10"), Some(16));
        assert_eq!(parse_flags("0xzz"), None);
        assert_eq!(parse_flags(""), None);
    }

    #[test]
    fn test_env_get_flags() {
        std::env::set_var("__URING_TEST_FLAGS__", "0x2");
        assert_eq!(env_get_flags("__URING_TEST_FLAGS__", 0), 2);
        std::env::remove_var("__URING_TEST_FLAGS__");
        assert_eq!(env_get_flags("__URING_TEST_FLAGS__", 9), 9);
    }
}
