//! Environment variable utilities
//!
//! Runtime overrides for `RuntimeConfig` are read through these helpers.
//! A variable that is unset or fails to parse falls back to the default.
//!
//! ```ignore
//! use dfiber_core::env::{env_get, env_get_bool};
//!
//! let threads: usize = env_get("DFIBER_THREADS", 1);
//! let use_caller = env_get_bool("DFIBER_USE_CALLER", true);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as a boolean
///
/// "1", "true", "yes", "on" (any case) are true; "0", "false", "no", "off"
/// are false. Anything else, including unset, yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// `Some(T)` if `key` is set and parses
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Raw string value of `key`, or `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Milliseconds in `key` as a `Duration`
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Check if `key` is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNSET: &str = "__DFIBER_TEST_UNSET_VAR__";

    #[test]
    fn test_unset_defaults() {
        let val: usize = env_get(UNSET, 42);
        assert_eq!(val, 42);
        assert!(env_get_bool(UNSET, true));
        assert!(!env_get_bool(UNSET, false));
        assert_eq!(env_get_opt::<usize>(UNSET), None);
        assert_eq!(env_get_str(UNSET, "hello"), "hello");
        assert_eq!(env_get_millis(UNSET, 250), Duration::from_millis(250));
        assert!(!env_is_set(UNSET));
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__DFIBER_TEST_NUM__", " 123 ");
        let val: usize = env_get("__DFIBER_TEST_NUM__", 0);
        assert_eq!(val, 123);
        assert!(env_is_set("__DFIBER_TEST_NUM__"));
        std::env::remove_var("__DFIBER_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        let key = "__DFIBER_TEST_BOOL__";
        for truthy in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var(key, truthy);
            assert!(env_get_bool(key, false), "{truthy}");
        }
        for falsy in ["0", "false", "No", "off"] {
            std::env::set_var(key, falsy);
            assert!(!env_get_bool(key, true), "{falsy}");
        }
        // Garbage keeps the default either way
        std::env::set_var(key, "garbage");
        assert!(env_get_bool(key, true));
        assert!(!env_get_bool(key, false));
        std::env::remove_var(key);
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__DFIBER_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__DFIBER_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__DFIBER_TEST_INVALID__");
    }
}
