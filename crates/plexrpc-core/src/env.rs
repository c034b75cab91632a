//! Environment variable helpers
//!
//! Every tunable in plexrpc has an environment override; these helpers do
//! the parsing so that a malformed value falls back to the default instead
//! of failing client construction.
//!
//! # Usage
//!
//! ```ignore
//! use plexrpc_core::env::{env_get, env_get_bool, env_get_ms, env_get_path};
//!
//! let attempts: u32 = env_get("PLEXRPC_MAX_ATTEMPTS", 2);
//! let timeout = env_get_ms("PLEXRPC_TIMEOUT_MS", Duration::from_millis(4000));
//! let map = env_get_path("PLEXRPC_LOOKUP_MAP");
//! let debug = env_get_bool("PLEXRPC_CLIENT_DEBUG", false);
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `"1" | "true" | "yes" | "on"` (any case) are true, any other set value
/// is false. Unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// `Some(T)` only if the variable is set and parses
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Milliseconds as a `Duration`
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// A path, ignoring empty values
#[inline]
pub fn env_get_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names; cargo runs tests in parallel.

    #[test]
    fn test_unset_falls_back() {
        let key = "__PLEXRPC_TEST_UNSET__";
        assert_eq!(env_get::<u32>(key, 7), 7);
        assert!(env_get_bool(key, true));
        assert_eq!(env_get_opt::<u64>(key), None);
        assert_eq!(env_get_str(key, "dflt"), "dflt");
        assert_eq!(env_get_ms(key, Duration::from_millis(5)), Duration::from_millis(5));
        assert_eq!(env_get_path(key), None);
        assert!(!env_is_set(key));
    }

    #[test]
    fn test_parse_and_garbage() {
        let key = "__PLEXRPC_TEST_NUM__";
        std::env::set_var(key, " 250 ");
        assert_eq!(env_get::<u32>(key, 0), 250);
        assert_eq!(env_get_ms(key, Duration::ZERO), Duration::from_millis(250));

        std::env::set_var(key, "lots");
        assert_eq!(env_get::<u32>(key, 9), 9);
        assert_eq!(env_get_ms(key, Duration::from_secs(1)), Duration::from_secs(1));
        std::env::remove_var(key);
    }

    #[test]
    fn test_bool_spellings() {
        let key = "__PLEXRPC_TEST_BOOL__";
        for yes in ["1", "true", "YES", "On"] {
            std::env::set_var(key, yes);
            assert!(env_get_bool(key, false), "{yes}");
        }
        for no in ["0", "false", "off", "maybe"] {
            std::env::set_var(key, no);
            assert!(!env_get_bool(key, true), "{no}");
        }
        std::env::remove_var(key);
    }

    #[test]
    fn test_empty_path_is_none() {
        let key = "__PLEXRPC_TEST_PATH__";
        std::env::set_var(key, "");
        assert_eq!(env_get_path(key), None);
        assert!(env_is_set(key));
        std::env::set_var(key, "/tmp/x.map");
        assert_eq!(env_get_path(key), Some(PathBuf::from("/tmp/x.map")));
        std::env::remove_var(key);
    }
}
