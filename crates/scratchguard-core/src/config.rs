//! Runtime configuration.
//!
//! Read from the environment on first use and cached thereafter:
//! - `SCRATCHGUARD_TEMP_CAPACITY`: temp arena capacity in bytes (default 65536).
//! - `SCRATCHGUARD_DEFAULT_ALIGN`: alignment used when `talloc` is given 0
//!   (default 8, must be a power of two).
//! - `SCRATCHGUARD_CLEAR_ON_RESET`: zero reclaimed arena bytes on reset
//!   (default on in debug builds, off in release).
//! - `SCRATCHGUARD_TRACK_HEAP`: route the global heap through the tracker
//!   (default on in debug builds, off in release).
//! - `SCRATCHGUARD_ASSERT`: `panic` (default) or `log`.
//!
//! Unparseable values fall back to the default.

use std::sync::OnceLock;

/// Default temp arena capacity.
pub const DEFAULT_TEMP_CAPACITY: usize = 64 * 1024;

/// Default temp arena alignment.
pub const DEFAULT_ALIGN: usize = 8;

/// How failed assertions are handled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssertMode {
    /// Panic with the assertion message.
    #[default]
    Panic,
    /// Log the failure and return the error to the caller.
    Log,
}

impl AssertMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" | "warn" | "off" | "release" => Self::Log,
            _ => Self::Panic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemConfig {
    pub temp_capacity: usize,
    pub default_align: usize,
    pub clear_on_reset: bool,
    pub track_heap: bool,
    pub assert_mode: AssertMode,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            temp_capacity: DEFAULT_TEMP_CAPACITY,
            default_align: DEFAULT_ALIGN,
            clear_on_reset: cfg!(debug_assertions),
            track_heap: cfg!(debug_assertions),
            assert_mode: AssertMode::Panic,
        }
    }
}

impl MemConfig {
    /// Build a config from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            temp_capacity: lookup("SCRATCHGUARD_TEMP_CAPACITY")
                .and_then(|v| parse_size(&v))
                .unwrap_or(defaults.temp_capacity),
            default_align: lookup("SCRATCHGUARD_DEFAULT_ALIGN")
                .and_then(|v| parse_size(&v))
                .filter(|a| a.is_power_of_two())
                .unwrap_or(defaults.default_align),
            clear_on_reset: lookup("SCRATCHGUARD_CLEAR_ON_RESET")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.clear_on_reset),
            track_heap: lookup("SCRATCHGUARD_TRACK_HEAP")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.track_heap),
            assert_mode: lookup("SCRATCHGUARD_ASSERT")
                .map(|v| AssertMode::from_str_loose(&v))
                .unwrap_or(defaults.assert_mode),
        }
    }

    /// Build a config from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    #[must_use]
    pub fn with_temp_capacity(mut self, capacity: usize) -> Self {
        self.temp_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_clear_on_reset(mut self, clear: bool) -> Self {
        self.clear_on_reset = clear;
        self
    }

    #[must_use]
    pub fn with_track_heap(mut self, track: bool) -> Self {
        self.track_heap = track;
        self
    }

    #[must_use]
    pub fn with_assert_mode(mut self, mode: AssertMode) -> Self {
        self.assert_mode = mode;
        self
    }
}

fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(d) = raw.strip_suffix('k') {
        (d, 1024)
    } else if let Some(d) = raw.strip_suffix('m') {
        (d, 1024 * 1024)
    } else {
        (raw.as_str(), 1)
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

static GLOBAL_CONFIG: OnceLock<MemConfig> = OnceLock::new();

/// Get the process configuration (reads env vars on first call, caches thereafter).
#[must_use]
pub fn global_config() -> MemConfig {
    *GLOBAL_CONFIG.get_or_init(MemConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let cfg = MemConfig::from_lookup(|_| None);
        assert_eq!(cfg, MemConfig::default());
        assert_eq!(cfg.temp_capacity, 65536);
        assert_eq!(cfg.default_align, 8);
        assert_eq!(cfg.clear_on_reset, cfg!(debug_assertions));
    }

    #[test]
    fn parses_sizes_and_flags() {
        let cfg = MemConfig::from_lookup(lookup(&[
            ("SCRATCHGUARD_TEMP_CAPACITY", "128k"),
            ("SCRATCHGUARD_DEFAULT_ALIGN", "16"),
            ("SCRATCHGUARD_CLEAR_ON_RESET", "off"),
            ("SCRATCHGUARD_TRACK_HEAP", "TRUE"),
            ("SCRATCHGUARD_ASSERT", "log"),
        ]));
        assert_eq!(cfg.temp_capacity, 128 * 1024);
        assert_eq!(cfg.default_align, 16);
        assert!(!cfg.clear_on_reset);
        assert!(cfg.track_heap);
        assert_eq!(cfg.assert_mode, AssertMode::Log);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = MemConfig::from_lookup(lookup(&[
            ("SCRATCHGUARD_TEMP_CAPACITY", "lots"),
            ("SCRATCHGUARD_DEFAULT_ALIGN", "12"),
            ("SCRATCHGUARD_CLEAR_ON_RESET", "maybe"),
        ]));
        assert_eq!(cfg.temp_capacity, DEFAULT_TEMP_CAPACITY);
        assert_eq!(cfg.default_align, DEFAULT_ALIGN);
        assert_eq!(cfg.clear_on_reset, cfg!(debug_assertions));
    }

    #[test]
    fn assert_mode_parsing() {
        assert_eq!(AssertMode::from_str_loose("PANIC"), AssertMode::Panic);
        assert_eq!(AssertMode::from_str_loose("log"), AssertMode::Log);
        assert_eq!(AssertMode::from_str_loose("bogus"), AssertMode::Panic);
    }
}
