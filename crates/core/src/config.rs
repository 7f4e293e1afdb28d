// crates/core/src/config.rs
//! Engine configuration: deadline windows and driver buffer sizes.
//!
//! Three sources, all producing the same [`EngineConfig`]:
//! - [`EngineConfig::default`]: the built-in windows
//! - [`EngineConfig::from_env`]: `JOBTREE_*` variables over the defaults
//! - [`EngineConfig::from_toml_str`]: a TOML document over the defaults
//!
//! Durations are given in milliseconds everywhere outside this crate.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::jobs::DeadlineConfig;

pub const ENV_ALLOCATION_WINDOW_MS: &str = "JOBTREE_ALLOCATION_WINDOW_MS";
pub const ENV_ALLOCATION_CEILING_MS: &str = "JOBTREE_ALLOCATION_CEILING_MS";
pub const ENV_EXECUTION_WINDOW_MS: &str = "JOBTREE_EXECUTION_WINDOW_MS";
pub const ENV_RESPONSE_WINDOW_MS: &str = "JOBTREE_RESPONSE_WINDOW_MS";
pub const ENV_PROGRESS_BUFFER: &str = "JOBTREE_PROGRESS_BUFFER";

/// Capacity of the progress broadcast channel.
pub const DEFAULT_PROGRESS_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub deadlines: DeadlineConfig,
    pub progress_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deadlines: DeadlineConfig::default(),
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
        }
    }
}

/// On-disk shape. Every field is optional and falls back to the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    allocation_window_ms: Option<u64>,
    allocation_ceiling_ms: Option<u64>,
    execution_window_ms: Option<u64>,
    response_window_ms: Option<u64>,
    progress_buffer: Option<usize>,
}

impl EngineConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`. Unparseable or zero values are
    /// skipped with a warning, as is an allocation ceiling shorter than the
    /// allocation window.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(0) | Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
                    None
                }
                Ok(v) => Some(v),
            }
        };

        let mut config = Self::default();
        let deadlines = &mut config.deadlines;
        if let Some(ms) = read(ENV_ALLOCATION_WINDOW_MS) {
            deadlines.allocation_window = Duration::from_millis(ms);
        }
        if let Some(ms) = read(ENV_ALLOCATION_CEILING_MS) {
            deadlines.allocation_ceiling = Duration::from_millis(ms);
        }
        if let Some(ms) = read(ENV_EXECUTION_WINDOW_MS) {
            deadlines.execution_window = Duration::from_millis(ms);
        }
        if let Some(ms) = read(ENV_RESPONSE_WINDOW_MS) {
            deadlines.response_window = Duration::from_millis(ms);
        }
        if let Some(n) = read(ENV_PROGRESS_BUFFER) {
            config.progress_buffer = usize::try_from(n).unwrap_or(DEFAULT_PROGRESS_BUFFER);
        }

        let deadlines = &mut config.deadlines;
        if deadlines.allocation_ceiling < deadlines.allocation_window {
            let defaults = DeadlineConfig::default();
            tracing::warn!(
                allocation_window_ms = deadlines.allocation_window.as_millis() as u64,
                allocation_ceiling_ms = deadlines.allocation_ceiling.as_millis() as u64,
                "Allocation ceiling shorter than its window, using default allocation deadlines"
            );
            deadlines.allocation_window = defaults.allocation_window;
            deadlines.allocation_ceiling = defaults.allocation_ceiling;
        }
        config
    }

    /// Parse a TOML document such as:
    ///
    /// ```toml
    /// allocation_window_ms = 1000
    /// execution_window_ms = 30000
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(input)?;
        let mut config = Self::default();

        let deadlines = &mut config.deadlines;
        let windows = [
            ("allocation_window_ms", raw.allocation_window_ms, &mut deadlines.allocation_window),
            ("allocation_ceiling_ms", raw.allocation_ceiling_ms, &mut deadlines.allocation_ceiling),
            ("execution_window_ms", raw.execution_window_ms, &mut deadlines.execution_window),
            ("response_window_ms", raw.response_window_ms, &mut deadlines.response_window),
        ];
        for (key, value, slot) in windows {
            match value {
                Some(0) => return Err(invalid(key, "must be greater than zero")),
                Some(ms) => *slot = Duration::from_millis(ms),
                None => {}
            }
        }

        match raw.progress_buffer {
            Some(0) => return Err(invalid("progress_buffer", "must be greater than zero")),
            Some(n) => config.progress_buffer = n,
            None => {}
        }

        if config.deadlines.allocation_ceiling < config.deadlines.allocation_window {
            return Err(invalid(
                "allocation_ceiling_ms",
                "must not be shorter than allocation_window_ms",
            ));
        }
        Ok(config)
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
