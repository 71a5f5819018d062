//! Configuration for klendathu.
//!
//! Everything is driven by environment variables so that a caller can tune
//! caching behaviour without touching code:
//! - `KLENDATHU_CACHE` - Optional. Directory for transcript cache files.
//!   Defaults to `<project root>/.klendathu/cache`.
//! - `KLENDATHU_CACHE_MODE` - Optional. `normal` (default), `ignore`
//!   (never consult the cache), or `force-use` (cache hits only; a miss
//!   fails the request before any agent work).
//! - `KLENDATHU_TRACE` - Optional. `1` or `true` enables trace logging to
//!   `$HOME/.klendathu/trace.log`.
//! - `KLENDATHU_AGENT_CMD` - Optional. Command for the subprocess agent
//!   adapter. Defaults to `klendathu-agent`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// How the transcript cache participates in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Consult the cache, fall back to the agent on a miss.
    #[default]
    Normal,
    /// Skip the lookup entirely; the agent always runs.
    Ignore,
    /// Require a cached transcript; a miss fails the request.
    ForceUse,
}

impl CacheMode {
    /// Parse a `KLENDATHU_CACHE_MODE` value.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "" | "normal" => Ok(Self::Normal),
            "ignore" => Ok(Self::Ignore),
            "force-use" => Ok(Self::ForceUse),
            other => Err(ConfigError::InvalidValue(
                "KLENDATHU_CACHE_MODE".to_string(),
                other.to_string(),
            )),
        }
    }

    /// Read the mode from the environment, treating unknown values as normal.
    pub fn from_env() -> Self {
        std::env::var("KLENDATHU_CACHE_MODE")
            .ok()
            .and_then(|v| Self::parse(&v).ok())
            .unwrap_or_default()
    }
}

/// Resolved settings for one request.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transcript cache directory.
    pub cache_dir: PathBuf,

    /// Cache participation mode.
    pub cache_mode: CacheMode,

    /// Command for the subprocess agent adapter.
    pub agent_cmd: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let cache_dir = std::env::var("KLENDATHU_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| crate::cache::default_cache_dir());

        let agent_cmd =
            std::env::var("KLENDATHU_AGENT_CMD").unwrap_or_else(|_| "klendathu-agent".to_string());

        Self {
            cache_dir,
            cache_mode: CacheMode::from_env(),
            agent_cmd,
        }
    }
}

/// Whether trace logging is enabled (`KLENDATHU_TRACE=1` or `true`).
pub fn trace_enabled() -> bool {
    std::env::var("KLENDATHU_TRACE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
