//! Runtime configuration of a [`Database`](crate::Database).

use std::str::FromStr;
use strata_core::{ConfigError, Error, IsolationLevel, Result};

/// Environment variable overriding [`Config::max_retries`].
pub const ENV_MAX_RETRIES: &str = "STRATA_MAX_RETRIES";
/// Environment variable overriding [`Config::prefetch`].
pub const ENV_PREFETCH: &str = "STRATA_PREFETCH";
/// Environment variable overriding [`Config::patch_cache_on_write`].
pub const ENV_PATCH_CACHE: &str = "STRATA_PATCH_CACHE";

/// How units of work run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Times a unit of work is re-run after a serialization conflict
    pub max_retries: u32,
    /// Warm the cache for every record of the originating query when one
    /// record is loaded
    pub prefetch: bool,
    pub isolation: IsolationLevel,
    /// Patch the cache with written values instead of invalidating it
    pub patch_cache_on_write: bool,
    /// Apply record rules to every user but the superuser
    pub strict_rules: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 5,
            prefetch: true,
            isolation: IsolationLevel::Serializable,
            patch_cache_on_write: false,
            strict_rules: true,
        }
    }
}

impl Config {
    /// Defaults, overridden by the `STRATA_*` environment variables that
    /// are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            config.max_retries = parse(ENV_MAX_RETRIES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PREFETCH) {
            config.prefetch = parse_flag(ENV_PREFETCH, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PATCH_CACHE) {
            config.patch_cache_on_write = parse_flag(ENV_PATCH_CACHE, &raw)?;
        }
        Ok(config)
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn prefetch(mut self, enabled: bool) -> Self {
        self.prefetch = enabled;
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn patch_cache_on_write(mut self, enabled: bool) -> Self {
        self.patch_cache_on_write = enabled;
        self
    }

    pub fn strict_rules(mut self, enabled: bool) -> Self {
        self.strict_rules = enabled;
        self
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim().parse().map_err(|e| {
        Error::Config(ConfigError {
            message: format!("invalid value {:?} for {}", raw, key),
            source: Some(Box::new(e)),
        })
    })
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(ConfigError {
            message: format!("invalid value {:?} for {}, expected a boolean", raw, key),
            source: None,
        })),
    }
}
