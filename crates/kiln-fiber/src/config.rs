use thiserror::Error;

/// Tuning knobs for a [`crate::BlockCache`] and the execution contexts that run against it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FiberConfig {
    /// Number of address-hash buckets a fresh cache starts with. The table doubles whenever the
    /// live-block count reaches twice its size.
    pub initial_hash_size: usize,
    /// Number of page buckets used to find the blocks covering a page on invalidation. Fixed for
    /// the lifetime of the cache.
    pub page_buckets: usize,

    /// Entries in each execution context's direct-mapped block cache.
    pub frame_cache_size: usize,

    /// Block entries between synthesized timer interrupts.
    pub timer_interval: u64,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            initial_hash_size: 1 << 10,
            page_buckets: 1 << 10,
            frame_cache_size: 1 << 10,
            timer_interval: 1 << 10,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("{field} must be a non-zero power of two (got {value})")]
    NotPowerOfTwo { field: &'static str, value: u64 },
}

impl FiberConfig {
    pub const HASH_SIZE_ENV: &'static str = "KILN_HASH_SIZE";
    pub const PAGE_BUCKETS_ENV: &'static str = "KILN_PAGE_BUCKETS";
    pub const FRAME_CACHE_SIZE_ENV: &'static str = "KILN_FRAME_CACHE_SIZE";
    pub const TIMER_INTERVAL_ENV: &'static str = "KILN_TIMER_INTERVAL";

    /// Defaults overlaid with any `KILN_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`FiberConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let cfg = Self {
            initial_hash_size: parse_var(&lookup, Self::HASH_SIZE_ENV)?
                .unwrap_or(defaults.initial_hash_size),
            page_buckets: parse_var(&lookup, Self::PAGE_BUCKETS_ENV)?
                .unwrap_or(defaults.page_buckets),
            frame_cache_size: parse_var(&lookup, Self::FRAME_CACHE_SIZE_ENV)?
                .unwrap_or(defaults.frame_cache_size),
            timer_interval: parse_var(&lookup, Self::TIMER_INTERVAL_ENV)?
                .unwrap_or(defaults.timer_interval),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("initial_hash_size", self.initial_hash_size as u64),
            ("page_buckets", self.page_buckets as u64),
            ("frame_cache_size", self.frame_cache_size as u64),
            ("timer_interval", self.timer_interval),
        ];
        for (field, value) in fields {
            if !value.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { field, value });
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            value: raw.to_owned(),
        })
}
