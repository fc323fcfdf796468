//! Allocator construction parameters.
//!
//! Every field has a default. Overrides can come from builder-style
//! `with_*` calls or from `POOLMALLOC_*` environment variables:
//! - `POOLMALLOC_MAX_TOTAL_MEMORY`: soft ceiling in bytes.
//! - `POOLMALLOC_THREAD_CACHE`: `on`/`off` (also `true`/`false`/`1`/`0`).
//! - `POOLMALLOC_ALIGNMENT`: block alignment, a power of two.
//! - `POOLMALLOC_SIZE_CLASSES`: comma-separated ascending class sizes.
//! - `POOLMALLOC_CACHE_CAPACITY`: blocks per class per thread cache.
//! - `POOLMALLOC_CLEANUP_INTERVAL_MS` / `POOLMALLOC_IDLE_TIMEOUT_MS`.
//! - `POOLMALLOC_PRESSURE_FREE_LIST_CAP`: free-list cap under memory pressure.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_SIZE_CLASSES: [usize; 8] = [8, 16, 32, 64, 128, 256, 512, 1024];
pub const DEFAULT_MAX_TOTAL_MEMORY: usize = 1024 * 1024 * 1024;
pub const DEFAULT_ALIGNMENT: usize = 8;
pub const DEFAULT_THREAD_CACHE_CAPACITY: usize = 16;
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_PRESSURE_FREE_LIST_CAP: usize = 64;

/// Configuration for an [`crate::Allocator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Soft memory ceiling. Exceeding it never fails an allocation; it only
    /// makes the pressure maintenance step trim free lists.
    pub max_total_memory: usize,
    /// Route small requests through per-thread caches.
    pub enable_thread_cache: bool,
    /// Alignment of every returned block. Must be a power of two.
    pub alignment: usize,
    /// Ascending class sizes. Each is rounded up to `alignment` at build time.
    pub size_classes: Vec<usize>,
    pub thread_cache_capacity: usize,
    pub cleanup_interval: Duration,
    /// Free blocks idle for longer than this are returned to the platform.
    pub idle_timeout: Duration,
    pub pressure_free_list_cap: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_total_memory: DEFAULT_MAX_TOTAL_MEMORY,
            enable_thread_cache: true,
            alignment: DEFAULT_ALIGNMENT,
            size_classes: DEFAULT_SIZE_CLASSES.to_vec(),
            thread_cache_capacity: DEFAULT_THREAD_CACHE_CAPACITY,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            pressure_free_list_cap: DEFAULT_PRESSURE_FREE_LIST_CAP,
        }
    }
}

impl AllocatorConfig {
    #[must_use]
    pub fn with_max_total_memory(mut self, bytes: usize) -> Self {
        self.max_total_memory = bytes;
        self
    }

    #[must_use]
    pub fn with_thread_cache(mut self, enabled: bool) -> Self {
        self.enable_thread_cache = enabled;
        self
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub fn with_size_classes(mut self, classes: impl Into<Vec<usize>>) -> Self {
        self.size_classes = classes.into();
        self
    }

    #[must_use]
    pub fn with_thread_cache_capacity(mut self, capacity: usize) -> Self {
        self.thread_cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pressure_free_list_cap(mut self, cap: usize) -> Self {
        self.pressure_free_list_cap = cap;
        self
    }

    /// Checks the invariants the allocator relies on.
    ///
    /// Class sizes are checked as given; rounding to the alignment happens
    /// later and may merge adjacent classes, which is rejected there.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.alignment.is_power_of_two() {
            return Err(ConfigError::AlignmentNotPowerOfTwo(self.alignment));
        }
        if self.size_classes.is_empty() {
            return Err(ConfigError::NoSizeClasses);
        }
        for (index, &size) in self.size_classes.iter().enumerate() {
            if size == 0 {
                return Err(ConfigError::ZeroSizeClass { index });
            }
        }
        for pair in self.size_classes.windows(2) {
            if pair[1] <= pair[0] {
                return Err(ConfigError::NotAscending {
                    previous: pair[0],
                    next: pair[1],
                });
            }
        }
        if self.thread_cache_capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroCleanupInterval);
        }
        Ok(())
    }

    /// Defaults overlaid with `POOLMALLOC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values produced by `lookup`.
    ///
    /// Unset keys keep their defaults. Set but unparsable keys are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("POOLMALLOC_MAX_TOTAL_MEMORY") {
            config.max_total_memory = parse_usize("POOLMALLOC_MAX_TOTAL_MEMORY", &v)?;
        }
        if let Some(v) = lookup("POOLMALLOC_THREAD_CACHE") {
            config.enable_thread_cache = parse_switch("POOLMALLOC_THREAD_CACHE", &v)?;
        }
        if let Some(v) = lookup("POOLMALLOC_ALIGNMENT") {
            config.alignment = parse_usize("POOLMALLOC_ALIGNMENT", &v)?;
        }
        if let Some(v) = lookup("POOLMALLOC_SIZE_CLASSES") {
            config.size_classes = v
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| parse_usize("POOLMALLOC_SIZE_CLASSES", part))
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = lookup("POOLMALLOC_CACHE_CAPACITY") {
            config.thread_cache_capacity = parse_usize("POOLMALLOC_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("POOLMALLOC_CLEANUP_INTERVAL_MS") {
            let ms = parse_usize("POOLMALLOC_CLEANUP_INTERVAL_MS", &v)?;
            config.cleanup_interval = Duration::from_millis(ms as u64);
        }
        if let Some(v) = lookup("POOLMALLOC_IDLE_TIMEOUT_MS") {
            let ms = parse_usize("POOLMALLOC_IDLE_TIMEOUT_MS", &v)?;
            config.idle_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(v) = lookup("POOLMALLOC_PRESSURE_FREE_LIST_CAP") {
            config.pressure_free_list_cap = parse_usize("POOLMALLOC_PRESSURE_FREE_LIST_CAP", &v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_usize(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            key,
            value: value.to_string(),
        })
}

fn parse_switch(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" | "enabled" => Ok(true),
        "off" | "false" | "0" | "no" | "disabled" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            key,
            value: value.to_string(),
        }),
    }
}
