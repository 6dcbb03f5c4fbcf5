//! # Config
//!
//! Tunables for the buffer pool, the cache-table eviction floor and the
//! hierarchical integrity storage.
//!
//! Every value has a built-in default and can be overridden through an
//! environment variable:
//!
//! ```text
//! VERICACHE_POOL_KB            buffer pool size in KiB        (default: 4096)
//! VERICACHE_BLOCK_SIZE         buddy block size in bytes      (default: 16384)
//! VERICACHE_MAX_CACHE_COUNT    cache-handle table capacity    (default: 1024)
//! VERICACHE_FLOOR_DIVISOR      floor count = capacity / N     (default: 16)
//! VERICACHE_FLOOR_UNIT         floor bytes = count * N        (default: 256)
//! VERICACHE_READ_CONCURRENCY   verified reads in flight       (default: 5)
//! VERICACHE_WRITE_CONCURRENCY  verified writes in flight      (default: 5)
//! VERICACHE_ACCESS_TIMEOUT_MS  timed acquire before flushing  (default: 10)
//! ```
//!
//! Unparseable values fall back to the default.

use std::str::FromStr;
use std::time::Duration;

/// Sizing of the memory region managed by a `BufferManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Total bytes in the pool.
    pub pool_size: usize,
    /// Smallest allocation unit of the buddy heap.
    pub block_size: usize,
    /// Capacity of the cache-handle table.
    pub max_cache_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4 * 1024 * 1024,
            block_size: 0x4000,
            max_cache_count: 1024,
        }
    }
}

/// Per-attribute minimum share protected from eviction.
///
/// A level keeps at least `max_cache_count / count_min_divisor` entries and
/// `that count * size_min_unit` bytes before it becomes an eviction victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFloorConfig {
    pub count_min_divisor: usize,
    pub size_min_unit: usize,
}

impl Default for CacheFloorConfig {
    fn default() -> Self {
        Self {
            count_min_divisor: 16,
            size_min_unit: 0x100,
        }
    }
}

impl CacheFloorConfig {
    /// Minimum entry count protected per attribute level.
    #[must_use]
    pub fn count_min(&self, max_cache_count: usize) -> usize {
        max_cache_count / self.count_min_divisor.max(1)
    }

    /// Minimum cached bytes protected per attribute level.
    #[must_use]
    pub fn size_min(&self, max_cache_count: usize) -> usize {
        self.count_min(max_cache_count) * self.size_min_unit
    }
}

/// Cache entry budget for one block-cache layer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCounts {
    pub data: usize,
    pub hash: usize,
}

/// Settings for hierarchical integrity verification storages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityConfig {
    pub read_concurrency: usize,
    pub write_concurrency: usize,
    pub access_timeout: Duration,
    pub save_data_cache: CacheCounts,
    pub rom_cache: CacheCounts,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            read_concurrency: 5,
            write_concurrency: 5,
            access_timeout: Duration::from_millis(10),
            save_data_cache: CacheCounts { data: 32, hash: 4 },
            rom_cache: CacheCounts { data: 24, hash: 8 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config {
    pub pool: PoolConfig,
    pub cache_floor: CacheFloorConfig,
    pub integrity: IntegrityConfig,
}

impl Config {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env_or = |key: &str, default: usize| -> usize { parse_or(&lookup, key, default) };

        let pool_kb = env_or("VERICACHE_POOL_KB", defaults.pool.pool_size / 1024);
        let timeout_ms = env_or(
            "VERICACHE_ACCESS_TIMEOUT_MS",
            defaults.integrity.access_timeout.as_millis() as usize,
        );

        let config = Self {
            pool: PoolConfig {
                pool_size: pool_kb * 1024,
                block_size: env_or("VERICACHE_BLOCK_SIZE", defaults.pool.block_size),
                max_cache_count: env_or("VERICACHE_MAX_CACHE_COUNT", defaults.pool.max_cache_count),
            },
            cache_floor: CacheFloorConfig {
                count_min_divisor: env_or(
                    "VERICACHE_FLOOR_DIVISOR",
                    defaults.cache_floor.count_min_divisor,
                ),
                size_min_unit: env_or("VERICACHE_FLOOR_UNIT", defaults.cache_floor.size_min_unit),
            },
            integrity: IntegrityConfig {
                read_concurrency: env_or(
                    "VERICACHE_READ_CONCURRENCY",
                    defaults.integrity.read_concurrency,
                ),
                write_concurrency: env_or(
                    "VERICACHE_WRITE_CONCURRENCY",
                    defaults.integrity.write_concurrency,
                ),
                access_timeout: Duration::from_millis(timeout_ms as u64),
                ..defaults.integrity
            },
        };
        tracing::debug!(?config, "configuration loaded");
        config
    }
}

/// Parses `key` through `lookup`, falling back to `default`.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
        assert_eq!(config.cache_floor.count_min(1024), 64);
        assert_eq!(config.cache_floor.size_min(1024), 64 * 0x100);
        assert_eq!(config.integrity.access_timeout, Duration::from_millis(10));
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup_from(&[
            ("VERICACHE_POOL_KB", "64"),
            ("VERICACHE_FLOOR_DIVISOR", "8"),
            ("VERICACHE_READ_CONCURRENCY", "2"),
            ("VERICACHE_ACCESS_TIMEOUT_MS", "1"),
        ]));
        assert_eq!(config.pool.pool_size, 64 * 1024);
        assert_eq!(config.cache_floor.count_min(64), 8);
        assert_eq!(config.integrity.read_concurrency, 2);
        assert_eq!(config.integrity.write_concurrency, 5);
        assert_eq!(config.integrity.access_timeout, Duration::from_millis(1));
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let config = Config::from_lookup(lookup_from(&[("VERICACHE_BLOCK_SIZE", "lots")]));
        assert_eq!(config.pool.block_size, PoolConfig::default().block_size);
    }

    #[test]
    fn zero_divisor_does_not_divide_by_zero() {
        let floor = CacheFloorConfig {
            count_min_divisor: 0,
            size_min_unit: 0x100,
        };
        assert_eq!(floor.count_min(16), 16);
    }
}
