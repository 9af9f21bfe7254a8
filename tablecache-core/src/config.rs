//! Configuration types

use crate::{CacheResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How an oversized cache makes room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Drop everything.
    Forget,
    /// Keep the most recently accessed objects.
    #[default]
    Lru,
    /// Keep the most frequently accessed objects.
    Lfu,
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvictionStrategy::Forget => "forget",
            EvictionStrategy::Lru => "lru",
            EvictionStrategy::Lfu => "lfu",
        };
        f.write_str(name)
    }
}

impl FromStr for EvictionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "forget" => Ok(EvictionStrategy::Forget),
            "lru" => Ok(EvictionStrategy::Lru),
            "lfu" => Ok(EvictionStrategy::Lfu),
            other => Err(ConfigError::InvalidValue {
                field: "strategy".to_string(),
                value: other.to_string(),
                reason: "expected one of forget, lru, lfu".to_string(),
            }),
        }
    }
}

/// Per-cache settings.
///
/// The registry hands a copy of its default config to every cache it
/// creates; each cache can then be tuned individually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the cache is used at all. A disabled cache passes every
    /// request straight through to storage.
    pub enabled: bool,
    /// Maximum number of cached objects; 0 means unlimited.
    pub max_size: usize,
    pub strategy: EvictionStrategy,
    /// Percentage of `max_size` retained by an eviction pass (0-100).
    pub keep_quota: u32,
    /// How often a call is retried after a unique violation or key change
    /// forced the cache to be invalidated.
    pub max_conflict_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 0,
            strategy: EvictionStrategy::Lru,
            keep_quota: 50,
            max_conflict_retries: 2,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_keep_quota(mut self, keep_quota: u32) -> Self {
        self.keep_quota = keep_quota;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - keep_quota in [0, 100]
    pub fn validate(&self) -> CacheResult<()> {
        validate_keep_quota(self.keep_quota)?;
        Ok(())
    }

    /// Create CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `TABLECACHE_ENABLED`: "true" or "false" (default: true)
    /// - `TABLECACHE_MAX_SIZE`: Maximum cached objects, 0 = unlimited (default: 0)
    /// - `TABLECACHE_STRATEGY`: "forget", "lru" or "lfu" (default: lru)
    /// - `TABLECACHE_KEEP_QUOTA`: Percentage kept on eviction (default: 50)
    /// - `TABLECACHE_MAX_CONFLICT_RETRIES`: Retries after a conflict (default: 2)
    ///
    /// Unparseable values fall back to their defaults; the result is
    /// validated before it is returned.
    pub fn from_env() -> CacheResult<Self> {
        let defaults = Self::default();

        let enabled = std::env::var("TABLECACHE_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(defaults.enabled);

        let max_size = std::env::var("TABLECACHE_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_size);

        let strategy = match std::env::var("TABLECACHE_STRATEGY") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.strategy,
        };

        let keep_quota = std::env::var("TABLECACHE_KEEP_QUOTA")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.keep_quota);

        let max_conflict_retries = std::env::var("TABLECACHE_MAX_CONFLICT_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_conflict_retries);

        let config = Self {
            enabled,
            max_size,
            strategy,
            keep_quota,
            max_conflict_retries,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON fragment; missing fields take their defaults.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Malformed {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Reject keep quotas outside of 0-100 percent.
pub fn validate_keep_quota(keep_quota: u32) -> CacheResult<()> {
    if keep_quota > 100 {
        return Err(ConfigError::InvalidValue {
            field: "keep_quota".to_string(),
            value: keep_quota.to_string(),
            reason: "must be a percentage between 0 and 100".to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_size, 0);
        assert_eq!(config.strategy, EvictionStrategy::Lru);
        assert_eq!(config.keep_quota, 50);
        assert_eq!(config.max_conflict_retries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new()
            .with_enabled(false)
            .with_max_size(1000)
            .with_strategy(EvictionStrategy::Lfu)
            .with_keep_quota(75)
            .with_max_conflict_retries(1);

        assert!(!config.enabled);
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.strategy, EvictionStrategy::Lfu);
        assert_eq!(config.keep_quota, 75);
        assert_eq!(config.max_conflict_retries, 1);
    }

    #[test]
    fn test_keep_quota_out_of_range_rejected() {
        let config = CacheConfig::new().with_keep_quota(101);
        assert!(config.validate().is_err());
        assert!(validate_keep_quota(100).is_ok());
        assert!(validate_keep_quota(0).is_ok());
    }

    #[test]
    fn test_strategy_parse_and_display() {
        assert_eq!("LRU".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Lru);
        assert_eq!(" lfu ".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Lfu);
        assert_eq!("forget".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Forget);
        assert!("random".parse::<EvictionStrategy>().is_err());

        for strategy in [EvictionStrategy::Forget, EvictionStrategy::Lru, EvictionStrategy::Lfu] {
            assert_eq!(strategy.to_string().parse::<EvictionStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_from_json_partial() {
        let config = CacheConfig::from_json(r#"{"max_size": 250, "strategy": "lfu"}"#).unwrap();
        assert_eq!(config.max_size, 250);
        assert_eq!(config.strategy, EvictionStrategy::Lfu);
        assert_eq!(config.keep_quota, 50);
        assert!(config.enabled);
    }

    #[test]
    fn test_from_json_rejects_bad_quota() {
        assert!(CacheConfig::from_json(r#"{"keep_quota": 200}"#).is_err());
        assert!(CacheConfig::from_json("not json").is_err());
    }
}
