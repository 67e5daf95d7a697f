//! Settings for the Redis-backed ABI store

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_HOT_CACHE_SIZE: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbiDecoderConfig {
    /// Where group ABIs are persisted
    pub redis: RedisConfig,
    /// In-process LRU in front of Redis
    pub hot_cache: HotCacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace for ABI keys, empty for none
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotCacheConfig {
    /// Parsed ABIs kept in memory
    pub max_size: usize,
}

impl AbiDecoderConfig {
    /// Reads `ABI_DECODER_REDIS_URL`, `ABI_DECODER_REDIS_KEY_PREFIX` and
    /// `ABI_DECODER_HOT_CACHE_SIZE`, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let max_size = env::var("ABI_DECODER_HOT_CACHE_SIZE")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_HOT_CACHE_SIZE);

        let config = Self {
            redis: RedisConfig {
                url: env::var("ABI_DECODER_REDIS_URL")
                    .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
                key_prefix: env::var("ABI_DECODER_REDIS_KEY_PREFIX").unwrap_or_default(),
            },
            hot_cache: HotCacheConfig { max_size },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis.url.is_empty() {
            bail!("ABI store needs a Redis URL");
        }
        if self.hot_cache.max_size == 0 {
            bail!("ABI hot cache must hold at least one entry");
        }
        Ok(())
    }
}

impl Default for AbiDecoderConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig {
                url: DEFAULT_REDIS_URL.to_string(),
                key_prefix: String::new(),
            },
            hot_cache: HotCacheConfig {
                max_size: DEFAULT_HOT_CACHE_SIZE,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AbiDecoderConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = AbiDecoderConfig::default();
        config.hot_cache.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = AbiDecoderConfig::default();
        config.redis.url.clear();
        assert!(config.validate().is_err());
    }
}
