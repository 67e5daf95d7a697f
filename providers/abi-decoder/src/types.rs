//! Shared types for the ABI decoder

use serde::{Deserialize, Serialize};

/// ABI store cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently held in the hot cache
    pub hot_cache_size: u64,
    /// Lookups answered by the hot cache
    pub hot_cache_hits: u64,
    /// Lookups answered by the backing store
    pub store_hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
}

impl CacheStats {
    /// Hot cache hit rate (0.0 to 1.0)
    pub fn hot_cache_hit_rate(&self) -> f64 {
        let total = self.hot_cache_hits + self.store_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hot_cache_hits as f64 / total as f64
        }
    }
}

/// ABI decoder error types
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("ABI parse error: {0}")]
    AbiParseError(String),

    #[error("Input decode error: {0}")]
    InputDecodeError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<redis::RedisError> for DecoderError {
    fn from(err: redis::RedisError) -> Self {
        DecoderError::CacheError(format!("Redis error: {}", err))
    }
}

impl From<serde_json::Error> for DecoderError {
    fn from(err: serde_json::Error) -> Self {
        DecoderError::AbiParseError(err.to_string())
    }
}
