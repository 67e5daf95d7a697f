//! ABI store: per-chain address ABIs and merged contract group ABIs
//!
//! Redis layout (see `stream_registry::cache`):
//! - `{prefix}abis:{chain_id}` hash, field = lowercase address
//! - `{prefix}contract-group-abis` hash, field = group name

use crate::abi::{parse_abi, Abi};
use crate::config::AbiDecoderConfig;
use crate::types::{CacheStats, DecoderError};

use async_trait::async_trait;
use lru::LruCache;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

pub type Result<T> = std::result::Result<T, DecoderError>;

/// Keyed ABI storage. No transactional semantics.
#[async_trait]
pub trait AbiStore: Send + Sync {
    async fn address_abi(&self, chain_id: &str, address: &str) -> Result<Option<Abi>>;

    /// ABIs for several addresses on one chain; missing addresses are absent
    /// from the result.
    async fn address_abis(
        &self,
        chain_id: &str,
        addresses: &[String],
    ) -> Result<HashMap<String, Abi>>;

    async fn set_address_abi(&self, chain_id: &str, address: &str, abi: &Abi) -> Result<()>;

    async fn delete_address_abi(&self, chain_id: &str, address: &str) -> Result<()>;

    async fn group_abi(&self, group: &str) -> Result<Option<Abi>>;

    async fn set_group_abi(&self, group: &str, abi: &Abi) -> Result<()>;

    async fn delete_group_abi(&self, group: &str) -> Result<()>;
}

fn address_cache_key(chain_id: &str, address: &str) -> String {
    format!("address:{}:{}", chain_id, address)
}

fn group_cache_key(group: &str) -> String {
    format!("group:{}", group)
}

/// Redis-backed ABI store with an in-memory LRU hot cache
pub struct RedisAbiStore {
    redis: ConnectionManager,
    key_prefix: String,
    hot_cache: Arc<RwLock<LruCache<String, Abi>>>,
    stats: Arc<RwLock<CacheStats>>,
}

impl RedisAbiStore {
    /// Connect using the decoder configuration
    pub async fn new(config: &AbiDecoderConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| DecoderError::ConfigError(e.to_string()))?;

        let client = redis::Client::open(config.redis.url.as_str())?;
        let redis = ConnectionManager::new(client).await?;

        info!(
            "ABI store connected with hot cache size: {}",
            config.hot_cache.max_size
        );
        Self::with_connection(redis, config)
    }

    /// Wrap an existing connection
    pub fn with_connection(redis: ConnectionManager, config: &AbiDecoderConfig) -> Result<Self> {
        let cache_size = NonZeroUsize::new(config.hot_cache.max_size).ok_or_else(|| {
            DecoderError::ConfigError("Hot cache size must be greater than 0".to_string())
        })?;
        Ok(Self {
            redis,
            key_prefix: config.redis.key_prefix.clone(),
            hot_cache: Arc::new(RwLock::new(LruCache::new(cache_size))),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        })
    }

    pub async fn cache_stats(&self) -> CacheStats {
        let mut stats = self.stats.read().await.clone();
        stats.hot_cache_size = self.hot_cache.read().await.len() as u64;
        stats
    }

    async fn hot_get(&self, key: &str) -> Option<Abi> {
        let hit = self.hot_cache.write().await.get(key).cloned();
        if hit.is_some() {
            self.stats.write().await.hot_cache_hits += 1;
        }
        hit
    }

    async fn hot_put(&self, key: String, abi: Abi) {
        self.hot_cache.write().await.put(key, abi);
    }

    async fn hot_remove(&self, key: &str) {
        self.hot_cache.write().await.pop(key);
    }

    async fn record_lookup(&self, found: bool) {
        let mut stats = self.stats.write().await;
        if found {
            stats.store_hits += 1;
        } else {
            stats.misses += 1;
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Abi>> {
        let raw: Option<String> = self.redis.clone().hget(key, field).await?;
        raw.map(|json| parse_abi(&json)).transpose()
    }
}

#[async_trait]
impl AbiStore for RedisAbiStore {
    #[instrument(skip(self))]
    async fn address_abi(&self, chain_id: &str, address: &str) -> Result<Option<Abi>> {
        let address = address.to_lowercase();
        let cache_key = address_cache_key(chain_id, &address);
        if let Some(abi) = self.hot_get(&cache_key).await {
            debug!("ABI cache hit (hot): {}", address);
            return Ok(Some(abi));
        }

        let key = stream_registry::address_abis_key(&self.key_prefix, chain_id);
        let abi = self.hash_get(&key, &address).await?;
        self.record_lookup(abi.is_some()).await;
        if let Some(abi) = &abi {
            self.hot_put(cache_key, abi.clone()).await;
        }
        Ok(abi)
    }

    #[instrument(skip(self, addresses), fields(count = addresses.len()))]
    async fn address_abis(
        &self,
        chain_id: &str,
        addresses: &[String],
    ) -> Result<HashMap<String, Abi>> {
        let mut found = HashMap::new();
        let mut misses = Vec::new();
        for address in addresses {
            let address = address.to_lowercase();
            match self.hot_get(&address_cache_key(chain_id, &address)).await {
                Some(abi) => {
                    found.insert(address, abi);
                }
                None => misses.push(address),
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }

        let key = stream_registry::address_abis_key(&self.key_prefix, chain_id);
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&key)
            .arg(&misses)
            .query_async(&mut self.redis.clone())
            .await?;

        for (address, raw) in misses.into_iter().zip(values) {
            let Some(raw) = raw else {
                self.record_lookup(false).await;
                continue;
            };
            match parse_abi(&raw) {
                Ok(abi) => {
                    self.record_lookup(true).await;
                    self.hot_put(address_cache_key(chain_id, &address), abi.clone())
                        .await;
                    found.insert(address, abi);
                }
                Err(e) => warn!("Skipping unreadable ABI for {}: {}", address, e),
            }
        }
        Ok(found)
    }

    async fn set_address_abi(&self, chain_id: &str, address: &str, abi: &Abi) -> Result<()> {
        let address = address.to_lowercase();
        let key = stream_registry::address_abis_key(&self.key_prefix, chain_id);
        let json = serde_json::to_string(abi)?;
        let _: () = self.redis.clone().hset(&key, &address, json).await?;
        self.hot_put(address_cache_key(chain_id, &address), abi.clone())
            .await;
        Ok(())
    }

    async fn delete_address_abi(&self, chain_id: &str, address: &str) -> Result<()> {
        let address = address.to_lowercase();
        let key = stream_registry::address_abis_key(&self.key_prefix, chain_id);
        let _: () = self.redis.clone().hdel(&key, &address).await?;
        self.hot_remove(&address_cache_key(chain_id, &address)).await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn group_abi(&self, group: &str) -> Result<Option<Abi>> {
        let cache_key = group_cache_key(group);
        if let Some(abi) = self.hot_get(&cache_key).await {
            return Ok(Some(abi));
        }
        let key = stream_registry::group_abis_key(&self.key_prefix);
        let abi = self.hash_get(&key, group).await?;
        self.record_lookup(abi.is_some()).await;
        if let Some(abi) = &abi {
            self.hot_put(cache_key, abi.clone()).await;
        }
        Ok(abi)
    }

    async fn set_group_abi(&self, group: &str, abi: &Abi) -> Result<()> {
        let key = stream_registry::group_abis_key(&self.key_prefix);
        let json = serde_json::to_string(abi)?;
        let _: () = self.redis.clone().hset(&key, group, json).await?;
        self.hot_put(group_cache_key(group), abi.clone()).await;
        Ok(())
    }

    async fn delete_group_abi(&self, group: &str) -> Result<()> {
        let key = stream_registry::group_abis_key(&self.key_prefix);
        let _: () = self.redis.clone().hdel(&key, group).await?;
        self.hot_remove(&group_cache_key(group)).await;
        Ok(())
    }
}

/// In-memory ABI store for local runs and tests
#[derive(Default)]
pub struct MemoryAbiStore {
    addresses: RwLock<HashMap<(String, String), Abi>>,
    groups: RwLock<HashMap<String, Abi>>,
}

impl MemoryAbiStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AbiStore for MemoryAbiStore {
    async fn address_abi(&self, chain_id: &str, address: &str) -> Result<Option<Abi>> {
        let key = (chain_id.to_string(), address.to_lowercase());
        Ok(self.addresses.read().await.get(&key).cloned())
    }

    async fn address_abis(
        &self,
        chain_id: &str,
        addresses: &[String],
    ) -> Result<HashMap<String, Abi>> {
        let stored = self.addresses.read().await;
        Ok(addresses
            .iter()
            .map(|a| a.to_lowercase())
            .filter_map(|address| {
                stored
                    .get(&(chain_id.to_string(), address.clone()))
                    .map(|abi| (address, abi.clone()))
            })
            .collect())
    }

    async fn set_address_abi(&self, chain_id: &str, address: &str, abi: &Abi) -> Result<()> {
        self.addresses
            .write()
            .await
            .insert((chain_id.to_string(), address.to_lowercase()), abi.clone());
        Ok(())
    }

    async fn delete_address_abi(&self, chain_id: &str, address: &str) -> Result<()> {
        self.addresses
            .write()
            .await
            .remove(&(chain_id.to_string(), address.to_lowercase()));
        Ok(())
    }

    async fn group_abi(&self, group: &str) -> Result<Option<Abi>> {
        Ok(self.groups.read().await.get(group).cloned())
    }

    async fn set_group_abi(&self, group: &str, abi: &Abi) -> Result<()> {
        self.groups
            .write()
            .await
            .insert(group.to_string(), abi.clone());
        Ok(())
    }

    async fn delete_group_abi(&self, group: &str) -> Result<()> {
        self.groups.write().await.remove(group);
        Ok(())
    }
}
