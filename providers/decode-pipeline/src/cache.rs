//! Pipeline cache: generator cursors and earliest event blocks

use crate::cursors::SerializedCursor;
use crate::error::Result;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

pub type StoredCursors = BTreeMap<String, SerializedCursor>;

#[async_trait]
pub trait PipelineCache: Send + Sync {
    async fn query_cursors(&self, stream_id: &str) -> Result<Option<StoredCursors>>;

    async fn set_query_cursors(&self, stream_id: &str, cursors: &StoredCursors) -> Result<()>;

    async fn delete_query_cursors(&self, stream_id: &str) -> Result<()>;

    async fn event_start_block(&self, chain_id: &str, version: &str) -> Result<Option<i64>>;

    /// Records `block_number` unless a lower block is already cached
    async fn set_event_start_block(&self, chain_id: &str, version: &str, block_number: i64) -> Result<()>;
}

/// Keeps the lower of the cached and given block in one round trip
const SET_MIN_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if (not current) or tonumber(ARGV[2]) < tonumber(current) then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
end
return 0
"#;

pub struct RedisPipelineCache {
    redis: ConnectionManager,
    key_prefix: String,
}

impl RedisPipelineCache {
    pub fn new(redis: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.to_string(),
        }
    }
}

#[async_trait]
impl PipelineCache for RedisPipelineCache {
    async fn query_cursors(&self, stream_id: &str) -> Result<Option<StoredCursors>> {
        let key = stream_registry::cache::query_cursors_key(&self.key_prefix, stream_id);
        let raw: Option<String> = self.redis.clone().get(&key).await?;
        Ok(raw.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    #[instrument(skip(self, cursors), fields(chains = cursors.len()))]
    async fn set_query_cursors(&self, stream_id: &str, cursors: &StoredCursors) -> Result<()> {
        let key = stream_registry::cache::query_cursors_key(&self.key_prefix, stream_id);
        let json = serde_json::to_string(cursors)?;
        let _: () = self.redis.clone().set(&key, json).await?;
        debug!("Stored query cursors for stream {}", stream_id);
        Ok(())
    }

    async fn delete_query_cursors(&self, stream_id: &str) -> Result<()> {
        let key = stream_registry::cache::query_cursors_key(&self.key_prefix, stream_id);
        let _: () = self.redis.clone().del(&key).await?;
        Ok(())
    }

    async fn event_start_block(&self, chain_id: &str, version: &str) -> Result<Option<i64>> {
        let key = stream_registry::cache::event_start_blocks_key(&self.key_prefix, chain_id);
        let block: Option<i64> = self.redis.clone().hget(&key, version).await?;
        Ok(block)
    }

    async fn set_event_start_block(&self, chain_id: &str, version: &str, block_number: i64) -> Result<()> {
        let key = stream_registry::cache::event_start_blocks_key(&self.key_prefix, chain_id);
        let mut conn = self.redis.clone();
        let _: i64 = redis::Script::new(SET_MIN_SCRIPT)
            .key(key)
            .arg(version)
            .arg(block_number)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
