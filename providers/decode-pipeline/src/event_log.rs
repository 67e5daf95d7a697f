//! Durable append-only per-name logs
//!
//! Each event or call name has its own log. Appends return a nonce that is
//! monotonic within the log; readers resume from the last nonce they saw.

use crate::error::Result;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Stream field holding the JSON envelope
const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub nonce: String,
    pub payload: String,
}

impl LogEntry {
    /// `id` of the envelope stored in this entry
    pub fn id(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.payload).ok()?;
        value.get("id")?.as_str().map(str::to_string)
    }
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append and return the entry nonce
    async fn append(&self, log: &str, payload: &str) -> Result<String>;

    /// Up to `count` newest entries, newest first
    async fn last_entries(&self, log: &str, count: usize) -> Result<Vec<LogEntry>>;

    /// Entries after each `(log, nonce)` position, oldest first
    async fn entries_after(
        &self,
        positions: &[(String, String)],
        count: usize,
    ) -> Result<Vec<(String, Vec<LogEntry>)>>;
}

/// Redis streams, one per name, trimmed approximately to `max_len`
pub struct RedisEventLog {
    redis: ConnectionManager,
    max_len: usize,
}

impl RedisEventLog {
    pub fn new(redis: ConnectionManager, max_len: usize) -> Self {
        Self { redis, max_len }
    }
}

fn entry(id: &redis::streams::StreamId) -> LogEntry {
    LogEntry {
        nonce: id.id.clone(),
        payload: id.get(PAYLOAD_FIELD).unwrap_or_default(),
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    #[instrument(skip(self, payload))]
    async fn append(&self, log: &str, payload: &str) -> Result<String> {
        let nonce: String = self
            .redis
            .clone()
            .xadd_maxlen(
                log,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[(PAYLOAD_FIELD, payload)],
            )
            .await?;
        debug!("Appended {} to {}", nonce, log);
        Ok(nonce)
    }

    async fn last_entries(&self, log: &str, count: usize) -> Result<Vec<LogEntry>> {
        let reply: StreamRangeReply = self
            .redis
            .clone()
            .xrevrange_count(log, "+", "-", count)
            .await?;
        Ok(reply.ids.iter().map(entry).collect())
    }

    async fn entries_after(
        &self,
        positions: &[(String, String)],
        count: usize,
    ) -> Result<Vec<(String, Vec<LogEntry>)>> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<&str> = positions.iter().map(|(log, _)| log.as_str()).collect();
        let ids: Vec<&str> = positions.iter().map(|(_, nonce)| nonce.as_str()).collect();
        let options = StreamReadOptions::default().count(count);
        let reply: StreamReadReply = self
            .redis
            .clone()
            .xread_options(&keys, &ids, &options)
            .await?;
        Ok(reply
            .keys
            .into_iter()
            .map(|key| {
                let entries = key.ids.iter().map(entry).collect();
                (key.key, entries)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_from_payload() {
        let e = LogEntry {
            nonce: "1-0".to_string(),
            payload: r#"{"id":"abc","name":"erc20.Transfer"}"#.to_string(),
        };
        assert_eq!(e.id().as_deref(), Some("abc"));

        let bad = LogEntry {
            nonce: "2-0".to_string(),
            payload: "not json".to_string(),
        };
        assert_eq!(bad.id(), None);
    }
}
