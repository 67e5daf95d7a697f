//! Storage seams over the per-chain tables

use crate::bulk_writer::DecodedBatch;
use crate::cursors::{CallFilter, LogFilter};
use crate::error::Result;
use crate::interactions::{InteractionQuery, Interactions};

use abi_decoder_provider::{LogRecord, TraceRecord, TransactionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts < self.end
    }
}

/// Read access to one or more chains' transactions, traces and logs
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Database clock, used for batch timestamps
    async fn db_now(&self) -> Result<DateTime<Utc>>;

    async fn find_interactions(&self, chain_id: &str, query: &InteractionQuery) -> Result<Interactions>;

    async fn transactions_by_hash(&self, chain_id: &str, hashes: &[String]) -> Result<Vec<TransactionRecord>>;

    /// Lowest block with a log of `topic0` emitted by any of `addresses`
    async fn earliest_log_block(&self, chain_id: &str, addresses: &[String], topic0: &str) -> Result<Option<i64>>;

    async fn earliest_log_timestamp(
        &self,
        chain_id: &str,
        filters: &[LogFilter],
        from_block: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn earliest_trace_timestamp(
        &self,
        chain_id: &str,
        filters: &[CallFilter],
        from_block: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn logs_in_window(&self, chain_id: &str, filters: &[LogFilter], window: TimeWindow) -> Result<Vec<LogRecord>>;

    async fn traces_in_window(
        &self,
        chain_id: &str,
        filters: &[CallFilter],
        window: TimeWindow,
    ) -> Result<Vec<TraceRecord>>;
}

/// Write side used by the bulk writer: one atomic decode update per call
#[async_trait]
pub trait DecodedSink: Send + Sync {
    async fn apply_decoded(&self, chain_id: &str, batch: &DecodedBatch) -> Result<()>;
}
