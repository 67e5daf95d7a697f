//! Bulk persistence writer
//!
//! Swaps decoded fields into chain tables in one transaction: rows go into
//! a temp table dropped on commit, then a single `UPDATE ... FROM` joins on
//! the primary key. Rows are never inserted into chain tables, so saving the
//! same batch twice leaves the same state.

use crate::config::BulkWriteConfig;
use crate::error::{PipelineError, Result};
use crate::store::DecodedSink;
use crate::types::ChainTable;

use abi_decoder_provider::{DecodedArg, LogRecord, TraceRecord, TransactionRecord};
use backoff::{backoff::Backoff, ExponentialBackoff};
use sqlx::{Postgres, QueryBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Postgres bind parameter limit per statement
const MAX_BIND_PARAMS: usize = 65_535;

/// Decoded rows of one chain table
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBatch {
    Transactions(Vec<TransactionRecord>),
    Traces(Vec<TraceRecord>),
    Logs(Vec<LogRecord>),
}

impl DecodedBatch {
    pub fn table(&self) -> ChainTable {
        match self {
            DecodedBatch::Transactions(_) => ChainTable::Transactions,
            DecodedBatch::Traces(_) => ChainTable::Traces,
            DecodedBatch::Logs(_) => ChainTable::Logs,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DecodedBatch::Transactions(rows) => rows.len(),
            DecodedBatch::Traces(rows) => rows.len(),
            DecodedBatch::Logs(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column values in `columns(self.table())` order
    pub fn rows(&self) -> Result<Vec<Vec<SqlValue>>> {
        match self {
            DecodedBatch::Transactions(rows) => rows
                .iter()
                .map(|tx| {
                    Ok(vec![
                        SqlValue::Text(Some(tx.hash.clone())),
                        SqlValue::Text(tx.function_name.clone()),
                        SqlValue::Json(json_text(&tx.function_args)?),
                    ])
                })
                .collect(),
            DecodedBatch::Traces(rows) => rows
                .iter()
                .map(|trace| {
                    Ok(vec![
                        SqlValue::Text(Some(trace.id.clone())),
                        SqlValue::Text(trace.function_name.clone()),
                        SqlValue::Json(json_text(&trace.function_args)?),
                        SqlValue::Json(json_text(&trace.function_outputs)?),
                    ])
                })
                .collect(),
            DecodedBatch::Logs(rows) => rows
                .iter()
                .map(|log| {
                    Ok(vec![
                        SqlValue::Text(Some(log.transaction_hash.clone())),
                        SqlValue::Int(log.log_index),
                        SqlValue::Text(log.event_name.clone()),
                        SqlValue::Json(json_text(&log.event_args)?),
                    ])
                })
                .collect(),
        }
    }
}

fn json_text(args: &Option<Vec<DecodedArg>>) -> Result<Option<String>> {
    Ok(args.as_ref().map(serde_json::to_string).transpose()?)
}

/// One temp table column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub key: bool,
}

const fn key(name: &'static str, sql_type: &'static str) -> Column {
    Column { name, sql_type, key: true }
}

const fn value(name: &'static str, sql_type: &'static str) -> Column {
    Column { name, sql_type, key: false }
}

const TRANSACTION_COLUMNS: &[Column] = &[
    key("hash", "text"),
    value("function_name", "text"),
    value("function_args", "json"),
];

const TRACE_COLUMNS: &[Column] = &[
    key("id", "text"),
    value("function_name", "text"),
    value("function_args", "json"),
    value("function_outputs", "json"),
];

const LOG_COLUMNS: &[Column] = &[
    key("transaction_hash", "text"),
    key("log_index", "int8"),
    value("event_name", "text"),
    value("event_args", "json"),
];

pub fn columns(table: ChainTable) -> &'static [Column] {
    match table {
        ChainTable::Transactions => TRANSACTION_COLUMNS,
        ChainTable::Traces => TRACE_COLUMNS,
        ChainTable::Logs => LOG_COLUMNS,
    }
}

/// A bind value for the temp table
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    Int(i64),
    /// JSON text, cast server side
    Json(Option<String>),
}

/// Statements of one bulk update
#[derive(Debug, Clone)]
pub struct BulkUpdatePlan {
    pub schema: String,
    pub table: ChainTable,
    pub temp_table: String,
}

impl BulkUpdatePlan {
    pub fn new(schema: &str, table: ChainTable) -> Self {
        Self {
            schema: schema.to_string(),
            table,
            temp_table: format!("tmp_decode_{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn create_table_sql(&self) -> String {
        let defs: Vec<String> = columns(self.table)
            .iter()
            .map(|c| format!("{} {}", c.name, c.sql_type))
            .collect();
        format!(
            "CREATE TEMP TABLE {} ({}) ON COMMIT DROP",
            self.temp_table,
            defs.join(", ")
        )
    }

    /// Rows per insert so one statement stays under the bind limit
    pub fn chunk_size(&self) -> usize {
        MAX_BIND_PARAMS / columns(self.table).len()
    }

    pub fn insert_statements(&self, rows: &[Vec<SqlValue>]) -> Vec<QueryBuilder<'static, Postgres>> {
        let names: Vec<&str> = columns(self.table).iter().map(|c| c.name).collect();
        rows.chunks(self.chunk_size())
            .map(|chunk| {
                let mut qb = QueryBuilder::new(format!(
                    "INSERT INTO {} ({}) ",
                    self.temp_table,
                    names.join(", ")
                ));
                qb.push_values(chunk.iter(), |mut b, row| {
                    for value in row {
                        match value {
                            SqlValue::Text(text) => {
                                b.push_bind(text.clone());
                            }
                            SqlValue::Int(int) => {
                                b.push_bind(*int);
                            }
                            SqlValue::Json(json) => {
                                b.push_bind(json.clone());
                                b.push_unseparated("::json");
                            }
                        }
                    }
                });
                qb
            })
            .collect()
    }

    pub fn update_sql(&self) -> String {
        let cols = columns(self.table);
        let sets: Vec<String> = cols
            .iter()
            .filter(|c| !c.key)
            .map(|c| format!("{} = s.{}", c.name, c.name))
            .collect();
        let joins: Vec<String> = cols
            .iter()
            .filter(|c| c.key)
            .map(|c| format!("t.{} = s.{}", c.name, c.name))
            .collect();
        format!(
            "UPDATE {}.{} AS t SET {} FROM {} AS s WHERE {}",
            self.schema,
            self.table.table_name(),
            sets.join(", "),
            self.temp_table,
            joins.join(" AND ")
        )
    }
}

/// What to do with a failure that is not retried away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Propagate,
    LogOnly,
}

pub struct BulkWriter {
    sink: Arc<dyn DecodedSink>,
    config: BulkWriteConfig,
}

impl BulkWriter {
    pub fn new(sink: Arc<dyn DecodedSink>, config: BulkWriteConfig) -> Self {
        Self { sink, config }
    }

    /// Persist decoded fields of `batch`, retrying deadlocks
    #[instrument(skip(self, batch), fields(table = ?batch.table(), rows = batch.len()))]
    pub async fn bulk_save(&self, chain_id: &str, batch: &DecodedBatch, policy: FailurePolicy) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        match self.save_with_retry(chain_id, batch).await {
            Ok(()) => Ok(()),
            Err(e) => match policy {
                FailurePolicy::Propagate => Err(e),
                FailurePolicy::LogOnly => {
                    error!(
                        "Bulk save of {} {} rows on chain {} failed: {}",
                        batch.len(),
                        batch.table().table_name(),
                        chain_id,
                        e
                    );
                    Ok(())
                }
            },
        }
    }

    fn exponential_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.min_delay_ms),
            max_interval: Duration::from_millis(self.config.max_delay_ms),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    async fn save_with_retry(&self, chain_id: &str, batch: &DecodedBatch) -> Result<()> {
        let mut backoff = self.exponential_backoff();
        let mut attempt = 1;

        loop {
            match self.sink.apply_decoded(chain_id, batch).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!("Bulk save succeeded on attempt {}", attempt);
                    }
                    return Ok(());
                }
                Err(e) if e.is_deadlock() => {
                    if attempt >= self.config.max_attempts {
                        return Err(PipelineError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.config.max_delay_ms));
                    warn!(
                        "Deadlock on attempt {}/{}, retrying in {:?}",
                        attempt, self.config.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        deadlocks: u32,
        calls: AtomicU32,
        message: &'static str,
    }

    #[async_trait]
    impl DecodedSink for FlakySink {
        async fn apply_decoded(&self, _chain_id: &str, _batch: &DecodedBatch) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.deadlocks {
                Err(PipelineError::Query(self.message.to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn fast_config(max_attempts: u32) -> BulkWriteConfig {
        BulkWriteConfig {
            max_attempts,
            min_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    fn one_log() -> DecodedBatch {
        DecodedBatch::Logs(vec![LogRecord {
            transaction_hash: "0xt".to_string(),
            log_index: 4,
            transaction_index: 0,
            address: "0xa".to_string(),
            topic0: None,
            topic1: None,
            topic2: None,
            topic3: None,
            data: None,
            block_number: 1,
            block_hash: String::new(),
            block_timestamp: Utc::now(),
            event_name: Some("Transfer".to_string()),
            event_args: Some(vec![DecodedArg::new("value", "uint256", serde_json::json!(1))]),
        }])
    }

    #[test]
    fn test_plan_sql() {
        let plan = BulkUpdatePlan::new("ethereum", ChainTable::Logs);
        assert!(plan.temp_table.starts_with("tmp_decode_"));
        assert_eq!(
            plan.create_table_sql(),
            format!(
                "CREATE TEMP TABLE {} (transaction_hash text, log_index int8, event_name text, event_args json) ON COMMIT DROP",
                plan.temp_table
            )
        );
        assert_eq!(
            plan.update_sql(),
            format!(
                "UPDATE ethereum.logs AS t SET event_name = s.event_name, event_args = s.event_args FROM {} AS s WHERE t.transaction_hash = s.transaction_hash AND t.log_index = s.log_index",
                plan.temp_table
            )
        );
    }

    #[test]
    fn test_insert_chunks_respect_bind_limit() {
        let plan = BulkUpdatePlan::new("ethereum", ChainTable::Transactions);
        assert_eq!(plan.chunk_size(), 21_845);

        let row = vec![
            SqlValue::Text(Some("0x1".to_string())),
            SqlValue::Text(None),
            SqlValue::Json(None),
        ];
        let rows = vec![row; plan.chunk_size() + 1];
        let statements = plan.insert_statements(&rows);
        assert_eq!(statements.len(), 2);
        assert!(statements[1].sql().ends_with("VALUES ($1, $2, $3::json)"));
    }

    #[test]
    fn test_log_rows_serialize_args() {
        let rows = one_log().rows().unwrap();
        assert_eq!(rows[0][1], SqlValue::Int(4));
        assert_eq!(
            rows[0][3],
            SqlValue::Json(Some(r#"[{"name":"value","type":"uint256","value":1}]"#.to_string()))
        );
    }

    #[tokio::test]
    async fn test_deadlocks_are_retried() {
        let sink = Arc::new(FlakySink {
            deadlocks: 2,
            calls: AtomicU32::new(0),
            message: "deadlock detected",
        });
        let writer = BulkWriter::new(sink.clone(), fast_config(5));
        writer
            .bulk_save("1", &one_log(), FailurePolicy::Propagate)
            .await
            .unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let sink = Arc::new(FlakySink {
            deadlocks: u32::MAX,
            calls: AtomicU32::new(0),
            message: "deadlock detected",
        });
        let writer = BulkWriter::new(sink.clone(), fast_config(3));
        let err = writer
            .bulk_save("1", &one_log(), FailurePolicy::Propagate)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_follow_policy() {
        let sink = Arc::new(FlakySink {
            deadlocks: u32::MAX,
            calls: AtomicU32::new(0),
            message: "relation does not exist",
        });
        let writer = BulkWriter::new(sink.clone(), fast_config(5));
        assert!(writer
            .bulk_save("1", &one_log(), FailurePolicy::Propagate)
            .await
            .is_err());
        assert!(writer
            .bulk_save("1", &one_log(), FailurePolicy::LogOnly)
            .await
            .is_ok());
        // Not retried
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}
