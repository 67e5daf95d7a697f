//! In-memory collaborators for local runs and tests

use crate::bulk_writer::DecodedBatch;
use crate::cache::{PipelineCache, StoredCursors};
use crate::coordinator::{ContractRegistry, DataModelDesigner};
use crate::cursors::{CallFilter, LogFilter};
use crate::error::{PipelineError, Result};
use crate::event_log::{EventLog, LogEntry};
use crate::interactions::{InteractionQuery, Interactions};
use crate::store::{ChainStore, DecodedSink, TimeWindow};
use crate::transmit::LiveTransmit;
use crate::types::{ChainTable, ContractGroup, ContractInstance, EventSpecTemplate};

use abi_decoder_provider::{LogRecord, TraceRecord, TransactionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

#[derive(Debug, Default, Clone)]
struct ChainTables {
    transactions: Vec<TransactionRecord>,
    traces: Vec<TraceRecord>,
    logs: Vec<LogRecord>,
}

/// Chain tables held in memory
#[derive(Default)]
pub struct MemoryChainStore {
    chains: RwLock<HashMap<String, ChainTables>>,
    now: RwLock<Option<DateTime<Utc>>>,
    fail_queries: AtomicBool,
    decode_writes: AtomicU64,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_transactions(&self, chain_id: &str, rows: Vec<TransactionRecord>) {
        self.chains
            .write()
            .await
            .entry(chain_id.to_string())
            .or_default()
            .transactions
            .extend(rows);
    }

    pub async fn insert_traces(&self, chain_id: &str, rows: Vec<TraceRecord>) {
        self.chains
            .write()
            .await
            .entry(chain_id.to_string())
            .or_default()
            .traces
            .extend(rows);
    }

    pub async fn insert_logs(&self, chain_id: &str, rows: Vec<LogRecord>) {
        self.chains
            .write()
            .await
            .entry(chain_id.to_string())
            .or_default()
            .logs
            .extend(rows);
    }

    pub async fn logs(&self, chain_id: &str) -> Vec<LogRecord> {
        self.tables(chain_id).await.logs
    }

    pub async fn transactions(&self, chain_id: &str) -> Vec<TransactionRecord> {
        self.tables(chain_id).await.transactions
    }

    pub async fn traces(&self, chain_id: &str) -> Vec<TraceRecord> {
        self.tables(chain_id).await.traces
    }

    /// Pin the database clock
    pub async fn set_now(&self, now: DateTime<Utc>) {
        *self.now.write().await = Some(now);
    }

    /// Make every query fail
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Number of successful decode updates applied
    pub fn decode_writes(&self) -> u64 {
        self.decode_writes.load(Ordering::SeqCst)
    }

    async fn tables(&self, chain_id: &str) -> ChainTables {
        self.chains
            .read()
            .await
            .get(chain_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(PipelineError::Query("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainStore for MemoryChainStore {
    async fn db_now(&self) -> Result<DateTime<Utc>> {
        self.check()?;
        Ok(self.now.read().await.unwrap_or_else(Utc::now))
    }

    async fn find_interactions(&self, chain_id: &str, query: &InteractionQuery) -> Result<Interactions> {
        self.check()?;
        let tables = self.tables(chain_id).await;
        Ok(match query.table {
            ChainTable::Transactions => Interactions::Transactions(
                tables
                    .transactions
                    .into_iter()
                    .filter(|tx| query.matches_transaction(tx))
                    .collect(),
            ),
            ChainTable::Traces => Interactions::Traces(
                tables
                    .traces
                    .into_iter()
                    .filter(|trace| query.matches_trace(trace))
                    .collect(),
            ),
            ChainTable::Logs => Interactions::Logs(
                tables
                    .logs
                    .into_iter()
                    .filter(|log| query.matches_log(log))
                    .collect(),
            ),
        })
    }

    async fn transactions_by_hash(&self, chain_id: &str, hashes: &[String]) -> Result<Vec<TransactionRecord>> {
        self.check()?;
        Ok(self
            .tables(chain_id)
            .await
            .transactions
            .into_iter()
            .filter(|tx| hashes.contains(&tx.hash))
            .collect())
    }

    async fn earliest_log_block(&self, chain_id: &str, addresses: &[String], topic0: &str) -> Result<Option<i64>> {
        self.check()?;
        Ok(self
            .tables(chain_id)
            .await
            .logs
            .iter()
            .filter(|log| {
                log.topic0
                    .as_deref()
                    .map(|t| t.eq_ignore_ascii_case(topic0))
                    .unwrap_or(false)
                    && addresses.iter().any(|a| a.eq_ignore_ascii_case(&log.address))
            })
            .map(|log| log.block_number)
            .min())
    }

    async fn earliest_log_timestamp(
        &self,
        chain_id: &str,
        filters: &[LogFilter],
        from_block: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.check()?;
        Ok(self
            .tables(chain_id)
            .await
            .logs
            .iter()
            .filter(|log| from_block.map_or(true, |b| log.block_number >= b))
            .filter(|log| filters.iter().any(|f| f.matches(log)))
            .map(|log| log.block_timestamp)
            .min())
    }

    async fn earliest_trace_timestamp(
        &self,
        chain_id: &str,
        filters: &[CallFilter],
        from_block: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.check()?;
        Ok(self
            .tables(chain_id)
            .await
            .traces
            .iter()
            .filter(|trace| from_block.map_or(true, |b| trace.block_number >= b))
            .filter(|trace| filters.iter().any(|f| f.matches(trace)))
            .map(|trace| trace.block_timestamp)
            .min())
    }

    async fn logs_in_window(&self, chain_id: &str, filters: &[LogFilter], window: TimeWindow) -> Result<Vec<LogRecord>> {
        self.check()?;
        let mut logs: Vec<LogRecord> = self
            .tables(chain_id)
            .await
            .logs
            .into_iter()
            .filter(|log| window.contains(&log.block_timestamp))
            .filter(|log| filters.iter().any(|f| f.matches(log)))
            .collect();
        logs.sort_by_key(|l| (l.block_timestamp, l.transaction_index, l.log_index));
        Ok(logs)
    }

    async fn traces_in_window(
        &self,
        chain_id: &str,
        filters: &[CallFilter],
        window: TimeWindow,
    ) -> Result<Vec<TraceRecord>> {
        self.check()?;
        let mut traces: Vec<TraceRecord> = self
            .tables(chain_id)
            .await
            .traces
            .into_iter()
            .filter(|trace| window.contains(&trace.block_timestamp))
            .filter(|trace| filters.iter().any(|f| f.matches(trace)))
            .collect();
        traces.sort_by_key(|t| (t.block_timestamp, t.transaction_index, t.trace_index));
        Ok(traces)
    }
}

#[async_trait]
impl DecodedSink for MemoryChainStore {
    async fn apply_decoded(&self, chain_id: &str, batch: &DecodedBatch) -> Result<()> {
        self.check()?;
        let mut chains = self.chains.write().await;
        let tables = chains.entry(chain_id.to_string()).or_default();
        match batch {
            DecodedBatch::Transactions(rows) => {
                for row in rows {
                    for tx in tables.transactions.iter_mut().filter(|tx| tx.hash == row.hash) {
                        tx.function_name = row.function_name.clone();
                        tx.function_args = row.function_args.clone();
                    }
                }
            }
            DecodedBatch::Traces(rows) => {
                for row in rows {
                    for trace in tables.traces.iter_mut().filter(|t| t.id == row.id) {
                        trace.function_name = row.function_name.clone();
                        trace.function_args = row.function_args.clone();
                        trace.function_outputs = row.function_outputs.clone();
                    }
                }
            }
            DecodedBatch::Logs(rows) => {
                for row in rows {
                    for log in tables.logs.iter_mut().filter(|l| {
                        l.transaction_hash == row.transaction_hash && l.log_index == row.log_index
                    }) {
                        log.event_name = row.event_name.clone();
                        log.event_args = row.event_args.clone();
                    }
                }
            }
        }
        self.decode_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Append-only logs with `"{n}-0"` nonces, trimmed to `max_len`
pub struct MemoryEventLog {
    logs: RwLock<HashMap<String, Vec<LogEntry>>>,
    sequence: AtomicU64,
    max_len: usize,
    fail_appends: AtomicBool,
}

impl MemoryEventLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            max_len,
            fail_appends: AtomicBool::new(false),
        }
    }

    /// Make appends fail until switched back
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub async fn entries(&self, log: &str) -> Vec<LogEntry> {
        self.logs.read().await.get(log).cloned().unwrap_or_default()
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new(crate::config::RelayConfig::default().stream_max_len)
    }
}

fn nonce_seq(nonce: &str) -> u64 {
    nonce
        .split_once('-')
        .map_or(nonce, |(seq, _)| seq)
        .parse()
        .unwrap_or(0)
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, log: &str, payload: &str) -> Result<String> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(PipelineError::Query(format!("append to {} refused", log)));
        }
        let nonce = format!("{}-0", self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        let mut logs = self.logs.write().await;
        let entries = logs.entry(log.to_string()).or_default();
        entries.push(LogEntry {
            nonce: nonce.clone(),
            payload: payload.to_string(),
        });
        if entries.len() > self.max_len {
            let excess = entries.len() - self.max_len;
            entries.drain(..excess);
        }
        Ok(nonce)
    }

    async fn last_entries(&self, log: &str, count: usize) -> Result<Vec<LogEntry>> {
        Ok(self
            .entries(log)
            .await
            .into_iter()
            .rev()
            .take(count)
            .collect())
    }

    async fn entries_after(
        &self,
        positions: &[(String, String)],
        count: usize,
    ) -> Result<Vec<(String, Vec<LogEntry>)>> {
        let logs = self.logs.read().await;
        Ok(positions
            .iter()
            .filter_map(|(log, nonce)| {
                let after = nonce_seq(nonce);
                let entries: Vec<LogEntry> = logs
                    .get(log)?
                    .iter()
                    .filter(|e| nonce_seq(&e.nonce) > after)
                    .take(count)
                    .cloned()
                    .collect();
                (!entries.is_empty()).then(|| (log.clone(), entries))
            })
            .collect())
    }
}

/// Records every transmitted payload
#[derive(Default)]
pub struct MemoryTransmit {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail: AtomicBool,
}

impl MemoryTransmit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LiveTransmit for MemoryTransmit {
    async fn transmit(&self, subject: &str, payload: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PipelineError::Nats("no responders".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((subject.to_string(), payload.to_vec()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPipelineCache {
    cursors: RwLock<HashMap<String, StoredCursors>>,
    start_blocks: RwLock<HashMap<(String, String), i64>>,
}

impl MemoryPipelineCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineCache for MemoryPipelineCache {
    async fn query_cursors(&self, stream_id: &str) -> Result<Option<StoredCursors>> {
        Ok(self.cursors.read().await.get(stream_id).cloned())
    }

    async fn set_query_cursors(&self, stream_id: &str, cursors: &StoredCursors) -> Result<()> {
        self.cursors
            .write()
            .await
            .insert(stream_id.to_string(), cursors.clone());
        Ok(())
    }

    async fn delete_query_cursors(&self, stream_id: &str) -> Result<()> {
        self.cursors.write().await.remove(stream_id);
        Ok(())
    }

    async fn event_start_block(&self, chain_id: &str, version: &str) -> Result<Option<i64>> {
        Ok(self
            .start_blocks
            .read()
            .await
            .get(&(chain_id.to_string(), version.to_string()))
            .copied())
    }

    async fn set_event_start_block(&self, chain_id: &str, version: &str, block_number: i64) -> Result<()> {
        let mut blocks = self.start_blocks.write().await;
        let entry = blocks
            .entry((chain_id.to_string(), version.to_string()))
            .or_insert(block_number);
        *entry = (*entry).min(block_number);
        Ok(())
    }
}

/// Groups keyed by full name with their instances
#[derive(Default)]
pub struct MemoryContractRegistry {
    groups: RwLock<BTreeMap<String, Vec<ContractInstance>>>,
    writes: AtomicU64,
}

impl MemoryContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `create_instances` calls
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContractRegistry for MemoryContractRegistry {
    async fn namespace_instances(&self, namespace: &str) -> Result<Vec<ContractInstance>> {
        Ok(self
            .groups
            .read()
            .await
            .iter()
            .filter(|(name, _)| {
                ContractGroup::parse(name)
                    .map(|g| g.namespace == namespace)
                    .unwrap_or(false)
            })
            .flat_map(|(_, instances)| instances.iter().cloned())
            .collect())
    }

    async fn group_instances(&self, group: &ContractGroup) -> Result<Vec<ContractInstance>> {
        Ok(self
            .groups
            .read()
            .await
            .get(&group.full_name())
            .cloned()
            .unwrap_or_default())
    }

    async fn create_instances(&self, group: &ContractGroup, instances: &[ContractInstance]) -> Result<()> {
        let mut groups = self.groups.write().await;
        let existing = groups.entry(group.full_name()).or_default();
        for instance in instances {
            if !existing.contains(instance) {
                existing.push(instance.clone());
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Logs and keeps the templates it is handed
#[derive(Default)]
pub struct LoggingDesigner {
    designed: Mutex<Vec<(String, Vec<EventSpecTemplate>)>>,
}

impl LoggingDesigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn designed(&self) -> Vec<(String, Vec<EventSpecTemplate>)> {
        self.designed.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DataModelDesigner for LoggingDesigner {
    async fn design_views(&self, group: &str, templates: &[EventSpecTemplate]) -> Result<()> {
        tracing::info!("Designing {} views for {}", templates.len(), group);
        if let Ok(mut designed) = self.designed.lock() {
            designed.push((group.to_string(), templates.to_vec()));
        }
        Ok(())
    }
}
