//! Windowed input generator
//!
//! Replays historical events and calls of a set of contracts in global
//! order. Each `next_batch` call advances a virtual clock by one window:
//!
//! 1. window `[start, start + target_batch_size * fastest block time)`
//! 2. fetch logs and traces of every chain whose cursor is before the window end
//! 3. drop interactions of failed transactions
//! 4. decode rows not decoded yet, persisting them for contract factories
//! 5. sort by `(blockTimestamp, chainId, transactionIndex, logIndex|traceIndex)`
//! 6. emit one input per group that declared the contract
//!
//! Empty windows roll forward within one call until the time budget runs out.

use crate::bulk_writer::{BulkWriter, DecodedBatch, FailurePolicy};
use crate::cache::PipelineCache;
use crate::config::GeneratorConfig;
use crate::cursors::{deserialize_cursors, serialize_cursors, QueryCursor, SerializedCursor};
use crate::error::Result;
use crate::store::{ChainStore, TimeWindow};
use crate::types::{CallSpec, EventSpec, InputSpec};

use abi_decoder_provider::{
    decode_function_call, decode_log_event, merge_abis, Abi, AbiStore, LogRecord, TraceRecord,
    TransactionRecord,
};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Output of one `next_batch` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputBatch {
    pub inputs: Vec<InputSpec>,
    /// Start of the next window; `None` once generation caught up with now
    pub next_start_date: Option<DateTime<Utc>>,
    pub cursors: BTreeMap<String, SerializedCursor>,
}

/// Collaborators shared by generators
#[derive(Clone)]
pub struct GeneratorDeps {
    pub store: Arc<dyn ChainStore>,
    pub abis: Arc<dyn AbiStore>,
    pub writer: Arc<BulkWriter>,
    pub cache: Arc<dyn PipelineCache>,
}

pub struct InputGenerator {
    deps: GeneratorDeps,
    cursors: BTreeMap<String, QueryCursor>,
    is_contract_factory: bool,
    config: GeneratorConfig,
    window: Duration,
}

impl InputGenerator {
    pub fn new(
        deps: GeneratorDeps,
        cursors: BTreeMap<String, QueryCursor>,
        is_contract_factory: bool,
        config: GeneratorConfig,
    ) -> Self {
        let fastest = cursors
            .keys()
            .map(|chain_id| config.block_time(chain_id))
            .fold(f64::INFINITY, f64::min);
        let fastest = if fastest.is_finite() {
            fastest
        } else {
            crate::config::DEFAULT_BLOCK_TIME_SECS
        };
        let window_ms = (config.target_batch_size as f64 * fastest * 1000.0).round() as i64;

        Self {
            deps,
            cursors,
            is_contract_factory,
            config,
            window: Duration::milliseconds(window_ms.max(1)),
        }
    }

    /// Rebuild a generator from the cursors persisted for `stream_id`
    pub async fn resume(
        deps: GeneratorDeps,
        stream_id: &str,
        is_contract_factory: bool,
        config: GeneratorConfig,
    ) -> Result<Option<Self>> {
        let Some(stored) = deps.cache.query_cursors(stream_id).await? else {
            return Ok(None);
        };
        debug!("Resuming stream {} with {} chains", stream_id, stored.len());
        Ok(Some(Self::new(
            deps,
            deserialize_cursors(stored),
            is_contract_factory,
            config,
        )))
    }

    pub async fn persist(&self, stream_id: &str) -> Result<()> {
        self.deps
            .cache
            .set_query_cursors(stream_id, &serialize_cursors(&self.cursors))
            .await
    }

    /// Drop the persisted cursors once generation is finished
    pub async fn complete(&self, stream_id: &str) -> Result<()> {
        self.deps.cache.delete_query_cursors(stream_id).await
    }

    pub fn cursors(&self) -> &BTreeMap<String, QueryCursor> {
        &self.cursors
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn earliest_cursor(&self) -> Option<DateTime<Utc>> {
        self.cursors.values().map(|c| c.timestamp_cursor).min()
    }

    /// Generate the inputs of the next non-empty window.
    ///
    /// Starts at `start_date` or at the earliest chain cursor.
    #[instrument(skip(self), fields(chains = self.cursors.len()))]
    pub async fn next_batch(&mut self, start_date: Option<DateTime<Utc>>) -> Result<InputBatch> {
        let deadline = Instant::now() + self.config.time_budget();
        let Some(mut start) = start_date.or_else(|| self.earliest_cursor()) else {
            return Ok(InputBatch {
                inputs: Vec::new(),
                next_start_date: None,
                cursors: BTreeMap::new(),
            });
        };

        loop {
            let end = start + self.window;
            let window = TimeWindow { start, end };
            let active: Vec<String> = self
                .cursors
                .iter()
                .filter(|(_, cursor)| cursor.timestamp_cursor < end)
                .map(|(chain_id, _)| chain_id.clone())
                .collect();

            let fetched: Vec<Vec<InputSpec>> = stream::iter(active)
                .map(|chain_id| self.chain_inputs(chain_id, window))
                .buffer_unordered(self.config.max_parallel_chains)
                .try_collect()
                .await?;

            let mut inputs: Vec<InputSpec> = fetched.into_iter().flatten().collect();
            inputs.sort_by(compare_inputs);

            for cursor in self.cursors.values_mut() {
                cursor.timestamp_cursor = cursor.timestamp_cursor.max(end);
            }

            let next_start_date = (end <= Utc::now()).then_some(end);
            if !inputs.is_empty() || next_start_date.is_none() || Instant::now() >= deadline {
                info!(
                    "Generated {} inputs for window ending {}",
                    inputs.len(),
                    end
                );
                return Ok(InputBatch {
                    inputs,
                    next_start_date,
                    cursors: serialize_cursors(&self.cursors),
                });
            }

            debug!("Window ending {} is empty, rolling forward", end);
            start = end;
        }
    }

    async fn chain_inputs(&self, chain_id: String, window: TimeWindow) -> Result<Vec<InputSpec>> {
        let Some(cursor) = self.cursors.get(&chain_id) else {
            return Ok(Vec::new());
        };
        // Everything before the chain cursor was emitted already
        let window = TimeWindow {
            start: window.start.max(cursor.timestamp_cursor),
            end: window.end,
        };
        let store = &self.deps.store;

        let mut logs = if cursor.input_events_query_comps.is_empty() {
            Vec::new()
        } else {
            store
                .logs_in_window(&chain_id, &cursor.input_events_query_comps, window)
                .await?
        };
        let mut traces = if cursor.input_functions_query_comps.is_empty() {
            Vec::new()
        } else {
            store
                .traces_in_window(&chain_id, &cursor.input_functions_query_comps, window)
                .await?
        };
        if logs.is_empty() && traces.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: BTreeSet<String> = logs
            .iter()
            .map(|l| l.transaction_hash.clone())
            .chain(traces.iter().map(|t| t.transaction_hash.clone()))
            .filter(|h| !h.is_empty())
            .collect();
        let hashes: Vec<String> = hashes.into_iter().collect();
        let parents: HashMap<String, TransactionRecord> = store
            .transactions_by_hash(&chain_id, &hashes)
            .await?
            .into_iter()
            .map(|tx| (tx.hash.clone(), tx))
            .collect();

        let succeeded = |hash: &str| parents.get(hash).map(TransactionRecord::succeeded).unwrap_or(false);
        logs.retain(|log| succeeded(&log.transaction_hash));
        traces.retain(|trace| {
            if trace.transaction_hash.is_empty() {
                trace.status != Some(0)
            } else {
                succeeded(&trace.transaction_hash)
            }
        });

        self.decode_missing(&chain_id, cursor, &mut logs, &mut traces).await?;
        let undecoded = logs.iter().filter(|l| !l.is_decoded()).count()
            + traces.iter().filter(|t| t.function_name.is_none()).count();
        if undecoded > 0 {
            warn!(
                "Skipping {} rows on chain {} that no known ABI decodes",
                undecoded, chain_id
            );
        }

        let mut inputs = Vec::new();
        for log in logs.iter().filter(|l| l.is_decoded()) {
            let parent = parents.get(&log.transaction_hash).cloned();
            for group in groups_of(cursor, &log.address) {
                if let Some(spec) = EventSpec::from_log(group, &chain_id, log, parent.clone()) {
                    if cursor.input_event_ids.contains(&spec.name) {
                        inputs.push(InputSpec::Event(spec));
                    }
                }
            }
        }
        for trace in traces.iter().filter(|t| t.function_name.is_some()) {
            let parent = parents.get(&trace.transaction_hash).cloned();
            let to = trace.to.as_deref().unwrap_or_default();
            for group in groups_of(cursor, to) {
                if let Some(spec) = CallSpec::from_trace(group, &chain_id, trace, parent.clone()) {
                    if cursor.input_function_ids.contains(&spec.name) {
                        inputs.push(InputSpec::Call(spec));
                    }
                }
            }
        }
        Ok(inputs)
    }

    /// Decode undecoded rows with every ABI known for their address.
    /// Contract factories also persist what decoded; failures to persist
    /// are logged only.
    async fn decode_missing(
        &self,
        chain_id: &str,
        cursor: &QueryCursor,
        logs: &mut [LogRecord],
        traces: &mut [TraceRecord],
    ) -> Result<()> {
        let addresses: BTreeSet<String> = logs
            .iter()
            .filter(|l| !l.is_decoded())
            .map(|l| l.address.to_lowercase())
            .chain(
                traces
                    .iter()
                    .filter(|t| t.function_name.is_none())
                    .filter_map(|t| t.to.as_deref().map(str::to_lowercase)),
            )
            .collect();
        if addresses.is_empty() {
            return Ok(());
        }

        let abis = self.known_abis(chain_id, cursor, addresses).await?;
        let empty = Abi::new();

        let mut decoded_logs = Vec::new();
        for log in logs.iter_mut().filter(|l| !l.is_decoded()) {
            let abi = abis.get(&log.address.to_lowercase()).unwrap_or(&empty);
            let decoded = decode_log_event(log.clone(), abi);
            if decoded.is_decoded() {
                *log = decoded;
                decoded_logs.push(log.clone());
            }
        }

        let mut decoded_traces = Vec::new();
        for trace in traces.iter_mut().filter(|t| t.function_name.is_none()) {
            let to = trace.to.as_deref().unwrap_or_default().to_lowercase();
            let abi = abis.get(&to).unwrap_or(&empty);
            let decoded = decode_function_call(trace.clone(), abi);
            if decoded.function_name.is_some() {
                *trace = decoded;
                decoded_traces.push(trace.clone());
            }
        }

        if !self.is_contract_factory {
            debug!(
                "Decoded {} logs and {} traces on chain {} in memory",
                decoded_logs.len(),
                decoded_traces.len(),
                chain_id
            );
            return Ok(());
        }
        let writer = &self.deps.writer;
        writer
            .bulk_save(chain_id, &DecodedBatch::Logs(decoded_logs), FailurePolicy::LogOnly)
            .await?;
        writer
            .bulk_save(chain_id, &DecodedBatch::Traces(decoded_traces), FailurePolicy::LogOnly)
            .await?;
        Ok(())
    }

    /// Address ABI merged with the ABIs of the groups that declared the address
    async fn known_abis(
        &self,
        chain_id: &str,
        cursor: &QueryCursor,
        addresses: BTreeSet<String>,
    ) -> Result<HashMap<String, Abi>> {
        let addresses: Vec<String> = addresses.into_iter().collect();
        let mut abis = self.deps.abis.address_abis(chain_id, &addresses).await?;
        let mut group_abis: HashMap<String, Option<Abi>> = HashMap::new();

        for address in &addresses {
            let mut known = abis.remove(address).unwrap_or_default();
            for group in groups_of(cursor, address) {
                if !group_abis.contains_key(group) {
                    let abi = self.deps.abis.group_abi(group).await?;
                    group_abis.insert(group.to_string(), abi);
                }
                if let Some(Some(group_abi)) = group_abis.get(group) {
                    known = merge_abis(&known, group_abi);
                }
            }
            abis.insert(address.clone(), known);
        }
        Ok(abis)
    }
}

fn groups_of<'a>(cursor: &'a QueryCursor, address: &str) -> impl Iterator<Item = &'a String> {
    cursor
        .input_groups
        .get(&address.to_lowercase())
        .into_iter()
        .flatten()
}

fn chain_order(chain_id: &str) -> (u64, &str) {
    (chain_id.parse().unwrap_or(u64::MAX), chain_id)
}

fn sort_key(input: &InputSpec) -> (DateTime<Utc>, (u64, &str), i64, i64, u8) {
    match input {
        InputSpec::Event(spec) => (
            spec.origin.block_timestamp,
            chain_order(&spec.origin.chain_id),
            spec.origin.transaction_index,
            spec.origin.log_index,
            0,
        ),
        InputSpec::Call(spec) => (
            spec.origin.block_timestamp,
            chain_order(&spec.origin.chain_id),
            spec.origin.transaction_index,
            spec.origin.trace_index,
            1,
        ),
    }
}

fn compare_inputs(a: &InputSpec, b: &InputSpec) -> Ordering {
    sort_key(a).cmp(&sort_key(b))
}
