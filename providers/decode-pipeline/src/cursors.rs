//! Query cursor builder
//!
//! Turns event/call definitions plus contract address sets into one
//! resumable query plan per chain: log and call predicates, the versions the
//! plan covers, and a timestamp cursor.

use crate::cache::PipelineCache;
use crate::error::Result;
use crate::store::ChainStore;

use abi_decoder_provider::{LogRecord, TraceRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Predicate over the `logs` table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LogFilter {
    /// `address = X AND topic0 IN (...)`
    AtAddress { address: String, topics: Vec<String> },
    /// `topic0 = X AND address IN (...)`
    ForTopic { topic: String, addresses: Vec<String> },
}

impl LogFilter {
    pub fn matches(&self, log: &LogRecord) -> bool {
        let address = log.address.to_lowercase();
        let topic0 = log.topic0.as_deref().unwrap_or_default().to_lowercase();
        match self {
            LogFilter::AtAddress { address: a, topics } => *a == address && topics.contains(&topic0),
            LogFilter::ForTopic { topic, addresses } => *topic == topic0 && addresses.contains(&address),
        }
    }
}

/// Predicate over the `traces` table. `function_name: None` selects calls
/// not decoded yet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFilter {
    pub function_name: Option<String>,
    pub to: String,
}

impl CallFilter {
    pub fn matches(&self, trace: &TraceRecord) -> bool {
        let to_matches = trace
            .to
            .as_deref()
            .map(|to| to.eq_ignore_ascii_case(&self.to))
            .unwrap_or(false);
        to_matches && trace.function_name.as_deref() == self.function_name.as_deref()
    }
}

/// Append `(f1 OR f2 ...)` for log filters; `FALSE` when empty
pub fn push_log_predicate(qb: &mut QueryBuilder<'_, Postgres>, filters: &[LogFilter]) {
    if filters.is_empty() {
        qb.push("FALSE");
        return;
    }
    qb.push("(");
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        match filter {
            LogFilter::AtAddress { address, topics } => {
                qb.push("(address = ").push_bind(address.clone());
                qb.push(" AND topic0 IN (");
                push_bind_list(qb, topics);
                qb.push("))");
            }
            LogFilter::ForTopic { topic, addresses } => {
                qb.push("(topic0 = ").push_bind(topic.clone());
                qb.push(" AND address IN (");
                push_bind_list(qb, addresses);
                qb.push("))");
            }
        }
    }
    qb.push(")");
}

/// Append `(f1 OR f2 ...)` for call filters; `FALSE` when empty
pub fn push_call_predicate(qb: &mut QueryBuilder<'_, Postgres>, filters: &[CallFilter]) {
    if filters.is_empty() {
        qb.push("FALSE");
        return;
    }
    qb.push("(");
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        match &filter.function_name {
            Some(name) => {
                qb.push("(function_name = ").push_bind(name.clone());
            }
            None => {
                qb.push("(function_name IS NULL");
            }
        }
        qb.push(" AND \"to\" = ").push_bind(filter.to.clone());
        qb.push(")");
    }
    qb.push(")");
}

pub(crate) fn push_bind_list(qb: &mut QueryBuilder<'_, Postgres>, values: &[String]) {
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
}

/// Event definition for one chain: a group's event and its addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    pub group: String,
    pub event_name: String,
    pub topic0: String,
    pub addresses: Vec<String>,
}

impl EventInput {
    pub fn version(&self) -> String {
        stream_registry::contract_item_version(&self.group, &self.event_name, &self.topic0.to_lowercase())
    }
}

/// Call definition for one chain: a group's function and its addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInput {
    pub group: String,
    pub function_name: String,
    pub selector: String,
    pub addresses: Vec<String>,
}

impl CallInput {
    pub fn version(&self) -> String {
        stream_registry::contract_item_version(&self.group, &self.function_name, &self.selector.to_lowercase())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainInputs {
    #[serde(default)]
    pub events: Vec<EventInput>,
    #[serde(default)]
    pub calls: Vec<CallInput>,
}

/// Resumable per-chain query plan
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCursor {
    pub input_events_query_comps: Vec<LogFilter>,
    /// Event versions this plan emits
    pub input_event_ids: BTreeSet<String>,
    pub input_functions_query_comps: Vec<CallFilter>,
    /// Call versions this plan emits
    pub input_function_ids: BTreeSet<String>,
    /// Address -> groups that declared it
    pub input_groups: BTreeMap<String, BTreeSet<String>>,
    /// Everything before this instant has been emitted
    pub timestamp_cursor: DateTime<Utc>,
}

/// Persisted form of a cursor; sets become ordered arrays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedCursor {
    pub input_events_query_comps: Vec<LogFilter>,
    pub input_event_ids: Vec<String>,
    pub input_functions_query_comps: Vec<CallFilter>,
    pub input_function_ids: Vec<String>,
    #[serde(default)]
    pub input_groups: BTreeMap<String, Vec<String>>,
    pub timestamp_cursor: DateTime<Utc>,
}

impl From<&QueryCursor> for SerializedCursor {
    fn from(cursor: &QueryCursor) -> Self {
        Self {
            input_events_query_comps: cursor.input_events_query_comps.clone(),
            input_event_ids: cursor.input_event_ids.iter().cloned().collect(),
            input_functions_query_comps: cursor.input_functions_query_comps.clone(),
            input_function_ids: cursor.input_function_ids.iter().cloned().collect(),
            input_groups: cursor
                .input_groups
                .iter()
                .map(|(address, groups)| (address.clone(), groups.iter().cloned().collect()))
                .collect(),
            timestamp_cursor: cursor.timestamp_cursor,
        }
    }
}

impl From<SerializedCursor> for QueryCursor {
    fn from(cursor: SerializedCursor) -> Self {
        Self {
            input_events_query_comps: cursor.input_events_query_comps,
            input_event_ids: cursor.input_event_ids.into_iter().collect(),
            input_functions_query_comps: cursor.input_functions_query_comps,
            input_function_ids: cursor.input_function_ids.into_iter().collect(),
            input_groups: cursor
                .input_groups
                .into_iter()
                .map(|(address, groups)| (address, groups.into_iter().collect()))
                .collect(),
            timestamp_cursor: cursor.timestamp_cursor,
        }
    }
}

pub fn serialize_cursors(cursors: &BTreeMap<String, QueryCursor>) -> BTreeMap<String, SerializedCursor> {
    cursors
        .iter()
        .map(|(chain_id, cursor)| (chain_id.clone(), SerializedCursor::from(cursor)))
        .collect()
}

pub fn deserialize_cursors(cursors: BTreeMap<String, SerializedCursor>) -> BTreeMap<String, QueryCursor> {
    cursors
        .into_iter()
        .map(|(chain_id, cursor)| (chain_id, QueryCursor::from(cursor)))
        .collect()
}

/// Predicates and id sets for one chain, before the start time is known.
/// `None` when the chain has nothing to query.
pub fn plan_chain(inputs: &ChainInputs, is_contract_factory: bool) -> Option<QueryCursor> {
    let mut input_groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut input_event_ids = BTreeSet::new();
    let mut input_function_ids = BTreeSet::new();

    let events: Vec<&EventInput> = inputs.events.iter().filter(|e| !e.addresses.is_empty()).collect();
    let event_addresses: BTreeSet<String> = events
        .iter()
        .flat_map(|e| e.addresses.iter().map(|a| a.to_lowercase()))
        .collect();

    let mut log_filters = Vec::new();
    if event_addresses.len() == 1 {
        let topics: BTreeSet<String> = events.iter().map(|e| e.topic0.to_lowercase()).collect();
        log_filters.push(LogFilter::AtAddress {
            address: event_addresses.iter().next().cloned().unwrap_or_default(),
            topics: topics.into_iter().collect(),
        });
    } else {
        for event in &events {
            let addresses: BTreeSet<String> = event.addresses.iter().map(|a| a.to_lowercase()).collect();
            let filter = LogFilter::ForTopic {
                topic: event.topic0.to_lowercase(),
                addresses: addresses.into_iter().collect(),
            };
            if !log_filters.contains(&filter) {
                log_filters.push(filter);
            }
        }
    }
    for event in &events {
        input_event_ids.insert(event.version());
        for address in &event.addresses {
            input_groups
                .entry(address.to_lowercase())
                .or_default()
                .insert(event.group.clone());
        }
    }

    let mut call_filters = BTreeSet::new();
    for call in inputs.calls.iter().filter(|c| !c.addresses.is_empty()) {
        input_function_ids.insert(call.version());
        for address in &call.addresses {
            let to = address.to_lowercase();
            call_filters.insert(CallFilter {
                function_name: Some(call.function_name.clone()),
                to: to.clone(),
            });
            if is_contract_factory {
                call_filters.insert(CallFilter {
                    function_name: None,
                    to: to.clone(),
                });
            }
            input_groups.entry(to).or_default().insert(call.group.clone());
        }
    }

    if log_filters.is_empty() && call_filters.is_empty() {
        return None;
    }

    Some(QueryCursor {
        input_events_query_comps: log_filters,
        input_event_ids,
        input_functions_query_comps: call_filters.into_iter().collect(),
        input_function_ids,
        input_groups,
        timestamp_cursor: Utc::now(),
    })
}

/// Builds per-chain cursors, probing chain tables for the start time
pub struct CursorBuilder {
    store: Arc<dyn ChainStore>,
    cache: Arc<dyn PipelineCache>,
}

impl CursorBuilder {
    pub fn new(store: Arc<dyn ChainStore>, cache: Arc<dyn PipelineCache>) -> Self {
        Self { store, cache }
    }

    /// Chains without any definitions are omitted from the result.
    ///
    /// Without `start_timestamp`, each chain starts at the earlier of its
    /// earliest matching log and trace, or now when neither exists.
    #[instrument(skip(self, chain_inputs), fields(chains = chain_inputs.len()))]
    pub async fn build_query_cursors(
        &self,
        chain_inputs: &BTreeMap<String, ChainInputs>,
        start_timestamp: Option<DateTime<Utc>>,
        is_contract_factory: bool,
    ) -> Result<BTreeMap<String, QueryCursor>> {
        let mut cursors = BTreeMap::new();
        for (chain_id, inputs) in chain_inputs {
            let Some(mut cursor) = plan_chain(inputs, is_contract_factory) else {
                debug!("Chain {} has no inputs, skipping", chain_id);
                continue;
            };
            cursor.timestamp_cursor = match start_timestamp {
                Some(start) => start,
                None => self.probe_start(chain_id, inputs, &cursor).await?,
            };
            cursors.insert(chain_id.clone(), cursor);
        }
        info!("Built query cursors for {} chains", cursors.len());
        Ok(cursors)
    }

    /// `Ok(None)` when there is nothing to generate
    pub async fn input_generator_queries(
        &self,
        chain_inputs: &BTreeMap<String, ChainInputs>,
        start_timestamp: Option<DateTime<Utc>>,
        is_contract_factory: bool,
    ) -> Result<Option<BTreeMap<String, QueryCursor>>> {
        let cursors = self
            .build_query_cursors(chain_inputs, start_timestamp, is_contract_factory)
            .await?;
        Ok((!cursors.is_empty()).then_some(cursors))
    }

    async fn probe_start(
        &self,
        chain_id: &str,
        inputs: &ChainInputs,
        cursor: &QueryCursor,
    ) -> Result<DateTime<Utc>> {
        let from_block = self.cached_start_block(chain_id, inputs).await?;

        let earliest_log = if cursor.input_events_query_comps.is_empty() {
            None
        } else {
            self.store
                .earliest_log_timestamp(chain_id, &cursor.input_events_query_comps, from_block)
                .await?
        };
        let earliest_trace = if cursor.input_functions_query_comps.is_empty() {
            None
        } else {
            self.store
                .earliest_trace_timestamp(chain_id, &cursor.input_functions_query_comps, None)
                .await?
        };

        Ok(match (earliest_log, earliest_trace) {
            (Some(log), Some(trace)) => log.min(trace),
            (Some(ts), None) | (None, Some(ts)) => ts,
            (None, None) => Utc::now(),
        })
    }

    /// Lowest cached start block when every event on the chain has one
    async fn cached_start_block(&self, chain_id: &str, inputs: &ChainInputs) -> Result<Option<i64>> {
        let mut lowest: Option<i64> = None;
        for event in inputs.events.iter().filter(|e| !e.addresses.is_empty()) {
            match self.cache.event_start_block(chain_id, &event.version()).await? {
                Some(block) => lowest = Some(lowest.map_or(block, |l| l.min(block))),
                None => return Ok(None),
            }
        }
        Ok(lowest)
    }
}
