//! Domain types shared across the pipeline

use abi_decoder_provider::{AbiItem, DecodedArg, LogRecord, TraceRecord, TransactionRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// A deployed contract: `(chainId, address)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInstance {
    pub chain_id: String,
    pub address: String,
}

impl ContractInstance {
    pub fn new(chain_id: &str, address: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            address: address.to_lowercase(),
        }
    }
}

/// A named contract group, e.g. `uniswap.v3.Pool` in namespace `uniswap.v3`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractGroup {
    pub namespace: String,
    pub name: String,
}

impl ContractGroup {
    /// Split `namespace.Name`
    pub fn parse(full_name: &str) -> Option<Self> {
        let (namespace, name) = full_name.rsplit_once('.')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        stream_registry::contract_group_name(&self.namespace, &self.name)
    }
}

/// A block on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRef {
    pub chain_id: String,
    pub block_number: i64,
}

/// Per-chain tables the pipeline reads and updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainTable {
    Transactions,
    Traces,
    Logs,
}

impl ChainTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            ChainTable::Transactions => "transactions",
            ChainTable::Traces => "traces",
            ChainTable::Logs => "logs",
        }
    }

    /// Column holding the contract address
    pub fn address_column(&self) -> &'static str {
        match self {
            ChainTable::Transactions | ChainTable::Traces => "\"to\"",
            ChainTable::Logs => "address",
        }
    }

    /// Column that stays null until the row is decoded
    pub fn decoded_column(&self) -> &'static str {
        match self {
            ChainTable::Transactions | ChainTable::Traces => "function_name",
            ChainTable::Logs => "event_name",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Event,
    Call,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::Event => stream_registry::input_types::EVENT,
            InputType::Call => stream_registry::input_types::CALL,
        }
    }
}

/// Where an event came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOrigin {
    pub contract_address: String,
    pub transaction_hash: String,
    pub log_index: i64,
    pub transaction_index: i64,
    pub block_number: i64,
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    pub chain_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionRecord>,
}

/// Where a call came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOrigin {
    pub contract_address: String,
    pub transaction_hash: String,
    pub trace_index: i64,
    pub transaction_index: i64,
    pub block_number: i64,
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    pub chain_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionRecord>,
}

/// A decoded event ready to publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    pub origin: EventOrigin,
    /// Namespaced version `group.EventName@topic0`
    pub name: String,
    pub data: Map<String, Value>,
}

impl EventSpec {
    pub fn from_log(
        group: &str,
        chain_id: &str,
        log: &LogRecord,
        transaction: Option<TransactionRecord>,
    ) -> Option<Self> {
        let event_name = log.event_name.as_deref()?;
        let topic0 = log.topic0.as_deref()?;
        Some(Self {
            origin: EventOrigin {
                contract_address: log.address.to_lowercase(),
                transaction_hash: log.transaction_hash.clone(),
                log_index: log.log_index,
                transaction_index: log.transaction_index,
                block_number: log.block_number,
                block_hash: log.block_hash.clone(),
                block_timestamp: log.block_timestamp,
                chain_id: chain_id.to_string(),
                transaction,
            },
            name: stream_registry::contract_item_version(
                group,
                event_name,
                &topic0.to_lowercase(),
            ),
            data: format_args(log.event_args.as_deref().unwrap_or_default()),
        })
    }

    /// Identity used to drop repeats of the same decoded log
    pub fn dedup_key(&self) -> (String, i64, String) {
        (
            self.origin.transaction_hash.clone(),
            self.origin.log_index,
            self.name.clone(),
        )
    }
}

/// A decoded function call ready to publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    pub origin: CallOrigin,
    /// Namespaced version `group.functionName@selector`
    pub name: String,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
}

impl CallSpec {
    pub fn from_trace(
        group: &str,
        chain_id: &str,
        trace: &TraceRecord,
        transaction: Option<TransactionRecord>,
    ) -> Option<Self> {
        let function_name = trace.function_name.as_deref()?;
        let selector = call_selector(trace.input.as_deref()?)?;
        Some(Self {
            origin: CallOrigin {
                contract_address: trace.to.as_deref().unwrap_or_default().to_lowercase(),
                transaction_hash: trace.transaction_hash.clone(),
                trace_index: trace.trace_index,
                transaction_index: trace.transaction_index,
                block_number: trace.block_number,
                block_hash: trace.block_hash.clone(),
                block_timestamp: trace.block_timestamp,
                chain_id: chain_id.to_string(),
                transaction,
            },
            name: stream_registry::contract_item_version(group, function_name, &selector),
            inputs: format_args(trace.function_args.as_deref().unwrap_or_default()),
            outputs: format_args(trace.function_outputs.as_deref().unwrap_or_default()),
        })
    }
}

/// One generator output record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "inputType", rename_all = "lowercase")]
pub enum InputSpec {
    Event(EventSpec),
    Call(CallSpec),
}

impl InputSpec {
    pub fn input_type(&self) -> InputType {
        match self {
            InputSpec::Event(_) => InputType::Event,
            InputSpec::Call(_) => InputType::Call,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            InputSpec::Event(spec) => &spec.name,
            InputSpec::Call(spec) => &spec.name,
        }
    }
}

/// Shape of an event handed to the data model designer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSpecTemplate {
    /// Namespaced version
    pub name: String,
    pub event_name: String,
    pub signature: String,
    pub inputs: Vec<TemplateField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

impl EventSpecTemplate {
    /// Template for a named event whose inputs are all named
    pub fn from_abi_item(group: &str, item: &AbiItem) -> Option<Self> {
        if !item.is_fully_named_event() {
            return None;
        }
        let signature = item.signature()?;
        Some(Self {
            name: stream_registry::contract_item_version(group, &item.name, &signature),
            event_name: item.name.clone(),
            signature,
            inputs: item
                .inputs
                .iter()
                .map(|p| TemplateField {
                    name: camel_case(&p.name),
                    field_type: p.param_type.clone(),
                })
                .collect(),
        })
    }
}

/// Result of registering instances with a group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedInstances {
    pub new_event_specs: Vec<EventSpec>,
    pub new_instances: Vec<ContractInstance>,
}

/// Envelope and origin field names decoded arguments must not shadow
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "name",
    "nonce",
    "origin",
    "data",
    "inputs",
    "outputs",
    "timestamp",
    "generated",
    "chainId",
    "contractAddress",
    "transactionHash",
    "transactionIndex",
    "logIndex",
    "traceIndex",
    "blockNumber",
    "blockHash",
    "blockTimestamp",
    "transaction",
];

/// `_token_id` -> `tokenId`
pub fn camel_case(name: &str) -> String {
    let trimmed = name.trim_start_matches('_');
    let mut out = String::with_capacity(trimmed.len());
    let mut upper_next = false;
    for c in trimmed.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Decoded args keyed by camel-cased name; names clashing with reserved
/// fields or each other get `_` prefixes until unique.
pub fn format_args(args: &[DecodedArg]) -> Map<String, Value> {
    let mut taken: HashSet<String> = RESERVED_FIELDS.iter().map(|f| f.to_string()).collect();
    let mut out = Map::new();
    for (index, arg) in args.iter().enumerate() {
        let mut key = camel_case(&arg.name);
        if key.is_empty() {
            key = format!("arg{}", index);
        }
        while taken.contains(&key) {
            key = format!("_{}", key);
        }
        taken.insert(key.clone());
        out.insert(key, arg.value.clone());
    }
    out
}

/// Lowercase `0x` + 8 hex selector of call input
pub fn call_selector(input: &str) -> Option<String> {
    let hex = input.strip_prefix("0x").unwrap_or(input);
    hex.get(..8).map(|selector| format!("0x{}", selector.to_lowercase()))
}
