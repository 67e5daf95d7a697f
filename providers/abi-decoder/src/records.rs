//! Raw chain interaction records
//!
//! Rows of the per-chain `transactions`, `traces` and `logs` tables. The
//! decode fields start out `None` and are filled once by the decoder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedArg {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: String,
    pub value: serde_json::Value,
}

impl DecodedArg {
    pub fn new(name: &str, arg_type: &str, value: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            arg_type: arg_type.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub hash: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    /// 1 = success, 0 = failure, `None` before receipts are known
    #[serde(default)]
    pub status: Option<i32>,
    pub block_number: i64,
    #[serde(default)]
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub transaction_index: i64,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub function_args: Option<Vec<DecodedArg>>,
}

impl TransactionRecord {
    /// Failed only when the receipt says so
    pub fn succeeded(&self) -> bool {
        self.status != Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub id: String,
    /// Empty on chains that emit system traces without a parent transaction
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub transaction_index: i64,
    #[serde(default)]
    pub trace_index: i64,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub trace_type: Option<String>,
    #[serde(default)]
    pub status: Option<i32>,
    pub block_number: i64,
    #[serde(default)]
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub function_args: Option<Vec<DecodedArg>>,
    #[serde(default)]
    pub function_outputs: Option<Vec<DecodedArg>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub transaction_hash: String,
    pub log_index: i64,
    #[serde(default)]
    pub transaction_index: i64,
    pub address: String,
    #[serde(default)]
    pub topic0: Option<String>,
    #[serde(default)]
    pub topic1: Option<String>,
    #[serde(default)]
    pub topic2: Option<String>,
    #[serde(default)]
    pub topic3: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    pub block_number: i64,
    #[serde(default)]
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub event_args: Option<Vec<DecodedArg>>,
}

impl LogRecord {
    /// Topics after `topic0`, stopping at the first missing one
    pub fn indexed_topics(&self) -> Vec<&str> {
        [&self.topic1, &self.topic2, &self.topic3]
            .into_iter()
            .map_while(|t| t.as_deref().filter(|t| !t.is_empty()))
            .collect()
    }

    pub fn is_decoded(&self) -> bool {
        self.event_name.is_some()
    }
}

/// Records carrying function call input (transactions and traces)
pub trait CallRecord: Clone {
    fn to_address(&self) -> Option<&str>;
    fn input(&self) -> Option<&str>;
    /// Return data; only traces have it
    fn output(&self) -> Option<&str> {
        None
    }
    fn function_name(&self) -> Option<&str>;
    fn set_decoded(&mut self, name: String, args: Vec<DecodedArg>, outputs: Option<Vec<DecodedArg>>);
}

impl CallRecord for TransactionRecord {
    fn to_address(&self) -> Option<&str> {
        self.to.as_deref()
    }

    fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    fn function_name(&self) -> Option<&str> {
        self.function_name.as_deref()
    }

    fn set_decoded(&mut self, name: String, args: Vec<DecodedArg>, _outputs: Option<Vec<DecodedArg>>) {
        self.function_name = Some(name);
        self.function_args = Some(args);
    }
}

impl CallRecord for TraceRecord {
    fn to_address(&self) -> Option<&str> {
        self.to.as_deref()
    }

    fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    fn function_name(&self) -> Option<&str> {
        self.function_name.as_deref()
    }

    fn set_decoded(&mut self, name: String, args: Vec<DecodedArg>, outputs: Option<Vec<DecodedArg>>) {
        self.function_name = Some(name);
        self.function_args = Some(args);
        self.function_outputs = outputs;
    }
}
