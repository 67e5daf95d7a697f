//! Contract interaction finder
//!
//! Finds transactions, traces or logs touching a set of addresses in an
//! inclusive block range. Failures surface as `PipelineError::Query`; an
//! empty result means nothing matched.

use crate::cursors::push_bind_list;
use crate::error::Result;
use crate::store::ChainStore;
use crate::types::ChainTable;

use abi_decoder_provider::{LogRecord, TraceRecord, TransactionRecord};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionQuery {
    pub table: ChainTable,
    pub start_block: i64,
    pub end_block: i64,
    pub addresses: Vec<String>,
    /// Also return rows that already carry decoded fields
    #[serde(default)]
    pub include_decoded: bool,
}

impl InteractionQuery {
    /// Undecoded rows of `table` at exactly one block
    pub fn at_block(table: ChainTable, block_number: i64, addresses: &[String]) -> Self {
        Self {
            table,
            start_block: block_number,
            end_block: block_number,
            addresses: addresses.iter().map(|a| a.to_lowercase()).collect(),
            include_decoded: false,
        }
    }

    /// Append `WHERE ...` for this query
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        if self.start_block == self.end_block {
            qb.push(" WHERE block_number = ").push_bind(self.start_block);
        } else {
            qb.push(" WHERE block_number >= ").push_bind(self.start_block);
            qb.push(" AND block_number <= ").push_bind(self.end_block);
        }

        qb.push(" AND ").push(self.table.address_column()).push(" IN (");
        push_bind_list(qb, &self.addresses);
        qb.push(")");

        if !self.include_decoded {
            qb.push(" AND ").push(self.table.decoded_column()).push(" IS NULL");
        }
    }

    fn in_range(&self, block_number: i64) -> bool {
        block_number >= self.start_block && block_number <= self.end_block
    }

    fn has_address(&self, address: Option<&str>) -> bool {
        address
            .map(|a| self.addresses.iter().any(|x| x.eq_ignore_ascii_case(a)))
            .unwrap_or(false)
    }

    pub fn matches_transaction(&self, tx: &TransactionRecord) -> bool {
        self.in_range(tx.block_number)
            && self.has_address(tx.to.as_deref())
            && (self.include_decoded || tx.function_name.is_none())
    }

    pub fn matches_trace(&self, trace: &TraceRecord) -> bool {
        self.in_range(trace.block_number)
            && self.has_address(trace.to.as_deref())
            && (self.include_decoded || trace.function_name.is_none())
    }

    pub fn matches_log(&self, log: &LogRecord) -> bool {
        self.in_range(log.block_number)
            && self.has_address(Some(&log.address))
            && (self.include_decoded || log.event_name.is_none())
    }
}

/// Rows returned by the finder, one variant per table
#[derive(Debug, Clone, PartialEq)]
pub enum Interactions {
    Transactions(Vec<TransactionRecord>),
    Traces(Vec<TraceRecord>),
    Logs(Vec<LogRecord>),
}

impl Interactions {
    pub fn len(&self) -> usize {
        match self {
            Interactions::Transactions(rows) => rows.len(),
            Interactions::Traces(rows) => rows.len(),
            Interactions::Logs(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_transactions(self) -> Vec<TransactionRecord> {
        match self {
            Interactions::Transactions(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn into_traces(self) -> Vec<TraceRecord> {
        match self {
            Interactions::Traces(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn into_logs(self) -> Vec<LogRecord> {
        match self {
            Interactions::Logs(rows) => rows,
            _ => Vec::new(),
        }
    }
}

pub struct InteractionFinder {
    store: Arc<dyn ChainStore>,
}

impl InteractionFinder {
    pub fn new(store: Arc<dyn ChainStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, query), fields(table = ?query.table, start = query.start_block, end = query.end_block))]
    pub async fn find_interactions(&self, chain_id: &str, query: &InteractionQuery) -> Result<Interactions> {
        if query.addresses.is_empty() {
            return Ok(empty(query.table));
        }
        let found = self.store.find_interactions(chain_id, query).await?;
        debug!("Found {} interactions on chain {}", found.len(), chain_id);
        Ok(found)
    }
}

fn empty(table: ChainTable) -> Interactions {
    match table {
        ChainTable::Transactions => Interactions::Transactions(Vec::new()),
        ChainTable::Traces => Interactions::Traces(Vec::new()),
        ChainTable::Logs => Interactions::Logs(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block_collapses_range() {
        let query = InteractionQuery::at_block(ChainTable::Logs, 100, &["0xABC".to_string()]);
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM ethereum.logs");
        query.push_where(&mut qb);
        assert_eq!(
            qb.sql(),
            "SELECT * FROM ethereum.logs WHERE block_number = $1 AND address IN ($2) AND event_name IS NULL"
        );
    }

    #[test]
    fn test_range_on_transactions() {
        let query = InteractionQuery {
            table: ChainTable::Transactions,
            start_block: 10,
            end_block: 20,
            addresses: vec!["0xa".to_string(), "0xb".to_string()],
            include_decoded: true,
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM t");
        query.push_where(&mut qb);
        assert_eq!(
            qb.sql(),
            "SELECT * FROM t WHERE block_number >= $1 AND block_number <= $2 AND \"to\" IN ($3, $4)"
        );
    }

    #[test]
    fn test_empty_interactions_helpers() {
        let found = empty(ChainTable::Traces);
        assert!(found.is_empty());
        assert!(found.into_traces().is_empty());
    }
}
