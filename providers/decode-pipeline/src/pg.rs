//! Postgres adapters: per-chain pools, chain tables and the contract registry

use crate::bulk_writer::{BulkUpdatePlan, DecodedBatch};
use crate::config::DatabaseConfig;
use crate::coordinator::ContractRegistry;
use crate::cursors::{push_call_predicate, push_log_predicate, CallFilter, LogFilter};
use crate::error::{PipelineError, Result};
use crate::interactions::{InteractionQuery, Interactions};
use crate::store::{ChainStore, DecodedSink, TimeWindow};
use crate::types::{ChainTable, ContractGroup, ContractInstance};

use abi_decoder_provider::{DecodedArg, LogRecord, TraceRecord, TransactionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

const TRANSACTION_COLUMNS: &str = "hash, \"to\", input, status, block_number, block_hash, \
     block_timestamp, transaction_index, function_name, function_args";

const TRACE_COLUMNS: &str = "id, transaction_hash, transaction_index, trace_index, \"to\", input, \
     output, trace_type, status, block_number, block_hash, block_timestamp, function_name, \
     function_args, function_outputs";

const LOG_COLUMNS: &str = "transaction_hash, log_index, transaction_index, address, topic0, \
     topic1, topic2, topic3, data, block_number, block_hash, block_timestamp, event_name, event_args";

/// Registry tables, created on startup when missing
pub const REGISTRY_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS contracts (
        id uuid PRIMARY KEY,
        namespace text NOT NULL,
        name text NOT NULL,
        UNIQUE (namespace, name)
    )",
    "CREATE TABLE IF NOT EXISTS contract_instances (
        id uuid PRIMARY KEY,
        contract_id uuid NOT NULL REFERENCES contracts (id),
        chain_id text NOT NULL,
        address text NOT NULL,
        UNIQUE (chain_id, address)
    )",
];

/// One pool per chain schema plus the fallback pool
#[derive(Clone)]
pub struct ChainPools {
    fallback: PgPool,
    chains: HashMap<String, (String, PgPool)>,
}

impl ChainPools {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let fallback = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        let mut chains = HashMap::new();
        for (chain_id, chain) in &config.chains {
            let pool = match &chain.url {
                Some(url) => {
                    PgPoolOptions::new()
                        .max_connections(config.max_connections)
                        .connect(url)
                        .await?
                }
                None => fallback.clone(),
            };
            chains.insert(chain_id.clone(), (chain.schema.clone(), pool));
        }

        info!("Connected database pools for {} chains", chains.len());
        Ok(Self { fallback, chains })
    }

    pub fn fallback(&self) -> &PgPool {
        &self.fallback
    }

    /// Pool and schema of a chain
    pub fn for_chain(&self, chain_id: &str) -> Result<(&PgPool, &str)> {
        self.chains
            .get(chain_id)
            .map(|(schema, pool)| (pool, schema.as_str()))
            .ok_or_else(|| PipelineError::MissingChainSchema(chain_id.to_string()))
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    hash: String,
    to: Option<String>,
    input: Option<String>,
    status: Option<i32>,
    block_number: i64,
    block_hash: String,
    block_timestamp: DateTime<Utc>,
    transaction_index: i64,
    function_name: Option<String>,
    function_args: Option<Json<Vec<DecodedArg>>>,
}

impl From<TransactionRow> for TransactionRecord {
    fn from(row: TransactionRow) -> Self {
        Self {
            hash: row.hash,
            to: row.to,
            input: row.input,
            status: row.status,
            block_number: row.block_number,
            block_hash: row.block_hash,
            block_timestamp: row.block_timestamp,
            transaction_index: row.transaction_index,
            function_name: row.function_name,
            function_args: row.function_args.map(|j| j.0),
        }
    }
}

#[derive(sqlx::FromRow)]
struct TraceRow {
    id: String,
    transaction_hash: Option<String>,
    transaction_index: i64,
    trace_index: i64,
    to: Option<String>,
    input: Option<String>,
    output: Option<String>,
    trace_type: Option<String>,
    status: Option<i32>,
    block_number: i64,
    block_hash: String,
    block_timestamp: DateTime<Utc>,
    function_name: Option<String>,
    function_args: Option<Json<Vec<DecodedArg>>>,
    function_outputs: Option<Json<Vec<DecodedArg>>>,
}

impl From<TraceRow> for TraceRecord {
    fn from(row: TraceRow) -> Self {
        Self {
            id: row.id,
            transaction_hash: row.transaction_hash.unwrap_or_default(),
            transaction_index: row.transaction_index,
            trace_index: row.trace_index,
            to: row.to,
            input: row.input,
            output: row.output,
            trace_type: row.trace_type,
            status: row.status,
            block_number: row.block_number,
            block_hash: row.block_hash,
            block_timestamp: row.block_timestamp,
            function_name: row.function_name,
            function_args: row.function_args.map(|j| j.0),
            function_outputs: row.function_outputs.map(|j| j.0),
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    transaction_hash: String,
    log_index: i64,
    transaction_index: i64,
    address: String,
    topic0: Option<String>,
    topic1: Option<String>,
    topic2: Option<String>,
    topic3: Option<String>,
    data: Option<String>,
    block_number: i64,
    block_hash: String,
    block_timestamp: DateTime<Utc>,
    event_name: Option<String>,
    event_args: Option<Json<Vec<DecodedArg>>>,
}

impl From<LogRow> for LogRecord {
    fn from(row: LogRow) -> Self {
        Self {
            transaction_hash: row.transaction_hash,
            log_index: row.log_index,
            transaction_index: row.transaction_index,
            address: row.address,
            topic0: row.topic0,
            topic1: row.topic1,
            topic2: row.topic2,
            topic3: row.topic3,
            data: row.data,
            block_number: row.block_number,
            block_hash: row.block_hash,
            block_timestamp: row.block_timestamp,
            event_name: row.event_name,
            event_args: row.event_args.map(|j| j.0),
        }
    }
}

fn select(columns: &str, schema: &str, table: ChainTable) -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!(
        "SELECT {} FROM {}.{}",
        columns,
        schema,
        table.table_name()
    ))
}

/// Chain tables over `ChainPools`
pub struct PgChainStore {
    pools: ChainPools,
}

impl PgChainStore {
    pub fn new(pools: ChainPools) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl ChainStore for PgChainStore {
    async fn db_now(&self) -> Result<DateTime<Utc>> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(self.pools.fallback())
            .await?;
        Ok(now)
    }

    #[instrument(skip(self, query), fields(table = ?query.table))]
    async fn find_interactions(&self, chain_id: &str, query: &InteractionQuery) -> Result<Interactions> {
        let (pool, schema) = self.pools.for_chain(chain_id)?;
        match query.table {
            ChainTable::Transactions => {
                let mut qb = select(TRANSACTION_COLUMNS, schema, query.table);
                query.push_where(&mut qb);
                qb.push(" ORDER BY block_number, transaction_index");
                let rows: Vec<TransactionRow> = qb.build_query_as().fetch_all(pool).await?;
                Ok(Interactions::Transactions(rows.into_iter().map(Into::into).collect()))
            }
            ChainTable::Traces => {
                let mut qb = select(TRACE_COLUMNS, schema, query.table);
                query.push_where(&mut qb);
                qb.push(" ORDER BY block_number, transaction_index, trace_index");
                let rows: Vec<TraceRow> = qb.build_query_as().fetch_all(pool).await?;
                Ok(Interactions::Traces(rows.into_iter().map(Into::into).collect()))
            }
            ChainTable::Logs => {
                let mut qb = select(LOG_COLUMNS, schema, query.table);
                query.push_where(&mut qb);
                qb.push(" ORDER BY block_number, transaction_index, log_index");
                let rows: Vec<LogRow> = qb.build_query_as().fetch_all(pool).await?;
                Ok(Interactions::Logs(rows.into_iter().map(Into::into).collect()))
            }
        }
    }

    async fn transactions_by_hash(&self, chain_id: &str, hashes: &[String]) -> Result<Vec<TransactionRecord>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let (pool, schema) = self.pools.for_chain(chain_id)?;
        let mut qb = select(TRANSACTION_COLUMNS, schema, ChainTable::Transactions);
        qb.push(" WHERE hash = ANY(").push_bind(hashes.to_vec()).push(")");
        let rows: Vec<TransactionRow> = qb.build_query_as().fetch_all(pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn earliest_log_block(&self, chain_id: &str, addresses: &[String], topic0: &str) -> Result<Option<i64>> {
        if addresses.is_empty() {
            return Ok(None);
        }
        let (pool, schema) = self.pools.for_chain(chain_id)?;
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT MIN(block_number) FROM {}.logs", schema));
        qb.push(" WHERE topic0 = ").push_bind(topic0.to_lowercase());
        qb.push(" AND address = ANY(").push_bind(addresses.to_vec()).push(")");
        let block: Option<i64> = qb.build_query_scalar().fetch_one(pool).await?;
        Ok(block)
    }

    async fn earliest_log_timestamp(
        &self,
        chain_id: &str,
        filters: &[LogFilter],
        from_block: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>> {
        let (pool, schema) = self.pools.for_chain(chain_id)?;
        let mut qb = select("block_timestamp", schema, ChainTable::Logs);
        qb.push(" WHERE ");
        push_log_predicate(&mut qb, filters);
        if let Some(block) = from_block {
            qb.push(" AND block_number >= ").push_bind(block);
        }
        qb.push(" ORDER BY block_timestamp ASC LIMIT 1");
        let ts: Option<DateTime<Utc>> = qb.build_query_scalar().fetch_optional(pool).await?;
        Ok(ts)
    }

    async fn earliest_trace_timestamp(
        &self,
        chain_id: &str,
        filters: &[CallFilter],
        from_block: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>> {
        let (pool, schema) = self.pools.for_chain(chain_id)?;
        let mut qb = select("block_timestamp", schema, ChainTable::Traces);
        qb.push(" WHERE ");
        push_call_predicate(&mut qb, filters);
        if let Some(block) = from_block {
            qb.push(" AND block_number >= ").push_bind(block);
        }
        qb.push(" ORDER BY block_timestamp ASC LIMIT 1");
        let ts: Option<DateTime<Utc>> = qb.build_query_scalar().fetch_optional(pool).await?;
        Ok(ts)
    }

    async fn logs_in_window(&self, chain_id: &str, filters: &[LogFilter], window: TimeWindow) -> Result<Vec<LogRecord>> {
        let (pool, schema) = self.pools.for_chain(chain_id)?;
        let mut qb = select(LOG_COLUMNS, schema, ChainTable::Logs);
        qb.push(" WHERE ");
        push_log_predicate(&mut qb, filters);
        push_window(&mut qb, window);
        qb.push(" ORDER BY block_timestamp, transaction_index, log_index");
        let rows: Vec<LogRow> = qb.build_query_as().fetch_all(pool).await?;
        debug!("Fetched {} logs on chain {}", rows.len(), chain_id);
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn traces_in_window(
        &self,
        chain_id: &str,
        filters: &[CallFilter],
        window: TimeWindow,
    ) -> Result<Vec<TraceRecord>> {
        let (pool, schema) = self.pools.for_chain(chain_id)?;
        let mut qb = select(TRACE_COLUMNS, schema, ChainTable::Traces);
        qb.push(" WHERE ");
        push_call_predicate(&mut qb, filters);
        push_window(&mut qb, window);
        qb.push(" ORDER BY block_timestamp, transaction_index, trace_index");
        let rows: Vec<TraceRow> = qb.build_query_as().fetch_all(pool).await?;
        debug!("Fetched {} traces on chain {}", rows.len(), chain_id);
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

fn push_window(qb: &mut QueryBuilder<'_, Postgres>, window: TimeWindow) {
    qb.push(" AND block_timestamp >= ").push_bind(window.start);
    qb.push(" AND block_timestamp < ").push_bind(window.end);
}

#[async_trait]
impl DecodedSink for PgChainStore {
    #[instrument(skip(self, batch), fields(table = ?batch.table(), rows = batch.len()))]
    async fn apply_decoded(&self, chain_id: &str, batch: &DecodedBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let (pool, schema) = self.pools.for_chain(chain_id)?;
        let plan = BulkUpdatePlan::new(schema, batch.table());
        let rows = batch.rows()?;

        // Dropping the transaction without commit rolls it back
        let mut tx = pool.begin().await?;
        sqlx::query(&plan.create_table_sql()).execute(&mut *tx).await?;
        for mut insert in plan.insert_statements(&rows) {
            insert.build().execute(&mut *tx).await?;
        }
        let updated = sqlx::query(&plan.update_sql()).execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(
            "Updated {} {} rows on chain {}",
            updated.rows_affected(),
            batch.table().table_name(),
            chain_id
        );
        Ok(())
    }
}

/// Contract and instance rows on the fallback database
pub struct PgContractRegistry {
    pool: PgPool,
}

impl PgContractRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in REGISTRY_SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    chain_id: String,
    address: String,
}

const INSTANCES_BY_CONTRACT: &str = "SELECT i.chain_id, i.address FROM contract_instances i \
     JOIN contracts c ON c.id = i.contract_id";

#[async_trait]
impl ContractRegistry for PgContractRegistry {
    async fn namespace_instances(&self, namespace: &str) -> Result<Vec<ContractInstance>> {
        let rows: Vec<InstanceRow> =
            sqlx::query_as(&format!("{} WHERE c.namespace = $1", INSTANCES_BY_CONTRACT))
                .bind(namespace)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|r| ContractInstance::new(&r.chain_id, &r.address))
            .collect())
    }

    async fn group_instances(&self, group: &ContractGroup) -> Result<Vec<ContractInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "{} WHERE c.namespace = $1 AND c.name = $2",
            INSTANCES_BY_CONTRACT
        ))
        .bind(&group.namespace)
        .bind(&group.name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ContractInstance::new(&r.chain_id, &r.address))
            .collect())
    }

    #[instrument(skip(self, instances), fields(group = %group.full_name(), count = instances.len()))]
    async fn create_instances(&self, group: &ContractGroup, instances: &[ContractInstance]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let contract_id: String = sqlx::query_scalar(
            "INSERT INTO contracts (id, namespace, name) VALUES ($1::uuid, $2, $3)
             ON CONFLICT (namespace, name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id::text",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&group.namespace)
        .bind(&group.name)
        .fetch_one(&mut *tx)
        .await?;

        for instance in instances {
            sqlx::query(
                "INSERT INTO contract_instances (id, contract_id, chain_id, address)
                 VALUES ($1::uuid, $2::uuid, $3, $4)
                 ON CONFLICT (chain_id, address) DO NOTHING",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&contract_id)
            .bind(&instance.chain_id)
            .bind(&instance.address)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!("Registered {} instances", instances.len());
        Ok(())
    }
}
