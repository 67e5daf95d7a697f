//! Decode Pipeline Provider
//!
//! Decodes raw EVM transactions, traces and logs of registered contracts,
//! persists the decoded fields, replays history in windowed batches, and
//! republishes decoded events as hash-chained per-name streams.

pub mod bulk_writer;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod cursors;
pub mod error;
pub mod event_log;
pub mod generator;
pub mod interactions;
pub mod memory;
pub mod nats_listener;
pub mod pg;
pub mod relay;
pub mod store;
pub mod transmit;
pub mod types;

pub use bulk_writer::{BulkWriter, DecodedBatch, FailurePolicy};
pub use cache::{PipelineCache, RedisPipelineCache};
pub use config::DecodePipelineConfig;
pub use coordinator::{ContractRegistry, DataModelDesigner, DecodeCoordinator, DecodedBlock};
pub use cursors::{CallFilter, ChainInputs, CursorBuilder, LogFilter, QueryCursor, SerializedCursor};
pub use error::{PipelineError, Result};
pub use event_log::{EventLog, LogEntry, RedisEventLog};
pub use generator::{GeneratorDeps, InputBatch, InputGenerator};
pub use interactions::{InteractionFinder, InteractionQuery, Interactions};
pub use nats_listener::{PipelineJobListener, PipelineJobListenerConfig, PipelineJobs};
pub use pg::{ChainPools, PgChainStore, PgContractRegistry};
pub use relay::{next_event_id, EventEnvelope, EventRelay};
pub use store::{ChainStore, DecodedSink, TimeWindow};
pub use transmit::{LiveTransmit, NatsTransmit};
pub use types::*;

use abi_decoder_provider::{AbiDecoderConfig, AbiStore, RedisAbiStore};
use anyhow::Context;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{info, instrument};

/// Everything the jobs need, wired to Postgres, Redis and NATS
pub struct DecodePipelineProvider {
    jobs: Arc<PipelineJobs>,
    abi_store: Arc<RedisAbiStore>,
    config: DecodePipelineConfig,
}

impl DecodePipelineProvider {
    /// Create the provider from environment configuration
    #[instrument]
    pub async fn new() -> anyhow::Result<Self> {
        info!("Initializing Decode Pipeline Provider");
        let config = DecodePipelineConfig::from_env()?;
        let abi_config = AbiDecoderConfig::from_env()?;
        Self::with_config(config, abi_config).await
    }

    pub async fn with_config(
        config: DecodePipelineConfig,
        abi_config: AbiDecoderConfig,
    ) -> anyhow::Result<Self> {
        let pools = ChainPools::connect(&config.database)
            .await
            .context("Failed to connect to Postgres")?;
        let registry = Arc::new(PgContractRegistry::new(pools.fallback().clone()));
        registry
            .ensure_schema()
            .await
            .context("Failed to create registry tables")?;
        let chain_store = Arc::new(PgChainStore::new(pools));

        let client = redis::Client::open(config.redis.url.as_str())?;
        let redis = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        let abi_store = Arc::new(RedisAbiStore::new(&abi_config).await?);
        let abis: Arc<dyn AbiStore> = abi_store.clone();
        let cache: Arc<dyn PipelineCache> =
            Arc::new(RedisPipelineCache::new(redis.clone(), &config.redis.key_prefix));
        let log = Arc::new(RedisEventLog::new(redis, config.relay.stream_max_len));

        let nats = async_nats::connect(&config.nats_url)
            .await
            .context("Failed to connect to NATS")?;
        let transmit = Arc::new(NatsTransmit::new(nats));

        let writer = Arc::new(BulkWriter::new(chain_store.clone(), config.bulk_write.clone()));
        let coordinator = Arc::new(DecodeCoordinator::new(
            registry,
            abis.clone(),
            chain_store.clone(),
            writer.clone(),
            cache.clone(),
            Arc::new(memory::LoggingDesigner::new()),
        ));
        let relay = Arc::new(EventRelay::new(chain_store.clone(), log, transmit));
        let cursor_builder = Arc::new(CursorBuilder::new(chain_store.clone(), cache.clone()));
        let generator_deps = GeneratorDeps {
            store: chain_store,
            abis,
            writer,
            cache,
        };

        let jobs = Arc::new(PipelineJobs::new(
            coordinator,
            relay,
            cursor_builder,
            generator_deps,
            config.generator.clone(),
        ));

        info!("Decode Pipeline Provider initialized successfully");
        Ok(Self {
            jobs,
            abi_store,
            config,
        })
    }

    pub fn jobs(&self) -> Arc<PipelineJobs> {
        self.jobs.clone()
    }

    /// Serve jobs until the subscription ends or shutdown is requested
    pub async fn run(self) -> anyhow::Result<()> {
        let mut listener_config = PipelineJobListenerConfig::from_env();
        listener_config.nats_url = self.config.nats_url.clone();
        let result = PipelineJobListener::new(listener_config, self.jobs)
            .start()
            .await;
        info!("ABI store cache stats: {:?}", self.abi_store.cache_stats().await);
        result
    }
}
