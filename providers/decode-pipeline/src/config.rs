//! Configuration for the decode pipeline provider

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;

/// Average block time for chains without an explicit setting
pub const DEFAULT_BLOCK_TIME_SECS: f64 = 12.0;

/// Decode pipeline provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodePipelineConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub nats_url: String,
    pub bulk_write: BulkWriteConfig,
    pub generator: GeneratorConfig,
    pub relay: RelayConfig,
}

/// One Postgres pool per chain schema plus a fallback pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Fallback database URL, also hosts the contract registry tables
    pub url: String,
    /// Chain id -> schema
    pub chains: BTreeMap<String, ChainSchemaConfig>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSchemaConfig {
    pub schema: String,
    /// Dedicated database URL; the fallback pool is used when absent
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkWriteConfig {
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Blocks per window on the fastest involved chain
    pub target_batch_size: u64,
    /// Chain id -> average block time in seconds
    pub block_times: HashMap<String, f64>,
    pub max_parallel_chains: usize,
    /// Wall-clock budget of one `next_batch` call
    pub time_budget_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Approximate max length of each durable per-name log
    pub stream_max_len: usize,
}

impl Default for BulkWriteConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay_ms: 50,
            max_delay_ms: 500,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            target_batch_size: 100,
            block_times: default_block_times(),
            max_parallel_chains: 4,
            time_budget_ms: 20_000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stream_max_len: 5000,
        }
    }
}

impl GeneratorConfig {
    pub fn block_time(&self, chain_id: &str) -> f64 {
        self.block_times
            .get(chain_id)
            .copied()
            .unwrap_or(DEFAULT_BLOCK_TIME_SECS)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}

fn default_block_times() -> HashMap<String, f64> {
    [
        ("1", 12.0),
        ("10", 2.0),
        ("137", 2.0),
        ("8453", 2.0),
        ("42161", 0.25),
        ("11155111", 12.0),
    ]
    .into_iter()
    .map(|(chain, secs)| (chain.to_string(), secs))
    .collect()
}

/// Parse `1=ethereum,137=polygon` style lists
fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let (key, value) = (key.trim(), value.trim());
            (!key.is_empty() && !value.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !value.starts_with(|c: char| c.is_ascii_digit())
}

impl DecodePipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let url = env::var("DECODE_PIPELINE_DATABASE_URL")
            .context("DECODE_PIPELINE_DATABASE_URL environment variable is required")?;

        let chains = parse_pairs(&env::var("DECODE_PIPELINE_CHAINS").unwrap_or_default())
            .into_iter()
            .map(|(chain_id, schema)| {
                let url = env::var(format!("DECODE_PIPELINE_DATABASE_URL_{}", chain_id)).ok();
                (chain_id, ChainSchemaConfig { schema, url })
            })
            .collect();

        let database = DatabaseConfig {
            url,
            chains,
            max_connections: env_or("DECODE_PIPELINE_DB_MAX_CONNECTIONS", 10),
        };

        let redis = RedisConfig {
            url: env::var("DECODE_PIPELINE_REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: env::var("DECODE_PIPELINE_REDIS_KEY_PREFIX").unwrap_or_default(),
        };

        let nats_url = env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let bulk_defaults = BulkWriteConfig::default();
        let bulk_write = BulkWriteConfig {
            max_attempts: env_or("DECODE_PIPELINE_BULK_MAX_ATTEMPTS", bulk_defaults.max_attempts),
            min_delay_ms: env_or("DECODE_PIPELINE_BULK_MIN_DELAY_MS", bulk_defaults.min_delay_ms),
            max_delay_ms: env_or("DECODE_PIPELINE_BULK_MAX_DELAY_MS", bulk_defaults.max_delay_ms),
        };

        let mut block_times = default_block_times();
        if let Ok(raw) = env::var("DECODE_PIPELINE_BLOCK_TIMES") {
            for (chain_id, secs) in parse_pairs(&raw) {
                let secs: f64 = secs
                    .parse()
                    .with_context(|| format!("Invalid block time for chain {}", chain_id))?;
                block_times.insert(chain_id, secs);
            }
        }

        let generator_defaults = GeneratorConfig::default();
        let generator = GeneratorConfig {
            target_batch_size: env_or(
                "DECODE_PIPELINE_TARGET_BATCH_SIZE",
                generator_defaults.target_batch_size,
            ),
            block_times,
            max_parallel_chains: env_or(
                "DECODE_PIPELINE_MAX_PARALLEL_CHAINS",
                generator_defaults.max_parallel_chains,
            ),
            time_budget_ms: env_or(
                "DECODE_PIPELINE_TIME_BUDGET_MS",
                generator_defaults.time_budget_ms,
            ),
        };

        let relay = RelayConfig {
            stream_max_len: env_or(
                "DECODE_PIPELINE_STREAM_MAX_LEN",
                RelayConfig::default().stream_max_len,
            ),
        };

        let config = Self {
            database,
            redis,
            nats_url,
            bulk_write,
            generator,
            relay,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(anyhow::anyhow!("Database URL cannot be empty"));
        }

        for (chain_id, chain) in &self.database.chains {
            if !is_identifier(&chain.schema) {
                return Err(anyhow::anyhow!(
                    "Invalid schema name for chain {}: {}",
                    chain_id,
                    chain.schema
                ));
            }
        }

        if self.redis.url.is_empty() {
            return Err(anyhow::anyhow!("Redis URL cannot be empty"));
        }

        if self.bulk_write.max_attempts == 0 {
            return Err(anyhow::anyhow!("Bulk write attempts must be greater than 0"));
        }

        if self.bulk_write.min_delay_ms > self.bulk_write.max_delay_ms {
            return Err(anyhow::anyhow!(
                "Bulk write min delay cannot exceed max delay"
            ));
        }

        if self.generator.target_batch_size == 0 || self.generator.max_parallel_chains == 0 {
            return Err(anyhow::anyhow!(
                "Generator batch size and parallelism must be greater than 0"
            ));
        }

        if self.generator.block_times.values().any(|secs| *secs <= 0.0) {
            return Err(anyhow::anyhow!("Block times must be positive"));
        }

        Ok(())
    }
}

impl Default for DecodePipelineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost:5432/chains".to_string(),
                chains: BTreeMap::new(),
                max_connections: 10,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                key_prefix: String::new(),
            },
            nats_url: "nats://localhost:4222".to_string(),
            bulk_write: BulkWriteConfig::default(),
            generator: GeneratorConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}
