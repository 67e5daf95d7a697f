//! Error types for the decode pipeline

use thiserror::Error;

const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A query against chain tables failed. Distinct from finding nothing.
    #[error("Query error: {0}")]
    Query(String),

    /// Deadlock or serialization failure; the transaction may be retried
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No schema configured for chain {0}")]
    MissingChainSchema(String),

    #[error("No ABI stored for contract group {0}")]
    MissingGroupAbi(String),

    #[error("Invalid contract group name: {0}")]
    InvalidGroupName(String),

    /// Tail of a hash-chained log without a readable id
    #[error("Unreadable hash chain tail in {log} at {nonce}")]
    BrokenChain { log: String, nonce: String },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decoder error: {0}")]
    Decoder(#[from] abi_decoder_provider::DecoderError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    /// Write-write conflict reported by the database
    pub fn is_deadlock(&self) -> bool {
        match self {
            PipelineError::Conflict(_) => true,
            PipelineError::Query(message) => message.to_lowercase().contains("deadlock"),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        let code = err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.into_owned());
        match code.as_deref() {
            Some(DEADLOCK_DETECTED) | Some(SERIALIZATION_FAILURE) => {
                PipelineError::Conflict(err.to_string())
            }
            _ => PipelineError::Query(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
