//! ABI Decoder
//!
//! Pure EVM ABI decoding of transactions, traces and logs using Alloy, with
//! fallback layouts for standard token transfer events, plus the ABI store
//! the decode pipeline reads contract ABIs from.

pub mod abi;
pub mod config;
pub mod decoder;
pub mod fallback;
pub mod normalize;
pub mod records;
pub mod store;
pub mod types;

pub use abi::{ensure_signatures, merge_abis, parse_abi, Abi, AbiItem, AbiItemKind, AbiParam};
pub use config::AbiDecoderConfig;
pub use decoder::{decode_function_call, decode_log_event};
pub use records::{CallRecord, DecodedArg, LogRecord, TraceRecord, TransactionRecord};
pub use store::{AbiStore, MemoryAbiStore, RedisAbiStore};
pub use types::{CacheStats, DecoderError};
