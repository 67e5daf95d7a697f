//! Fixed layouts for token events that decode without a contract ABI
//!
//! Amounts decoded here are always base-10 strings so no precision is lost
//! regardless of magnitude.

use crate::abi::{AbiItem, AbiParam};
use crate::decoder::decode_event;
use crate::records::{DecodedArg, LogRecord};
use serde_json::Value;
use tracing::debug;

/// `Transfer(address,address,uint256)`
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
/// `TransferSingle(address,address,address,uint256,uint256)`
pub const TRANSFER_SINGLE_TOPIC: &str =
    "0xc3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62";
/// `TransferBatch(address,address,address,uint256[],uint256[])`
pub const TRANSFER_BATCH_TOPIC: &str =
    "0x4a39dc06d4c0dbc64b70af90fd698a233a518aa5d07e595d983b8c0526c8f7fb";
/// WETH `Deposit(address,uint256)`
pub const DEPOSIT_TOPIC: &str =
    "0xe1fffcc4923d04b559f4d29a8bfc6cda04eb5b0d3c460751c2402c5c5cc9109c";
/// WETH `Withdrawal(address,uint256)`
pub const WITHDRAWAL_TOPIC: &str =
    "0x7fcf532c15f0a6db0bd6d0e038bea71d30d808c7d98cb3bf7268a95bf5081b65";

fn erc20_transfer() -> AbiItem {
    AbiItem::event(
        "Transfer",
        vec![
            AbiParam::indexed("from", "address"),
            AbiParam::indexed("to", "address"),
            AbiParam::new("value", "uint256"),
        ],
    )
}

fn erc721_transfer() -> AbiItem {
    AbiItem::event(
        "Transfer",
        vec![
            AbiParam::indexed("from", "address"),
            AbiParam::indexed("to", "address"),
            AbiParam::indexed("tokenId", "uint256"),
        ],
    )
}

fn transfer_single() -> AbiItem {
    AbiItem::event(
        "TransferSingle",
        vec![
            AbiParam::indexed("operator", "address"),
            AbiParam::indexed("from", "address"),
            AbiParam::indexed("to", "address"),
            AbiParam::new("id", "uint256"),
            AbiParam::new("value", "uint256"),
        ],
    )
}

fn transfer_batch() -> AbiItem {
    AbiItem::event(
        "TransferBatch",
        vec![
            AbiParam::indexed("operator", "address"),
            AbiParam::indexed("from", "address"),
            AbiParam::indexed("to", "address"),
            AbiParam::new("ids", "uint256[]"),
            AbiParam::new("values", "uint256[]"),
        ],
    )
}

/// Special balance-affecting events tried last
fn balance_events() -> Vec<AbiItem> {
    vec![
        AbiItem::event(
            "Deposit",
            vec![
                AbiParam::indexed("dst", "address"),
                AbiParam::new("wad", "uint256"),
            ],
        ),
        AbiItem::event(
            "Withdrawal",
            vec![
                AbiParam::indexed("src", "address"),
                AbiParam::new("wad", "uint256"),
            ],
        ),
    ]
}

/// Decode `Transfer` (ERC-20 or ERC-721 by topic count), `TransferSingle`
/// or `TransferBatch` without a contract ABI.
pub fn decode_transfer(log: &LogRecord) -> Option<(String, Vec<DecodedArg>)> {
    let topic0 = log.topic0.as_deref()?.to_lowercase();
    let item = match topic0.as_str() {
        TRANSFER_TOPIC => match log.indexed_topics().len() {
            2 => erc20_transfer(),
            3 => erc721_transfer(),
            _ => return None,
        },
        TRANSFER_SINGLE_TOPIC => transfer_single(),
        TRANSFER_BATCH_TOPIC => transfer_batch(),
        _ => return None,
    };
    decode_with(&item, log)
}

/// Decode WETH-style `Deposit` / `Withdrawal`
pub fn decode_balance_event(log: &LogRecord) -> Option<(String, Vec<DecodedArg>)> {
    let topic0 = log.topic0.as_deref()?.to_lowercase();
    balance_events()
        .into_iter()
        .find(|item| item.signature().as_deref() == Some(topic0.as_str()))
        .and_then(|item| decode_with(&item, log))
}

fn decode_with(item: &AbiItem, log: &LogRecord) -> Option<(String, Vec<DecodedArg>)> {
    match decode_event(item, log) {
        Ok(args) => Some((
            item.name.clone(),
            args.into_iter()
                .map(|mut arg| {
                    arg.value = numbers_to_strings(arg.value);
                    arg
                })
                .collect(),
        )),
        Err(e) => {
            debug!("Fallback {} did not fit log: {}", item.name, e);
            None
        }
    }
}

fn numbers_to_strings(value: Value) -> Value {
    match value {
        Value::Number(n) => Value::String(n.to_string()),
        Value::Array(items) => Value::Array(items.into_iter().map(numbers_to_strings).collect()),
        other => other,
    }
}
