//! Core ABI decoding implementation using Alloy
//!
//! Both entry points are pure: they return the record with its decode
//! fields populated, or the record unchanged when nothing matches or
//! decoding fails. Failures are logged, never returned.

use crate::abi::{event_by_topic, function_by_selector, AbiItem, AbiParam};
use crate::fallback;
use crate::normalize::normalize_value;
use crate::records::{CallRecord, DecodedArg, LogRecord};
use crate::types::DecoderError;

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::hex;
use tracing::{debug, warn};

/// Hex characters per ABI word
const WORD_HEX_LEN: usize = 64;

/// Decode a transaction or trace against an ABI.
///
/// Traces additionally get their `output` decoded against the item's outputs.
pub fn decode_function_call<R: CallRecord>(record: R, abi: &[AbiItem]) -> R {
    match try_decode_function_call(&record, abi) {
        Ok(Some((name, args, outputs))) => {
            let mut record = record;
            record.set_decoded(name, args, outputs);
            record
        }
        Ok(None) => record,
        Err(e) => {
            warn!(
                "Failed to decode call to {}: {}",
                record.to_address().unwrap_or_default(),
                e
            );
            record
        }
    }
}

/// Decode a log against an ABI, falling back to the well-known token
/// transfer and balance event layouts.
pub fn decode_log_event(log: LogRecord, abi: &[AbiItem]) -> LogRecord {
    match try_decode_log_event(&log, abi) {
        Ok(Some((name, args))) => {
            let mut log = log;
            log.event_name = Some(name);
            log.event_args = Some(args);
            log
        }
        Ok(None) => log,
        Err(e) => {
            warn!(
                "Failed to decode log {}:{}: {}",
                log.transaction_hash, log.log_index, e
            );
            log
        }
    }
}

type DecodedCall = (String, Vec<DecodedArg>, Option<Vec<DecodedArg>>);

fn try_decode_function_call<R: CallRecord>(
    record: &R,
    abi: &[AbiItem],
) -> Result<Option<DecodedCall>, DecoderError> {
    let input = match record.input() {
        Some(input) => strip_hex_prefix(input),
        None => return Ok(None),
    };
    let selector = match input.get(..8) {
        Some(selector) => format!("0x{}", selector.to_lowercase()),
        None => return Ok(None),
    };
    let item = match function_by_selector(abi, &selector) {
        Some(item) => item,
        None => return Ok(None),
    };

    let arg_hex = &input[8..];
    let args = decode_call_inputs(item, arg_hex)?;

    let outputs = match record.output().map(strip_hex_prefix) {
        Some(output) if !output.is_empty() && !item.outputs.is_empty() => {
            match decode_hex(output).and_then(|bytes| decode_params(&item.outputs, &bytes)) {
                Ok(outputs) => Some(sanitize(outputs)),
                Err(e) => {
                    debug!("Could not decode outputs of {}: {}", item.name, e);
                    None
                }
            }
        }
        _ => None,
    };

    Ok(Some((item.name.clone(), sanitize(args), outputs)))
}

/// Decode call arguments, retrying with fewer inputs when the ABI declares
/// more positional arguments than the payload has words.
fn decode_call_inputs(item: &AbiItem, arg_hex: &str) -> Result<Vec<DecodedArg>, DecoderError> {
    let bytes = decode_hex(arg_hex)?;
    match decode_params(&item.inputs, &bytes) {
        Ok(args) => Ok(args),
        Err(e) => {
            let words = arg_hex.len() / WORD_HEX_LEN;
            if arg_hex.len() % WORD_HEX_LEN == 0 && item.inputs.len() > words {
                debug!(
                    "Retrying {} with {} of {} declared inputs",
                    item.name,
                    words,
                    item.inputs.len()
                );
                decode_params(&item.inputs[..words], &bytes)
            } else {
                Err(e)
            }
        }
    }
}

/// Decode ABI-encoded parameters and pair them with their declarations
pub fn decode_params(params: &[AbiParam], data: &[u8]) -> Result<Vec<DecodedArg>, DecoderError> {
    let types = params
        .iter()
        .map(AbiParam::resolve)
        .collect::<Result<Vec<_>, _>>()?;
    let decoded = DynSolType::Tuple(types)
        .abi_decode_params(data)
        .map_err(|e| DecoderError::InputDecodeError(e.to_string()))?;
    let values = match decoded {
        DynSolValue::Tuple(values) => values,
        other => vec![other],
    };
    if values.len() != params.len() {
        return Err(DecoderError::InputDecodeError(format!(
            "Expected {} values, decoded {}",
            params.len(),
            values.len()
        )));
    }
    Ok(params
        .iter()
        .zip(values.iter())
        .map(|(param, value)| to_arg(param, value))
        .collect())
}

fn try_decode_log_event(
    log: &LogRecord,
    abi: &[AbiItem],
) -> Result<Option<(String, Vec<DecodedArg>)>, DecoderError> {
    let topic0 = match log.topic0.as_deref() {
        Some(topic) if !topic.is_empty() => topic,
        _ => return Ok(None),
    };

    let primary_error = match event_by_topic(abi, topic0) {
        Some(item) => match decode_event(item, log) {
            Ok(args) => return Ok(Some((item.name.clone(), sanitize(args)))),
            Err(e) => Some(e),
        },
        None => None,
    };

    if let Some((name, args)) = fallback::decode_transfer(log) {
        return Ok(Some((name, sanitize(args))));
    }
    if log.topic1.is_some() {
        if let Some((name, args)) = fallback::decode_balance_event(log) {
            return Ok(Some((name, sanitize(args))));
        }
    }

    match primary_error {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

/// Decode an event's indexed arguments from topics and the rest from data
pub fn decode_event(item: &AbiItem, log: &LogRecord) -> Result<Vec<DecodedArg>, DecoderError> {
    let topics = log.indexed_topics();
    let indexed_count = item.inputs.iter().filter(|p| p.indexed).count();
    if topics.len() < indexed_count {
        return Err(DecoderError::InputDecodeError(format!(
            "{} expects {} indexed topics, log has {}",
            item.name,
            indexed_count,
            topics.len()
        )));
    }

    let mut indexed = Vec::with_capacity(indexed_count);
    for (param, topic) in item.inputs.iter().filter(|p| p.indexed).zip(topics) {
        indexed.push(decode_topic(param, topic)?);
    }

    let body: Vec<AbiParam> = item.inputs.iter().filter(|p| !p.indexed).cloned().collect();
    let data = decode_hex(strip_hex_prefix(log.data.as_deref().unwrap_or_default()))?;
    let non_indexed = decode_params(&body, &data)?;

    let mut indexed = indexed.into_iter();
    let mut non_indexed = non_indexed.into_iter();
    let mut args = Vec::with_capacity(item.inputs.len());
    for param in &item.inputs {
        let next = if param.indexed {
            indexed.next()
        } else {
            non_indexed.next()
        };
        match next {
            Some(arg) => args.push(arg),
            None => {
                return Err(DecoderError::InputDecodeError(format!(
                    "Missing value for {}.{}",
                    item.name, param.name
                )))
            }
        }
    }
    Ok(args)
}

/// Indexed reference types are stored as their hash; keep the raw topic.
fn decode_topic(param: &AbiParam, topic: &str) -> Result<DecodedArg, DecoderError> {
    let ty = param.resolve()?;
    let hashed = matches!(
        ty,
        DynSolType::String
            | DynSolType::Bytes
            | DynSolType::Array(_)
            | DynSolType::FixedArray(_, _)
            | DynSolType::Tuple(_)
    );
    if hashed {
        return Ok(DecodedArg::new(
            &param.name,
            &param.param_type,
            serde_json::Value::String(topic.to_lowercase()),
        ));
    }
    let word = decode_hex(strip_hex_prefix(topic))?;
    if word.len() != 32 {
        return Err(DecoderError::InputDecodeError(format!(
            "Topic for {} is {} bytes",
            param.name,
            word.len()
        )));
    }
    let value = ty
        .abi_decode(&word)
        .map_err(|e| DecoderError::InputDecodeError(e.to_string()))?;
    Ok(to_arg(param, &value))
}

fn to_arg(param: &AbiParam, value: &DynSolValue) -> DecodedArg {
    DecodedArg::new(&param.name, &param.param_type, normalize_value(param, value))
}

/// Drop argument sets that would not survive storage as JSON
fn sanitize(args: Vec<DecodedArg>) -> Vec<DecodedArg> {
    if survives_json_round_trip(&args) {
        args
    } else {
        warn!("Dropping decoded arguments that fail the JSON round trip");
        Vec::new()
    }
}

/// Serialize, parse back, compare; also rejects NUL characters that JSON
/// columns refuse.
pub fn survives_json_round_trip(args: &[DecodedArg]) -> bool {
    let serialized = match serde_json::to_string(args) {
        Ok(serialized) => serialized,
        Err(_) => return false,
    };
    if serialized.contains("\\u0000") {
        return false;
    }
    serde_json::from_str::<Vec<DecodedArg>>(&serialized)
        .map(|parsed| parsed == args)
        .unwrap_or(false)
}

pub(crate) fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

pub(crate) fn decode_hex(value: &str) -> Result<Vec<u8>, DecoderError> {
    hex::decode(value).map_err(|e| DecoderError::InputDecodeError(format!("Invalid hex: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{TraceRecord, TransactionRecord};
    use alloy_primitives::{keccak256, Address, U256};
    use chrono::Utc;
    use serde_json::json;

    fn transfer_fn() -> AbiItem {
        AbiItem::function(
            "transfer",
            vec![AbiParam::new("to", "address"), AbiParam::new("amount", "uint256")],
            vec![AbiParam::new("success", "bool")],
        )
    }

    fn tx(input: &str) -> TransactionRecord {
        TransactionRecord {
            hash: "0xhash".to_string(),
            to: Some("0xtoken".to_string()),
            input: Some(input.to_string()),
            status: Some(1),
            block_number: 10,
            block_hash: "0xblock".to_string(),
            block_timestamp: Utc::now(),
            transaction_index: 0,
            function_name: None,
            function_args: None,
        }
    }

    fn encode_call(selector: &str, values: Vec<DynSolValue>) -> String {
        format!(
            "{}{}",
            selector,
            hex::encode(DynSolValue::Tuple(values).abi_encode_params())
        )
    }

    fn recipient() -> Address {
        "0x1111111111111111111111111111111111111111".parse().unwrap()
    }

    #[test]
    fn test_decode_function_call_round_trip() {
        let input = encode_call(
            "0xa9059cbb",
            vec![
                DynSolValue::Address(recipient()),
                DynSolValue::Uint(U256::from(1_000u64), 256),
            ],
        );
        let decoded = decode_function_call(tx(&input), &[transfer_fn()]);
        assert_eq!(decoded.function_name.as_deref(), Some("transfer"));
        assert_eq!(
            decoded.function_args,
            Some(vec![
                DecodedArg::new("to", "address", json!("0x1111111111111111111111111111111111111111")),
                DecodedArg::new("amount", "uint256", json!(1000)),
            ])
        );
    }

    #[test]
    fn test_no_matching_selector_is_identity() {
        let record = tx("0xdeadbeef");
        assert_eq!(decode_function_call(record.clone(), &[transfer_fn()]), record);

        let empty = tx("0x");
        assert_eq!(decode_function_call(empty.clone(), &[transfer_fn()]), empty);
    }

    #[test]
    fn test_malformed_payload_is_identity() {
        let record = tx("0xa9059cbb1234");
        assert_eq!(decode_function_call(record.clone(), &[transfer_fn()]), record);
    }

    #[test]
    fn test_non_ascii_input_is_identity() {
        let split_selector = tx("0xabcdefaé0000");
        assert_eq!(
            decode_function_call(split_selector.clone(), &[transfer_fn()]),
            split_selector
        );

        let bad_args = tx("0xa9059cbbé");
        assert_eq!(decode_function_call(bad_args.clone(), &[transfer_fn()]), bad_args);
    }

    #[test]
    fn test_over_counted_inputs_retry() {
        let item = AbiItem::function(
            "transfer",
            vec![
                AbiParam::new("to", "address"),
                AbiParam::new("amount", "uint256"),
                AbiParam::new("memo", "uint256"),
            ],
            vec![],
        );
        // Selector follows the declared three inputs; payload has two words
        let selector = item.signature().unwrap();
        let input = encode_call(
            &selector,
            vec![
                DynSolValue::Address(recipient()),
                DynSolValue::Uint(U256::from(7u64), 256),
            ],
        );
        let decoded = decode_function_call(tx(&input), &[item]);
        let args = decoded.function_args.expect("decoded with fewer inputs");
        assert_eq!(args.len(), 2);
        assert_eq!(args[1].value, json!(7));
    }

    #[test]
    fn test_trace_outputs_decoded() {
        let input = encode_call(
            "0xa9059cbb",
            vec![
                DynSolValue::Address(recipient()),
                DynSolValue::Uint(U256::from(1u64), 256),
            ],
        );
        let output = format!(
            "0x{}",
            hex::encode(DynSolValue::Tuple(vec![DynSolValue::Bool(true)]).abi_encode_params())
        );
        let trace = TraceRecord {
            id: "call_0x_1".to_string(),
            transaction_hash: "0xhash".to_string(),
            transaction_index: 0,
            trace_index: 1,
            to: Some("0xtoken".to_string()),
            input: Some(input),
            output: Some(output),
            trace_type: Some("call".to_string()),
            status: Some(1),
            block_number: 10,
            block_hash: "0xblock".to_string(),
            block_timestamp: Utc::now(),
            function_name: None,
            function_args: None,
            function_outputs: None,
        };
        let decoded = decode_function_call(trace, &[transfer_fn()]);
        assert_eq!(decoded.function_name.as_deref(), Some("transfer"));
        assert_eq!(
            decoded.function_outputs,
            Some(vec![DecodedArg::new("success", "bool", json!(true))])
        );
    }

    fn log(topics: [Option<String>; 4], data: String) -> LogRecord {
        let [topic0, topic1, topic2, topic3] = topics;
        LogRecord {
            transaction_hash: "0xhash".to_string(),
            log_index: 3,
            transaction_index: 0,
            address: "0xpool".to_string(),
            topic0,
            topic1,
            topic2,
            topic3,
            data: Some(data),
            block_number: 10,
            block_hash: "0xblock".to_string(),
            block_timestamp: Utc::now(),
            event_name: None,
            event_args: None,
        }
    }

    fn padded(addr: &Address) -> String {
        format!("0x{:0>64}", hex::encode(addr.as_slice()))
    }

    #[test]
    fn test_decode_log_event_round_trip() {
        let item = AbiItem::event(
            "Swap",
            vec![
                AbiParam::indexed("sender", "address"),
                AbiParam::new("amountIn", "uint256"),
                AbiParam::new("path", "address[]"),
                AbiParam::indexed("to", "address"),
            ],
        );
        let data = format!(
            "0x{}",
            hex::encode(
                DynSolValue::Tuple(vec![
                    DynSolValue::Uint(U256::from(99u64), 256),
                    DynSolValue::Array(vec![DynSolValue::Address(recipient())]),
                ])
                .abi_encode_params()
            )
        );
        let record = log(
            [
                item.signature(),
                Some(padded(&recipient())),
                Some(padded(&Address::ZERO)),
                None,
            ],
            data,
        );
        let decoded = decode_log_event(record, &[item]);
        assert_eq!(decoded.event_name.as_deref(), Some("Swap"));
        let args = decoded.event_args.expect("decoded");
        let names: Vec<&str> = args.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["sender", "amountIn", "path", "to"]);
        assert_eq!(args[1].value, json!(99));
        assert_eq!(
            args[3].value,
            json!("0x0000000000000000000000000000000000000000")
        );
    }

    #[test]
    fn test_indexed_dynamic_argument_kept_as_topic() {
        let item = AbiItem::event(
            "Named",
            vec![AbiParam::indexed("label", "string"), AbiParam::new("n", "uint8")],
        );
        let label_hash = format!("0x{}", hex::encode(keccak256("hello")));
        let data = format!(
            "0x{}",
            hex::encode(
                DynSolValue::Tuple(vec![DynSolValue::Uint(U256::from(1u64), 8)])
                    .abi_encode_params()
            )
        );
        let record = log([item.signature(), Some(label_hash.clone()), None, None], data);
        let decoded = decode_log_event(record, &[item]);
        let args = decoded.event_args.expect("decoded");
        assert_eq!(args[0].value, json!(label_hash));
        assert_eq!(args[1].value, json!(1));
    }

    #[test]
    fn test_unknown_topic_is_identity() {
        let record = log(
            [Some(format!("0x{}", "ab".repeat(32))), None, None, None],
            "0x".to_string(),
        );
        assert_eq!(decode_log_event(record.clone(), &[]), record);
    }

    #[test]
    fn test_round_trip_check_rejects_nul() {
        let ok = vec![DecodedArg::new("memo", "string", json!("fine"))];
        assert!(survives_json_round_trip(&ok));
        let bad = vec![DecodedArg::new("memo", "string", json!("bad\u{0}"))];
        assert!(!survives_json_round_trip(&bad));
        assert_eq!(sanitize(bad), Vec::new());
    }
}
