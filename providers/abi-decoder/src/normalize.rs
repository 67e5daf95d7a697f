//! Convert decoded ABI values into JSON by declared Solidity type

use crate::abi::AbiParam;
use alloy_dyn_abi::DynSolValue;
use alloy_primitives::hex;
use serde_json::{Map, Value};

/// Largest integer a JSON consumer can hold without losing precision
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Normalize one decoded value against its parameter declaration
pub fn normalize_value(param: &AbiParam, value: &DynSolValue) -> Value {
    to_json(value, param.components.as_deref())
}

fn to_json(value: &DynSolValue, components: Option<&[AbiParam]>) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Uint(v, _) => match u64::try_from(*v) {
            Ok(n) if n <= MAX_SAFE_INTEGER => Value::from(n),
            _ => Value::String(v.to_string()),
        },
        DynSolValue::Int(v, _) => match i64::try_from(*v) {
            Ok(n) if n.unsigned_abs() <= MAX_SAFE_INTEGER => Value::from(n),
            _ => Value::String(v.to_string()),
        },
        DynSolValue::Address(addr) => Value::String(format!("0x{}", hex::encode(addr.as_slice()))),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::Function(f) => Value::String(format!("0x{}", hex::encode(f.as_slice()))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            Value::Array(items.iter().map(|item| to_json(item, components)).collect())
        }
        DynSolValue::Tuple(items) => tuple_to_json(items, components),
    }
}

fn tuple_to_json(items: &[DynSolValue], components: Option<&[AbiParam]>) -> Value {
    let components = components.filter(|c| c.len() == items.len());
    match components {
        Some(components) if components.iter().all(|c| !c.name.is_empty()) => {
            let mut object = Map::new();
            for (component, item) in components.iter().zip(items) {
                object.insert(
                    component.name.clone(),
                    to_json(item, component.components.as_deref()),
                );
            }
            Value::Object(object)
        }
        Some(components) => Value::Array(
            components
                .iter()
                .zip(items)
                .map(|(component, item)| to_json(item, component.components.as_deref()))
                .collect(),
        ),
        None => Value::Array(items.iter().map(|item| to_json(item, None)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, I256, U256};
    use serde_json::json;

    #[test]
    fn test_small_ints_become_numbers() {
        let param = AbiParam::new("amount", "uint256");
        assert_eq!(
            normalize_value(&param, &DynSolValue::Uint(U256::from(42u64), 256)),
            json!(42)
        );
        assert_eq!(
            normalize_value(&param, &DynSolValue::Uint(U256::from(MAX_SAFE_INTEGER), 256)),
            json!(MAX_SAFE_INTEGER)
        );
        let signed = AbiParam::new("delta", "int24");
        assert_eq!(
            normalize_value(&signed, &DynSolValue::Int(I256::try_from(-7i64).unwrap(), 24)),
            json!(-7)
        );
    }

    #[test]
    fn test_large_ints_become_strings() {
        let param = AbiParam::new("amount", "uint256");
        let big = U256::from(MAX_SAFE_INTEGER) + U256::from(1u64);
        assert_eq!(
            normalize_value(&param, &DynSolValue::Uint(big, 256)),
            json!("9007199254740992")
        );
    }

    #[test]
    fn test_address_is_lowercased() {
        let addr: Address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse().unwrap();
        assert_eq!(
            normalize_value(&AbiParam::new("token", "address"), &DynSolValue::Address(addr)),
            json!("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")
        );
    }

    #[test]
    fn test_arrays_normalize_element_wise() {
        let param = AbiParam::new("flags", "bool[]");
        let value = DynSolValue::Array(vec![DynSolValue::Bool(true), DynSolValue::Bool(false)]);
        assert_eq!(normalize_value(&param, &value), json!([true, false]));
    }

    #[test]
    fn test_named_tuple_becomes_object() {
        let param = AbiParam {
            name: "order".to_string(),
            param_type: "tuple".to_string(),
            indexed: false,
            components: Some(vec![
                AbiParam::new("amount", "uint256"),
                AbiParam::new("memo", "string"),
            ]),
            internal_type: None,
        };
        let value = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(5u64), 256),
            DynSolValue::String("hi".to_string()),
        ]);
        assert_eq!(
            normalize_value(&param, &value),
            json!({"amount": 5, "memo": "hi"})
        );

        let mut unnamed = param.clone();
        if let Some(components) = unnamed.components.as_mut() {
            components[1].name.clear();
        }
        assert_eq!(normalize_value(&unnamed, &value), json!([5, "hi"]));
    }
}
