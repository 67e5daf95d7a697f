//! JSON ABI model used by the decoder and the ABI store.
//!
//! Items carry a precomputed `signature`: the 4-byte selector for functions
//! and errors, the 32-byte topic for events. Items stored without one get it
//! computed from `name(type,...)` before they are used for matching.

use crate::types::DecoderError;
use alloy_dyn_abi::DynSolType;
use alloy_primitives::{hex, keccak256};
use serde::{Deserialize, Serialize};

/// A contract ABI: ordered list of items
pub type Abi = Vec<AbiItem>;

/// ABI item type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbiItemKind {
    #[default]
    Function,
    Event,
    Constructor,
    Fallback,
    Receive,
    Error,
}

/// ABI parameter (function input/output or event argument)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    /// Parameter name (may be empty)
    #[serde(default)]
    pub name: String,
    /// Solidity type, e.g. `uint256`, `address[]`, `tuple[2]`
    #[serde(rename = "type")]
    pub param_type: String,
    /// Whether the argument is stored in a topic (events only)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub indexed: bool,
    /// Components for tuple types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<AbiParam>>,
    #[serde(
        rename = "internalType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub internal_type: Option<String>,
}

impl AbiParam {
    pub fn new(name: &str, param_type: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type: param_type.to_string(),
            indexed: false,
            components: None,
            internal_type: None,
        }
    }

    pub fn indexed(name: &str, param_type: &str) -> Self {
        Self {
            indexed: true,
            ..Self::new(name, param_type)
        }
    }

    /// Canonical type string with tuples expanded, e.g. `(address,uint256)[]`
    pub fn canonical_type(&self) -> String {
        match self.param_type.strip_prefix("tuple") {
            Some(array_suffix) => {
                let inner: Vec<String> = self
                    .components
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(AbiParam::canonical_type)
                    .collect();
                format!("({}){}", inner.join(","), array_suffix)
            }
            None => self.param_type.clone(),
        }
    }

    /// Resolve into the recursive ABI type used for decoding
    pub fn resolve(&self) -> Result<DynSolType, DecoderError> {
        let canonical = self.canonical_type();
        DynSolType::parse(&canonical).map_err(|e| {
            DecoderError::AbiParseError(format!("Unsupported type {}: {}", canonical, e))
        })
    }

    /// Type string without any array suffix (`uint256[][]` -> `uint256`)
    pub fn base_type(&self) -> &str {
        match self.param_type.find('[') {
            Some(idx) => &self.param_type[..idx],
            None => &self.param_type,
        }
    }

    pub fn is_array(&self) -> bool {
        self.param_type.ends_with(']')
    }
}

/// ABI item (function, event, constructor, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiItem {
    #[serde(rename = "type", default)]
    pub kind: AbiItemKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<AbiParam>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub anonymous: bool,
    #[serde(
        rename = "stateMutability",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub state_mutability: Option<String>,
    /// Selector (functions) or topic (events), lowercase `0x` hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl AbiItem {
    pub fn event(name: &str, inputs: Vec<AbiParam>) -> Self {
        let mut item = Self {
            kind: AbiItemKind::Event,
            name: name.to_string(),
            inputs,
            outputs: Vec::new(),
            anonymous: false,
            state_mutability: None,
            signature: None,
        };
        item.signature = item.compute_signature();
        item
    }

    pub fn function(name: &str, inputs: Vec<AbiParam>, outputs: Vec<AbiParam>) -> Self {
        let mut item = Self {
            kind: AbiItemKind::Function,
            name: name.to_string(),
            inputs,
            outputs,
            anonymous: false,
            state_mutability: None,
            signature: None,
        };
        item.signature = item.compute_signature();
        item
    }

    /// `name(type1,type2,...)`
    pub fn canonical_signature(&self) -> String {
        let types: Vec<String> = self.inputs.iter().map(AbiParam::canonical_type).collect();
        format!("{}({})", self.name, types.join(","))
    }

    /// Signature derived from name and input types; `None` for nameless items
    pub fn compute_signature(&self) -> Option<String> {
        if self.name.is_empty() {
            return None;
        }
        let hash = keccak256(self.canonical_signature().as_bytes());
        match self.kind {
            AbiItemKind::Event => Some(format!("0x{}", hex::encode(hash))),
            AbiItemKind::Function | AbiItemKind::Error => {
                Some(format!("0x{}", hex::encode(&hash[..4])))
            }
            _ => None,
        }
    }

    /// Declared signature, lowercased
    pub fn signature(&self) -> Option<String> {
        self.signature
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    pub fn is_event(&self) -> bool {
        self.kind == AbiItemKind::Event
    }

    pub fn is_function(&self) -> bool {
        self.kind == AbiItemKind::Function
    }

    /// Named event whose inputs are all named; the only events that get specs
    pub fn is_fully_named_event(&self) -> bool {
        self.is_event()
            && !self.anonymous
            && !self.name.is_empty()
            && self.inputs.iter().all(|p| !p.name.is_empty())
    }
}

/// Fill in missing signatures so every decodable item can be matched
pub fn ensure_signatures(abi: &mut [AbiItem]) {
    for item in abi.iter_mut() {
        if item.signature().is_none() {
            item.signature = item.compute_signature();
        }
    }
}

/// Parse ABI JSON and fill in missing signatures
pub fn parse_abi(abi_json: &str) -> Result<Abi, DecoderError> {
    let mut abi: Abi = serde_json::from_str(abi_json)
        .map_err(|e| DecoderError::AbiParseError(format!("Failed to parse ABI JSON: {}", e)))?;
    ensure_signatures(&mut abi);
    Ok(abi)
}

/// Find a function by its 4-byte selector (`0x` + 8 hex chars)
pub fn function_by_selector<'a>(abi: &'a [AbiItem], selector: &str) -> Option<&'a AbiItem> {
    let selector = selector.to_lowercase();
    abi.iter()
        .filter(|item| item.is_function())
        .find(|item| item.signature().as_deref() == Some(selector.as_str()))
}

/// Find a non-anonymous event by its topic0
pub fn event_by_topic<'a>(abi: &'a [AbiItem], topic: &str) -> Option<&'a AbiItem> {
    let topic = topic.to_lowercase();
    abi.iter()
        .filter(|item| item.is_event() && !item.anonymous)
        .find(|item| item.signature().as_deref() == Some(topic.as_str()))
}

/// Merge `incoming` items into `existing`; items already present by
/// signature are kept untouched.
pub fn merge_abis(existing: &[AbiItem], incoming: &[AbiItem]) -> Abi {
    let mut merged: Abi = existing.to_vec();
    ensure_signatures(&mut merged);
    let mut known: std::collections::HashSet<String> =
        merged.iter().filter_map(AbiItem::signature).collect();
    for item in incoming {
        let mut item = item.clone();
        if item.signature().is_none() {
            item.signature = item.compute_signature();
        }
        let repeated = item.signature().is_some_and(|sig| !known.insert(sig));
        if !repeated {
            merged.push(item);
        }
    }
    merged
}
