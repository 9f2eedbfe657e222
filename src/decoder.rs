//! ABI-driven log decoding.
//!
//! [`EventDecoder`] maps `topics[0]` to an event definition taken from a
//! JSON ABI and turns a raw log into an event name plus a map of named
//! parameters. It holds no mutable state and is safe to share across tasks
//! once built.

use std::collections::{BTreeMap, HashMap};

use alloy::{
    dyn_abi::{DynSolValue, EventExt},
    json_abi::{Event, JsonAbi},
    primitives::B256,
    rpc::types::Log,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("log has no topics")]
    NoTopics,

    #[error("no event in the ABI matches signature {0}")]
    UnknownSignature(B256),

    #[error("topic count mismatch: expected {expected} indexed topics, got {got}")]
    TopicCountMismatch { expected: usize, got: usize },

    #[error("invalid ABI JSON: {0}")]
    InvalidAbi(#[from] serde_json::Error),

    #[error("failed to decode log: {0}")]
    DecodeFailed(String),
}

/// A decoded log: the event's name plus its parameters by name.
///
/// Parameter values are rendered as JSON so sinks can serialize them
/// without knowing Solidity types: integers become decimal strings (they
/// routinely exceed 64 bits), addresses and byte values become 0x-hex.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedEvent {
    pub name: String,
    pub params: BTreeMap<String, Value>,
}

/// Immutable `topics[0] -> event` registry built from a JSON ABI.
pub struct EventDecoder {
    events: HashMap<B256, Event>,
}

impl EventDecoder {
    /// Parses a JSON ABI (the standard compiler output) and indexes every
    /// event it declares by signature hash.
    pub fn from_json(abi_json: &str) -> Result<Self, DecodeError> {
        let abi: JsonAbi = serde_json::from_str(abi_json)?;
        let mut events = HashMap::new();
        for event in abi.events() {
            events.insert(event.selector(), event.clone());
        }
        Ok(Self { events })
    }

    /// Number of registered event signatures.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Decodes one log against the registry.
    ///
    /// Indexed parameters come from `topics[1..]`, the rest from the data
    /// payload. Indexed reference types (strings, bytes, arrays) are
    /// stored on chain as their keccak hash; they decode to that 32-byte
    /// value, not the original.
    ///
    /// # Errors
    ///
    /// * [`DecodeError::NoTopics`] - the log carries no topics at all.
    /// * [`DecodeError::UnknownSignature`] - `topics[0]` is not in the registry.
    /// * [`DecodeError::TopicCountMismatch`] - indexed arity doesn't match the ABI.
    /// * [`DecodeError::DecodeFailed`] - the payload doesn't fit the ABI types.
    pub fn decode(&self, log: &Log) -> Result<DecodedEvent, DecodeError> {
        let topics = log.topics();
        let Some(signature) = topics.first() else {
            return Err(DecodeError::NoTopics);
        };

        let event =
            self.events.get(signature).ok_or(DecodeError::UnknownSignature(*signature))?;

        let indexed_count = event.inputs.iter().filter(|input| input.indexed).count();
        if topics.len() - 1 != indexed_count {
            return Err(DecodeError::TopicCountMismatch {
                expected: indexed_count,
                got: topics.len() - 1,
            });
        }

        let decoded = event
            .decode_log_parts(topics.iter().copied(), log.data().data.as_ref())
            .map_err(|e| DecodeError::DecodeFailed(e.to_string()))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut params = BTreeMap::new();
        for input in &event.inputs {
            let value = if input.indexed { indexed.next() } else { body.next() };
            let Some(value) = value else {
                return Err(DecodeError::DecodeFailed(format!(
                    "no decoded value for parameter `{}`",
                    input.name
                )));
            };
            params.insert(input.name.clone(), render(&value));
        }

        Ok(DecodedEvent { name: event.name.clone(), params })
    }
}

impl std::fmt::Debug for EventDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDecoder").field("events", &self.events.len()).finish()
    }
}

fn render(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::Address(a) => Value::String(format!("{a:#x}")),
        DynSolValue::Function(f) => Value::String(alloy::primitives::hex::encode_prefixed(f.as_slice())),
        DynSolValue::FixedBytes(bytes, size) => {
            Value::String(alloy::primitives::hex::encode_prefixed(&bytes[..*size]))
        }
        DynSolValue::Bytes(bytes) => Value::String(alloy::primitives::hex::encode_prefixed(bytes)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(values)
        | DynSolValue::FixedArray(values)
        | DynSolValue::Tuple(values) => Value::Array(values.iter().map(render).collect()),
    }
}
