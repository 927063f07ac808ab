//! Call frames exchanged by two bridges
//!
//! Frames are JSON documents tagged by `kind`, payloads hex encoded:
//!
//! ```json
//! {"kind":"call","call_id":3,"chain_id":"…","parent":null,"function_tag":"f","payload":"0a0b"}
//! {"kind":"return","call_id":3,"chain_id":"…","outcome":{"status":"value","value":"ff"}}
//! ```

use super::bridge::CallError;
use serde::{Deserialize, Serialize};

/// Identifies one top-level call and every call nested inside it
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(uuid::Uuid);

impl ChainId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChainId({})", &self.0.to_string()[..8])
    }
}

/// A request to run `function_tag` on the other side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    pub call_id: u64,
    pub chain_id: ChainId,
    /// Call this one is nested in, by id
    pub parent: Option<u64>,
    pub function_tag: String,
    #[serde(with = "crate::encoding::hex_vec")]
    pub payload: Vec<u8>,
}

/// The single response to a [`CallFrame`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnFrame {
    pub call_id: u64,
    pub chain_id: ChainId,
    pub outcome: CallOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Value {
        #[serde(with = "crate::encoding::hex_opt")]
        value: Option<Vec<u8>>,
    },
    NoHandler {
        function_tag: String,
    },
    HandlerThrew {
        kind: String,
        message: String,
    },
}

impl CallOutcome {
    pub fn into_result(self) -> Result<Option<Vec<u8>>, CallError> {
        match self {
            CallOutcome::Value { value } => Ok(value),
            CallOutcome::NoHandler { function_tag } => Err(CallError::NoHandler(function_tag)),
            CallOutcome::HandlerThrew { kind, message } => {
                Err(CallError::HandlerThrew { kind, message })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Call(CallFrame),
    Return(ReturnFrame),
}

impl Frame {
    pub fn chain_id(&self) -> ChainId {
        match self {
            Frame::Call(c) => c.chain_id,
            Frame::Return(r) => r.chain_id,
        }
    }

    pub fn call_id(&self) -> u64 {
        match self {
            Frame::Call(c) => c.call_id,
            Frame::Return(r) => r.call_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CallError> {
        serde_json::to_vec(self).map_err(|e| CallError::Protocol(format!("encode frame: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CallError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CallError::Protocol(format!("decode frame: {}", e)))
    }
}
