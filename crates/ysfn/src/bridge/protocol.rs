//! Wire types exchanged between the host and the child runtime.
//!
//! Two message shapes share one socket:
//! - **Header** (child → host, once): routing metadata for the function.
//! - **Tagged data** (both directions, repeated): `(tag, payload)` frames.

use std::fmt;

use serde::{Deserialize, Serialize};
use bytes::Bytes;

use crate::error::BridgeError;

/// Unique identifier for a relay session, used for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-time handshake sent by the child right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub tags: Vec<u32>,
    /// String-encoded JSON function definition document.
    #[serde(default)]
    pub function_definition: String,
}

/// Function definition document. Only `name` is interpreted; everything
/// else is carried opaquely to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl FunctionDefinition {
    /// Parse and validate a definition document.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let definition: FunctionDefinition = serde_json::from_str(raw)
            .map_err(|e| BridgeError::InvalidDefinition(e.to_string()))?;
        if definition.name.is_empty() {
            return Err(BridgeError::InvalidDefinition(
                "function name is empty".to_string(),
            ));
        }
        Ok(definition)
    }
}

/// A tagged data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedFrame {
    pub tag: u32,
    pub payload: Bytes,
}

impl TaggedFrame {
    pub fn new(tag: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }
}

/// Routing metadata resolved from a validated handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    /// Observed tags, deduplicated in first-seen order.
    pub tags: Vec<u32>,
    pub definition: FunctionDefinition,
    /// The definition document exactly as received.
    pub definition_raw: String,
}

impl Handshake {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Decode the raw header bytes into a [`Header`].
pub fn decode_header(raw: &[u8]) -> Result<Header, BridgeError> {
    serde_json::from_slice(raw).map_err(|e| BridgeError::Decode(e.to_string()))
}

/// Decode and validate a handshake message.
///
/// `definition_override` replaces the in-band `function_definition` when the
/// definition is sourced from the working directory instead.
pub fn decode_handshake(
    raw: &[u8],
    definition_override: Option<String>,
) -> Result<Handshake, BridgeError> {
    let header = decode_header(raw)?;
    let definition_raw = definition_override.unwrap_or(header.function_definition);
    let definition = FunctionDefinition::parse(&definition_raw)?;

    let mut tags = Vec::with_capacity(header.tags.len());
    for tag in header.tags {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    Ok(Handshake {
        tags,
        definition,
        definition_raw,
    })
}
