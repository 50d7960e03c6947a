// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Deterministic core types and canonical encoding helpers shared by the wire codec, the
//! persistence layer and the DHT.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization")]
    Serialize,
    /// Deserialization failed.
    #[error("deserialization")]
    Deserialize,
    /// Decoded payload exceeded the caller's size cap.
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation across platforms.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Requires deterministic container ordering (use `CanonicalMap`).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts()
        .serialize(v)
        .map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// Canonical map type: deterministic iteration order is load-bearing for message-id hashing.
pub type CanonicalMap<K, V> = BTreeMap<K, V>;

/// A canonical, ordered value type for message payloads, playing the role the distilled source's
/// dynamically-typed `Dict[str, Any]` payload plays, but with a deterministic byte representation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absence of a value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// IEEE-754 double, compared/encoded as its bit pattern so `Value` can derive `Ord`.
    Float(u64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Canonically-ordered nested map.
    Map(CanonicalMap<String, Value>),
}

impl Value {
    /// Construct a float value from an `f64`.
    pub fn from_f64(f: f64) -> Self {
        Value::Float(f.to_bits())
    }

    /// Read a float value back out as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// Read a string out, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Read an integer out, if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Read bytes out, if this is a `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Read a list out, if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    /// Read a map out, if this is a `Map`.
    pub fn as_map(&self) -> Option<&CanonicalMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Shorthand for building a payload map.
pub type Payload = CanonicalMap<String, Value>;

/// 64-bit-prefix node identifier: lowercase hex of the first 8 bytes of `SHA256(pubkey)`.
///
/// Distinct from the DHT's own 160-bit SHA-1 address space (see `crate::networking::dht`); the two
/// MUST never be conflated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 8]);

impl NodeId {
    /// Derive a node id from raw Ed25519 public key bytes.
    pub fn from_public_key(pubkey: &[u8]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, pubkey);
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest.as_ref()[..8]);
        NodeId(out)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Lowercase hex representation (16 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 16-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 8 {
            return None;
        }
        let mut out = [0u8; 8];
        out.copy_from_slice(&bytes);
        Some(NodeId(out))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A peer as known to the peer store: address, public key, liveness and trust bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Node id.
    pub node_id: NodeId,
    /// `host:port` address.
    pub address: String,
    /// Ed25519 public key bytes (32).
    pub public_key: Vec<u8>,
    /// Last time a packet was received from this peer (unix seconds).
    pub last_seen: f64,
    /// Trust score in `[0, max_trust]`.
    pub trust_score: f64,
    /// First time this peer was ever recorded (unix seconds).
    pub first_seen: f64,
    /// Count of successful inbound connections/handshakes.
    pub connection_count: u64,
    /// Count of valid signed messages received.
    pub valid_messages: u64,
    /// Count of invalid/malformed/forged messages received.
    pub invalid_messages: u64,
}

/// A value stored in the DHT.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DhtValue {
    /// Original key (UTF-8).
    pub key: String,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Origin timestamp (unix seconds).
    pub timestamp: f64,
    /// Optional time-to-live in seconds.
    pub ttl: Option<f64>,
    /// Node ids known to also hold a replica.
    pub replicas: std::collections::BTreeSet<NodeId>,
}

impl DhtValue {
    /// True when `now > timestamp + ttl` and a ttl is set.
    pub fn is_expired(&self, now: f64) -> bool {
        match self.ttl {
            Some(ttl) => now > self.timestamp + ttl,
            None => false,
        }
    }
}
