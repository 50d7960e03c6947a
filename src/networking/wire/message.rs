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

//! The application-level message envelope carried inside packet payloads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{decode_canonical_limited, encode_canonical, CodecError, NodeId, Payload, Value};

/// Message envelope errors.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Envelope failed to encode or decode.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    /// Signature did not verify against the claimed sender.
    #[error("bad signature")]
    BadSignature,
}

/// Application message types, wire-stable integers.
///
/// `Serialize`/`Deserialize` are implemented by hand below rather than derived, so that the
/// integer on the wire is always the declared discriminant rather than bincode's default
/// positional variant index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    /// Initial handshake offer.
    Handshake = 1,
    /// Handshake acknowledgment, carries a peer sample.
    HandshakeAck = 2,
    /// Liveness probe.
    Heartbeat = 3,
    /// Request for more peers.
    PeerDiscovery = 4,
    /// Unsolicited peer sample.
    PeerAnnouncement = 5,
    /// Gossip-propagated application payload.
    Gossip = 6,
    /// Trust score update notification.
    TrustUpdate = 7,
    /// Request for the sender's trusted-peer list.
    TrustedPeersRequest = 8,
    /// Response to `TrustedPeersRequest`.
    TrustedPeersResponse = 9,
    /// Graceful session teardown.
    Disconnect = 10,
    /// Opaque application data, not gossip-propagated.
    CustomData = 11,
    /// DHT store request.
    DhtStore = 12,
    /// DHT value lookup request.
    DhtFindValue = 13,
    /// DHT delete request.
    DhtDelete = 14,
    /// Response to `DhtStore`.
    DhtStoreOk = 15,
    /// Response to `DhtFindValue`.
    DhtFindValueResponse = 16,
    /// Response to `DhtDelete`.
    DhtDeleteOk = 17,
}

impl MessageType {
    /// Decode from the wire integer.
    pub fn from_u8(b: u8) -> Option<Self> {
        use MessageType::*;
        Some(match b {
            1 => Handshake,
            2 => HandshakeAck,
            3 => Heartbeat,
            4 => PeerDiscovery,
            5 => PeerAnnouncement,
            6 => Gossip,
            7 => TrustUpdate,
            8 => TrustedPeersRequest,
            9 => TrustedPeersResponse,
            10 => Disconnect,
            11 => CustomData,
            12 => DhtStore,
            13 => DhtFindValue,
            14 => DhtDelete,
            15 => DhtStoreOk,
            16 => DhtFindValueResponse,
            17 => DhtDeleteOk,
            _ => return None,
        })
    }
}

impl Serialize for MessageType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let b = u8::deserialize(deserializer)?;
        MessageType::from_u8(b).ok_or_else(|| serde::de::Error::custom("unknown message type"))
    }
}

/// A self-describing application message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Message type.
    pub msg_type: MessageType,
    /// Sender's node id.
    pub sender_id: NodeId,
    /// Unix-seconds send timestamp.
    pub timestamp: f64,
    /// Canonically-ordered payload.
    pub payload: Payload,
    /// Optional Ed25519 signature over the signable view (64 bytes).
    pub signature: Option<Vec<u8>>,
    /// Deterministic 16-hex-character message id.
    pub message_id: String,
    /// Hops remaining before gossip propagation stops.
    pub ttl: i32,
}

/// Fields included when hashing or signing a message; this is every field except `signature`.
#[derive(Serialize)]
struct Signable<'a> {
    msg_type: MessageType,
    sender_id: NodeId,
    timestamp_bits: u64,
    payload: &'a Payload,
    message_id: &'a str,
    ttl: i32,
}

fn derive_message_id(msg_type: MessageType, sender_id: NodeId, timestamp: f64, payload: &Payload) -> String {
    #[derive(Serialize)]
    struct IdInput<'a> {
        sender_id: NodeId,
        timestamp_bits: u64,
        msg_type: MessageType,
        payload: &'a Payload,
    }
    let input = IdInput {
        sender_id,
        timestamp_bits: timestamp.to_bits(),
        msg_type,
        payload,
    };
    // encode_canonical cannot fail for these plain-data types; an id is still required, so fall
    // back to hashing an empty buffer rather than panicking on a theoretical encode failure.
    let bytes = encode_canonical(&input).unwrap_or_default();
    let digest = ring::digest::digest(&ring::digest::SHA256, &bytes);
    hex::encode(&digest.as_ref()[..8])
}

const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

impl Message {
    /// Build a new, unsigned message; `message_id` is derived immediately.
    pub fn new(msg_type: MessageType, sender_id: NodeId, timestamp: f64, payload: Payload, ttl: i32) -> Self {
        let message_id = derive_message_id(msg_type, sender_id, timestamp, &payload);
        Self {
            msg_type,
            sender_id,
            timestamp,
            payload,
            signature: None,
            message_id,
            ttl,
        }
    }

    /// Bytes that a signature covers (every field except `signature` itself).
    pub fn signable_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let signable = Signable {
            msg_type: self.msg_type,
            sender_id: self.sender_id,
            timestamp_bits: self.timestamp.to_bits(),
            payload: &self.payload,
            message_id: &self.message_id,
            ttl: self.ttl,
        };
        Ok(encode_canonical(&signable)?)
    }

    /// Sign this message in place using the given identity.
    pub fn sign(&mut self, identity: &crate::core::identity::Identity) -> Result<(), MessageError> {
        let bytes = self.signable_bytes()?;
        self.signature = Some(identity.sign(&bytes).to_vec());
        Ok(())
    }

    /// Verify this message's signature against a raw 32-byte Ed25519 public key.
    pub fn verify(&self, pubkey: &[u8]) -> bool {
        match &self.signature {
            Some(sig) => match self.signable_bytes() {
                Ok(bytes) => crate::core::identity::Identity::verify(pubkey, &bytes, sig),
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Serialize the full envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(encode_canonical(self)?)
    }

    /// Deserialize a full envelope, bounded by a hard size cap.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(decode_canonical_limited(bytes, MAX_MESSAGE_BYTES)?)
    }
}

/// Constructors for each message type, mirroring the distilled source's message factory.
pub struct MessageFactory;

impl MessageFactory {
    /// `HANDSHAKE`: announce identity, address and protocol version.
    pub fn handshake(sender_id: NodeId, now: f64, public_key: &[u8], address: &str) -> Message {
        let mut payload = Payload::new();
        payload.insert("public_key".into(), Value::Bytes(public_key.to_vec()));
        payload.insert("address".into(), Value::Str(address.to_string()));
        payload.insert("protocol_version".into(), Value::Str("1.0".to_string()));
        Message::new(MessageType::Handshake, sender_id, now, payload, 1)
    }

    /// `HANDSHAKE_ACK`: acknowledge, attaching a peer sample.
    pub fn handshake_ack(sender_id: NodeId, now: f64, public_key: &[u8], peers: Value) -> Message {
        let mut payload = Payload::new();
        payload.insert("public_key".into(), Value::Bytes(public_key.to_vec()));
        payload.insert("peers".into(), peers);
        Message::new(MessageType::HandshakeAck, sender_id, now, payload, 1)
    }

    /// `HEARTBEAT`: empty liveness probe.
    pub fn heartbeat(sender_id: NodeId, now: f64) -> Message {
        Message::new(MessageType::Heartbeat, sender_id, now, Payload::new(), 1)
    }

    /// `PEER_DISCOVERY`: request more peers.
    pub fn peer_discovery(sender_id: NodeId, now: f64) -> Message {
        Message::new(MessageType::PeerDiscovery, sender_id, now, Payload::new(), 1)
    }

    /// `PEER_ANNOUNCEMENT`: unsolicited peer sample.
    pub fn peer_announcement(sender_id: NodeId, now: f64, peers: Value) -> Message {
        let mut payload = Payload::new();
        payload.insert("peers".into(), peers);
        Message::new(MessageType::PeerAnnouncement, sender_id, now, payload, 1)
    }

    /// `GOSSIP`: propagate application data with a TTL.
    pub fn gossip(sender_id: NodeId, now: f64, data: Value, ttl: i32) -> Message {
        let mut payload = Payload::new();
        payload.insert("data".into(), data);
        Message::new(MessageType::Gossip, sender_id, now, payload, ttl)
    }

    /// `TRUST_UPDATE`: notify a trust score change for `target_node_id`.
    pub fn trust_update(sender_id: NodeId, now: f64, target_node_id: NodeId, trust_score: f64, reason: &str) -> Message {
        let mut payload = Payload::new();
        payload.insert("target_node_id".into(), Value::Str(target_node_id.to_hex()));
        payload.insert("trust_score".into(), Value::from_f64(trust_score));
        payload.insert("reason".into(), Value::Str(reason.to_string()));
        Message::new(MessageType::TrustUpdate, sender_id, now, payload, 1)
    }

    /// `TRUSTED_PEERS_REQUEST`.
    pub fn trusted_peers_request(sender_id: NodeId, now: f64) -> Message {
        Message::new(MessageType::TrustedPeersRequest, sender_id, now, Payload::new(), 1)
    }

    /// `TRUSTED_PEERS_RESPONSE`.
    pub fn trusted_peers_response(sender_id: NodeId, now: f64, trusted_peers: Value) -> Message {
        let mut payload = Payload::new();
        payload.insert("trusted_peers".into(), trusted_peers);
        Message::new(MessageType::TrustedPeersResponse, sender_id, now, payload, 1)
    }

    /// `DISCONNECT`: graceful teardown with a reason.
    pub fn disconnect(sender_id: NodeId, now: f64, reason: &str) -> Message {
        let mut payload = Payload::new();
        payload.insert("reason".into(), Value::Str(reason.to_string()));
        Message::new(MessageType::Disconnect, sender_id, now, payload, 1)
    }

    /// `CUSTOM_DATA`: opaque application payload, not gossip-propagated.
    pub fn custom_data(sender_id: NodeId, now: f64, data: Value, ttl: i32) -> Message {
        let mut payload = Payload::new();
        payload.insert("data".into(), data);
        Message::new(MessageType::CustomData, sender_id, now, payload, ttl)
    }

    /// `DHT_STORE`: ask the recipient to hold `key` -> `value`, correlated by `request_id`.
    pub fn dht_store(
        sender_id: NodeId,
        now: f64,
        request_id: &str,
        key: &str,
        value: &[u8],
        ttl_secs: Option<f64>,
    ) -> Message {
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.to_string()));
        payload.insert("key".into(), Value::Str(key.to_string()));
        payload.insert("value".into(), Value::Bytes(value.to_vec()));
        if let Some(ttl) = ttl_secs {
            payload.insert("ttl".into(), Value::from_f64(ttl));
        }
        Message::new(MessageType::DhtStore, sender_id, now, payload, 1)
    }

    /// `DHT_STORE_OK`: acknowledge a `DHT_STORE`.
    pub fn dht_store_ok(sender_id: NodeId, now: f64, request_id: &str, stored: bool) -> Message {
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.to_string()));
        payload.insert("stored".into(), Value::Bool(stored));
        Message::new(MessageType::DhtStoreOk, sender_id, now, payload, 1)
    }

    /// `DHT_FIND_VALUE`: ask for `key`, or (if absent) the `count` nodes closest to it.
    pub fn dht_find_value(sender_id: NodeId, now: f64, request_id: &str, key: &str, count: i64) -> Message {
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.to_string()));
        payload.insert("key".into(), Value::Str(key.to_string()));
        payload.insert("count".into(), Value::Int(count));
        Message::new(MessageType::DhtFindValue, sender_id, now, payload, 1)
    }

    /// `DHT_FIND_VALUE_RESPONSE`: either the stored `value`, or a `closer_nodes` sample.
    pub fn dht_find_value_response(
        sender_id: NodeId,
        now: f64,
        request_id: &str,
        value: Option<&[u8]>,
        closer_nodes: Value,
    ) -> Message {
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.to_string()));
        match value {
            Some(v) => {
                payload.insert("value".into(), Value::Bytes(v.to_vec()));
            }
            None => {
                payload.insert("closer_nodes".into(), closer_nodes);
            }
        }
        Message::new(MessageType::DhtFindValueResponse, sender_id, now, payload, 1)
    }

    /// `DHT_DELETE`: ask the recipient to drop `key`, correlated by `request_id`.
    pub fn dht_delete(sender_id: NodeId, now: f64, request_id: &str, key: &str) -> Message {
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.to_string()));
        payload.insert("key".into(), Value::Str(key.to_string()));
        Message::new(MessageType::DhtDelete, sender_id, now, payload, 1)
    }

    /// `DHT_DELETE_OK`: acknowledge a `DHT_DELETE`.
    pub fn dht_delete_ok(sender_id: NodeId, now: f64, request_id: &str, deleted: bool) -> Message {
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.to_string()));
        payload.insert("deleted".into(), Value::Bool(deleted));
        Message::new(MessageType::DhtDeleteOk, sender_id, now, payload, 1)
    }
}
