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

//! A decentralized peer-to-peer networking substrate.
//!
//! An authenticated overlay of Ed25519-identified nodes that exchange messages by epidemic
//! gossip, rank and admit peers by an adjustable trust score, store key-value pairs in a
//! Kademlia-style distributed hash table, and carry traffic over a datagram transport with its
//! own framing, fragmentation, reliability and congestion control. See [`node::Node`] for the
//! entry point that wires these collaborators together.
//!
//! This crate provides:
//! - Deterministic wire types & canonical message encoding ([`core::types`], [`networking::wire`])
//! - A reliable/unreliable datagram transport with a TCP-like connection FSM and Reno congestion
//!   control ([`networking::transport`])
//! - Deduplicated, TTL-bounded gossip propagation ([`networking::gossip`])
//! - Trust-ranked peer admission, eviction and discovery ([`networking::peer_store`],
//!   [`networking::trust`])
//! - A Kademlia-style DHT with iterative lookup ([`networking::dht`])
//! - Structured logging and internal metrics ([`monitoring::metrics`])

/// Core protocol primitives: identity, configuration, canonical types, and the persistence
/// collaborator contract.
pub mod core;
/// Observability (metrics, structured logging helpers).
pub mod monitoring;
/// The P2P networking substrate: wire codec, transport, trust, gossip and the DHT.
pub mod networking;
/// The node orchestrator that boots and wires every collaborator together.
pub mod node;
