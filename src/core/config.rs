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

//! Node configuration surface. Loading this from a TOML file is an external concern; this type
//! only defines and validates the recognized options.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field was out of its valid range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Full node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Bootstrap peer addresses (`host:port`), dialed at startup.
    pub bootstrap_nodes: Vec<String>,

    /// Number of peers picked per gossip fanout round.
    pub gossip_fanout: usize,
    /// Seconds between gossip fanout rounds.
    pub gossip_interval_secs: f64,
    /// Default TTL stamped on newly originated gossip/custom-data messages.
    pub message_ttl: i32,
    /// Capacity of the gossip engine's seen-message FIFO cache.
    pub message_cache_size: usize,

    /// Maximum size of the active peer set.
    pub max_peers: usize,
    /// Peer count below which discovery actively seeks more peers.
    pub min_peers: usize,
    /// Seconds between peer-discovery rounds.
    pub peer_discovery_interval_secs: f64,
    /// Seconds of inactivity after which a peer is evicted.
    pub peer_timeout_secs: f64,
    /// Seconds between heartbeat rounds.
    pub heartbeat_interval_secs: f64,

    /// Starting trust score assigned to newly seen peers.
    pub initial_trust_score: f64,
    /// Fraction by which trust is nudged toward `initial_trust_score` per decay interval.
    pub trust_decay_rate: f64,
    /// Seconds between trust decay rounds.
    pub trust_decay_interval_secs: f64,
    /// Minimum trust score; also the low gating floor used by `is_trusted`.
    pub min_trust_threshold: f64,
    /// Maximum trust score (upper clamp).
    pub max_trust_score: f64,
    /// Trust delta applied for a valid signed message.
    pub trust_boost_message: f64,
    /// Trust delta (magnitude) applied for an invalid/forged message.
    pub trust_penalty_invalid: f64,
    /// Higher trust bar used by "trusted peers" sharing/filtering (distinct from the gating floor).
    pub trusted_peers_threshold: f64,

    /// Maximum concurrent transport connections.
    pub max_concurrent_connections: usize,
    /// Seconds allowed for an outbound connection attempt (including bootstrap dials).
    pub connection_timeout_secs: f64,
    /// Outbound send/receive buffer size in messages.
    pub message_buffer_size: usize,

    /// Kademlia bucket size.
    pub dht_k: usize,
    /// Kademlia lookup parallelism.
    pub dht_alpha: usize,
    /// Number of replication-closest nodes that receive a STORE/DELETE.
    pub dht_replication_factor: usize,
    /// Default TTL (seconds) applied to DHT values stored without an explicit TTL.
    pub dht_ttl_default_secs: f64,
    /// Per-RPC timeout for DHT STORE/FIND_VALUE/DELETE.
    pub dht_rpc_timeout_secs: f64,
    /// Bound on iterative lookup rounds.
    pub dht_lookup_max_iterations: usize,

    /// Seconds a partial reassembly buffer is kept before being garbage-collected.
    pub fragment_stale_timeout_secs: f64,
    /// Maximum segment size used by the congestion controller.
    pub mss: usize,

    /// Directory holding the identity key file and the persistence store.
    pub data_dir: String,
    /// Log verbosity, as accepted by `tracing_subscriber::EnvFilter`.
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            bootstrap_nodes: Vec::new(),

            gossip_fanout: 3,
            gossip_interval_secs: 1.0,
            message_ttl: 10,
            message_cache_size: 10_000,

            max_peers: 50,
            min_peers: 5,
            peer_discovery_interval_secs: 30.0,
            peer_timeout_secs: 60.0,
            heartbeat_interval_secs: 10.0,

            initial_trust_score: 0.5,
            trust_decay_rate: 0.01,
            trust_decay_interval_secs: 300.0,
            min_trust_threshold: 0.1,
            max_trust_score: 1.0,
            trust_boost_message: 0.001,
            trust_penalty_invalid: 0.1,
            trusted_peers_threshold: 0.7,

            max_concurrent_connections: 100,
            connection_timeout_secs: 10.0,
            message_buffer_size: 1024,

            dht_k: 20,
            dht_alpha: 3,
            dht_replication_factor: 3,
            dht_ttl_default_secs: 3600.0,
            dht_rpc_timeout_secs: 5.0,
            dht_lookup_max_iterations: 20,

            fragment_stale_timeout_secs: 30.0,
            mss: 1400,

            data_dir: "./data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Validate option ranges; mirrors the distilled source's own `validate()`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be nonzero".into()));
        }
        if self.gossip_fanout < 1 {
            return Err(ConfigError::Invalid("gossip_fanout must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.initial_trust_score) {
            return Err(ConfigError::Invalid(
                "initial_trust_score must be in [0, 1]".into(),
            ));
        }
        if self.max_peers < self.min_peers {
            return Err(ConfigError::Invalid("max_peers must be >= min_peers".into()));
        }
        if self.min_trust_threshold > self.max_trust_score {
            return Err(ConfigError::Invalid(
                "min_trust_threshold must be <= max_trust_score".into(),
            ));
        }
        if self.dht_alpha < 1 || self.dht_k < 1 {
            return Err(ConfigError::Invalid("dht_alpha and dht_k must be >= 1".into()));
        }
        Ok(())
    }

    /// `host:port` listen address.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_peer_bounds() {
        let mut cfg = NodeConfig::default();
        cfg.max_peers = 2;
        cfg.min_peers = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_trust() {
        let mut cfg = NodeConfig::default();
        cfg.initial_trust_score = 1.5;
        assert!(cfg.validate().is_err());
    }
}
