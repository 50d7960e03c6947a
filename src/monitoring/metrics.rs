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

//! Node-scoped metrics. A [`Metrics`] handle is constructed once by the orchestrator and passed
//! down to whichever collaborator needs it; nothing here is a process-wide global, and nothing in
//! this crate exposes a scrape endpoint (Prometheus export is an external collaborator concern,
//! per the crate's scope).

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A prometheus instrument failed to construct or register.
    #[error("prometheus")]
    Prom,
}

/// Node-scoped metrics container, handed out by the orchestrator.
///
/// The gossip/DHT gauges mirror the running counters each engine already keeps internally
/// ([`crate::networking::gossip::GossipStats`], [`crate::networking::dht::DhtStats`]); the
/// orchestrator re-`set`s them from a fresh snapshot on every heartbeat tick rather than
/// duplicating the counting logic here. The counters below are incremented directly at the one
/// dispatch point that observes the event.
#[derive(Clone)]
pub struct Metrics {
    /// Registry a deployment may scrape via its own exporter.
    pub registry: Registry,

    /// Active (established) peer connections.
    pub active_peers: IntGauge,
    /// Known peers total (active + disconnected).
    pub known_peers: IntGauge,

    /// Gossip messages received (before dedup/TTL/trust filtering).
    pub gossip_received: IntGauge,
    /// Gossip messages dropped as duplicates of an already-seen id.
    pub gossip_duplicates: IntGauge,
    /// Gossip messages dropped for an expired TTL.
    pub gossip_expired: IntGauge,
    /// Gossip messages dropped for an untrusted sender.
    pub gossip_untrusted_drops: IntGauge,
    /// Gossip sends issued during fanout rounds.
    pub gossip_fanned_out: IntGauge,

    /// DHT local `store` calls.
    pub dht_stores: IntGauge,
    /// DHT local `retrieve` calls.
    pub dht_retrievals: IntGauge,
    /// DHT replication rounds performed.
    pub dht_replications: IntGauge,
    /// DHT local entries dropped as expired.
    pub dht_expirations: IntGauge,

    /// Messages dropped for a signature that did not verify.
    pub signature_invalid_total: IntCounter,
    /// Peers evicted for exceeding the inactivity timeout.
    pub peer_timeouts_total: IntCounter,
}

impl Metrics {
    /// Construct and register every instrument against a fresh [`Registry`].
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let active_peers = IntGauge::new("p2p_active_peers", "Active peer connections")
            .map_err(|_| MetricsError::Prom)?;
        let known_peers = IntGauge::new("p2p_known_peers", "Known peers, active or not")
            .map_err(|_| MetricsError::Prom)?;

        let gossip_received = IntGauge::new("p2p_gossip_received", "Gossip messages received")
            .map_err(|_| MetricsError::Prom)?;
        let gossip_duplicates = IntGauge::new(
            "p2p_gossip_duplicates",
            "Gossip messages dropped as already-seen duplicates",
        )
        .map_err(|_| MetricsError::Prom)?;
        let gossip_expired = IntGauge::new("p2p_gossip_expired", "Gossip messages dropped for an expired TTL")
            .map_err(|_| MetricsError::Prom)?;
        let gossip_untrusted_drops = IntGauge::new(
            "p2p_gossip_untrusted_drops",
            "Gossip messages dropped for an untrusted sender",
        )
        .map_err(|_| MetricsError::Prom)?;
        let gossip_fanned_out = IntGauge::new("p2p_gossip_fanned_out", "Gossip sends issued during fanout rounds")
            .map_err(|_| MetricsError::Prom)?;

        let dht_stores = IntGauge::new("p2p_dht_stores", "DHT local store calls").map_err(|_| MetricsError::Prom)?;
        let dht_retrievals =
            IntGauge::new("p2p_dht_retrievals", "DHT local retrieve calls").map_err(|_| MetricsError::Prom)?;
        let dht_replications = IntGauge::new("p2p_dht_replications", "DHT replication rounds performed")
            .map_err(|_| MetricsError::Prom)?;
        let dht_expirations = IntGauge::new("p2p_dht_expirations", "DHT local entries dropped as expired")
            .map_err(|_| MetricsError::Prom)?;

        let signature_invalid_total = IntCounter::new(
            "p2p_signature_invalid_total",
            "Messages dropped for a signature that did not verify",
        )
        .map_err(|_| MetricsError::Prom)?;
        let peer_timeouts_total = IntCounter::new(
            "p2p_peer_timeouts_total",
            "Peers evicted for exceeding the inactivity timeout",
        )
        .map_err(|_| MetricsError::Prom)?;

        let gauges: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(active_peers.clone()),
            Box::new(known_peers.clone()),
            Box::new(gossip_received.clone()),
            Box::new(gossip_duplicates.clone()),
            Box::new(gossip_expired.clone()),
            Box::new(gossip_untrusted_drops.clone()),
            Box::new(gossip_fanned_out.clone()),
            Box::new(dht_stores.clone()),
            Box::new(dht_retrievals.clone()),
            Box::new(dht_replications.clone()),
            Box::new(dht_expirations.clone()),
        ];
        for gauge in gauges {
            registry.register(gauge).map_err(|_| MetricsError::Prom)?;
        }
        registry
            .register(Box::new(signature_invalid_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(peer_timeouts_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            active_peers,
            known_peers,
            gossip_received,
            gossip_duplicates,
            gossip_expired,
            gossip_untrusted_drops,
            gossip_fanned_out,
            dht_stores,
            dht_retrievals,
            dht_replications,
            dht_expirations,
            signature_invalid_total,
            peer_timeouts_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_instrument_registers_without_name_collisions() {
        let metrics = Metrics::new().unwrap();
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn gauges_and_counters_start_at_zero() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.gossip_received.get(), 0);
        assert_eq!(metrics.active_peers.get(), 0);
        assert_eq!(metrics.signature_invalid_total.get(), 0);
    }
}
