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

//! Trust scoring for peers: event-driven adjustments, periodic decay towards the initial score,
//! transitive recommendation, and a blended reputation score.
//!
//! Scores live in an in-memory cache for fast reads and are mirrored to the persistence
//! collaborator on every change, so a restarted node resumes with the scores it left off at.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::persistence::{PersistenceStore, StoreError};
use crate::core::types::NodeId;

/// Caps how many interaction samples are kept per peer for trend analysis.
const INTERACTION_HISTORY_CAP: usize = 100;

/// Tuning knobs for [`TrustEngine`], mirroring the relevant [`crate::core::config::NodeConfig`]
/// fields.
#[derive(Clone, Copy, Debug)]
pub struct TrustParams {
    /// Score assigned to a peer with no recorded history.
    pub initial_trust: f64,
    /// Lower clamp and default gating threshold.
    pub min_trust: f64,
    /// Upper clamp.
    pub max_trust: f64,
    /// Fraction by which a score is nudged toward `initial_trust` per decay round.
    pub decay_rate: f64,
    /// Higher bar used when selecting peers to advertise as "trusted".
    pub trusted_peers_threshold: f64,
}

impl Default for TrustParams {
    fn default() -> Self {
        Self {
            initial_trust: 0.5,
            min_trust: 0.1,
            max_trust: 1.0,
            decay_rate: 0.01,
            trusted_peers_threshold: 0.7,
        }
    }
}

struct Interactions {
    samples: std::collections::VecDeque<f64>,
}

impl Interactions {
    fn new() -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(INTERACTION_HISTORY_CAP),
        }
    }

    fn record(&mut self, value: f64) {
        if self.samples.len() == INTERACTION_HISTORY_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Slope of a simple linear regression over the recorded samples, zero with fewer than two.
    fn trend(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let x_mean = (n - 1) as f64 / 2.0;
        let y_mean: f64 = self.samples.iter().sum::<f64>() / n as f64;
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (i, y) in self.samples.iter().enumerate() {
            let dx = i as f64 - x_mean;
            numerator += dx * (y - y_mean);
            denominator += dx * dx;
        }
        if denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        }
    }
}

/// Peer trust and reputation tracker.
pub struct TrustEngine {
    store: Arc<dyn PersistenceStore>,
    params: TrustParams,
    cache: tokio::sync::Mutex<HashMap<NodeId, f64>>,
    history: tokio::sync::Mutex<HashMap<NodeId, Interactions>>,
}

impl TrustEngine {
    /// Build a trust engine over the given persistence collaborator.
    pub fn new(store: Arc<dyn PersistenceStore>, params: TrustParams) -> Self {
        Self {
            store,
            params,
            cache: tokio::sync::Mutex::new(HashMap::new()),
            history: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Current trust score for a peer; `initial_trust` if never recorded.
    pub async fn get_trust(&self, id: NodeId) -> Result<f64, StoreError> {
        if let Some(score) = self.cache.lock().await.get(&id) {
            return Ok(*score);
        }
        let score = match self.store.get_peer(id).await? {
            Some(peer) => peer.trust_score,
            None => self.params.initial_trust,
        };
        self.cache.lock().await.insert(id, score);
        Ok(score)
    }

    /// Overwrite a peer's trust score, clamped to `[0, max_trust]`, logging the delta.
    pub async fn set_trust(&self, id: NodeId, score: f64, reason: &str) -> Result<(), StoreError> {
        let old = self.get_trust(id).await?;
        let clamped = score.clamp(0.0, self.params.max_trust);
        self.cache.lock().await.insert(id, clamped);
        self.store.update_peer_trust(id, clamped).await?;
        self.store
            .log_trust_event(id, "set_trust", clamped - old, reason)
            .await?;
        Ok(())
    }

    /// Adjust a peer's trust score by `delta`.
    pub async fn adjust_trust(&self, id: NodeId, delta: f64, reason: &str) -> Result<(), StoreError> {
        let current = self.get_trust(id).await?;
        self.set_trust(id, current + delta, reason).await
    }

    async fn record_interaction(&self, id: NodeId, value: f64) {
        self.history
            .lock()
            .await
            .entry(id)
            .or_insert_with(Interactions::new)
            .record(value);
    }

    /// A valid signed message was received from `id`.
    pub async fn on_valid_message(&self, id: NodeId, boost: f64) -> Result<(), StoreError> {
        self.adjust_trust(id, boost, "valid_message").await?;
        self.store.increment_peer_stats(id, 1, 0).await?;
        self.record_interaction(id, boost).await;
        Ok(())
    }

    /// An invalid, malformed, or forged message was received from `id`.
    pub async fn on_invalid_message(&self, id: NodeId, penalty: f64) -> Result<(), StoreError> {
        self.adjust_trust(id, -penalty, "invalid_message").await?;
        self.store.increment_peer_stats(id, 0, 1).await?;
        self.record_interaction(id, -penalty).await;
        Ok(())
    }

    /// `id` failed to respond within the expected deadline.
    pub async fn on_peer_timeout(&self, id: NodeId, penalty: f64) -> Result<(), StoreError> {
        self.adjust_trust(id, -penalty, "timeout").await
    }

    /// A handshake with `id` completed successfully.
    pub async fn on_successful_connection(&self, id: NodeId, boost: f64) -> Result<(), StoreError> {
        self.adjust_trust(id, boost, "successful_connection").await
    }

    /// Whether `id` clears `threshold`, or the configured `min_trust` floor if `None`.
    pub async fn is_trusted(&self, id: NodeId, threshold: Option<f64>) -> Result<bool, StoreError> {
        let threshold = threshold.unwrap_or(self.params.min_trust);
        Ok(self.get_trust(id).await? >= threshold)
    }

    /// Peers at or above `min_trust` (the configured "trusted peers" bar if `None`), highest
    /// trust first.
    pub async fn get_trusted_peers(
        &self,
        min_trust: Option<f64>,
    ) -> Result<Vec<crate::core::types::PeerRecord>, StoreError> {
        let threshold = min_trust.unwrap_or(self.params.trusted_peers_threshold);
        self.store.get_trusted_peers(threshold).await
    }

    /// Apply a transitive trust recommendation: `recommender` vouches for `recommended` at
    /// `recommended_trust`, weighted down by the recommender's own standing.
    pub async fn apply_transitive_trust(
        &self,
        recommender: NodeId,
        recommended: NodeId,
        recommended_trust: f64,
    ) -> Result<(), StoreError> {
        let recommender_trust = self.get_trust(recommender).await?;
        let weighted = recommended_trust * recommender_trust * 0.1;
        let reason = format!("recommendation_from_{recommender}");
        self.adjust_trust(recommended, weighted, &reason).await
    }

    /// Slope of `id`'s recent interaction history; positive means improving.
    pub async fn get_interaction_trend(&self, id: NodeId) -> f64 {
        self.history
            .lock()
            .await
            .get(&id)
            .map(|h| h.trend())
            .unwrap_or(0.0)
    }

    /// Blended reputation score: 60% current trust, 20% clamped interaction trend, 20% a fixed
    /// baseline reserved for future per-peer statistics.
    pub async fn compute_reputation_score(&self, id: NodeId) -> Result<f64, StoreError> {
        let trust = self.get_trust(id).await?;
        if self.store.get_peer(id).await?.is_none() {
            return Ok(trust);
        }
        let trend = self.get_interaction_trend(id).await;
        let stats_score = 0.5;
        let reputation = trust * 0.6 + (0.5 + trend).clamp(0.0, 1.0) * 0.2 + stats_score * 0.2;
        Ok(reputation.clamp(0.0, 1.0))
    }

    /// Nudge every known peer's trust a `decay_rate` fraction of the way back toward
    /// `initial_trust`; changes below `0.001` are not persisted.
    pub async fn apply_trust_decay(&self) -> Result<(), StoreError> {
        let peers = self.store.get_all_peers().await?;
        for peer in peers {
            let target = self.params.initial_trust;
            let new_trust = peer.trust_score + (target - peer.trust_score) * self.params.decay_rate;
            if (new_trust - peer.trust_score).abs() > 0.001 {
                self.set_trust(peer.node_id, new_trust, "periodic_decay").await?;
            }
        }
        debug!("trust decay round complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persistence::SledStore;

    async fn engine() -> (TrustEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn PersistenceStore> =
            Arc::new(SledStore::open(dir.path().join("db").to_str().unwrap()).unwrap());
        (TrustEngine::new(store, TrustParams::default()), dir)
    }

    fn peer_id(byte: u8) -> NodeId {
        NodeId::from_public_key(&[byte; 32])
    }

    #[tokio::test]
    async fn unknown_peer_starts_at_initial_trust() {
        let (engine, _dir) = engine().await;
        assert_eq!(engine.get_trust(peer_id(1)).await.unwrap(), 0.5);
    }

    #[tokio::test]
    async fn set_trust_clamps_to_max() {
        let (engine, _dir) = engine().await;
        let id = peer_id(1);
        engine.set_trust(id, 5.0, "test").await.unwrap();
        assert_eq!(engine.get_trust(id).await.unwrap(), 1.0);
        engine.set_trust(id, -5.0, "test").await.unwrap();
        assert_eq!(engine.get_trust(id).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn invalid_message_lowers_trust_and_counts_invalid() {
        let (engine, _dir) = engine().await;
        let id = peer_id(2);
        // seed a peer record so increment_peer_stats has something to act on
        engine.store.save_peer(&crate::core::types::PeerRecord {
            node_id: id,
            address: "127.0.0.1:1".into(),
            public_key: vec![2u8; 32],
            last_seen: 0.0,
            trust_score: 0.5,
            first_seen: 0.0,
            connection_count: 0,
            valid_messages: 0,
            invalid_messages: 0,
        }).await.unwrap();

        engine.on_invalid_message(id, 0.1).await.unwrap();
        let peer = engine.store.get_peer(id).await.unwrap().unwrap();
        assert_eq!(peer.invalid_messages, 1);
        assert!(engine.get_trust(id).await.unwrap() < 0.5);
    }

    #[tokio::test]
    async fn transitive_trust_is_weighted_by_recommender() {
        let (engine, _dir) = engine().await;
        let recommender = peer_id(3);
        let recommended = peer_id(4);
        engine.set_trust(recommender, 1.0, "seed").await.unwrap();
        let before = engine.get_trust(recommended).await.unwrap();
        engine
            .apply_transitive_trust(recommender, recommended, 1.0)
            .await
            .unwrap();
        let after = engine.get_trust(recommended).await.unwrap();
        assert!((after - before - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn interaction_trend_is_zero_with_fewer_than_two_samples() {
        let (engine, _dir) = engine().await;
        let id = peer_id(5);
        assert_eq!(engine.get_interaction_trend(id).await, 0.0);
        engine.record_interaction(id, 0.1).await;
        assert_eq!(engine.get_interaction_trend(id).await, 0.0);
    }

    #[tokio::test]
    async fn interaction_trend_detects_improving_run() {
        let (engine, _dir) = engine().await;
        let id = peer_id(6);
        for v in [0.1, 0.2, 0.3, 0.4] {
            engine.record_interaction(id, v).await;
        }
        assert!(engine.get_interaction_trend(id).await > 0.0);
    }

    #[tokio::test]
    async fn decay_pulls_trust_toward_initial() {
        let (engine, _dir) = engine().await;
        let id = peer_id(7);
        engine.store.save_peer(&crate::core::types::PeerRecord {
            node_id: id,
            address: "127.0.0.1:1".into(),
            public_key: vec![7u8; 32],
            last_seen: 0.0,
            trust_score: 1.0,
            first_seen: 0.0,
            connection_count: 0,
            valid_messages: 0,
            invalid_messages: 0,
        }).await.unwrap();
        engine.apply_trust_decay().await.unwrap();
        let peer = engine.store.get_peer(id).await.unwrap().unwrap();
        assert!(peer.trust_score < 1.0);
    }
}
