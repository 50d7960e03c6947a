//! Full-stack scenarios driving the [`positron_net::node::Node`] orchestrator over real TCP
//! sockets on loopback, plus a couple of subsystem scenarios (fragmentation, DHT) that don't need
//! a running node to exercise end to end.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use positron_net::core::config::NodeConfig;
use positron_net::core::types::{NodeId, Value};
use positron_net::networking::dht::{DhtError, DhtParams, DhtTransport, DistributedHashTable};
use positron_net::networking::wire::fragment::Fragmenter;
use positron_net::node::Node;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn test_config(port: u16, data_dir: &std::path::Path, bootstrap: Vec<String>) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.host = "127.0.0.1".to_string();
    cfg.port = port;
    cfg.data_dir = data_dir.to_string_lossy().to_string();
    cfg.bootstrap_nodes = bootstrap;
    // Ticks are disarmed for deterministic assertions; individual tests invoke the behavior they
    // care about directly instead of waiting out a real interval.
    cfg.gossip_interval_secs = 3600.0;
    cfg.peer_discovery_interval_secs = 3600.0;
    cfg.heartbeat_interval_secs = 3600.0;
    cfg.trust_decay_interval_secs = 3600.0;
    cfg
}

/// A single node boots, reports empty stats, and shuts down cleanly.
#[tokio::test]
async fn single_node_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let node = Node::start(test_config(free_port(), dir.path(), vec![])).await.unwrap();
    node.run().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stats = node.get_stats().await;
    assert_eq!(stats.active_peers, 0);
    assert_eq!(stats.gossip.received, 0);
    assert_eq!(stats.dht.stores, 0);

    node.shutdown().await;
}

/// Two nodes complete a handshake over a bootstrap dial and each record the other as active.
#[tokio::test]
async fn two_node_bootstrap_join() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let port_b = free_port();

    let node_b = Node::start(test_config(port_b, dir_b.path(), vec![])).await.unwrap();
    node_b.run().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let node_a = Node::start(test_config(
        free_port(),
        dir_a.path(),
        vec![format!("127.0.0.1:{port_b}")],
    ))
    .await
    .unwrap();
    node_a.run().await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(node_a.get_stats().await.active_peers, 1);
    assert_eq!(node_b.get_stats().await.active_peers, 1);
    assert_ne!(node_a.node_id(), node_b.node_id());

    node_a.shutdown().await;
    node_b.shutdown().await;
}

/// A hub-and-spoke triple: A and C both bootstrap to B. A application-level message sent
/// point-to-point from A to B carries far enough (via B's gossip re-propagation) to reach C,
/// and every node that delivers it invokes its own registered handler with the true originator.
#[tokio::test]
async fn three_node_application_message_propagates_through_the_hub() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();
    let port_b = free_port();

    // B's fanout tick is armed (short interval) so it actually relays to C; A and C never
    // originate anything themselves in this scenario, so their own tick cadence doesn't matter.
    let mut cfg_b = test_config(port_b, dir_b.path(), vec![]);
    cfg_b.gossip_interval_secs = 0.05;
    let node_b = Node::start(cfg_b).await.unwrap();
    node_b.run().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let node_a = Node::start(test_config(
        free_port(),
        dir_a.path(),
        vec![format!("127.0.0.1:{port_b}")],
    ))
    .await
    .unwrap();
    node_a.run().await;

    let node_c = Node::start(test_config(
        free_port(),
        dir_c.path(),
        vec![format!("127.0.0.1:{port_b}")],
    ))
    .await
    .unwrap();
    node_c.run().await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node_a.get_stats().await.active_peers, 1);
    assert_eq!(node_b.get_stats().await.active_peers, 2);
    assert_eq!(node_c.get_stats().await.active_peers, 1);

    let seen_by_b: Arc<Mutex<Vec<(NodeId, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_by_c: Arc<Mutex<Vec<(NodeId, String)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen_by_b.clone();
        node_b
            .register_data_handler("greet", move |from, data| {
                if let Some(text) = data.as_str() {
                    seen.lock().unwrap().push((from, text.to_string()));
                }
            })
            .await;
    }
    {
        let seen = seen_by_c.clone();
        node_c
            .register_data_handler("greet", move |from, data| {
                if let Some(text) = data.as_str() {
                    seen.lock().unwrap().push((from, text.to_string()));
                }
            })
            .await;
    }

    node_a
        .send_to_peer(node_b.node_id(), "greet", Value::Str("hello from a".into()))
        .await
        .unwrap();

    // B delivers immediately; the message reaches C on B's next fanout tick.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let b_seen = seen_by_b.lock().unwrap().clone();
    let c_seen = seen_by_c.lock().unwrap().clone();
    assert_eq!(b_seen, vec![(node_a.node_id(), "hello from a".to_string())]);
    assert_eq!(c_seen, vec![(node_a.node_id(), "hello from a".to_string())]);

    node_a.shutdown().await;
    node_b.shutdown().await;
    node_c.shutdown().await;
}

/// A message signed by one key but claiming another node's identity fails verification and is
/// never handed to the application.
#[tokio::test]
async fn forged_signature_is_rejected_without_reaching_the_application() {
    use positron_net::core::identity::Identity;
    use positron_net::networking::wire::message::MessageFactory;

    let dir_forger = tempfile::tempdir().unwrap();
    let dir_victim = tempfile::tempdir().unwrap();
    let forger = Identity::load_or_generate(&dir_forger.path().join("id.key")).unwrap();
    let victim = Identity::load_or_generate(&dir_victim.path().join("id.key")).unwrap();

    // The forger signs a heartbeat but the message claims to originate from the victim.
    let mut message = MessageFactory::heartbeat(victim.node_id(), 1.0);
    message.sign(&forger).unwrap();

    // Verification against the claimed sender's real public key must fail even though the
    // signature itself is well-formed and was produced by a real keypair.
    assert!(!message.verify(&victim.public_key_bytes()));
    // It does verify against the key that actually signed it, proving the signature is valid in
    // isolation: the rejection is specifically about sender/key mismatch, not a malformed sig.
    assert!(message.verify(&forger.public_key_bytes()));
}

/// A 10,000-byte payload fragments into more than one packet at a 1400-byte MTU and reassembles
/// byte-for-byte on the receiving side, including out-of-order delivery.
#[tokio::test]
async fn ten_kilobyte_payload_fragments_and_reassembles_at_mtu() {
    let mtu = 1400;
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();

    let fragmenter = Fragmenter::new(mtu);
    let packets = fragmenter.fragment(&payload, 0);
    assert!(packets.len() > 1, "a 10,000-byte payload must not fit in one packet at this mtu");
    assert!(packets.iter().all(|p| p.payload.len() <= mtu));

    let mut receiver = Fragmenter::new(mtu);
    let mut shuffled = packets;
    // reverse to ensure the reassembly buffer is exercised out of arrival order
    shuffled.reverse();

    let mut reassembled = None;
    for packet in &shuffled {
        if let Some(whole) = receiver.add_fragment(packet) {
            reassembled = Some(whole);
        }
    }
    assert_eq!(reassembled.unwrap(), payload);
    assert_eq!(receiver.pending_count(), 0);
}

/// A single-node DHT store/retrieve/delete cycle: storing locally makes the value retrievable
/// with no network round trip, and a delete makes it unretrievable again.
#[tokio::test]
async fn single_node_dht_store_retrieve_delete_cycle() {
    struct NullTransport;
    #[async_trait::async_trait]
    impl DhtTransport for NullTransport {
        async fn send_message(&self, _address: &str, _message: positron_net::networking::wire::message::Message) -> Result<(), DhtError> {
            Ok(())
        }
    }

    let self_id = NodeId::from_public_key(&[42u8; 32]);
    let dht = DistributedHashTable::new(
        self_id,
        "127.0.0.1:9999".to_string(),
        DhtParams {
            k: 20,
            alpha: 3,
            replication_factor: 3,
            ttl_default_secs: 3600.0,
            rpc_timeout: Duration::from_millis(200),
            max_lookup_iterations: 5,
        },
        Arc::new(NullTransport),
    );

    assert_eq!(dht.retrieve("profile:alice", true).await, None);

    dht.store("profile:alice", b"{\"age\":30}".to_vec(), Some(120.0)).await;
    assert_eq!(dht.retrieve("profile:alice", true).await, Some(b"{\"age\":30}".to_vec()));

    let stats = dht.stats().await;
    assert_eq!(stats.stores, 1);

    assert!(dht.delete("profile:alice").await);
    assert_eq!(dht.retrieve("profile:alice", true).await, None);
    // deleting again reports nothing existed
    assert!(!dht.delete("profile:alice").await);
}
