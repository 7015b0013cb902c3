//! Integration tests for topic mesh dissemination.
//!
//! Real nodes over QUIC on loopback: mesh formation through a bootstrap node,
//! delivery without self-echo, duplicate suppression across a fully meshed
//! group, and ejection of a peer that stops answering heartbeats.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use librum::{Identity, Message, Node, NodeConfig, Subscription, Topic};
use tokio::time::{sleep, timeout, Instant};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(20);
const QUIET_PERIOD: Duration = Duration::from_millis(750);
const HEARTBEAT: Duration = Duration::from_millis(200);
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default().with_listen_addr(format!("127.0.0.1:{}", next_port()));
    config.discovery.local_discovery = false;
    config.gossip.heartbeat_interval = HEARTBEAT;
    config.gossip.send_timeout = SEND_TIMEOUT;
    config
}

/// A bootstrap node plus `n` nodes seeded with it.
async fn network(n: usize) -> (Node, Vec<Node>) {
    let bootstrap = Node::bind(test_config()).expect("bootstrap bind failed");
    bootstrap.start(&[]).await.expect("bootstrap start failed");
    let seed = bootstrap.contact().clone();

    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        let node = Node::bind(test_config()).expect("bind failed");
        node.start(std::slice::from_ref(&seed)).await.expect("start failed");
        nodes.push(node);
    }
    (bootstrap, nodes)
}

async fn wait_for_mesh(topic: &Topic, expected: &[Identity]) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        let mesh = topic.mesh_peers().await;
        if expected.iter().all(|id| mesh.contains(id)) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "mesh for {} never contained {:?}, has {:?}",
            topic.name(),
            expected,
            mesh
        );
        sleep(Duration::from_millis(50)).await;
    }
}

/// Everything that arrives before the subscription goes quiet.
async fn drain(sub: &mut Subscription) -> Vec<Message> {
    let mut received = Vec::new();
    while let Ok(Some(msg)) = timeout(QUIET_PERIOD, sub.next()).await {
        received.push(msg);
    }
    received
}

async fn shutdown_all(nodes: &[&Node]) {
    for node in nodes {
        node.shutdown().await;
    }
}

// =============================================================================
// Test: three nodes, one publisher
// =============================================================================

#[tokio::test]
async fn three_node_pubsub_no_self_delivery() {
    let (a, rest) = network(2).await;
    let (b, c) = (&rest[0], &rest[1]);

    let topic_a = a.join("t").await.expect("a join failed");
    let topic_b = b.join("t").await.expect("b join failed");
    let topic_c = c.join("t").await.expect("c join failed");

    wait_for_mesh(&topic_a, &[b.identity(), c.identity()]).await;
    wait_for_mesh(&topic_b, &[a.identity()]).await;
    wait_for_mesh(&topic_c, &[a.identity()]).await;

    let mut sub_a = topic_a.subscribe().await.expect("a subscribe failed");
    let mut sub_b = topic_b.subscribe().await.expect("b subscribe failed");
    let mut sub_c = topic_c.subscribe().await.expect("c subscribe failed");

    topic_b.publish("hello").await.expect("publish failed");

    for (name, sub) in [("a", &mut sub_a), ("c", &mut sub_c)] {
        let received = drain(sub).await;
        assert_eq!(received.len(), 1, "node {name} should receive exactly one copy");
        assert_eq!(received[0].data, b"hello");
        assert_eq!(received[0].source, b.identity());
        assert_eq!(received[0].topic, "t");
    }
    assert!(drain(&mut sub_b).await.is_empty(), "publisher must not receive its own message");

    shutdown_all(&[&a, b, c]).await;
}

// =============================================================================
// Test: duplicate suppression
// =============================================================================

/// Every node meshes with every other, so each message reaches each node over
/// several paths. Each subscriber must still see it once.
#[tokio::test]
async fn fully_meshed_group_delivers_each_message_once() {
    let (a, rest) = network(3).await;
    let nodes: Vec<&Node> = std::iter::once(&a).chain(rest.iter()).collect();

    let mut topics = Vec::new();
    for node in &nodes {
        topics.push(node.join("dups").await.expect("join failed"));
    }
    for (i, topic) in topics.iter().enumerate() {
        let others: Vec<Identity> = nodes
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, n)| n.identity())
            .collect();
        wait_for_mesh(topic, &others).await;
    }

    let mut subs = Vec::new();
    for topic in &topics[1..] {
        subs.push(topic.subscribe().await.expect("subscribe failed"));
    }

    for i in 0..5 {
        topics[0].publish(format!("msg-{i}")).await.expect("publish failed");
    }

    for sub in &mut subs {
        let received = drain(sub).await;
        let mut texts: Vec<String> = received.iter().map(|m| m.text()).collect();
        texts.sort();
        assert_eq!(texts, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    }

    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn messages_from_one_neighbour_arrive_in_order() {
    let (a, rest) = network(1).await;
    let b = &rest[0];

    let topic_a = a.join("ordered").await.expect("a join failed");
    let topic_b = b.join("ordered").await.expect("b join failed");
    wait_for_mesh(&topic_a, &[b.identity()]).await;
    wait_for_mesh(&topic_b, &[a.identity()]).await;

    let mut sub_a = topic_a.subscribe().await.expect("subscribe failed");
    for i in 0..20 {
        topic_b.publish(format!("{i}")).await.expect("publish failed");
    }

    let texts: Vec<String> = drain(&mut sub_a).await.iter().map(|m| m.text()).collect();
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(texts, expected);

    shutdown_all(&[&a, b]).await;
}

// =============================================================================
// Test: mesh ejection
// =============================================================================

#[tokio::test]
async fn silent_peer_is_ejected_from_mesh() {
    let (a, rest) = network(1).await;
    let b = &rest[0];

    let topic_a = a.join("eject").await.expect("a join failed");
    let topic_b = b.join("eject").await.expect("b join failed");
    wait_for_mesh(&topic_a, &[b.identity()]).await;
    wait_for_mesh(&topic_b, &[a.identity()]).await;

    b.shutdown().await;
    let stopped = Instant::now();

    let bound = HEARTBEAT * (librum::gossipsub::DEFAULT_MAX_MISSED_HEARTBEATS + 1) + SEND_TIMEOUT;
    loop {
        if !topic_a.mesh_peers().await.contains(&b.identity()) {
            break;
        }
        assert!(
            stopped.elapsed() < bound + Duration::from_secs(2),
            "peer still in mesh after {:?}",
            stopped.elapsed()
        );
        sleep(Duration::from_millis(50)).await;
    }

    a.shutdown().await;
}

#[tokio::test]
async fn left_topic_stops_delivery() {
    let (a, rest) = network(1).await;
    let b = &rest[0];

    let topic_a = a.join("leave").await.expect("a join failed");
    let topic_b = b.join("leave").await.expect("b join failed");
    wait_for_mesh(&topic_a, &[b.identity()]).await;

    let mut sub_b = topic_b.subscribe().await.expect("subscribe failed");
    topic_b.leave().await;

    assert!(timeout(QUIET_PERIOD, sub_b.next()).await.is_ok_and(|m| m.is_none()));
    topic_a.publish("anyone?").await.expect("publish failed");

    shutdown_all(&[&a, b]).await;
}
