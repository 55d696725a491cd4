//! Integration tests for nodes talking over real UDP sockets on loopback.
//!
//! Timing is shortened through `NodeConfig` so that hello exchanges and
//! retries happen within a few hundred milliseconds.

use std::future::Future;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use meshchat::{GoAwayCode, Message, NeighbourAddr, Node, NodeConfig, NodeEvent, Tlv};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_addr() -> String {
    format!("127.0.0.1:{}", next_port())
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn fast_config() -> NodeConfig {
    NodeConfig {
        short_hello_interval: Duration::from_millis(100),
        long_hello_interval: Duration::from_millis(200),
        maintenance_tick: Duration::from_millis(20),
        backoff_unit: Duration::from_millis(50),
        recv_timeout: Duration::from_millis(200),
        ..NodeConfig::default()
    }
}

async fn fast_node() -> Node {
    Node::bind_with_config(&test_addr(), fast_config())
        .await
        .expect("bind failed")
}

fn addr_of(node: &Node) -> NeighbourAddr {
    NeighbourAddr::from_socket_addr(node.local_addr())
}

async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    false
}

async fn symmetric_with(node: &Node, peer: NeighbourAddr) -> bool {
    node.neighbours()
        .await
        .map(|s| s.is_symmetric(&peer))
        .unwrap_or(false)
}

async fn connect(a: &Node, b: &Node) {
    a.bootstrap(b.local_addr()).await.expect("bootstrap failed");
    let (a_addr, b_addr) = (addr_of(a), addr_of(b));
    assert!(
        wait_until(|| async move { symmetric_with(a, b_addr).await && symmetric_with(b, a_addr).await }).await,
        "nodes never became symmetric"
    );
}

async fn next_text(events: &mut tokio::sync::mpsc::Receiver<NodeEvent>) -> Vec<u8> {
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(NodeEvent::Text { text, .. }) => return text,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no text event before timeout")
}

#[tokio::test]
async fn bootstrap_hello_leads_to_symmetry() {
    let a = fast_node().await;
    let b = fast_node().await;

    a.bootstrap(b.local_addr()).await.expect("bootstrap failed");

    let a_addr = addr_of(&a);
    let b_ref = &b;
    assert!(
        wait_until(|| async move { b_ref.neighbours().await.map(|s| s.is_active(&a_addr)).unwrap_or(false) }).await,
        "short hello did not make the sender active"
    );

    connect(&a, &b).await;
    let snapshot = a.neighbours().await.expect("snapshot failed");
    let info = snapshot
        .active
        .iter()
        .find(|n| n.addr == addr_of(&b))
        .expect("b not active on a");
    assert_eq!(info.id, b.local_id());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn text_reaches_symmetric_neighbour() {
    let a = fast_node().await;
    let b = fast_node().await;
    let mut b_events = b.events().await.expect("events taken");

    connect(&a, &b).await;
    a.submit(b"alice : hi").await.expect("submit failed");

    assert_eq!(next_text(&mut b_events).await, b"alice : hi");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn text_floods_across_two_hops() {
    let a = fast_node().await;
    let b = fast_node().await;
    let c = fast_node().await;
    let mut c_events = c.events().await.expect("events taken");

    connect(&a, &b).await;
    connect(&c, &b).await;

    let key = a.submit(b"over the hill").await.expect("submit failed");
    assert_eq!(key.origin, a.local_id());
    assert_eq!(next_text(&mut c_events).await, b"over the hill");

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn garbage_datagram_gets_go_away_three() {
    let node = fast_node().await;
    let stranger = UdpSocket::bind("127.0.0.1:0").await.expect("stranger bind failed");

    stranger
        .send_to(&[1, 2, 3], node.local_addr())
        .await
        .expect("stranger send failed");

    let mut buf = [0u8; 512];
    let (len, from) = timeout(TEST_TIMEOUT, stranger.recv_from(&mut buf))
        .await
        .expect("no reply before timeout")
        .expect("recv failed");
    assert_eq!(from, node.local_addr());

    let reply = Message::decode(&buf[..len]).expect("reply should decode");
    match &reply.tlvs()[0] {
        Tlv::GoAway { code, .. } => assert_eq!(*code, GoAwayCode::ProtocolViolation),
        other => panic!("expected GO_AWAY, got {:?}", other),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn shutdown_tells_neighbours() {
    let a = fast_node().await;
    let b = fast_node().await;
    let mut b_events = b.events().await.expect("events taken");

    connect(&a, &b).await;
    a.shutdown().await;

    let notice = timeout(TEST_TIMEOUT, async {
        loop {
            match b_events.recv().await {
                Some(NodeEvent::GoAway { code, .. }) => return code,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no go away before timeout");
    assert_eq!(notice, GoAwayCode::Leaving);

    let snapshot = b.neighbours().await.expect("snapshot failed");
    assert!(!snapshot.is_active(&addr_of(&a)));
    assert!(snapshot.is_potential(&addr_of(&a)));

    b.shutdown().await;
}
