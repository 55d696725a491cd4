//! # High-Level Node API
//!
//! A [`Node`] binds the UDP socket, spawns the engine actor and the receive
//! loop, and exposes the few operations an application needs.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("[::]:0").await?;
//! node.bootstrap("192.0.2.7:1212".parse()?).await?;
//!
//! let mut events = node.events().await?;
//! node.submit(b"alice : hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let NodeEvent::Text { text, .. } = event {
//!         println!("{}", String::from_utf8_lossy(&text));
//!     }
//! }
//! node.shutdown().await;
//! ```
//!
//! ## Component Integration
//!
//! - **UdpTransport**: the socket, shared by the engine and propagation tasks
//! - **Engine**: actor owning the neighbour table and the data cache
//! - **receive loop**: feeds datagrams from the socket into the engine

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::identity::{generate_local_id, NeighbourAddr, NodeId};
use crate::messages::{DataKey, Message, Tlv};
use crate::protocol::{Engine, NeighbourSnapshot, NodeConfig, NodeEvent};
use crate::protocols::PeerTransport;
use crate::transport::UdpTransport;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

pub struct Node {
    local_id: NodeId,
    transport: Arc<UdpTransport>,
    engine: Engine,
    events: TakeOnce<NodeEvent>,
    receiver: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl Node {
    /// Create a node with a fresh random id and default timing.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, NodeConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, config: NodeConfig) -> Result<Self> {
        let local_id = generate_local_id().context("failed to generate local id")?;
        Self::create(addr, local_id, config).await
    }

    /// Create a node with a caller-chosen id.
    pub async fn bind_with_id(addr: &str, local_id: NodeId, config: NodeConfig) -> Result<Self> {
        Self::create(addr, local_id, config).await
    }

    async fn create(addr: &str, local_id: NodeId, config: NodeConfig) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;

        let transport = Arc::new(
            UdpTransport::bind(addr, config.send_timeout)
                .await
                .with_context(|| format!("failed to bind UDP socket on {}", addr))?,
        );
        let recv_timeout = config.recv_timeout;

        let (engine, events) = Engine::spawn(local_id, config, transport.clone());
        let cancel = CancellationToken::new();
        let receiver = transport.spawn_receiver(engine.clone(), recv_timeout, cancel.clone());

        info!(id = %local_id, addr = %transport.local_addr(), "node started");

        Ok(Self {
            local_id,
            transport,
            engine,
            events: tokio::sync::Mutex::new(Some(events)),
            receiver,
            cancel,
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Record `addr` as a potential neighbour and greet it with a short HELLO.
    ///
    /// Fails if the greeting cannot be sent.
    pub async fn bootstrap(&self, addr: SocketAddr) -> Result<()> {
        let peer = NeighbourAddr::from_socket_addr(addr);
        self.engine.add_bootstrap(peer).await?;

        let hello = Message::single(Tlv::short_hello(self.local_id))?;
        self.transport
            .send_message(peer, &hello)
            .await
            .with_context(|| format!("failed to send hello to bootstrap peer {}", addr))?;
        debug!(peer = %peer, "bootstrap hello sent");
        Ok(())
    }

    /// Flood a text payload authored by this node.
    pub async fn submit(&self, payload: &[u8]) -> Result<DataKey> {
        self.engine.submit(payload.to_vec()).await
    }

    /// Take the event receiver. Only the first call succeeds.
    pub async fn events(&self) -> Result<mpsc::Receiver<NodeEvent>> {
        let mut guard = self.events.lock().await;
        guard.take().context("event receiver already taken")
    }

    pub async fn neighbours(&self) -> Result<NeighbourSnapshot> {
        self.engine.snapshot().await
    }

    /// Say goodbye to active neighbours and stop all tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Err(e) = self.engine.shutdown().await {
            debug!(error = %e, "engine already stopped");
        }
        self.receiver.abort();
        info!(id = %self.local_id, "node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_rejects_bad_address() {
        assert!(Node::bind("not-an-address").await.is_err());
    }

    #[tokio::test]
    async fn events_can_be_taken_once() {
        let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
        assert!(node.events().await.is_ok());
        assert!(node.events().await.is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn bootstrap_peer_is_potential() {
        let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        node.bootstrap(peer).await.expect("bootstrap failed");

        let snapshot = node.neighbours().await.expect("snapshot failed");
        assert!(snapshot.is_potential(&NeighbourAddr::from_socket_addr(peer)));
        assert!(snapshot.active.is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_submit_is_rejected() {
        let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
        let err = node.submit(&[0u8; 300]).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
        node.shutdown().await;
    }
}
