//! # UDP Transport
//!
//! One UDP socket carries every datagram the node sends or receives.
//!
//! ## Socket Setup
//!
//! | Option | Value |
//! |--------|-------|
//! | `SO_REUSEADDR` | on |
//! | `IPV6_V6ONLY` | off (dual-stack) when bound to an IPv6 address |
//! | blocking | off; readiness handled by tokio |
//!
//! ## Sending
//!
//! Each send waits at most `send_timeout` for the socket and is retried once on
//! timeout or would-block. A second failure is reported as [`SendError`] and is
//! never fatal to the node.
//!
//! ## Receiving
//!
//! [`UdpTransport::spawn_receiver`] runs a loop that waits at most
//! `recv_timeout` per `recv_from`, normalises the source address and hands the
//! bytes to the engine. Decoding happens on the engine actor.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::identity::NeighbourAddr;
use crate::messages::{Message, MAX_RECEIVE_SIZE};
use crate::protocol::Engine;
use crate::protocols::{PeerTransport, SendError};

/// Sends made per datagram before giving up.
const SEND_TRIES: usize = 2;

pub struct UdpTransport {
    inner: Arc<UdpSocket>,
    local_addr: SocketAddr,
    send_timeout: Duration,
}

impl UdpTransport {
    /// Bind a non-blocking, address-reusing UDP socket.
    pub async fn bind(addr: SocketAddr, send_timeout: Duration) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        let local_addr = socket.local_addr()?;
        debug!(addr = %local_addr, "udp socket bound");

        Ok(Self {
            inner: Arc::new(socket),
            local_addr,
            send_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn is_ipv4(&self) -> bool {
        self.local_addr.is_ipv4()
    }

    /// Send raw bytes with the bounded-wait, single-retry policy.
    pub async fn send_datagram(&self, to: SocketAddr, bytes: &[u8]) -> Result<(), SendError> {
        let mut last_error = SendError::TimedOut;
        for attempt in 1..=SEND_TRIES {
            match tokio::time::timeout(self.send_timeout, self.inner.send_to(bytes, to)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                    trace!(peer = %to, attempt, "socket busy, retrying");
                    last_error = SendError::Io(e);
                }
                Ok(Err(e)) => return Err(SendError::Io(e)),
                Err(_) => {
                    trace!(peer = %to, attempt, "send timed out");
                    last_error = SendError::TimedOut;
                }
            }
        }
        Err(last_error)
    }

    /// Start the receive loop, forwarding datagrams to `engine` until `cancel`
    /// fires or the engine goes away.
    pub fn spawn_receiver(
        &self,
        engine: Engine,
        recv_timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let socket = self.inner.clone();
        tokio::spawn(receive_loop(socket, engine, recv_timeout, cancel))
    }
}

#[async_trait]
impl PeerTransport for UdpTransport {
    async fn send_message(&self, to: NeighbourAddr, message: &Message) -> Result<(), SendError> {
        let bytes = message.encode();
        trace!(peer = %to, len = bytes.len(), "send");
        self.send_datagram(to.to_socket_addr(self.is_ipv4()), &bytes).await
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    engine: Engine,
    recv_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_RECEIVE_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)) => r,
        };

        match received {
            Err(_) => continue,
            Ok(Err(e)) => {
                // ICMP errors from earlier sends surface here on some platforms.
                warn!(error = %e, "recv_from failed");
                continue;
            }
            Ok(Ok((len, from))) => {
                trace!(peer = %from, len, "recv");
                let from = NeighbourAddr::from_socket_addr(from);
                if engine.inbound(from, buf[..len].to_vec()).await.is_err() {
                    debug!("engine closed, receive loop exiting");
                    break;
                }
            }
        }
    }
}
