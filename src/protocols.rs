//! Trait seams between the protocol engine and its collaborators.
//!
//! | Trait | Implemented by | Used by |
//! |-------|----------------|---------|
//! | [`PeerTransport`] | [`UdpTransport`](crate::transport::UdpTransport), test doubles | engine actor, propagation tasks |
//! | [`FloodPlanner`] | engine handle | [`propagate`](crate::flooding::propagate) |
//!
//! Keeping these separate from their implementations lets the flooding and
//! protocol modules be exercised without a socket.

use std::fmt;
use std::io;

use async_trait::async_trait;

use crate::flooding::FloodStep;
use crate::identity::NeighbourAddr;
use crate::messages::{DataKey, Message};

/// Datagram delivery to a single neighbour.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Encode and send `message` to `to`.
    ///
    /// Implementations bound the wait and retry transient failures once before
    /// reporting [`SendError`].
    async fn send_message(&self, to: NeighbourAddr, message: &Message) -> Result<(), SendError>;
}

/// Source of propagation steps for one cached data item.
#[async_trait]
pub trait FloodPlanner: Send + Sync + 'static {
    /// Next step for `key`, or `None` once the engine is gone.
    async fn next_step(&self, key: DataKey) -> Option<FloodStep>;
}

/// A datagram that could not be handed to the OS.
#[derive(Debug)]
pub enum SendError {
    /// The socket did not become writable within the send timeout, twice.
    TimedOut,
    Io(io::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "send timed out"),
            Self::Io(e) => write!(f, "send failed: {}", e),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TimedOut => None,
            Self::Io(e) => Some(e),
        }
    }
}
