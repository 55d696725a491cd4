//! # meshchat - Peer-to-Peer Chat Overlay
//!
//! meshchat floods short text messages over UDP among nodes that find each
//! other by gossip:
//!
//! - **Wire format**: compact TLV datagrams with a 4-byte header
//! - **Neighbours**: hello exchanges establish symmetric (two-way) links
//! - **Flooding**: every item is retried to each symmetric neighbour with
//!   exponential backoff until acknowledged, and silent neighbours are evicted
//!
//! ## Architecture
//!
//! The node is built around one **actor**:
//! - [`Engine`] is a cheap-to-clone handle that sends commands over a channel
//! - the actor owns the neighbour table and the data cache and processes
//!   commands sequentially
//! - one propagation task per cached item asks the actor what to send next
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: bind, bootstrap, submit, events, shutdown |
//! | `identity` | Random node ids and normalised neighbour addresses |
//! | `messages` | TLV and datagram encoding/decoding |
//! | `neighbours` | Active/potential sets, symmetry, hello scheduling |
//! | `flooding` | Bounded data cache and per-item retry policy |
//! | `protocol` | Interpreter for decoded datagrams and the engine actor |
//! | `protocols` | Transport and planner trait seams |
//! | `transport` | UDP socket, bounded sends, receive loop |

mod flooding;
mod identity;
mod messages;
mod neighbours;
mod node;
mod protocol;
mod protocols;
mod transport;

pub use flooding::{
    backoff_bounds, draw_backoff, propagate, Dissemination, FloodStep, InsertOutcome, PendingTarget,
    PropagationState, ReceivedData, SubmitRejection,
};
pub use identity::{generate_local_id, CryptoError, NeighbourAddr, NodeId};
pub use messages::{
    DataKey, DecodeError, EncodeError, GoAwayCode, Message, Tlv, TlvType, MAX_DATAGRAM_SIZE,
    MAX_DATA_PAYLOAD, MAX_RECEIVE_SIZE,
};
pub use neighbours::{HelloSchedule, Neighbour, NeighbourTable};
pub use node::Node;
pub use protocol::{Effect, Engine, NeighbourInfo, NeighbourSnapshot, NodeConfig, NodeEvent, ProtocolState};
pub use protocols::{FloodPlanner, PeerTransport, SendError};
pub use transport::UdpTransport;
