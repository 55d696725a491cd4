//! # Node Identity and Peer Addressing
//!
//! This module defines the two identity types the overlay works with:
//!
//! - [`NodeId`]: random 64-bit identifier a node picks once at startup
//! - [`NeighbourAddr`]: the `(ip, port)` pair that identifies a neighbour
//!
//! ## Identity Model
//!
//! A `NodeId` is only a *claim*: any peer can put any id in a HELLO. The
//! neighbour table therefore keys peers by their transport address, never by
//! id. The id is carried in hellos (symmetry proof) and in DATA/ACK TLVs
//! (origin of a data item).
//!
//! ## Address Normalisation
//!
//! The wire format carries 128-bit addresses. IPv4 peers are represented as
//! IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) so that a neighbour has exactly
//! one representation regardless of how the socket reported it.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Random 64-bit node identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    #[inline]
    pub const fn from_u64(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Failure of the operating system CSPRNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoError {
    pub code: Option<u32>,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "CSPRNG unavailable (error code {})", code),
            None => write!(f, "CSPRNG unavailable"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<getrandom::Error> for CryptoError {
    fn from(err: getrandom::Error) -> Self {
        Self { code: Some(err.code().get()) }
    }
}

/// Draw a fresh local identity from the operating system CSPRNG.
///
/// Called once at startup; the id is kept for the lifetime of the process.
pub fn generate_local_id() -> Result<NodeId, CryptoError> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(NodeId::from_be_bytes(bytes))
}

/// Transport address of a neighbour. Equality of neighbours is equality of
/// this value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NeighbourAddr {
    ip: Ipv6Addr,
    port: u16,
}

impl NeighbourAddr {
    pub const fn new(ip: Ipv6Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Normalise a socket address; IPv4 becomes IPv4-mapped IPv6.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self { ip, port: addr.port() }
    }

    #[inline]
    pub const fn ip(&self) -> Ipv6Addr {
        self.ip
    }

    #[inline]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Socket address to hand to the OS.
    ///
    /// An IPv4 socket cannot reach `::ffff:a.b.c.d`, so mapped addresses are
    /// unwrapped when `ipv4_socket` is set. IPv6 sockets are dual-stack and take
    /// the mapped form as is.
    pub fn to_socket_addr(&self, ipv4_socket: bool) -> SocketAddr {
        if ipv4_socket && let Some(v4) = self.ip.to_ipv4_mapped() {
            return SocketAddr::new(IpAddr::V4(v4), self.port);
        }
        SocketAddr::V6(SocketAddrV6::new(self.ip, self.port, 0, 0))
    }
}

impl fmt::Display for NeighbourAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => write!(f, "{}:{}", v4, self.port),
            None => write!(f, "[{}]:{}", self.ip, self.port),
        }
    }
}

impl From<SocketAddr> for NeighbourAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}
