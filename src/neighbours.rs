//! # Neighbour Table
//!
//! Tracks the peers this node exchanges datagrams with, in two disjoint sets:
//!
//! | Set | Entered by | Left by |
//! |-----|------------|---------|
//! | active | any HELLO from the peer | GO_AWAY, framing error, retry budget exhausted |
//! | potential | bootstrap, NEIGHBOUR gossip, demotion | any HELLO from the peer |
//!
//! ## Symmetry
//!
//! An active neighbour is *symmetric* while the last long HELLO it sent naming
//! this node is younger than the symmetry timeout (120s by default). Only
//! symmetric neighbours are flooding targets and gossip subjects.
//!
//! ## Maintenance
//!
//! [`HelloSchedule`] plans the periodic traffic that keeps the sets alive:
//!
//! - short HELLO to every potential neighbour while fewer than `min_symmetric`
//!   neighbours are symmetric (every 10s)
//! - long HELLO to every active neighbour (every 20s), with NEIGHBOUR TLVs for
//!   the other symmetric neighbours appended on every 4th round

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::{NeighbourAddr, NodeId};
use crate::messages::{Message, Tlv, MAX_DATAGRAM_SIZE};
use crate::protocol::NodeConfig;

/// A known peer, keyed by its transport address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Neighbour {
    pub addr: NeighbourAddr,
    /// Last id the peer claimed; zero when only learned through gossip.
    pub id: NodeId,
    pub last_hello_at: Option<Instant>,
    pub last_long_hello_at: Option<Instant>,
}

impl Neighbour {
    pub fn new(addr: NeighbourAddr, id: NodeId) -> Self {
        Self {
            addr,
            id,
            last_hello_at: None,
            last_long_hello_at: None,
        }
    }

    pub fn is_symmetric_at(&self, now: Instant, timeout: Duration) -> bool {
        self.last_long_hello_at
            .is_some_and(|at| now.saturating_duration_since(at) < timeout)
    }
}

/// Active and potential neighbour sets.
pub struct NeighbourTable {
    active: BTreeMap<NeighbourAddr, Neighbour>,
    potential: LruCache<NeighbourAddr, Neighbour>,
    max_active: usize,
    symmetry_timeout: Duration,
}

impl NeighbourTable {
    pub fn new(max_active: usize, max_potential: NonZeroUsize, symmetry_timeout: Duration) -> Self {
        Self {
            active: BTreeMap::new(),
            potential: LruCache::new(max_potential),
            max_active,
            symmetry_timeout,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let max_potential = NonZeroUsize::new(config.max_potential).unwrap_or(NonZeroUsize::MIN);
        Self::new(config.max_active, max_potential, config.symmetry_timeout)
    }

    /// Find a neighbour in either set, active first.
    pub fn lookup(&self, addr: &NeighbourAddr) -> Option<&Neighbour> {
        self.active.get(addr).or_else(|| self.potential.peek(addr))
    }

    pub fn contains(&self, addr: &NeighbourAddr) -> bool {
        self.is_active(addr) || self.is_potential(addr)
    }

    pub fn is_active(&self, addr: &NeighbourAddr) -> bool {
        self.active.contains_key(addr)
    }

    pub fn is_potential(&self, addr: &NeighbourAddr) -> bool {
        self.potential.contains(addr)
    }

    /// Insert into the active set if absent. An existing entry is left as is.
    ///
    /// Returns `false` when the entry already existed or the set is full.
    pub fn add_active(&mut self, neighbour: Neighbour) -> bool {
        if self.active.contains_key(&neighbour.addr) {
            return false;
        }
        if self.active.len() >= self.max_active {
            debug!(peer = %neighbour.addr, max = self.max_active, "active set full, ignoring neighbour");
            return false;
        }
        self.active.insert(neighbour.addr, neighbour);
        true
    }

    /// Insert into the potential set if absent. The least recently learned
    /// entry is dropped when the set is full.
    pub fn add_potential(&mut self, neighbour: Neighbour) -> bool {
        if self.potential.contains(&neighbour.addr) {
            return false;
        }
        if let Some((dropped, _)) = self.potential.push(neighbour.addr, neighbour) {
            trace!(peer = %dropped, "potential set full, dropped oldest entry");
        }
        true
    }

    pub fn remove_active(&mut self, addr: &NeighbourAddr) -> Option<Neighbour> {
        self.active.remove(addr)
    }

    pub fn remove_potential(&mut self, addr: &NeighbourAddr) -> Option<Neighbour> {
        self.potential.pop(addr)
    }

    /// Move a neighbour from the active to the potential set.
    pub fn demote(&mut self, addr: &NeighbourAddr) -> bool {
        match self.active.remove(addr) {
            Some(mut neighbour) => {
                neighbour.last_long_hello_at = None;
                debug!(peer = %addr, "neighbour demoted to potential");
                self.potential.push(neighbour.addr, neighbour);
                true
            }
            None => false,
        }
    }

    /// Make `addr` active, pulling it out of the potential set if it was there.
    ///
    /// Returns the active entry, or `None` if the active set is full.
    pub fn activate(&mut self, addr: NeighbourAddr, id: NodeId) -> Option<&mut Neighbour> {
        if !self.active.contains_key(&addr) {
            if self.active.len() >= self.max_active {
                debug!(peer = %addr, "active set full, hello ignored");
                return None;
            }
            self.potential.pop(&addr);
            debug!(peer = %addr, id = %id, "new active neighbour");
            self.active.insert(addr, Neighbour::new(addr, id));
        }
        self.active.get_mut(&addr)
    }

    /// Refresh hello timestamps for an active neighbour.
    ///
    /// `last_long_hello_at` only moves for a long hello naming `local_id`.
    pub fn record_hello(
        &mut self,
        addr: &NeighbourAddr,
        is_long: bool,
        dest_id: Option<NodeId>,
        local_id: NodeId,
        now: Instant,
    ) -> bool {
        let Some(neighbour) = self.active.get_mut(addr) else {
            return false;
        };
        neighbour.last_hello_at = Some(now);
        if is_long && dest_id == Some(local_id) {
            neighbour.last_long_hello_at = Some(now);
        }
        true
    }

    pub fn is_symmetric(&self, addr: &NeighbourAddr, now: Instant) -> bool {
        self.active
            .get(addr)
            .is_some_and(|n| n.is_symmetric_at(now, self.symmetry_timeout))
    }

    /// Addresses of the currently symmetric active neighbours.
    pub fn symmetric_snapshot(&self, now: Instant) -> Vec<NeighbourAddr> {
        self.active
            .values()
            .filter(|n| n.is_symmetric_at(now, self.symmetry_timeout))
            .map(|n| n.addr)
            .collect()
    }

    pub fn symmetric_count(&self, now: Instant) -> usize {
        self.active
            .values()
            .filter(|n| n.is_symmetric_at(now, self.symmetry_timeout))
            .count()
    }

    pub fn active(&self) -> impl Iterator<Item = &Neighbour> {
        self.active.values()
    }

    pub fn potential(&self) -> impl Iterator<Item = &Neighbour> {
        self.potential.iter().map(|(_, n)| n)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn potential_len(&self) -> usize {
        self.potential.len()
    }
}

/// Timer state for periodic hello traffic. Not reentrant; driven by one tick.
#[derive(Debug, Default)]
pub struct HelloSchedule {
    last_solicitation_at: Option<Instant>,
    last_long_hello_at: Option<Instant>,
    rounds: u32,
}

impl HelloSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Datagrams due at `now`, as `(destination, message)` pairs.
    pub fn plan(
        &mut self,
        table: &NeighbourTable,
        local_id: NodeId,
        config: &NodeConfig,
        now: Instant,
    ) -> Vec<(NeighbourAddr, Message)> {
        let mut out = Vec::new();

        if is_due(self.last_solicitation_at, config.short_hello_interval, now) {
            self.last_solicitation_at = Some(now);
            let symmetric = table.symmetric_count(now);
            if symmetric < config.min_symmetric && table.potential_len() > 0 {
                trace!(symmetric, potential = table.potential_len(), "soliciting potential neighbours");
                for neighbour in table.potential() {
                    if let Ok(message) = Message::single(Tlv::short_hello(local_id)) {
                        out.push((neighbour.addr, message));
                    }
                }
            }
        }

        if is_due(self.last_long_hello_at, config.long_hello_interval, now) {
            self.last_long_hello_at = Some(now);
            let gossip = self.rounds % config.gossip_every.max(1) == 0;
            self.rounds = self.rounds.wrapping_add(1);

            let symmetric = if gossip { table.symmetric_snapshot(now) } else { Vec::new() };
            for neighbour in table.active() {
                out.push((neighbour.addr, long_hello_for(neighbour, local_id, &symmetric)));
            }
            trace!(active = table.active_len(), gossip, "long hello round");
        }

        out
    }
}

fn is_due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.is_none_or(|at| now.saturating_duration_since(at) >= interval)
}

/// Long HELLO for `target`, followed by NEIGHBOUR TLVs for every other entry
/// of `symmetric` that fits the datagram budget.
fn long_hello_for(target: &Neighbour, local_id: NodeId, symmetric: &[NeighbourAddr]) -> Message {
    let mut message = Message::new();
    // Fixed-size TLVs; push cannot fail.
    let _ = message.push(Tlv::long_hello(local_id, target.id));
    for addr in symmetric.iter().filter(|a| **a != target.addr) {
        let tlv = Tlv::Neighbour(*addr);
        if !message.fits(&tlv, MAX_DATAGRAM_SIZE) {
            debug!(peer = %target.addr, "neighbour gossip truncated to datagram budget");
            break;
        }
        let _ = message.push(tlv);
    }
    message
}
