//! # Reliable Flooding
//!
//! Every data item (local or received) is pushed to each symmetric neighbour
//! until that neighbour acknowledges it or runs out of retries.
//!
//! ## Cache
//!
//! [`Dissemination`] holds at most `capacity` items (16 by default), most
//! recently inserted first. Inserting beyond capacity evicts the oldest item and
//! cancels its propagation task. A key that is already cached is never
//! re-inserted, which is what stops a flood from looping.
//!
//! ## Per-target Retry Policy
//!
//! | Attempt | Wait before send |
//! |---------|------------------|
//! | 1 | `[1, 2)` s |
//! | 2 | `[2, 4)` s |
//! | 3 | `[4, 8)` s |
//! | 4 | `[8, 16)` s |
//! | give up | after a further `[16, 32)` s without ACK |
//!
//! A target that gives up is sent GO_AWAY(2) and demoted to the potential set.
//! Targets are scheduled independently by deadline; attempts to one target are
//! strictly sequential.
//!
//! ## Task Model
//!
//! The cache lives inside the engine actor. [`propagate`] runs one task per
//! item: it asks the actor for the next [`FloodStep`], then sleeps or sends
//! outside the actor. The item's [`CancellationToken`] is checked at every
//! wait and before every send.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::identity::{NeighbourAddr, NodeId};
use crate::messages::{DataKey, GoAwayCode, Message, Tlv, MAX_DATA_PAYLOAD, PAYLOAD_TYPE_TEXT};
use crate::neighbours::NeighbourTable;
use crate::protocols::{FloodPlanner, PeerTransport};

/// GO_AWAY reason sent to a neighbour that never acknowledged.
pub const INACTIVE_REASON: &str = "You are too slow or inactive";

/// Highest exponent used for backoff; keeps the shift in range.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyKnown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropagationState {
    Propagating,
    Settled,
}

/// A neighbour an item still has to reach.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTarget {
    pub addr: NeighbourAddr,
    pub acked: bool,
    /// Number of the next send; starts at 1.
    pub attempts: u32,
    pub next_attempt_at: Instant,
}

/// A cached data item and its outstanding deliveries.
#[derive(Debug)]
pub struct ReceivedData {
    pub key: DataKey,
    pub payload_type: u8,
    pub payload: Vec<u8>,
    pending: Vec<PendingTarget>,
    state: PropagationState,
    cancel: CancellationToken,
}

impl ReceivedData {
    pub fn pending(&self) -> &[PendingTarget] {
        &self.pending
    }

    pub fn state(&self) -> PropagationState {
        self.state
    }

    fn data_message(&self) -> Option<Message> {
        Message::single(Tlv::Data {
            key: self.key,
            payload_type: self.payload_type,
            payload: self.payload.clone(),
        })
        .ok()
    }
}

/// What a propagation task should do next.
#[derive(Debug)]
pub enum FloodStep {
    /// No targets left, or the item is gone from the cache.
    Settled,
    /// Sleep until the earliest target deadline.
    Wait(Instant),
    /// Send these datagrams, then ask again.
    Transmit(Vec<(NeighbourAddr, Message)>),
}

/// Reasons a local submission is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    PayloadTooLarge { len: usize },
    /// Every local nonce has been used.
    NonceExhausted,
}

impl fmt::Display for SubmitRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len } => {
                write!(f, "payload of {} bytes exceeds {}", len, MAX_DATA_PAYLOAD)
            }
            Self::NonceExhausted => write!(f, "local nonce space exhausted"),
        }
    }
}

impl std::error::Error for SubmitRejection {}

/// Inclusive lower and exclusive upper wait before send number `attempt`.
pub fn backoff_bounds(attempt: u32, unit: Duration) -> (Duration, Duration) {
    let exp = attempt.clamp(1, MAX_BACKOFF_EXPONENT);
    (unit * (1 << (exp - 1)), unit * (1 << exp))
}

/// Uniform draw from [`backoff_bounds`].
pub fn draw_backoff<R: Rng + ?Sized>(attempt: u32, unit: Duration, rng: &mut R) -> Duration {
    let (lo, hi) = backoff_bounds(attempt, unit);
    let (lo_ms, hi_ms) = (lo.as_millis() as u64, hi.as_millis() as u64);
    if hi_ms <= lo_ms {
        return lo;
    }
    Duration::from_millis(rng.gen_range(lo_ms..hi_ms))
}

/// Bounded cache of recently seen data items.
pub struct Dissemination {
    local_id: NodeId,
    next_nonce: Option<u32>,
    cache: VecDeque<ReceivedData>,
    capacity: usize,
    max_attempts: u32,
    backoff_unit: Duration,
}

impl Dissemination {
    pub fn new(local_id: NodeId, capacity: usize, max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            local_id,
            next_nonce: Some(0),
            cache: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            max_attempts,
            backoff_unit,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn contains(&self, key: &DataKey) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &DataKey) -> Option<&ReceivedData> {
        self.cache.iter().find(|d| d.key == *key)
    }

    fn get_mut(&mut self, key: &DataKey) -> Option<&mut ReceivedData> {
        self.cache.iter_mut().find(|d| d.key == *key)
    }

    /// Keys from most to least recently inserted.
    pub fn keys(&self) -> impl Iterator<Item = DataKey> + '_ {
        self.cache.iter().map(|d| d.key)
    }

    pub fn cancel_token(&self, key: &DataKey) -> Option<CancellationToken> {
        self.get(key).map(|d| d.cancel.clone())
    }

    /// Cache an item and seed one pending target per address in `targets`.
    pub fn ingest<R: Rng + ?Sized>(
        &mut self,
        key: DataKey,
        payload_type: u8,
        payload: Vec<u8>,
        targets: Vec<NeighbourAddr>,
        now: Instant,
        rng: &mut R,
    ) -> InsertOutcome {
        if self.contains(&key) {
            trace!(key = %key, "data already known");
            return InsertOutcome::AlreadyKnown;
        }

        let unit = self.backoff_unit;
        let pending = targets
            .into_iter()
            .map(|addr| PendingTarget {
                addr,
                acked: false,
                attempts: 1,
                next_attempt_at: now + draw_backoff(1, unit, &mut *rng),
            })
            .collect();

        self.cache.push_front(ReceivedData {
            key,
            payload_type,
            payload,
            pending,
            state: PropagationState::Propagating,
            cancel: CancellationToken::new(),
        });

        while self.cache.len() > self.capacity {
            self.evict_oldest();
        }
        InsertOutcome::Inserted
    }

    /// Allocate the next local nonce and cache `payload` as a text item.
    pub fn submit_local<R: Rng + ?Sized>(
        &mut self,
        payload: Vec<u8>,
        targets: Vec<NeighbourAddr>,
        now: Instant,
        rng: &mut R,
    ) -> Result<DataKey, SubmitRejection> {
        if payload.len() > MAX_DATA_PAYLOAD {
            return Err(SubmitRejection::PayloadTooLarge { len: payload.len() });
        }
        let nonce = self.next_nonce.ok_or(SubmitRejection::NonceExhausted)?;
        self.next_nonce = nonce.checked_add(1);

        let key = DataKey::new(self.local_id, nonce);
        // Fresh nonce, so the key cannot already be cached.
        self.ingest(key, PAYLOAD_TYPE_TEXT, payload, targets, now, rng);
        Ok(key)
    }

    /// Record that `addr` acknowledged `key`.
    pub fn mark_acked(&mut self, key: &DataKey, addr: &NeighbourAddr) -> bool {
        let Some(data) = self.get_mut(key) else {
            return false;
        };
        match data.pending.iter_mut().find(|t| t.addr == *addr) {
            Some(target) => {
                target.acked = true;
                true
            }
            None => false,
        }
    }

    /// Drop the least recently inserted item and cancel its task.
    pub fn evict_oldest(&mut self) -> Option<DataKey> {
        let evicted = self.cache.pop_back()?;
        evicted.cancel.cancel();
        debug!(key = %evicted.key, "data evicted from cache");
        Some(evicted.key)
    }

    /// Cancel every propagation task; used on shutdown.
    pub fn cancel_all(&self) {
        for data in &self.cache {
            data.cancel.cancel();
        }
    }

    /// Advance the propagation of `key` to `now`.
    ///
    /// Acked and orphaned targets are pruned; targets past their retry budget
    /// are demoted in `table` and sent GO_AWAY; due targets get DATA.
    pub fn step<R: Rng + ?Sized>(
        &mut self,
        key: &DataKey,
        table: &mut NeighbourTable,
        now: Instant,
        rng: &mut R,
    ) -> FloodStep {
        let max_attempts = self.max_attempts;
        let unit = self.backoff_unit;
        let Some(data) = self.get_mut(key) else {
            return FloodStep::Settled;
        };
        if data.cancel.is_cancelled() {
            return FloodStep::Settled;
        }

        let data_message = data.data_message();
        let mut out = Vec::new();

        data.pending.retain_mut(|target| {
            if target.acked {
                trace!(key = %key, peer = %target.addr, "target acknowledged");
                return false;
            }
            if !table.is_active(&target.addr) {
                trace!(key = %key, peer = %target.addr, "target no longer active");
                return false;
            }
            if target.next_attempt_at > now {
                return true;
            }
            // The last DATA gets one more backoff window to be acknowledged before eviction.
            if target.attempts > max_attempts {
                warn!(key = %key, peer = %target.addr, "neighbour never acknowledged, evicting");
                table.demote(&target.addr);
                if let Ok(go_away) = Message::single(Tlv::go_away(GoAwayCode::Inactive, INACTIVE_REASON)) {
                    out.push((target.addr, go_away));
                }
                return false;
            }

            if let Some(message) = &data_message {
                out.push((target.addr, message.clone()));
            }
            target.attempts += 1;
            target.next_attempt_at = now + draw_backoff(target.attempts, unit, &mut *rng);
            true
        });

        if !out.is_empty() {
            return FloodStep::Transmit(out);
        }
        match data.pending.iter().map(|t| t.next_attempt_at).min() {
            Some(deadline) => FloodStep::Wait(deadline),
            None => {
                if data.state != PropagationState::Settled {
                    debug!(key = %key, "data settled");
                }
                data.state = PropagationState::Settled;
                FloodStep::Settled
            }
        }
    }
}

/// Drive one item's propagation until it settles or is cancelled.
pub async fn propagate<P, T>(planner: P, transport: Arc<T>, key: DataKey, cancel: CancellationToken)
where
    P: FloodPlanner,
    T: PeerTransport,
{
    loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => break,
            step = planner.next_step(key) => step,
        };

        match step {
            None | Some(FloodStep::Settled) => break,
            Some(FloodStep::Wait(deadline)) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            Some(FloodStep::Transmit(sends)) => {
                for (to, message) in sends {
                    if cancel.is_cancelled() {
                        trace!(key = %key, "propagation cancelled");
                        return;
                    }
                    // A failed send already consumed its attempt.
                    if let Err(e) = transport.send_message(to, &message).await {
                        debug!(key = %key, peer = %to, error = %e, "flood send failed");
                    }
                }
            }
        }
    }
    trace!(key = %key, "propagation task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;
    use std::num::NonZeroUsize;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const LOCAL: NodeId = NodeId::from_u64(0x1111);
    const UNIT: Duration = Duration::from_secs(1);

    fn addr(n: u16) -> NeighbourAddr {
        NeighbourAddr::new(Ipv6Addr::LOCALHOST, 20_000 + n)
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn cache() -> Dissemination {
        Dissemination::new(LOCAL, 16, 4, UNIT)
    }

    fn table_with(active: &[NeighbourAddr]) -> NeighbourTable {
        let mut table = NeighbourTable::new(128, NonZeroUsize::new(256).unwrap(), Duration::from_secs(120));
        for a in active {
            table.activate(*a, NodeId::from_u64(a.port() as u64));
        }
        table
    }

    fn key(n: u32) -> DataKey {
        DataKey::new(NodeId::from_u64(0x2222), n)
    }

    fn kinds(sends: &[(NeighbourAddr, Message)]) -> Vec<(NeighbourAddr, TlvKind)> {
        sends
            .iter()
            .map(|(to, m)| {
                let kind = match &m.tlvs()[0] {
                    Tlv::Data { .. } => TlvKind::Data,
                    Tlv::GoAway { code, .. } => TlvKind::GoAway(*code),
                    other => panic!("unexpected {:?}", other),
                };
                (*to, kind)
            })
            .collect()
    }

    #[derive(Debug, PartialEq)]
    enum TlvKind {
        Data,
        GoAway(GoAwayCode),
    }

    #[test]
    fn backoff_bounds_double() {
        for n in 1..=4u32 {
            let (lo, hi) = backoff_bounds(n, UNIT);
            assert_eq!(lo, Duration::from_secs(1 << (n - 1)));
            assert_eq!(hi, Duration::from_secs(1 << n));
        }
    }

    #[test]
    fn backoff_draw_stays_in_bounds() {
        let mut rng = rng();
        for n in 1..=4u32 {
            let (lo, hi) = backoff_bounds(n, UNIT);
            for _ in 0..200 {
                let d = draw_backoff(n, UNIT, &mut rng);
                assert!(d >= lo && d < hi, "attempt {} drew {:?}", n, d);
            }
        }
    }

    #[test]
    fn ingest_is_idempotent() {
        let now = Instant::now();
        let mut cache = cache();
        let mut rng = rng();

        assert_eq!(
            cache.ingest(key(1), 0, b"a".to_vec(), vec![addr(1)], now, &mut rng),
            InsertOutcome::Inserted
        );
        assert_eq!(
            cache.ingest(key(1), 0, b"b".to_vec(), vec![addr(2)], now, &mut rng),
            InsertOutcome::AlreadyKnown
        );
        assert_eq!(cache.len(), 1);
        let data = cache.get(&key(1)).unwrap();
        assert_eq!(data.payload, b"a");
        assert_eq!(data.pending().len(), 1);
    }

    #[test]
    fn cache_evicts_oldest_and_cancels_its_task() {
        let now = Instant::now();
        let mut cache = cache();
        let mut rng = rng();

        for n in 0..16 {
            cache.ingest(key(n), 0, Vec::new(), Vec::new(), now, &mut rng);
        }
        let oldest = cache.cancel_token(&key(0)).unwrap();
        assert!(!oldest.is_cancelled());

        cache.ingest(key(16), 0, Vec::new(), Vec::new(), now, &mut rng);
        assert_eq!(cache.len(), 16);
        assert!(!cache.contains(&key(0)));
        assert!(oldest.is_cancelled());
        assert_eq!(cache.keys().next(), Some(key(16)));
    }

    #[test]
    fn local_nonces_are_sequential() {
        let now = Instant::now();
        let mut cache = cache();
        let mut rng = rng();

        let a = cache.submit_local(b"a".to_vec(), Vec::new(), now, &mut rng).unwrap();
        let b = cache.submit_local(b"b".to_vec(), Vec::new(), now, &mut rng).unwrap();
        assert_eq!(a, DataKey::new(LOCAL, 0));
        assert_eq!(b, DataKey::new(LOCAL, 1));
        assert_eq!(cache.get(&a).unwrap().payload_type, PAYLOAD_TYPE_TEXT);
    }

    #[test]
    fn local_submit_rejects_oversized_payload() {
        let mut cache = cache();
        let err = cache
            .submit_local(vec![0; MAX_DATA_PAYLOAD + 1], Vec::new(), Instant::now(), &mut rng())
            .unwrap_err();
        assert_eq!(err, SubmitRejection::PayloadTooLarge { len: MAX_DATA_PAYLOAD + 1 });
        assert!(cache.is_empty());
    }

    #[test]
    fn nonce_exhaustion_is_an_error() {
        let mut cache = cache();
        cache.next_nonce = Some(u32::MAX);
        let now = Instant::now();
        assert!(cache.submit_local(Vec::new(), Vec::new(), now, &mut rng()).is_ok());
        assert_eq!(
            cache.submit_local(Vec::new(), Vec::new(), now, &mut rng()),
            Err(SubmitRejection::NonceExhausted)
        );
    }

    #[test]
    fn empty_target_list_settles() {
        let now = Instant::now();
        let mut cache = cache();
        let mut table = table_with(&[]);
        let mut rng = rng();
        cache.ingest(key(1), 0, Vec::new(), Vec::new(), now, &mut rng);

        assert!(matches!(cache.step(&key(1), &mut table, now, &mut rng), FloodStep::Settled));
        assert_eq!(cache.get(&key(1)).unwrap().state(), PropagationState::Settled);
        assert!(cache.contains(&key(1)));
    }

    #[test]
    fn first_send_waits_for_backoff() {
        let now = Instant::now();
        let mut cache = cache();
        let mut table = table_with(&[addr(1)]);
        let mut rng = rng();
        cache.ingest(key(1), 0, b"x".to_vec(), vec![addr(1)], now, &mut rng);

        match cache.step(&key(1), &mut table, now, &mut rng) {
            FloodStep::Wait(deadline) => {
                let wait = deadline - now;
                assert!(wait >= Duration::from_secs(1) && wait < Duration::from_secs(2));
            }
            other => panic!("expected wait, got {:?}", other),
        }
    }

    #[test]
    fn acked_target_is_pruned_without_send() {
        let now = Instant::now();
        let mut cache = cache();
        let mut table = table_with(&[addr(1), addr(2)]);
        let mut rng = rng();
        cache.ingest(key(1), 0, b"x".to_vec(), vec![addr(1), addr(2)], now, &mut rng);

        assert!(cache.mark_acked(&key(1), &addr(1)));
        assert!(!cache.mark_acked(&key(1), &addr(9)));

        let later = now + Duration::from_secs(2);
        match cache.step(&key(1), &mut table, later, &mut rng) {
            FloodStep::Transmit(sends) => assert_eq!(kinds(&sends), vec![(addr(2), TlvKind::Data)]),
            other => panic!("expected transmit, got {:?}", other),
        }
        assert_eq!(cache.get(&key(1)).unwrap().pending().len(), 1);
    }

    #[test]
    fn orphaned_target_is_pruned() {
        let now = Instant::now();
        let mut cache = cache();
        let mut table = table_with(&[addr(1)]);
        let mut rng = rng();
        cache.ingest(key(1), 0, b"x".to_vec(), vec![addr(1)], now, &mut rng);

        table.remove_active(&addr(1));
        assert!(matches!(cache.step(&key(1), &mut table, now, &mut rng), FloodStep::Settled));
        assert!(!table.is_potential(&addr(1)));
    }

    #[test]
    fn silent_target_gets_four_sends_then_one_go_away() {
        let start = Instant::now();
        let mut cache = cache();
        let mut table = table_with(&[addr(1)]);
        let mut rng = rng();
        cache.ingest(key(1), 0, b"x".to_vec(), vec![addr(1)], start, &mut rng);

        let mut now = start;
        let mut log = Vec::new();
        loop {
            match cache.step(&key(1), &mut table, now, &mut rng) {
                FloodStep::Wait(deadline) => now = deadline,
                FloodStep::Transmit(sends) => log.extend(kinds(&sends)),
                FloodStep::Settled => break,
            }
        }

        assert_eq!(
            log,
            vec![
                (addr(1), TlvKind::Data),
                (addr(1), TlvKind::Data),
                (addr(1), TlvKind::Data),
                (addr(1), TlvKind::Data),
                (addr(1), TlvKind::GoAway(GoAwayCode::Inactive)),
            ]
        );
        assert!(!table.is_active(&addr(1)));
        assert!(table.is_potential(&addr(1)));
        assert!(cache.get(&key(1)).unwrap().pending().is_empty());

        // Total wait: four backoffs plus the grace period, all within bounds.
        let elapsed = now - start;
        assert!(elapsed >= Duration::from_secs(1 + 2 + 4 + 8 + 16));
        assert!(elapsed < Duration::from_secs(2 + 4 + 8 + 16 + 32));
    }

    #[test]
    fn step_on_evicted_item_settles() {
        let mut cache = cache();
        let mut table = table_with(&[]);
        assert!(matches!(
            cache.step(&key(5), &mut table, Instant::now(), &mut rng()),
            FloodStep::Settled
        ));
    }
}
