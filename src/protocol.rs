//! # Protocol Engine
//!
//! This module applies decoded datagrams to node state and hosts that state in
//! a single actor.
//!
//! ## Architecture
//!
//! ```text
//! Engine (handle, cheap to clone)
//!   │ commands (mpsc)
//!   ▼
//! EngineActor ── owns ── ProtocolState { NeighbourTable, Dissemination, HelloSchedule }
//!   │                           │
//!   │ effects                   └─ interpret(from, message) -> Vec<Effect>
//!   ├─ Send     → PeerTransport
//!   ├─ Flood    → spawn flooding::propagate (asks back via FloodStep commands)
//!   └─ Deliver  → NodeEvent channel
//! ```
//!
//! All mutation of the neighbour table and the data cache happens on the actor
//! task. Propagation tasks never touch state directly.
//!
//! ## TLV Dispatch
//!
//! | TLV | Effect |
//! |-----|--------|
//! | PAD1 / PADN | none |
//! | HELLO | activate sender, refresh hello timestamps |
//! | NEIGHBOUR | add advertised address to the potential set |
//! | DATA | cache + flood if new, deliver text, always ACK the sender |
//! | ACK | mark the sender as having the item |
//! | GO_AWAY | demote sender, surface notice |
//! | WARNING | surface text |
//!
//! A datagram that fails to decode is answered with GO_AWAY(3) and its sender
//! is demoted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::flooding::{self, Dissemination, FloodStep, InsertOutcome, SubmitRejection};
use crate::identity::{NeighbourAddr, NodeId};
use crate::messages::{DataKey, DecodeError, GoAwayCode, Message, Tlv, MAX_DATAGRAM_SIZE, PAYLOAD_TYPE_TEXT};
use crate::neighbours::{HelloSchedule, Neighbour, NeighbourTable};
use crate::protocols::{FloodPlanner, PeerTransport};

// ============================================================================
// Configuration Constants
// ============================================================================

/// A neighbour stays symmetric this long after its last long HELLO naming us.
pub const DEFAULT_SYMMETRY_TIMEOUT: Duration = Duration::from_secs(120);

/// Below this many symmetric neighbours, potential neighbours are solicited.
pub const DEFAULT_MIN_SYMMETRIC: usize = 8;

pub const DEFAULT_SHORT_HELLO_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_LONG_HELLO_INTERVAL: Duration = Duration::from_secs(20);

/// Neighbour gossip rides on every Nth long-hello round.
pub const DEFAULT_GOSSIP_EVERY: u32 = 4;

pub const DEFAULT_MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// SECURITY: Bounds memory spent on remembered data items.
pub const DEFAULT_CACHE_CAPACITY: usize = 16;

/// DATA sends per target before the target is evicted.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Base of the exponential retry backoff.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// SECURITY: Bounds the active set against address spraying.
pub const DEFAULT_MAX_ACTIVE: usize = 128;

/// SECURITY: Bounds the potential set against gossip floods.
pub const DEFAULT_MAX_POTENTIAL: usize = 256;

/// Buffered events before new ones are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// GO_AWAY reason for a datagram that failed to decode.
pub const INVALID_MESSAGE_REASON: &str = "Invalid message";

/// GO_AWAY reason on graceful shutdown.
pub const LEAVING_REASON: &str = "Leaving";

/// Tunables for a node. `Default` gives the protocol's standard timing.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub symmetry_timeout: Duration,
    pub min_symmetric: usize,
    pub short_hello_interval: Duration,
    pub long_hello_interval: Duration,
    pub gossip_every: u32,
    pub maintenance_tick: Duration,
    pub cache_capacity: usize,
    pub max_attempts: u32,
    pub backoff_unit: Duration,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    pub max_active: usize,
    pub max_potential: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            symmetry_timeout: DEFAULT_SYMMETRY_TIMEOUT,
            min_symmetric: DEFAULT_MIN_SYMMETRIC,
            short_hello_interval: DEFAULT_SHORT_HELLO_INTERVAL,
            long_hello_interval: DEFAULT_LONG_HELLO_INTERVAL,
            gossip_every: DEFAULT_GOSSIP_EVERY,
            maintenance_tick: DEFAULT_MAINTENANCE_TICK,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            max_active: DEFAULT_MAX_ACTIVE,
            max_potential: DEFAULT_MAX_POTENTIAL,
        }
    }
}

// ============================================================================
// Events and Effects
// ============================================================================

/// Something the local user should see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// A new text item from the overlay.
    Text {
        key: DataKey,
        from: NeighbourAddr,
        text: Vec<u8>,
    },
    Warning {
        from: NeighbourAddr,
        text: String,
    },
    /// A neighbour told us to go away.
    GoAway {
        from: NeighbourAddr,
        code: GoAwayCode,
        message: String,
    },
    /// A neighbour sent a datagram we could not decode.
    InvalidMessage {
        from: NeighbourAddr,
        error: DecodeError,
    },
}

/// Output of the interpreter, executed by the actor.
#[derive(Debug)]
pub enum Effect {
    Send { to: NeighbourAddr, message: Message },
    Flood { key: DataKey, cancel: CancellationToken },
    Deliver(NodeEvent),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighbourInfo {
    pub addr: NeighbourAddr,
    pub id: NodeId,
    pub symmetric: bool,
}

/// Point-in-time view of the neighbour table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NeighbourSnapshot {
    pub active: Vec<NeighbourInfo>,
    pub potential: Vec<NeighbourAddr>,
    pub cached_items: usize,
}

impl NeighbourSnapshot {
    pub fn is_active(&self, addr: &NeighbourAddr) -> bool {
        self.active.iter().any(|n| n.addr == *addr)
    }

    pub fn is_symmetric(&self, addr: &NeighbourAddr) -> bool {
        self.active.iter().any(|n| n.addr == *addr && n.symmetric)
    }

    pub fn is_potential(&self, addr: &NeighbourAddr) -> bool {
        self.potential.contains(addr)
    }
}

// ============================================================================
// Interpreter
// ============================================================================

/// Node state and the rules that change it. Owned by the engine actor.
pub struct ProtocolState {
    local_id: NodeId,
    config: NodeConfig,
    neighbours: NeighbourTable,
    dissemination: Dissemination,
    schedule: HelloSchedule,
}

impl ProtocolState {
    pub fn new(local_id: NodeId, config: NodeConfig) -> Self {
        let neighbours = NeighbourTable::from_config(&config);
        let dissemination = Dissemination::new(
            local_id,
            config.cache_capacity,
            config.max_attempts,
            config.backoff_unit,
        );
        Self {
            local_id,
            config,
            neighbours,
            dissemination,
            schedule: HelloSchedule::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn neighbours(&self) -> &NeighbourTable {
        &self.neighbours
    }

    pub fn dissemination(&self) -> &Dissemination {
        &self.dissemination
    }

    /// Decode `bytes` from `from` and apply it.
    pub fn handle_datagram<R: Rng + ?Sized>(
        &mut self,
        from: NeighbourAddr,
        bytes: &[u8],
        now: Instant,
        rng: &mut R,
    ) -> Vec<Effect> {
        match Message::decode(bytes) {
            Ok(message) => self.interpret(from, &message, now, rng),
            Err(error) => self.reject(from, error),
        }
    }

    fn reject(&mut self, from: NeighbourAddr, error: DecodeError) -> Vec<Effect> {
        debug!(peer = %from, error = %error, "invalid datagram");
        self.neighbours.demote(&from);

        let mut effects = Vec::with_capacity(2);
        if let Ok(message) = Message::single(Tlv::go_away(GoAwayCode::ProtocolViolation, INVALID_MESSAGE_REASON)) {
            effects.push(Effect::Send { to: from, message });
        }
        effects.push(Effect::Deliver(NodeEvent::InvalidMessage { from, error }));
        effects
    }

    /// Apply every TLV of a decoded message from `from`, in order.
    pub fn interpret<R: Rng + ?Sized>(
        &mut self,
        from: NeighbourAddr,
        message: &Message,
        now: Instant,
        rng: &mut R,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut reply = Message::new();

        for tlv in message.tlvs() {
            trace!(peer = %from, tlv = %tlv.tlv_type(), "tlv");
            match tlv {
                Tlv::Pad1 | Tlv::PadN(_) => {}
                Tlv::Hello { source, destination } => {
                    self.on_hello(from, *source, *destination, now);
                }
                Tlv::Neighbour(addr) => self.on_neighbour(from, *addr),
                Tlv::Data { key, payload_type, payload } => {
                    self.on_data(from, *key, *payload_type, payload, now, &mut *rng, &mut effects);
                    let ack = Tlv::Ack(*key);
                    if !reply.fits(&ack, MAX_DATAGRAM_SIZE) {
                        effects.push(Effect::Send { to: from, message: std::mem::take(&mut reply) });
                    }
                    let _ = reply.push(ack);
                }
                Tlv::Ack(key) => {
                    if self.dissemination.mark_acked(key, &from) {
                        trace!(peer = %from, key = %key, "ack");
                    }
                }
                Tlv::GoAway { code, message } => {
                    let message = String::from_utf8_lossy(message).into_owned();
                    info!(peer = %from, code = code.as_u8(), reason = %message, "neighbour sent go away");
                    self.neighbours.demote(&from);
                    effects.push(Effect::Deliver(NodeEvent::GoAway { from, code: *code, message }));
                }
                Tlv::Warning(text) => {
                    let text = String::from_utf8_lossy(text).into_owned();
                    effects.push(Effect::Deliver(NodeEvent::Warning { from, text }));
                }
            }
        }

        if !reply.is_empty() {
            effects.push(Effect::Send { to: from, message: reply });
        }
        effects
    }

    fn on_hello(&mut self, from: NeighbourAddr, source: NodeId, destination: Option<NodeId>, now: Instant) {
        if source == self.local_id {
            if self.neighbours.remove_potential(&from).is_some() {
                debug!(peer = %from, "dropped own address from potential set");
            }
            return;
        }

        let Some(neighbour) = self.neighbours.activate(from, source) else {
            return;
        };
        if neighbour.id != source {
            debug!(peer = %from, old = %neighbour.id, new = %source, "neighbour changed id");
            neighbour.id = source;
        }
        self.neighbours
            .record_hello(&from, destination.is_some(), destination, self.local_id, now);
    }

    fn on_neighbour(&mut self, from: NeighbourAddr, advertised: NeighbourAddr) {
        if self.neighbours.is_active(&advertised) {
            return;
        }
        // Placeholder id; the peer's own hello replaces it on activation.
        let id = self.neighbours.lookup(&from).map(|n| n.id).unwrap_or_default();
        if self.neighbours.add_potential(Neighbour::new(advertised, id)) {
            trace!(peer = %from, advertised = %advertised, "learned potential neighbour");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_data<R: Rng + ?Sized>(
        &mut self,
        from: NeighbourAddr,
        key: DataKey,
        payload_type: u8,
        payload: &[u8],
        now: Instant,
        rng: &mut R,
        effects: &mut Vec<Effect>,
    ) {
        let targets = self.neighbours.symmetric_snapshot(now);
        let outcome = self
            .dissemination
            .ingest(key, payload_type, payload.to_vec(), targets, now, rng);

        if outcome == InsertOutcome::Inserted {
            debug!(peer = %from, key = %key, len = payload.len(), "new data");
            if payload_type == PAYLOAD_TYPE_TEXT {
                effects.push(Effect::Deliver(NodeEvent::Text { key, from, text: payload.to_vec() }));
            }
            if let Some(cancel) = self.dissemination.cancel_token(&key) {
                effects.push(Effect::Flood { key, cancel });
            }
        }
        // The sender has it, whether or not we did.
        self.dissemination.mark_acked(&key, &from);
    }

    /// Cache and start flooding a locally authored payload.
    pub fn submit_local<R: Rng + ?Sized>(
        &mut self,
        payload: Vec<u8>,
        now: Instant,
        rng: &mut R,
    ) -> Result<(DataKey, Vec<Effect>), SubmitRejection> {
        let targets = self.neighbours.symmetric_snapshot(now);
        let key = self.dissemination.submit_local(payload, targets, now, rng)?;
        debug!(key = %key, "local data submitted");

        let effects = self
            .dissemination
            .cancel_token(&key)
            .map(|cancel| Effect::Flood { key, cancel })
            .into_iter()
            .collect();
        Ok((key, effects))
    }

    /// Remember a bootstrap peer as a potential neighbour.
    pub fn add_bootstrap(&mut self, addr: NeighbourAddr) {
        if !self.neighbours.is_active(&addr) {
            self.neighbours.add_potential(Neighbour::new(addr, NodeId::default()));
        }
    }

    /// Periodic hello traffic due at `now`.
    pub fn maintenance(&mut self, now: Instant) -> Vec<Effect> {
        self.schedule
            .plan(&self.neighbours, self.local_id, &self.config, now)
            .into_iter()
            .map(|(to, message)| Effect::Send { to, message })
            .collect()
    }

    pub fn flood_step<R: Rng + ?Sized>(&mut self, key: &DataKey, now: Instant, rng: &mut R) -> FloodStep {
        self.dissemination.step(key, &mut self.neighbours, now, rng)
    }

    /// GO_AWAY(1) to every active neighbour and cancel all propagation.
    pub fn shutdown(&mut self) -> Vec<Effect> {
        self.dissemination.cancel_all();
        self.neighbours
            .active()
            .filter_map(|n| {
                Message::single(Tlv::go_away(GoAwayCode::Leaving, LEAVING_REASON))
                    .ok()
                    .map(|message| Effect::Send { to: n.addr, message })
            })
            .collect()
    }

    pub fn snapshot(&self, now: Instant) -> NeighbourSnapshot {
        NeighbourSnapshot {
            active: self
                .neighbours
                .active()
                .map(|n| NeighbourInfo {
                    addr: n.addr,
                    id: n.id,
                    symmetric: n.is_symmetric_at(now, self.config.symmetry_timeout),
                })
                .collect(),
            potential: self.neighbours.potential().map(|n| n.addr).collect(),
            cached_items: self.dissemination.len(),
        }
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Inbound {
        from: NeighbourAddr,
        bytes: Vec<u8>,
    },
    Submit(Vec<u8>, oneshot::Sender<Result<DataKey, SubmitRejection>>),
    AddBootstrap(NeighbourAddr, oneshot::Sender<()>),
    FloodStep(DataKey, oneshot::Sender<FloodStep>),
    Snapshot(oneshot::Sender<NeighbourSnapshot>),
    /// Say goodbye to active neighbours, then stop.
    Shutdown(oneshot::Sender<()>),
}

// ============================================================================
// Engine Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Engine {
    cmd_tx: mpsc::Sender<Command>,
}

impl Engine {
    /// Spawn the engine actor sending through `transport`.
    pub fn spawn<T: PeerTransport>(
        local_id: NodeId,
        config: NodeConfig,
        transport: Arc<T>,
    ) -> (Self, mpsc::Receiver<NodeEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let actor = EngineActor {
            state: ProtocolState::new(local_id, config),
            transport,
            events: event_tx,
            planner_tx: cmd_tx.downgrade(),
            rng: StdRng::from_entropy(),
        };
        tokio::spawn(actor.run(cmd_rx));

        (Self { cmd_tx }, event_rx)
    }

    /// Hand a received datagram to the engine.
    pub async fn inbound(&self, from: NeighbourAddr, bytes: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(Command::Inbound { from, bytes })
            .await
            .map_err(|_| anyhow!("engine actor closed"))
    }

    pub async fn submit(&self, payload: Vec<u8>) -> Result<DataKey> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit(payload, tx))
            .await
            .map_err(|_| anyhow!("engine actor closed"))?;
        let key = rx.await.map_err(|_| anyhow!("engine actor closed"))??;
        Ok(key)
    }

    pub async fn add_bootstrap(&self, addr: NeighbourAddr) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddBootstrap(addr, tx))
            .await
            .map_err(|_| anyhow!("engine actor closed"))?;
        rx.await.map_err(|_| anyhow!("engine actor closed"))
    }

    pub async fn snapshot(&self) -> Result<NeighbourSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| anyhow!("engine actor closed"))?;
        rx.await.map_err(|_| anyhow!("engine actor closed"))
    }

    /// Send GO_AWAY(1) to active neighbours and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| anyhow!("engine actor closed"))?;
        rx.await.map_err(|_| anyhow!("engine actor closed"))
    }
}

/// Propagation tasks reach the actor through a weak sender so they never keep
/// it alive on their own.
struct EnginePlanner {
    cmd_tx: mpsc::WeakSender<Command>,
}

#[async_trait]
impl FloodPlanner for EnginePlanner {
    async fn next_step(&self, key: DataKey) -> Option<FloodStep> {
        let cmd_tx = self.cmd_tx.upgrade()?;
        let (tx, rx) = oneshot::channel();
        cmd_tx.send(Command::FloodStep(key, tx)).await.ok()?;
        drop(cmd_tx);
        rx.await.ok()
    }
}

// ============================================================================
// Engine Actor
// ============================================================================

struct EngineActor<T: PeerTransport> {
    state: ProtocolState,
    transport: Arc<T>,
    events: mpsc::Sender<NodeEvent>,
    planner_tx: mpsc::WeakSender<Command>,
    rng: StdRng,
}

impl<T: PeerTransport> EngineActor<T> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut maintenance = tokio::time::interval(self.state.config.maintenance_tick);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Inbound { from, bytes }) => {
                            let effects = self.state.handle_datagram(from, &bytes, Instant::now(), &mut self.rng);
                            self.apply(effects);
                        }
                        Some(Command::Submit(payload, reply)) => {
                            match self.state.submit_local(payload, Instant::now(), &mut self.rng) {
                                Ok((key, effects)) => {
                                    self.apply(effects);
                                    let _ = reply.send(Ok(key));
                                }
                                Err(rejection) => {
                                    let _ = reply.send(Err(rejection));
                                }
                            }
                        }
                        Some(Command::AddBootstrap(addr, reply)) => {
                            self.state.add_bootstrap(addr);
                            let _ = reply.send(());
                        }
                        Some(Command::FloodStep(key, reply)) => {
                            let step = self.state.flood_step(&key, Instant::now(), &mut self.rng);
                            let _ = reply.send(step);
                        }
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.state.snapshot(Instant::now()));
                        }
                        Some(Command::Shutdown(reply)) => {
                            info!(active = self.state.neighbours.active_len(), "leaving overlay");
                            let effects = self.state.shutdown();
                            self.flush(effects).await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            debug!("engine handle dropped, actor quitting");
                            self.state.dissemination.cancel_all();
                            break;
                        }
                    }
                }
                _ = maintenance.tick() => {
                    let effects = self.state.maintenance(Instant::now());
                    self.apply(effects);
                }
            }
        }
    }

    /// Execute effects without waiting on the socket.
    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } => {
                    tokio::spawn(send_detached(self.transport.clone(), to, message));
                }
                Effect::Flood { key, cancel } => {
                    let planner = EnginePlanner { cmd_tx: self.planner_tx.clone() };
                    tokio::spawn(flooding::propagate(planner, self.transport.clone(), key, cancel));
                }
                Effect::Deliver(event) => {
                    if self.events.try_send(event).is_err() {
                        debug!("event channel full or closed, event dropped");
                    }
                }
            }
        }
    }

    /// Send every outbound datagram and wait for all of them. Used on the way
    /// out, when nothing else is left to serve.
    async fn flush(&self, effects: Vec<Effect>) {
        let mut sends = JoinSet::new();
        for effect in effects {
            if let Effect::Send { to, message } = effect {
                sends.spawn(send_detached(self.transport.clone(), to, message));
            }
        }
        while sends.join_next().await.is_some() {}
    }
}

async fn send_detached<T: PeerTransport>(transport: Arc<T>, to: NeighbourAddr, message: Message) {
    if let Err(e) = transport.send_message(to, &message).await {
        warn!(peer = %to, error = %e, "send failed");
    }
}
