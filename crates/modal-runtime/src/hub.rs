//! Hub controller
//!
//! Discovers nodes, assigns their ids, distributes the session
//! configuration, starts and stops the session, and turns external note
//! events into pokes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use modal_config::{ConfigDistributor, TransferPlan};
use modal_core::{
    AckStatus, LinkAddr, ModalError, ModalResult, NodeId, PokeEvent, SessionConfig, MAX_NODES,
};
use modal_topology::default_session;
use modal_transport::{Incoming, Link, Transport};
use modal_wire::{Payload, CAP_AUDIO};

use crate::{JoinPolicy, RuntimeConfig};

/// Name announced by the hub in `Hello`
pub const HUB_NAME: &str = "modal-hub";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HubState {
    Idle,
    Discovering,
    Configuring,
    Ready,
    Running,
}

impl HubState {
    pub fn name(self) -> &'static str {
        match self {
            HubState::Idle => "idle",
            HubState::Discovering => "discovering",
            HubState::Configuring => "configuring",
            HubState::Ready => "ready",
            HubState::Running => "running",
        }
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the hub knows about one node
#[derive(Clone, Debug, PartialEq)]
pub struct NodeEntry {
    pub id: NodeId,
    pub addr: LinkAddr,
    pub name: String,
    /// Counted for the session
    pub registered: bool,
    pub joined: bool,
    pub configured: bool,
    /// Gave up after the configuration attempt budget
    pub failed: bool,
    pub last_status: Option<AckStatus>,
    pub config_attempts: u32,
    pub cfg_sent_at: Option<Instant>,
    pub last_heartbeat: Option<Instant>,
    pub load: u8,
    /// Last reported amplitude
    pub amplitude: Option<f32>,
}

impl NodeEntry {
    fn new(id: NodeId, addr: LinkAddr, name: String) -> Self {
        NodeEntry {
            id,
            addr,
            name,
            registered: false,
            joined: false,
            configured: false,
            failed: false,
            last_status: None,
            config_attempts: 0,
            cfg_sent_at: None,
            last_heartbeat: None,
            load: 0,
            amplitude: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubStats {
    pub discovery_rounds: u64,
    pub hellos: u64,
    pub offers_sent: u64,
    pub joins: u64,
    pub config_attempts: u64,
    pub acks: u64,
    pub nacks: u64,
    pub pokes_sent: u64,
    /// Notes received outside a running session
    pub pokes_dropped: u64,
    pub send_failures: u64,
    pub stale_warnings: u64,
}

/// Requests from the event front-end
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubCommand {
    NoteOn { note: u8, velocity: u8 },
    /// Re-poke on every drive tick until released
    NoteHold { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    Start,
    Stop,
    Reset,
    Query(NodeId),
}

/// A held note and the node it drives
#[derive(Clone, Copy, Debug)]
struct HeldNote {
    target: NodeId,
    event: PokeEvent,
}

pub struct HubController<L: Link> {
    transport: Arc<Transport<L>>,
    config: RuntimeConfig,
    state: HubState,
    nodes: BTreeMap<NodeId, NodeEntry>,
    session: Option<SessionConfig>,
    plan: Option<TransferPlan>,
    distributor: ConfigDistributor,
    held: BTreeMap<u8, HeldNote>,
    stats: HubStats,
}

impl<L: Link> HubController<L> {
    pub fn new(link: L, config: &RuntimeConfig) -> Self {
        HubController {
            transport: Arc::new(Transport::with_retry(
                link,
                NodeId::HUB,
                config.retry_policy(),
            )),
            config: config.clone(),
            state: HubState::Idle,
            nodes: BTreeMap::new(),
            session: None,
            plan: None,
            distributor: ConfigDistributor::new(config.transfer_timing()),
            held: BTreeMap::new(),
            stats: HubStats::default(),
        }
    }

    pub fn state(&self) -> HubState {
        self.state
    }

    pub fn stats(&self) -> HubStats {
        self.stats
    }

    pub fn transport(&self) -> &Arc<Transport<L>> {
        &self.transport
    }

    pub fn session(&self) -> Option<&SessionConfig> {
        self.session.as_ref()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    /// Nodes counted for the session
    pub fn registered_count(&self) -> usize {
        self.nodes.values().filter(|n| n.registered).count()
    }

    pub fn configured_count(&self) -> usize {
        self.nodes.values().filter(|n| n.configured).count()
    }

    fn transition(&mut self, next: HubState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "hub state");
            self.state = next;
        }
    }

    fn invalid(&self, action: &'static str) -> ModalError {
        ModalError::InvalidTransition {
            state: self.state.name(),
            action,
        }
    }

    async fn send(&mut self, dest: NodeId, payload: Payload) {
        if let Err(e) = self.transport.send(dest, payload).await {
            warn!(dest = %dest, error = %e, "hub send failed");
            self.stats.send_failures += 1;
        }
    }

    fn hello(&self) -> Payload {
        Payload::Hello {
            addr: self.transport.local_addr(),
            capabilities: CAP_AUDIO,
            name: HUB_NAME.into(),
        }
    }

    /// Enter discovery and announce the hub
    pub async fn start_discovery(&mut self) -> ModalResult<()> {
        match self.state {
            HubState::Idle | HubState::Ready | HubState::Discovering => {}
            _ => return Err(self.invalid("discover")),
        }
        self.transition(HubState::Discovering);
        self.stats.discovery_rounds += 1;
        let hello = self.hello();
        self.send(NodeId::BROADCAST, hello).await;
        Ok(())
    }

    /// Run a full discovery window and return the number of registered nodes
    ///
    /// `Hello` is re-broadcast every hello interval so nodes that booted
    /// late still hear the hub.
    pub async fn discover(&mut self) -> ModalResult<usize> {
        self.start_discovery().await?;

        let transport = self.transport.clone();
        let deadline = Instant::now() + self.config.discovery_window;
        let period = self.config.hello_interval;
        let mut hello = tokio::time::interval_at(Instant::now() + period, period);
        hello.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                _ = hello.tick() => {
                    let payload = self.hello();
                    self.send(NodeId::BROADCAST, payload).await;
                }
                incoming = transport.recv() => self.handle(incoming?).await,
            }
        }

        let count = self.registered_count();
        info!(nodes = count, "discovery window closed");
        Ok(count)
    }

    /// Close discovery and fix the session configuration
    ///
    /// Without `custom`, a ring over the registered nodes is generated.
    pub fn finish_discovery(&mut self, custom: Option<SessionConfig>) -> ModalResult<&SessionConfig> {
        if self.state != HubState::Discovering {
            return Err(self.invalid("finish discovery"));
        }

        let config = match custom {
            Some(config) => {
                config.validate()?;
                for node in &config.nodes {
                    if !self.nodes.get(&node.id).is_some_and(|n| n.registered) {
                        warn!(node = %node.id, "configured node was not discovered");
                    }
                }
                config
            }
            None => {
                let ids: Vec<NodeId> = self
                    .nodes
                    .values()
                    .filter(|n| n.registered)
                    .map(|n| n.id)
                    .collect();
                if ids.is_empty() {
                    return Err(ModalError::InvalidConfig("no nodes discovered".into()));
                }
                default_session(&ids)?
            }
        };

        self.plan = Some(TransferPlan::from_config(&config)?);
        info!(
            session = %config.session_id,
            topology = %config.topology,
            nodes = config.node_count(),
            "session configuration fixed"
        );
        self.transition(HubState::Configuring);
        Ok(self.session.insert(config))
    }

    /// Distribute the configuration and collect acknowledgements
    ///
    /// The first attempt is broadcast. Nodes that NACK or stay silent get
    /// unicast retransmissions up to the attempt budget, after which they
    /// are marked failed and left out. Returns the number of configured
    /// nodes.
    pub async fn distribute(&mut self) -> ModalResult<usize> {
        match self.state {
            HubState::Configuring | HubState::Ready => {}
            _ => return Err(self.invalid("distribute")),
        }
        let (Some(plan), Some(session)) = (self.plan.clone(), self.session.as_ref()) else {
            return Err(self.invalid("distribute"));
        };
        let targets: Vec<NodeId> = session
            .nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| self.nodes.contains_key(id))
            .collect();
        self.transition(HubState::Configuring);
        for id in &targets {
            if let Some(entry) = self.nodes.get_mut(id) {
                entry.configured = false;
                entry.failed = false;
                entry.config_attempts = 0;
                entry.last_status = None;
            }
        }

        let transport = self.transport.clone();
        for attempt in 1..=self.config.max_config_attempts.max(1) {
            let pending: Vec<NodeId> = targets
                .iter()
                .copied()
                .filter(|id| self.nodes.get(id).is_some_and(|n| !n.configured))
                .collect();
            if pending.is_empty() {
                break;
            }

            let now = Instant::now();
            for id in &pending {
                if let Some(entry) = self.nodes.get_mut(id) {
                    entry.config_attempts += 1;
                    entry.cfg_sent_at = Some(now);
                }
            }
            self.stats.config_attempts += 1;

            if attempt == 1 {
                self.distributor
                    .distribute(&transport, NodeId::BROADCAST, &plan)
                    .await?;
            } else {
                for id in &pending {
                    debug!(node = %id, attempt, "retransmitting configuration");
                    if let Err(e) = self.distributor.distribute(&transport, *id, &plan).await {
                        warn!(node = %id, error = %e, "retransmission failed");
                    }
                }
            }

            let deadline = Instant::now() + self.config.ack_timeout;
            while targets
                .iter()
                .any(|id| self.nodes.get(id).is_some_and(|n| !n.configured))
            {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    incoming = transport.recv() => self.handle(incoming?).await,
                }
            }
        }

        for id in &targets {
            if let Some(entry) = self.nodes.get_mut(id) {
                if !entry.configured {
                    entry.failed = true;
                    warn!(
                        node = %id,
                        attempts = entry.config_attempts,
                        status = ?entry.last_status,
                        "node not configured, leaving it out"
                    );
                }
            }
        }

        let configured = self.configured_count();
        info!(configured, expected = targets.len(), "configuration distributed");
        self.transition(HubState::Ready);
        Ok(configured)
    }

    /// Discovery, configuration and distribution in one call
    pub async fn setup(&mut self, custom: Option<SessionConfig>) -> ModalResult<usize> {
        self.discover().await?;
        self.finish_discovery(custom)?;
        self.distribute().await
    }

    pub async fn start_session(&mut self) -> ModalResult<()> {
        if self.state != HubState::Ready {
            return Err(self.invalid("start"));
        }
        let payload = Payload::Start {
            start_time_ms: self.transport.uptime_ms(),
        };
        self.transport.broadcast(payload).await?;
        self.transition(HubState::Running);
        Ok(())
    }

    /// Stop the session; configuration is kept for a restart
    pub async fn stop_session(&mut self) -> ModalResult<()> {
        if self.state != HubState::Running {
            return Err(self.invalid("stop"));
        }
        self.held.clear();
        self.transport.broadcast(Payload::Stop).await?;
        self.transition(HubState::Ready);
        Ok(())
    }

    /// Zero the modal state of every node
    pub async fn reset_nodes(&mut self) -> ModalResult<()> {
        self.transport.broadcast(Payload::Reset).await
    }

    /// Ask one node for a state report
    pub async fn query_state(&mut self, id: NodeId) -> ModalResult<()> {
        let query = Payload::State {
            mode0_re: 0.0,
            mode0_im: 0.0,
            amplitude: 0.0,
        };
        self.transport.send(id, query).await
    }

    /// Node driven by `note`
    pub fn target_for(&self, note: u8) -> Option<NodeId> {
        let session = self.session.as_ref()?;
        let count = session.node_count();
        if count == 0 {
            return None;
        }
        Some(session.nodes[note as usize % count].id)
    }

    /// Poke the node mapped to `note`
    ///
    /// Returns the poked node, or `None` when no session is running; such
    /// notes are dropped, not queued.
    pub async fn note_on(&mut self, note: u8, velocity: u8) -> Option<NodeId> {
        let target = match (self.state, self.target_for(note)) {
            (HubState::Running, Some(target)) => target,
            _ => {
                debug!(note, state = %self.state, "note dropped");
                self.stats.pokes_dropped += 1;
                return None;
            }
        };
        let event = PokeEvent::from_velocity(NodeId::HUB, velocity);
        self.poke(target, &event).await;
        Some(target)
    }

    /// Like [`note_on`](Self::note_on), then keep poking on every drive tick
    pub async fn note_hold(&mut self, note: u8, velocity: u8) -> Option<NodeId> {
        let target = self.note_on(note, velocity).await?;
        self.held.insert(
            note,
            HeldNote {
                target,
                event: PokeEvent::from_velocity(NodeId::HUB, velocity),
            },
        );
        Some(target)
    }

    /// Release a held note; returns whether it was held
    pub fn note_off(&mut self, note: u8) -> bool {
        self.held.remove(&note).is_some()
    }

    pub fn held_notes(&self) -> usize {
        self.held.len()
    }

    /// Re-poke every held note
    pub async fn drive_tick(&mut self) {
        if self.state != HubState::Running {
            return;
        }
        let held: Vec<HeldNote> = self.held.values().copied().collect();
        for note in held {
            self.poke(note.target, &note.event).await;
        }
    }

    async fn poke(&mut self, target: NodeId, event: &PokeEvent) {
        match self.transport.send(target, Payload::poke(event)).await {
            Ok(()) => self.stats.pokes_sent += 1,
            Err(e) => {
                debug!(node = %target, error = %e, "poke lost");
                self.stats.send_failures += 1;
            }
        }
    }

    pub async fn heartbeat(&mut self) {
        let payload = Payload::Heartbeat {
            uptime_ms: self.transport.uptime_ms(),
            load: 0,
        };
        self.send(NodeId::BROADCAST, payload).await;
    }

    /// Warn about nodes silent past the stale timeout
    pub fn check_liveness(&mut self) -> Vec<NodeId> {
        let stale = self
            .transport
            .registry()
            .lock()
            .check_stale(self.config.stale_timeout);
        let stale: Vec<NodeId> = stale
            .into_iter()
            .filter(|id| self.nodes.contains_key(id))
            .collect();
        for id in &stale {
            warn!(node = %id, "no heartbeat from node");
            self.stats.stale_warnings += 1;
        }
        stale
    }

    /// Process one inbound message
    pub async fn handle(&mut self, incoming: Incoming) {
        let source = incoming.message.source();
        let now = Instant::now();
        match incoming.message.payload {
            Payload::Hello { name, .. } if source != NodeId::HUB => {
                self.on_hello(source, incoming.from, name).await;
            }
            Payload::Join { requested_id, .. } => {
                self.on_join(requested_id.unwrap_or(source), incoming.from);
            }
            Payload::CfgAck { .. } => self.on_ack(source, now),
            Payload::CfgNack { status } => {
                self.stats.nacks += 1;
                if let Some(entry) = self.nodes.get_mut(&source) {
                    warn!(node = %source, status = ?status, "configuration rejected");
                    entry.configured = false;
                    entry.last_status = Some(status);
                }
            }
            Payload::Heartbeat { load, .. } => {
                if let Some(entry) = self.nodes.get_mut(&source) {
                    entry.last_heartbeat = Some(now);
                    entry.load = load;
                }
            }
            Payload::State { amplitude, .. } => {
                if let Some(entry) = self.nodes.get_mut(&source) {
                    entry.amplitude = Some(amplitude);
                }
            }
            other => debug!(from = %source, msg_type = ?other.msg_type(), "hub ignoring message"),
        }
    }

    fn assign_id(&self, requested: NodeId, from: LinkAddr) -> Option<NodeId> {
        if let Some(entry) = self.nodes.values().find(|n| n.addr == from) {
            return Some(entry.id);
        }
        if requested.index() < MAX_NODES && !self.nodes.contains_key(&requested) {
            return Some(requested);
        }
        (0..MAX_NODES as u8)
            .map(NodeId)
            .find(|id| !self.nodes.contains_key(id))
    }

    async fn on_hello(&mut self, source: NodeId, from: LinkAddr, name: String) {
        self.stats.hellos += 1;
        if self.state != HubState::Discovering {
            debug!(from = %from, "hello outside discovery");
            return;
        }

        let Some(id) = self.assign_id(source, from) else {
            warn!(from = %from, max = MAX_NODES, "node table full, ignoring hello");
            return;
        };

        if let Err(e) = self.transport.registry().lock().add_or_update_peer(id, from) {
            warn!(node = %id, error = %e, "peer not registered");
            return;
        }

        let optimistic = self.config.join_policy == JoinPolicy::Optimistic;
        let entry = self.nodes.entry(id).or_insert_with(|| {
            info!(node = %id, addr = %from, name = %name, "node discovered");
            NodeEntry::new(id, from, name)
        });
        entry.addr = from;
        entry.registered |= optimistic;

        let payload = Payload::Offer {
            session_id: self
                .session
                .as_ref()
                .map(|s| s.session_id.clone())
                .unwrap_or_else(|| "default_session".into()),
            config_size: self.plan.as_ref().map_or(0, |p| p.total_size()),
            num_nodes: self.registered_count() as u8,
        };
        self.send(id, payload).await;
        self.stats.offers_sent += 1;
    }

    fn on_join(&mut self, id: NodeId, from: LinkAddr) {
        self.stats.joins += 1;
        let Some(entry) = self.nodes.get_mut(&id) else {
            debug!(node = %id, "join from unknown node");
            return;
        };
        if entry.addr != from {
            debug!(node = %id, "join address differs from hello");
        }
        entry.joined = true;
        if !entry.registered {
            info!(node = %id, "node confirmed");
            entry.registered = true;
        }
    }

    fn on_ack(&mut self, source: NodeId, now: Instant) {
        self.stats.acks += 1;
        let Some(entry) = self.nodes.get_mut(&source) else {
            return;
        };
        entry.configured = true;
        entry.failed = false;
        entry.last_status = Some(AckStatus::Ok);
        if let Some(sent) = entry.cfg_sent_at.take() {
            let rtt = now.saturating_duration_since(sent);
            self.transport
                .registry()
                .lock()
                .record_latency(source, rtt / 2);
        }
        debug!(node = %source, "configuration acknowledged");
    }

    /// Apply one front-end command
    pub async fn command(&mut self, command: HubCommand) -> ModalResult<()> {
        match command {
            HubCommand::NoteOn { note, velocity } => {
                self.note_on(note, velocity).await;
            }
            HubCommand::NoteHold { note, velocity } => {
                self.note_hold(note, velocity).await;
            }
            HubCommand::NoteOff { note } => {
                self.note_off(note);
            }
            HubCommand::Start => self.start_session().await?,
            HubCommand::Stop => self.stop_session().await?,
            HubCommand::Reset => self.reset_nodes().await?,
            HubCommand::Query(id) => self.query_state(id).await?,
        }
        Ok(())
    }

    /// Serve commands, heartbeats and held notes until shutdown
    ///
    /// Command errors are logged; only a link failure ends the loop early.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<HubCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ModalResult<HubStats> {
        let transport = self.transport.clone();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drive = tokio::time::interval(self.config.drive_interval);
        drive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if let Err(e) = self.command(command).await {
                            warn!(error = %e, "hub command failed");
                        }
                    }
                    None => commands_open = false,
                },
                incoming = transport.recv() => self.handle(incoming?).await,
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                    self.check_liveness();
                }
                _ = drive.tick() => self.drive_tick().await,
            }
        }

        info!(stats = ?self.stats, "hub finished");
        Ok(self.stats)
    }
}

impl<L: Link> fmt::Debug for HubController<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubController")
            .field("state", &self.state)
            .field("nodes", &self.nodes.len())
            .field("stats", &self.stats)
            .finish()
    }
}
