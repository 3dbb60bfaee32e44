//! Node-side session state machine
//!
//! Pure protocol logic: messages go in, [`Action`]s come out. The network
//! loop performs the actions, so the machine can be driven directly in
//! tests without sockets, threads or timers.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use modal_config::{ChunkOutcome, ConfigReceiver};
use modal_core::{
    AckStatus, LinkAddr, ModalError, NodeId, Personality, PokeEvent, SessionConfig,
};
use modal_wire::{Message, Payload, CAP_AUDIO};

use crate::ControlCommand;

/// Lifecycle of a node within a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No configuration
    Idle,
    /// A transfer is in progress or the last one failed
    Configuring,
    /// Configured, oscillator stopped
    Ready,
    Running,
    /// The session reached its maximum duration
    Stopped,
    Error,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Ready => "ready",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Side effect requested by the state machine
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Transmit a message
    Send { dest: NodeId, payload: Payload },
    /// Hand a command to the control loop
    Control(ControlCommand),
    /// Hand an excitation to the control loop
    Excite(PokeEvent),
    /// Use a new node id from now on
    AdoptId(NodeId),
    /// Answer a state query with the latest snapshot
    ReportState { dest: NodeId },
}

/// Session counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub pokes_accepted: u64,
    /// Pokes received outside `Running`
    pub pokes_dropped: u64,
    pub configs_applied: u64,
    pub nacks_sent: u64,
    pub ignored: u64,
}

/// State of one node's participation in a session
#[derive(Debug)]
pub struct NodeSession {
    id: NodeId,
    addr: LinkAddr,
    name: String,
    personality: Personality,
    state: SessionState,
    hub: Option<NodeId>,
    receiver: ConfigReceiver,
    config: Option<SessionConfig>,
    started_at: Option<Instant>,
    stats: SessionStats,
}

impl NodeSession {
    /// `id` may be [`NodeId::UNASSIGNED`] to have the hub pick one
    pub fn new(id: NodeId, addr: LinkAddr, name: impl Into<String>, personality: Personality) -> Self {
        NodeSession {
            id,
            addr,
            name: name.into(),
            personality,
            state: SessionState::Idle,
            hub: None,
            receiver: ConfigReceiver::new(),
            config: None,
            started_at: None,
            stats: SessionStats::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn hub(&self) -> Option<NodeId> {
        self.hub
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn receiver(&self) -> &ConfigReceiver {
        &self.receiver
    }

    /// Time since the session last started
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.started_at.map(|t| now.saturating_duration_since(t))
    }

    /// Whether the node should keep announcing itself
    pub fn needs_announce(&self) -> bool {
        self.state == SessionState::Idle
    }

    /// Discovery announcement
    pub fn hello(&self) -> Payload {
        Payload::Hello {
            addr: self.addr,
            capabilities: CAP_AUDIO,
            name: self.name.clone(),
        }
    }

    /// Enter the error state after an unrecoverable local failure
    pub fn fail(&mut self, reason: &ModalError) -> Vec<Action> {
        warn!(node = %self.id, error = %reason, "session failed");
        let was_running = self.state == SessionState::Running;
        self.transition(SessionState::Error);
        self.started_at = None;
        if was_running {
            vec![Action::Control(ControlCommand::Stop)]
        } else {
            Vec::new()
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!(node = %self.id, from = %self.state, to = %next, "session state");
            self.state = next;
        }
    }

    fn is_for_me(&self, msg: &Message) -> bool {
        msg.header.is_broadcast() || msg.dest() == self.id
    }

    /// React to one inbound message
    pub fn handle(&mut self, msg: &Message, now: Instant) -> Vec<Action> {
        let source = msg.source();
        match &msg.payload {
            Payload::Hello { .. } => self.on_hello(source),
            Payload::Offer { session_id, .. } => self.on_offer(msg, session_id),
            Payload::CfgBegin {
                total_size,
                num_chunks,
                checksum,
            } if self.is_for_me(msg) => self.on_cfg_begin(source, *total_size, *num_chunks, *checksum),
            Payload::CfgChunk { index, data } if self.is_for_me(msg) => {
                if self.receiver.on_chunk(*index, data) == ChunkOutcome::Stored {
                    debug!(node = %self.id, index, "chunk stored");
                }
                Vec::new()
            }
            Payload::CfgEnd { checksum } if self.is_for_me(msg) => self.on_cfg_end(source, *checksum),
            Payload::Start { .. } if self.is_for_me(msg) => self.on_start(now),
            Payload::Stop if self.is_for_me(msg) => self.on_stop(),
            Payload::Reset if self.is_for_me(msg) => self.on_reset(),
            Payload::Poke { .. } if self.is_for_me(msg) => self.on_poke(msg),
            Payload::State { .. } if msg.dest() == self.id => {
                vec![Action::ReportState { dest: source }]
            }
            _ => {
                self.stats.ignored += 1;
                Vec::new()
            }
        }
    }

    fn on_hello(&mut self, source: NodeId) -> Vec<Action> {
        // Answer the hub's announcement so it learns our address
        if source == NodeId::HUB && self.state == SessionState::Idle {
            vec![Action::Send {
                dest: NodeId::BROADCAST,
                payload: self.hello(),
            }]
        } else {
            Vec::new()
        }
    }

    fn on_offer(&mut self, msg: &Message, session_id: &str) -> Vec<Action> {
        let offered = msg.dest();
        if offered.is_broadcast() || !matches!(self.state, SessionState::Idle | SessionState::Configuring) {
            self.stats.ignored += 1;
            return Vec::new();
        }
        if self.id != NodeId::UNASSIGNED && self.id != offered {
            self.stats.ignored += 1;
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.id != offered {
            info!(id = %offered, session = session_id, "adopting offered id");
            self.id = offered;
            actions.push(Action::AdoptId(offered));
        }
        self.hub = Some(msg.source());
        actions.push(Action::Send {
            dest: msg.source(),
            payload: Payload::Join {
                requested_id: Some(self.id),
                addr: self.addr,
            },
        });
        actions
    }

    fn on_cfg_begin(&mut self, source: NodeId, total_size: u16, num_chunks: u8, checksum: u32) -> Vec<Action> {
        if self.state == SessionState::Running {
            debug!(node = %self.id, "ignoring configuration while running");
            self.stats.ignored += 1;
            return Vec::new();
        }

        self.hub.get_or_insert(source);
        self.transition(SessionState::Configuring);
        match self.receiver.on_begin(total_size, num_chunks, checksum) {
            Ok(()) => Vec::new(),
            Err(e) => self.nack(source, &e),
        }
    }

    fn on_cfg_end(&mut self, source: NodeId, checksum: u32) -> Vec<Action> {
        if !self.receiver.is_receiving() {
            self.stats.ignored += 1;
            return Vec::new();
        }

        let config = match self.receiver.on_end(checksum) {
            Ok(config) => config,
            Err(e) => return self.nack(source, &e),
        };

        let Some(node_config) = config.node(self.id).cloned() else {
            let err = ModalError::InvalidConfig(format!("node {} not in session", self.id));
            return self.nack(source, &err);
        };

        info!(
            node = %self.id,
            session = %config.session_id,
            topology = %config.topology,
            neighbors = node_config.neighbors.len(),
            "configuration applied"
        );
        self.personality = node_config.personality;
        self.config = Some(config);
        self.stats.configs_applied += 1;
        self.transition(SessionState::Ready);

        vec![
            Action::Control(ControlCommand::Apply(Box::new(node_config))),
            Action::Send {
                dest: source,
                payload: Payload::CfgAck {
                    status: AckStatus::Ok,
                },
            },
        ]
    }

    fn nack(&mut self, dest: NodeId, err: &ModalError) -> Vec<Action> {
        let status = err.nack_status().unwrap_or(AckStatus::InvalidConfig);
        warn!(node = %self.id, error = %err, status = ?status, "rejecting configuration");
        self.stats.nacks_sent += 1;
        self.transition(SessionState::Configuring);
        vec![Action::Send {
            dest,
            payload: Payload::CfgNack { status },
        }]
    }

    fn on_start(&mut self, now: Instant) -> Vec<Action> {
        match self.state {
            SessionState::Ready | SessionState::Stopped => {
                self.started_at = Some(now);
                self.transition(SessionState::Running);
                vec![Action::Control(ControlCommand::Start)]
            }
            SessionState::Running => Vec::new(),
            state => {
                let err = ModalError::InvalidTransition {
                    state: state.name(),
                    action: "start",
                };
                debug!(node = %self.id, error = %err, "start ignored");
                self.stats.ignored += 1;
                Vec::new()
            }
        }
    }

    fn on_stop(&mut self) -> Vec<Action> {
        if self.state != SessionState::Running {
            return Vec::new();
        }
        self.started_at = None;
        self.transition(SessionState::Ready);
        vec![Action::Control(ControlCommand::Stop)]
    }

    fn on_reset(&mut self) -> Vec<Action> {
        if self.state == SessionState::Error {
            self.config = None;
            self.transition(SessionState::Idle);
        }
        vec![Action::Control(ControlCommand::Reset)]
    }

    fn on_poke(&mut self, msg: &Message) -> Vec<Action> {
        if self.state != SessionState::Running {
            self.stats.pokes_dropped += 1;
            return Vec::new();
        }
        match msg.poke_event() {
            Some(event) => {
                self.stats.pokes_accepted += 1;
                vec![Action::Excite(event)]
            }
            None => Vec::new(),
        }
    }

    /// Time-driven transitions
    ///
    /// Enforces the session's maximum duration: the session restarts from
    /// zero state if it auto-restarts, otherwise it stops.
    pub fn poll(&mut self, now: Instant) -> Vec<Action> {
        let max_ms = match (&self.config, self.state) {
            (Some(config), SessionState::Running) if config.max_duration_ms > 0 => {
                config.max_duration_ms
            }
            _ => return Vec::new(),
        };
        let auto_restart = self.config.as_ref().is_some_and(|c| c.auto_restart);

        let Some(elapsed) = self.elapsed(now) else {
            return Vec::new();
        };
        if elapsed < Duration::from_millis(max_ms as u64) {
            return Vec::new();
        }

        if auto_restart {
            info!(node = %self.id, "session duration reached, restarting");
            self.started_at = Some(now);
            vec![
                Action::Control(ControlCommand::Reset),
                Action::Control(ControlCommand::Start),
            ]
        } else {
            info!(node = %self.id, "session duration reached");
            self.started_at = None;
            self.transition(SessionState::Stopped);
            vec![Action::Control(ControlCommand::Stop)]
        }
    }

    pub fn personality(&self) -> Personality {
        self.personality
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modal_config::TransferPlan;
    use modal_core::PhaseHint;
    use modal_topology::ring_resonator;

    fn session(id: NodeId) -> NodeSession {
        NodeSession::new(id, LinkAddr::new([10, 0, 0, 9, 0, 0]), "test", Personality::Resonator)
    }

    fn from_hub(payload: Payload) -> Message {
        Message::broadcast(NodeId::HUB, payload)
    }

    fn poke() -> Message {
        Message::new(
            NodeId::HUB,
            NodeId(2),
            Payload::Poke {
                strength: 0.8,
                phase_hint: PhaseHint::Random,
                mode_weights: [1.0; 4],
            },
        )
    }

    /// Deliver a full transfer and return the actions of `CfgEnd`
    fn configure(s: &mut NodeSession, config: &SessionConfig, skip: Option<u8>) -> Vec<Action> {
        let plan = TransferPlan::from_config(config).unwrap();
        let now = Instant::now();
        assert!(s.handle(&from_hub(plan.begin()), now).is_empty());
        for (i, chunk) in plan.chunks().enumerate() {
            if Some(i as u8) != skip {
                s.handle(&from_hub(chunk), now);
            }
        }
        s.handle(&from_hub(plan.end()), now)
    }

    #[test]
    fn test_full_lifecycle() {
        let mut s = session(NodeId(2));
        let now = Instant::now();
        let actions = configure(&mut s, &ring_resonator(4).unwrap(), None);

        assert_eq!(s.state(), SessionState::Ready);
        assert!(matches!(
            &actions[0],
            Action::Control(ControlCommand::Apply(cfg)) if cfg.id == NodeId(2)
        ));
        assert_eq!(
            actions[1],
            Action::Send {
                dest: NodeId::HUB,
                payload: Payload::CfgAck { status: AckStatus::Ok }
            }
        );

        let actions = s.handle(&from_hub(Payload::Start { start_time_ms: 0 }), now);
        assert_eq!(actions, vec![Action::Control(ControlCommand::Start)]);
        assert_eq!(s.state(), SessionState::Running);

        assert!(matches!(s.handle(&poke(), now)[..], [Action::Excite(_)]));

        let actions = s.handle(&from_hub(Payload::Stop), now);
        assert_eq!(actions, vec![Action::Control(ControlCommand::Stop)]);
        assert_eq!(s.state(), SessionState::Ready);
        assert!(s.config().is_some());

        // Restart without re-transfer
        s.handle(&from_hub(Payload::Start { start_time_ms: 0 }), now);
        assert_eq!(s.state(), SessionState::Running);
    }

    #[test]
    fn test_poke_while_ready_dropped() {
        let mut s = session(NodeId(2));
        configure(&mut s, &ring_resonator(4).unwrap(), None);

        assert!(s.handle(&poke(), Instant::now()).is_empty());
        assert_eq!(s.stats().pokes_dropped, 1);
        assert_eq!(s.stats().pokes_accepted, 0);
    }

    #[test]
    fn test_missing_chunk_stays_configuring() {
        let mut s = session(NodeId(2));
        let actions = configure(&mut s, &ring_resonator(16).unwrap(), Some(0));

        assert_eq!(s.state(), SessionState::Configuring);
        assert_eq!(
            actions,
            vec![Action::Send {
                dest: NodeId::HUB,
                payload: Payload::CfgNack {
                    status: AckStatus::MissingChunks
                }
            }]
        );
        assert!(s.config().is_none());

        // Start before a good transfer is refused
        assert!(s
            .handle(&from_hub(Payload::Start { start_time_ms: 0 }), Instant::now())
            .is_empty());

        // Retransmission succeeds
        configure(&mut s, &ring_resonator(16).unwrap(), None);
        assert_eq!(s.state(), SessionState::Ready);
    }

    #[test]
    fn test_not_in_session_nacks() {
        let mut s = session(NodeId(9));
        let actions = configure(&mut s, &ring_resonator(4).unwrap(), None);
        assert_eq!(
            actions,
            vec![Action::Send {
                dest: NodeId::HUB,
                payload: Payload::CfgNack {
                    status: AckStatus::InvalidConfig
                }
            }]
        );
    }

    #[test]
    fn test_offer_adopts_id() {
        let mut s = session(NodeId::UNASSIGNED);
        let offer = Message::new(
            NodeId::HUB,
            NodeId(3),
            Payload::Offer {
                session_id: "default_session".into(),
                config_size: 0,
                num_nodes: 0,
            },
        );

        let actions = s.handle(&offer, Instant::now());
        assert_eq!(actions[0], Action::AdoptId(NodeId(3)));
        assert!(matches!(
            &actions[1],
            Action::Send { dest, payload: Payload::Join { requested_id: Some(NodeId(3)), .. } }
                if *dest == NodeId::HUB
        ));
        assert_eq!(s.id(), NodeId(3));
        assert_eq!(s.hub(), Some(NodeId::HUB));

        // An offer for another id is not ours
        let other = Message::new(NodeId::HUB, NodeId(5), offer.payload.clone());
        assert!(s.handle(&other, Instant::now()).is_empty());
        assert_eq!(s.id(), NodeId(3));
    }

    #[test]
    fn test_answers_hub_hello_while_idle() {
        let mut s = session(NodeId::UNASSIGNED);
        let hello = from_hub(Payload::Hello {
            addr: LinkAddr::ZERO,
            capabilities: 0,
            name: "hub".into(),
        });
        assert!(matches!(
            s.handle(&hello, Instant::now())[..],
            [Action::Send { payload: Payload::Hello { .. }, .. }]
        ));
        assert!(s.needs_announce());
    }

    #[test]
    fn test_unicast_for_other_node_ignored() {
        let mut s = session(NodeId(1));
        let stop = Message::new(NodeId::HUB, NodeId(2), Payload::Reset);
        assert!(s.handle(&stop, Instant::now()).is_empty());
        assert_eq!(s.stats().ignored, 1);
    }

    #[test]
    fn test_max_duration_stops() {
        let mut config = ring_resonator(4).unwrap();
        config.max_duration_ms = 1000;
        let mut s = session(NodeId(0));
        configure(&mut s, &config, None);

        let t0 = Instant::now();
        s.handle(&from_hub(Payload::Start { start_time_ms: 0 }), t0);
        assert!(s.poll(t0 + Duration::from_millis(999)).is_empty());

        let actions = s.poll(t0 + Duration::from_millis(1000));
        assert_eq!(actions, vec![Action::Control(ControlCommand::Stop)]);
        assert_eq!(s.state(), SessionState::Stopped);

        // A new start is still accepted
        s.handle(&from_hub(Payload::Start { start_time_ms: 0 }), t0);
        assert_eq!(s.state(), SessionState::Running);
    }

    #[test]
    fn test_max_duration_auto_restart() {
        let mut config = ring_resonator(4).unwrap();
        config.max_duration_ms = 500;
        config.auto_restart = true;
        let mut s = session(NodeId(0));
        configure(&mut s, &config, None);

        let t0 = Instant::now();
        s.handle(&from_hub(Payload::Start { start_time_ms: 0 }), t0);
        let t1 = t0 + Duration::from_millis(600);
        assert_eq!(
            s.poll(t1),
            vec![
                Action::Control(ControlCommand::Reset),
                Action::Control(ControlCommand::Start)
            ]
        );
        assert_eq!(s.state(), SessionState::Running);
        assert_eq!(s.elapsed(t1), Some(Duration::ZERO));
    }

    #[test]
    fn test_state_query() {
        let mut s = session(NodeId(4));
        let query = Message::new(
            NodeId::HUB,
            NodeId(4),
            Payload::State {
                mode0_re: 0.0,
                mode0_im: 0.0,
                amplitude: 0.0,
            },
        );
        assert_eq!(
            s.handle(&query, Instant::now()),
            vec![Action::ReportState { dest: NodeId::HUB }]
        );
    }

    #[test]
    fn test_fail_and_reset() {
        let mut s = session(NodeId(0));
        configure(&mut s, &ring_resonator(2).unwrap(), None);
        s.handle(&from_hub(Payload::Start { start_time_ms: 0 }), Instant::now());

        let actions = s.fail(&ModalError::TransportError("link down".into()));
        assert_eq!(actions, vec![Action::Control(ControlCommand::Stop)]);
        assert_eq!(s.state(), SessionState::Error);

        s.handle(&from_hub(Payload::Reset), Instant::now());
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.config().is_none());
    }
}
