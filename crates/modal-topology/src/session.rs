//! Session synthesis from a coupling graph, plus the built-in presets

use modal_core::{
    BoundedVec, ModalResult, ModeParams, NodeConfig, NodeId, Personality, SessionConfig,
    TopologyKind, DEFAULT_CONTROL_RATE_HZ, MAX_MODES,
};

use crate::topology::{self, Adjacency};

/// Builds a [`SessionConfig`] whose neighbor lists mirror an [`Adjacency`]
///
/// A node's coupling strength is the global coupling scaled by the weakest
/// edge it touches, so bridge nodes of a clustered graph couple more softly.
pub struct SessionBuilder {
    session_id: String,
    kind: TopologyKind,
    adjacency: Adjacency,
    ids: Option<Vec<NodeId>>,
    global_coupling: f32,
    control_rate_hz: u16,
    max_duration_ms: u32,
    auto_restart: bool,
    personality: Personality,
    modes: [ModeParams; MAX_MODES],
    carrier_freq_hz: f32,
    gain: f32,
}

impl SessionBuilder {
    pub fn new(session_id: impl Into<String>, kind: TopologyKind, adjacency: Adjacency) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            adjacency,
            ids: None,
            global_coupling: 0.3,
            control_rate_hz: DEFAULT_CONTROL_RATE_HZ,
            max_duration_ms: 0,
            auto_restart: false,
            personality: Personality::Resonator,
            modes: ModeParams::default_bank(),
            carrier_freq_hz: 440.0,
            gain: 0.7,
        }
    }

    /// Map graph index `i` to `ids[i]` instead of `NodeId(i)`
    pub fn ids(mut self, ids: Vec<NodeId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn coupling(mut self, global_coupling: f32) -> Self {
        self.global_coupling = global_coupling;
        self
    }

    pub fn control_rate(mut self, hz: u16) -> Self {
        self.control_rate_hz = hz;
        self
    }

    pub fn max_duration_ms(mut self, ms: u32) -> Self {
        self.max_duration_ms = ms;
        self
    }

    pub fn auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn personality(mut self, personality: Personality) -> Self {
        self.personality = personality;
        self
    }

    pub fn modes(mut self, modes: [ModeParams; MAX_MODES]) -> Self {
        self.modes = modes;
        self
    }

    pub fn carrier(mut self, hz: f32) -> Self {
        self.carrier_freq_hz = hz;
        self
    }

    pub fn gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn build(self) -> ModalResult<SessionConfig> {
        self.build_with(|_, _| {})
    }

    /// Build, then let `customize` adjust each node by graph index
    pub fn build_with<F>(self, mut customize: F) -> ModalResult<SessionConfig>
    where
        F: FnMut(usize, &mut NodeConfig),
    {
        let n = self.adjacency.node_count();
        let ids = match self.ids {
            Some(ids) => ids,
            None => (0..n).map(|i| NodeId(i as u8)).collect(),
        };

        let mut config = SessionConfig::new(self.session_id, self.kind);
        config.global_coupling = self.global_coupling;
        config.control_rate_hz = self.control_rate_hz;
        config.max_duration_ms = self.max_duration_ms;
        config.auto_restart = self.auto_restart;

        for (i, &id) in ids.iter().enumerate().take(n) {
            let mut node = NodeConfig::new(id);
            node.personality = self.personality;
            node.modes = self.modes;
            node.neighbors = BoundedVec::try_from_iter(self.adjacency.neighbor_ids(i, &ids))?;
            node.coupling_strength =
                self.global_coupling * self.adjacency.min_incident_weight(i).unwrap_or(1.0);
            node.carrier_freq_hz = self.carrier_freq_hz;
            node.gain = self.gain;
            customize(i, &mut node);
            config.push_node(node)?;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Ring of resonators
pub fn ring_resonator(n: usize) -> ModalResult<SessionConfig> {
    SessionBuilder::new("ring_resonator", TopologyKind::Ring, topology::ring(n)?)
        .coupling(0.3)
        .gain(0.7)
        .build()
}

/// Small-world drone of self-oscillators with a slight carrier spread
pub fn small_world_oscillator(n: usize) -> ModalResult<SessionConfig> {
    SessionBuilder::new(
        "small_world_oscillator",
        TopologyKind::SmallWorld,
        topology::small_world(n)?,
    )
    .coupling(0.4)
    .personality(Personality::SelfOscillator)
    .gain(0.6)
    .build_with(|i, node| node.carrier_freq_hz = 440.0 + 10.0 * i as f32)
}

/// Two resonator clusters joined by half-strength bridges at node 3 of each
pub fn clusters(n: usize) -> ModalResult<SessionConfig> {
    let cluster_size = (n / 2).max(1);
    SessionBuilder::new(
        "clusters",
        TopologyKind::Clustered,
        topology::clustered(n, 2, 3, 0.5)?,
    )
    .coupling(0.25)
    .build_with(|i, node| {
        let cluster = (i / cluster_size).min(1);
        node.carrier_freq_hz = 440.0 + 220.0 * cluster as f32;
    })
}

/// Self-oscillating conductor at node 0 with resonating spokes
pub fn hub_spoke(n: usize) -> ModalResult<SessionConfig> {
    SessionBuilder::new("hub_spoke", TopologyKind::HubSpoke, topology::hub_spoke(n, 0)?)
        .coupling(0.3)
        .build_with(|i, node| {
            if i == 0 {
                node.personality = Personality::SelfOscillator;
                node.gain = 0.5;
            } else {
                node.carrier_freq_hz = 440.0 + 20.0 * i as f32;
            }
        })
}

/// Ring session over exactly the given node ids
///
/// Used by a hub that finishes discovery without a caller-supplied
/// configuration.
pub fn default_session(ids: &[NodeId]) -> ModalResult<SessionConfig> {
    SessionBuilder::new(
        "default_session",
        TopologyKind::Ring,
        topology::ring(ids.len())?,
    )
    .ids(ids.to_vec())
    .build()
}

/// Preset by name, as accepted on the command line
pub fn preset(name: &str, n: usize) -> ModalResult<SessionConfig> {
    match name {
        "ring" => ring_resonator(n),
        "small-world" => small_world_oscillator(n),
        "clusters" => clusters(n),
        "hub-spoke" => hub_spoke(n),
        other => Err(modal_core::ModalError::InvalidConfig(format!(
            "unknown preset '{other}'"
        ))),
    }
}
