//! Session configuration shared by every node in a run
//!
//! A [`SessionConfig`] is built by the hub (or a topology preset), validated,
//! serialized for chunked transfer and applied read-only on each node.

use std::collections::BTreeSet;
use std::f32::consts::TAU;
use std::fmt;

use crate::{BoundedVec, ModalError, ModalResult, NodeId, Personality};

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram the transport accepts
pub const MAX_PACKET_SIZE: usize = 250;

/// Largest serialized configuration
pub const MAX_CONFIG_SIZE: usize = 2048;

/// Payload bytes carried by a single configuration chunk
pub const CHUNK_SIZE: usize = 200;

/// Modes per node
pub const MAX_MODES: usize = 4;

/// Nodes per session
pub const MAX_NODES: usize = 16;

/// Neighbors per node (every other node of a full session)
pub const MAX_NEIGHBORS: usize = MAX_NODES - 1;

/// Longest session id in bytes
pub const MAX_SESSION_ID_LEN: usize = 31;

/// Default control-loop rate
pub const DEFAULT_CONTROL_RATE_HZ: u16 = 500;

/// Index of the mode whose phase drives timbre modulation
pub const TIMBRE_MODE: usize = 2;

/// Parameters of one modal oscillator
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModeParams {
    /// Angular frequency (rad/s)
    pub omega: f32,
    /// Damping coefficient (1/s)
    pub gamma: f32,
    /// Audio weight in [0, 1]
    pub weight: f32,
    pub active: bool,
}

impl ModeParams {
    pub fn from_hz(freq_hz: f32, gamma: f32, weight: f32) -> Self {
        ModeParams {
            omega: TAU * freq_hz,
            gamma,
            weight,
            active: true,
        }
    }

    pub const fn inactive() -> Self {
        ModeParams {
            omega: 0.0,
            gamma: 0.0,
            weight: 0.0,
            active: false,
        }
    }

    pub fn freq_hz(&self) -> f32 {
        self.omega / TAU
    }

    /// Two detuned fundamentals, an octave timbre mode and a sub-bass mode
    pub fn default_bank() -> [ModeParams; MAX_MODES] {
        [
            ModeParams::from_hz(440.0, 0.5, 1.0),
            ModeParams::from_hz(442.0, 0.6, 0.8),
            ModeParams::from_hz(880.0, 1.0, 0.3),
            ModeParams::from_hz(55.0, 0.1, 0.5),
        ]
    }
}

impl Default for ModeParams {
    fn default() -> Self {
        ModeParams::inactive()
    }
}

/// Network shape of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TopologyKind {
    #[default]
    Ring = 0,
    SmallWorld = 1,
    Clustered = 2,
    HubSpoke = 3,
    Custom = 4,
    Random = 5,
    Complete = 6,
}

impl TopologyKind {
    pub fn from_byte(b: u8) -> ModalResult<Self> {
        Ok(match b {
            0 => TopologyKind::Ring,
            1 => TopologyKind::SmallWorld,
            2 => TopologyKind::Clustered,
            3 => TopologyKind::HubSpoke,
            4 => TopologyKind::Custom,
            5 => TopologyKind::Random,
            6 => TopologyKind::Complete,
            _ => return Err(ModalError::InvalidConfig(format!("unknown topology {b}"))),
        })
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopologyKind::Ring => "ring",
            TopologyKind::SmallWorld => "small-world",
            TopologyKind::Clustered => "clustered",
            TopologyKind::HubSpoke => "hub-spoke",
            TopologyKind::Custom => "custom",
            TopologyKind::Random => "random",
            TopologyKind::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Configuration of a single node
#[derive(Clone, Debug, PartialEq)]
pub struct NodeConfig {
    pub id: NodeId,
    pub personality: Personality,
    pub modes: [ModeParams; MAX_MODES],
    pub neighbors: BoundedVec<NodeId, MAX_NEIGHBORS>,
    pub coupling_strength: f32,
    pub carrier_freq_hz: f32,
    pub gain: f32,
}

impl NodeConfig {
    pub fn new(id: NodeId) -> Self {
        NodeConfig {
            id,
            personality: Personality::Resonator,
            modes: ModeParams::default_bank(),
            neighbors: BoundedVec::new(),
            coupling_strength: 0.3,
            carrier_freq_hz: 440.0,
            gain: 0.7,
        }
    }

    /// Add a neighbor, ignoring duplicates
    pub fn add_neighbor(&mut self, neighbor: NodeId) -> ModalResult<()> {
        if neighbor == self.id {
            return Err(ModalError::InvalidConfig(format!(
                "node {} cannot neighbor itself",
                self.id
            )));
        }
        self.neighbors.try_insert_unique(neighbor).map(|_| ())
    }

    pub fn active_modes(&self) -> impl Iterator<Item = &ModeParams> {
        self.modes.iter().filter(|m| m.active)
    }
}

/// Configuration of a whole session
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub session_id: String,
    pub topology: TopologyKind,
    pub global_coupling: f32,
    pub control_rate_hz: u16,
    /// Maximum session time, 0 = unlimited
    pub max_duration_ms: u32,
    pub auto_restart: bool,
    pub nodes: Vec<NodeConfig>,
}

impl SessionConfig {
    pub fn new(session_id: impl Into<String>, topology: TopologyKind) -> Self {
        SessionConfig {
            session_id: session_id.into(),
            topology,
            global_coupling: 0.3,
            control_rate_hz: DEFAULT_CONTROL_RATE_HZ,
            max_duration_ms: 0,
            auto_restart: false,
            nodes: Vec::new(),
        }
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeConfig> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Append a node configuration, enforcing the session size limit
    pub fn push_node(&mut self, node: NodeConfig) -> ModalResult<()> {
        if self.nodes.len() >= MAX_NODES {
            return Err(ModalError::TooManyNodes {
                count: self.nodes.len() + 1,
                max: MAX_NODES,
            });
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Check structural invariants
    ///
    /// Node ids are unique, every neighbor is a node of this session and no
    /// node lists itself.
    pub fn validate(&self) -> ModalResult<()> {
        if self.session_id.len() > MAX_SESSION_ID_LEN {
            return Err(ModalError::InvalidConfig(format!(
                "session id longer than {MAX_SESSION_ID_LEN} bytes"
            )));
        }
        if self.nodes.is_empty() {
            return Err(ModalError::InvalidConfig("session has no nodes".into()));
        }
        if self.nodes.len() > MAX_NODES {
            return Err(ModalError::TooManyNodes {
                count: self.nodes.len(),
                max: MAX_NODES,
            });
        }
        if self.control_rate_hz == 0 {
            return Err(ModalError::InvalidConfig("control rate is zero".into()));
        }

        let mut ids = BTreeSet::new();
        for node in &self.nodes {
            if node.id.is_broadcast() {
                return Err(ModalError::InvalidConfig(
                    "broadcast id used as node id".into(),
                ));
            }
            if !ids.insert(node.id) {
                return Err(ModalError::DuplicateNode(node.id));
            }
        }

        for node in &self.nodes {
            for &neighbor in &node.neighbors {
                if neighbor == node.id || !ids.contains(&neighbor) {
                    return Err(ModalError::UnknownNeighbor {
                        node: node.id,
                        neighbor,
                    });
                }
            }
            for mode in node.active_modes() {
                if !mode.omega.is_finite() || !mode.gamma.is_finite() || !mode.weight.is_finite()
                {
                    return Err(ModalError::InvalidConfig(format!(
                        "node {} has a non-finite mode parameter",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node() -> SessionConfig {
        let mut cfg = SessionConfig::new("pair", TopologyKind::Custom);
        let mut a = NodeConfig::new(NodeId(0));
        a.add_neighbor(NodeId(1)).unwrap();
        let mut b = NodeConfig::new(NodeId(1));
        b.add_neighbor(NodeId(0)).unwrap();
        cfg.push_node(a).unwrap();
        cfg.push_node(b).unwrap();
        cfg
    }

    #[test]
    fn test_valid_session() {
        let cfg = two_node();
        cfg.validate().unwrap();
        assert_eq!(cfg.node_count(), 2);
        assert!(cfg.node(NodeId(1)).is_some());
        assert!(cfg.node(NodeId(5)).is_none());
    }

    #[test]
    fn test_unknown_neighbor_rejected() {
        let mut cfg = two_node();
        cfg.node_mut(NodeId(0))
            .unwrap()
            .add_neighbor(NodeId(9))
            .unwrap();
        assert_eq!(
            cfg.validate(),
            Err(ModalError::UnknownNeighbor {
                node: NodeId(0),
                neighbor: NodeId(9)
            })
        );
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut cfg = two_node();
        cfg.nodes.push(NodeConfig::new(NodeId(1)));
        assert_eq!(cfg.validate(), Err(ModalError::DuplicateNode(NodeId(1))));
    }

    #[test]
    fn test_self_neighbor_rejected() {
        let mut node = NodeConfig::new(NodeId(3));
        assert!(node.add_neighbor(NodeId(3)).is_err());
    }

    #[test]
    fn test_node_limit() {
        let mut cfg = SessionConfig::new("full", TopologyKind::Ring);
        for i in 0..MAX_NODES as u8 {
            cfg.push_node(NodeConfig::new(NodeId(i))).unwrap();
        }
        let err = cfg.push_node(NodeConfig::new(NodeId(99))).unwrap_err();
        assert!(matches!(err, ModalError::TooManyNodes { .. }));
    }

    #[test]
    fn test_default_bank() {
        let bank = ModeParams::default_bank();
        assert!((bank[0].freq_hz() - 440.0).abs() < 1e-3);
        assert!((bank[3].freq_hz() - 55.0).abs() < 1e-3);
        assert!(bank.iter().all(|m| m.active));
    }
}
