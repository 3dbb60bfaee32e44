//! In-process mesh simulator
//!
//! Runs a hub and N fully threaded nodes over a [`MemoryMesh`], every link
//! wrapped in a [`ChaosLink`].

use std::time::Duration;

use modal_core::{ModalError, ModalResult, NodeId, Personality, SessionConfig};
use modal_oscillator::{ModalNode, NodeSnapshot};
use modal_runtime::{
    spawn_node, HubController, NodeHandle, NodeOptions, NodeStats, RuntimeConfig, SessionState,
    SilentRenderer,
};
use modal_transport::{MemoryLink, MemoryMesh};

use crate::chaos::{ChaosConfig, ChaosLink};

pub type SimLink = ChaosLink<MemoryLink>;

/// Simulation settings
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub nodes: usize,
    pub runtime: RuntimeConfig,
    pub chaos: ChaosConfig,
    /// Base seed for links and oscillators
    pub seed: u64,
    /// Upper bound for any state wait
    pub wait_timeout: Duration,
}

impl SimConfig {
    /// Timings shortened so a full session setup takes well under a second
    pub fn fast(nodes: usize) -> Self {
        let runtime = RuntimeConfig {
            discovery_window: Duration::from_millis(300),
            hello_interval: Duration::from_millis(100),
            ack_timeout: Duration::from_millis(300),
            cfg_begin_delay: Duration::from_millis(5),
            cfg_chunk_delay: Duration::from_millis(2),
            ..RuntimeConfig::default()
        };
        SimConfig {
            nodes,
            runtime,
            chaos: ChaosConfig::none(),
            seed: 0x5eed,
            wait_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chaos = chaos;
        self
    }
}

/// A hub and its nodes on one shared medium
pub struct MeshSimulator {
    config: SimConfig,
    mesh: MemoryMesh,
    hub: HubController<SimLink>,
    nodes: Vec<NodeHandle<SilentRenderer>>,
}

impl MeshSimulator {
    /// Boot the hub and all nodes; nodes start unassigned and announce
    /// themselves. Must be called inside a multi-threaded tokio runtime.
    pub fn start(config: SimConfig) -> ModalResult<Self> {
        let mesh = MemoryMesh::new();
        let hub_link = ChaosLink::new(mesh.link(), config.chaos.clone(), config.seed);
        let hub = HubController::new(hub_link, &config.runtime);

        let mut nodes = Vec::with_capacity(config.nodes);
        for i in 0..config.nodes {
            let seed = config.seed.wrapping_add(i as u64 + 1);
            let link = ChaosLink::new(mesh.link(), config.chaos.clone(), seed);
            let options = NodeOptions {
                id: NodeId::UNASSIGNED,
                personality: Personality::Resonator,
                name: format!("sim-{i}"),
                seed: Some(seed),
            };
            nodes.push(spawn_node(link, options, &config.runtime, SilentRenderer)?);
        }

        Ok(MeshSimulator {
            config,
            mesh,
            hub,
            nodes,
        })
    }

    pub fn hub(&self) -> &HubController<SimLink> {
        &self.hub
    }

    pub fn hub_mut(&mut self) -> &mut HubController<SimLink> {
        &mut self.hub
    }

    pub fn node(&self, index: usize) -> Option<&NodeHandle<SilentRenderer>> {
        self.nodes.get(index)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn mesh(&self) -> &MemoryMesh {
        &self.mesh
    }

    /// Session states of all nodes, in boot order
    pub fn states(&self) -> Vec<SessionState> {
        self.nodes.iter().map(|n| n.state()).collect()
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(|n| n.snapshot().load()).collect()
    }

    /// Wait until every node reports `target`
    pub async fn wait_all(&mut self, target: SessionState) -> ModalResult<()> {
        let timeout = self.config.wait_timeout;
        for (i, node) in self.nodes.iter_mut().enumerate() {
            tokio::time::timeout(timeout, node.wait_for(target))
                .await
                .map_err(|_| {
                    ModalError::TransportError(format!("node {i} never reached {target}"))
                })??;
        }
        Ok(())
    }

    /// Discover, configure and distribute; returns configured node count
    pub async fn setup(&mut self, custom: Option<SessionConfig>) -> ModalResult<usize> {
        self.hub.setup(custom).await
    }

    /// Start the session and wait for every node to run
    pub async fn start_session(&mut self) -> ModalResult<()> {
        self.hub.start_session().await?;
        self.wait_all(SessionState::Running).await
    }

    /// Stop every loop and return per-node results in boot order
    pub async fn shutdown(self) -> ModalResult<Vec<(NodeStats, ModalNode)>> {
        let mut results = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            results.push(node.shutdown().await?);
        }
        Ok(results)
    }
}
