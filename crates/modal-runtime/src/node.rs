//! Node runtime - network loop and loop wiring
//!
//! A node runs three loops:
//! - network: this module, an async task driving [`NodeSession`]
//! - control: [`ControlLoop`] on its own thread
//! - audio: [`AudioLoop`] on its own thread
//!
//! The network loop never waits on the others. Excitations cross to the
//! control thread through a bounded queue and lifecycle commands through a
//! published [`EngineTarget`](crate::EngineTarget); the audio thread only
//! reads published snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use modal_core::{ModalError, ModalResult, NodeId, Personality};
use modal_oscillator::{ModalNode, SnapshotReader};
use modal_transport::{Incoming, Link, Transport};
use modal_wire::Payload;

use crate::{
    bounded, engine_target, Action, AudioLoop, AudioRenderer, ControlLoop, ExcitationSender,
    NodeSession, RuntimeConfig, SessionState, TargetWriter,
};

/// How often session timers are checked
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Identity of a node at boot
#[derive(Clone, Debug)]
pub struct NodeOptions {
    /// [`NodeId::UNASSIGNED`] lets the hub assign one
    pub id: NodeId,
    pub personality: Personality,
    /// Announced in `Hello`
    pub name: String,
    /// Fixed seed for reproducible excitation phases
    pub seed: Option<u64>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        NodeOptions {
            id: NodeId::UNASSIGNED,
            personality: Personality::Resonator,
            name: "modal-node".into(),
            seed: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub messages_in: u64,
    pub send_failures: u64,
    pub excitations_queued: u64,
    /// Excitations lost to a full queue
    pub excitations_dropped: u64,
    pub heartbeats_sent: u64,
    pub state_reports: u64,
}

/// Network side of a node
pub struct NodeRuntime<L: Link> {
    transport: Arc<Transport<L>>,
    session: NodeSession,
    excitations: ExcitationSender,
    target: TargetWriter,
    snapshot: SnapshotReader,
    config: RuntimeConfig,
    stats: NodeStats,
    state_tx: watch::Sender<SessionState>,
}

impl<L: Link> NodeRuntime<L> {
    /// Build the network side and the control loop it feeds
    ///
    /// The caller decides where the [`ControlLoop`] runs.
    pub fn new(link: L, options: NodeOptions, config: &RuntimeConfig) -> (Self, ControlLoop) {
        let transport = Arc::new(Transport::with_retry(
            link,
            options.id,
            config.retry_policy(),
        ));

        let mut node = match options.seed {
            Some(seed) => ModalNode::with_seed(options.id, options.personality, seed),
            None => ModalNode::new(options.id, options.personality),
        };
        node.set_envelope_duration(config.poke_envelope);

        let (excitations, erx) = bounded(config.excitation_queue_capacity);
        let (target, reader) = engine_target();
        let control = ControlLoop::new(node, erx, reader, config.control_period());

        let session = NodeSession::new(
            options.id,
            transport.local_addr(),
            options.name,
            options.personality,
        );
        let (state_tx, _) = watch::channel(session.state());

        let runtime = NodeRuntime {
            transport,
            session,
            excitations,
            target,
            snapshot: control.snapshot_reader(),
            config: config.clone(),
            stats: NodeStats::default(),
            state_tx,
        };
        (runtime, control)
    }

    pub fn id(&self) -> NodeId {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &NodeSession {
        &self.session
    }

    pub fn transport(&self) -> &Arc<Transport<L>> {
        &self.transport
    }

    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    pub fn snapshot(&self) -> SnapshotReader {
        self.snapshot.clone()
    }

    /// Follow session state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Process one inbound message
    pub async fn handle(&mut self, incoming: Incoming) {
        self.stats.messages_in += 1;
        let actions = self.session.handle(&incoming.message, Instant::now());
        self.execute(actions).await;
    }

    /// Check session timers
    pub async fn poll(&mut self) {
        let actions = self.session.poll(Instant::now());
        self.execute(actions).await;
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { dest, payload } => self.send(dest, payload).await,
                Action::Control(command) => self.target.send(command),
                Action::Excite(event) => {
                    if self.excitations.try_push(event) {
                        self.stats.excitations_queued += 1;
                    } else {
                        debug!(node = %self.id(), "excitation queue full, poke dropped");
                        self.stats.excitations_dropped += 1;
                    }
                }
                Action::AdoptId(id) => self.transport.set_local_id(id),
                Action::ReportState { dest } => {
                    let snap = self.snapshot.load();
                    self.stats.state_reports += 1;
                    let payload = Payload::State {
                        mode0_re: snap.mode0.re,
                        mode0_im: snap.mode0.im,
                        amplitude: snap.amplitude,
                    };
                    self.send(dest, payload).await;
                }
            }
        }
        self.state_tx.send_if_modified(|state| {
            let next = self.session.state();
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    async fn send(&mut self, dest: NodeId, payload: Payload) {
        if let Err(e) = self.transport.send(dest, payload).await {
            debug!(node = %self.id(), error = %e, "send failed");
            self.stats.send_failures += 1;
        }
    }

    /// Broadcast liveness; load is the excitation queue fill in percent
    pub async fn heartbeat(&mut self) {
        let capacity = self.excitations.capacity().max(1);
        let load = (self.excitations.pending() * 100 / capacity).min(100) as u8;
        let payload = Payload::Heartbeat {
            uptime_ms: self.transport.uptime_ms(),
            load,
        };
        self.send(NodeId::BROADCAST, payload).await;
        self.stats.heartbeats_sent += 1;
    }

    /// Broadcast `Hello`
    pub async fn announce(&mut self) {
        let hello = self.session.hello();
        self.send(NodeId::BROADCAST, hello).await;
    }

    /// Run until `shutdown` turns true or the link fails
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ModalResult<NodeStats> {
        let transport = self.transport.clone();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut hello = tokio::time::interval(self.config.hello_interval);
        hello.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(node = %self.id(), addr = %transport.local_addr(), "node network loop started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                incoming = transport.recv() => match incoming {
                    Ok(incoming) => self.handle(incoming).await,
                    Err(e) => {
                        let actions = self.session.fail(&e);
                        self.execute(actions).await;
                        return Err(e);
                    }
                },
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = hello.tick(), if self.session.needs_announce() => self.announce().await,
                _ = poll.tick() => self.poll().await,
            }
        }

        info!(node = %self.id(), stats = ?self.stats, "node network loop finished");
        Ok(self.stats)
    }
}

/// A node with all three loops running
pub struct NodeHandle<R: AudioRenderer> {
    shutdown_tx: watch::Sender<bool>,
    rt_shutdown: Arc<AtomicBool>,
    network: tokio::task::JoinHandle<ModalResult<NodeStats>>,
    control: std::thread::JoinHandle<ModalNode>,
    audio: std::thread::JoinHandle<R>,
    state: watch::Receiver<SessionState>,
    snapshot: SnapshotReader,
}

impl<R: AudioRenderer> NodeHandle<R> {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`
    pub async fn wait_for(&mut self, target: SessionState) -> ModalResult<()> {
        self.state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|e| ModalError::TransportError(e.to_string()))
    }

    pub fn snapshot(&self) -> SnapshotReader {
        self.snapshot.clone()
    }

    /// Stop all loops and collect the final node state
    pub async fn shutdown(self) -> ModalResult<(NodeStats, ModalNode)> {
        let _ = self.shutdown_tx.send(true);
        let stats = self
            .network
            .await
            .map_err(|e| ModalError::TransportError(e.to_string()))??;

        self.rt_shutdown.store(true, Ordering::Release);
        let control = self.control;
        let audio = self.audio;
        let node = tokio::task::spawn_blocking(move || {
            let _ = audio.join();
            control.join()
        })
        .await
        .map_err(|e| ModalError::TransportError(e.to_string()))?
        .map_err(|_| ModalError::TransportError("control thread panicked".into()))?;

        Ok((stats, node))
    }
}

/// Start a node: control and audio threads plus the network task
///
/// Must be called from within a tokio runtime.
pub fn spawn_node<L: Link, R: AudioRenderer>(
    link: L,
    options: NodeOptions,
    config: &RuntimeConfig,
    renderer: R,
) -> ModalResult<NodeHandle<R>> {
    config.validate()?;
    let (runtime, control) = NodeRuntime::new(link, options, config);
    let snapshot = runtime.snapshot();
    let state = runtime.subscribe();

    let rt_shutdown = Arc::new(AtomicBool::new(false));
    let io_err = |e: std::io::Error| ModalError::TransportError(e.to_string());
    let control = control.spawn(rt_shutdown.clone()).map_err(io_err)?;
    let audio = AudioLoop::new(snapshot.clone(), renderer, config.audio)
        .spawn(rt_shutdown.clone())
        .map_err(io_err)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let network = tokio::spawn(runtime.run(shutdown_rx));

    Ok(NodeHandle {
        shutdown_tx,
        rt_shutdown,
        network,
        control,
        audio,
        state,
        snapshot,
    })
}
