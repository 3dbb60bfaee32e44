//! Control-rate loop
//!
//! Owns the [`ModalNode`]. Per tick: reconcile with the latest
//! [`EngineTarget`], apply at most one excitation, advance the oscillator by
//! one period, publish a snapshot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use modal_oscillator::{snapshot_cell, ModalNode, SnapshotReader, SnapshotWriter};

use crate::{EngineTarget, ExcitationReceiver, PeriodicTimer, TargetReader};

/// Counters readable from outside the control thread
#[derive(Debug, Default)]
pub struct ControlStats {
    ticks: AtomicU64,
    pokes_applied: AtomicU64,
    /// Pokes dequeued while the oscillator was stopped
    pokes_discarded: AtomicU64,
    target_updates: AtomicU64,
}

impl ControlStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn pokes_applied(&self) -> u64 {
        self.pokes_applied.load(Ordering::Relaxed)
    }

    pub fn pokes_discarded(&self) -> u64 {
        self.pokes_discarded.load(Ordering::Relaxed)
    }

    pub fn target_updates(&self) -> u64 {
        self.target_updates.load(Ordering::Relaxed)
    }
}

/// The control loop and everything it exclusively owns
pub struct ControlLoop {
    node: ModalNode,
    excitations: ExcitationReceiver,
    target: TargetReader,
    config_epoch: u64,
    reset_epoch: u64,
    snapshot: SnapshotWriter,
    dt: f32,
    stats: Arc<ControlStats>,
}

impl ControlLoop {
    pub fn new(
        node: ModalNode,
        excitations: ExcitationReceiver,
        target: TargetReader,
        period: Duration,
    ) -> Self {
        let (snapshot, _) = snapshot_cell(node.snapshot());
        ControlLoop {
            node,
            excitations,
            target,
            config_epoch: 0,
            reset_epoch: 0,
            snapshot,
            dt: period.as_secs_f32(),
            stats: Arc::new(ControlStats::default()),
        }
    }

    /// Reader for the audio loop and diagnostics
    pub fn snapshot_reader(&self) -> SnapshotReader {
        self.snapshot.reader()
    }

    pub fn stats(&self) -> Arc<ControlStats> {
        self.stats.clone()
    }

    pub fn node(&self) -> &ModalNode {
        &self.node
    }

    /// One control step
    pub fn tick(&mut self) {
        if let Some(target) = self.target.changed() {
            self.stats.target_updates.fetch_add(1, Ordering::Relaxed);
            self.reconcile(&target);
        }

        if let Some(event) = self.excitations.pop() {
            if self.node.is_running() {
                self.node.apply_excitation(&event);
                self.stats.pokes_applied.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.pokes_discarded.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.node.step(self.dt);
        self.snapshot.publish(self.node.snapshot());
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Order: parameters, then reset, then the running flag
    fn reconcile(&mut self, target: &EngineTarget) {
        if target.config_epoch != self.config_epoch {
            self.config_epoch = target.config_epoch;
            if let Some(config) = &target.config {
                if let Err(e) = self.node.apply_config(config) {
                    warn!(node = %config.id, error = %e, "rejected node configuration");
                }
            }
        }
        if target.reset_epoch != self.reset_epoch {
            self.reset_epoch = target.reset_epoch;
            self.node.reset();
        }
        match (target.running, self.node.is_running()) {
            (true, false) => self.node.start(),
            (false, true) => self.node.stop(),
            _ => {}
        }
    }

    /// Tick on `timer` until `shutdown` is set
    pub fn run(mut self, mut timer: PeriodicTimer, shutdown: Arc<AtomicBool>) -> ModalNode {
        while !shutdown.load(Ordering::Acquire) {
            self.tick();
            timer.wait();
        }
        debug!(
            ticks = timer.ticks(),
            late = timer.late_ticks(),
            resyncs = timer.resyncs(),
            "control loop finished"
        );
        self.node
    }

    /// Run on a dedicated thread
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> std::io::Result<JoinHandle<ModalNode>> {
        let period = Duration::from_secs_f32(self.dt);
        std::thread::Builder::new()
            .name("modal-control".into())
            .spawn(move || self.run(PeriodicTimer::new(period), shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bounded, engine_target, ControlCommand, TargetWriter};
    use modal_core::{NodeConfig, NodeId, Personality, PokeEvent};

    const PERIOD: Duration = Duration::from_millis(2);

    fn control(capacity: usize) -> (ControlLoop, crate::ExcitationSender, TargetWriter) {
        let (etx, erx) = bounded(capacity);
        let (writer, reader) = engine_target();
        let mut node = ModalNode::with_seed(NodeId(0), Personality::Resonator, 1);
        node.apply_config(&NodeConfig::new(NodeId(0))).unwrap();
        (ControlLoop::new(node, erx, reader, PERIOD), etx, writer)
    }

    #[test]
    fn test_poke_while_stopped_never_applied() {
        let (mut ctl, mut pokes, _commands) = control(16);
        let before = ctl.node().amplitude();
        pokes.try_push(PokeEvent::new(NodeId(9), 1.0));
        ctl.tick();

        assert_eq!(ctl.stats().pokes_applied(), 0);
        assert_eq!(ctl.stats().pokes_discarded(), 1);
        assert_eq!(ctl.snapshot_reader().load().amplitude, before);
        assert!(!ctl.node().is_exciting());
    }

    #[test]
    fn test_one_poke_per_tick() {
        let (mut ctl, mut pokes, commands) = control(16);
        commands.send(ControlCommand::Start);
        for _ in 0..3 {
            pokes.try_push(PokeEvent::new(NodeId(9), 1.0));
        }

        ctl.tick();
        assert_eq!(ctl.stats().pokes_applied(), 1);
        assert!(ctl.snapshot_reader().load().amplitude > 0.0);

        ctl.tick();
        ctl.tick();
        ctl.tick();
        assert_eq!(ctl.stats().pokes_applied(), 3);
        assert_eq!(ctl.stats().ticks(), 4);
    }

    #[test]
    fn test_backpressure() {
        let capacity = 16;
        let (mut ctl, mut pokes, commands) = control(capacity);
        commands.send(ControlCommand::Start);

        // Burst within a single control period
        let sent = 40;
        for _ in 0..sent {
            pokes.try_push(PokeEvent::new(NodeId(1), 0.5));
        }
        for _ in 0..sent {
            ctl.tick();
        }

        assert_eq!(ctl.stats().pokes_applied(), capacity as u64);
        assert_eq!(pokes.counters().dropped(), (sent - capacity) as u64);
    }

    #[test]
    fn test_commands_apply_and_reset() {
        let (mut ctl, mut pokes, commands) = control(4);
        let mut config = NodeConfig::new(NodeId(3));
        config.carrier_freq_hz = 660.0;

        commands.send(ControlCommand::Apply(Box::new(config)));
        commands.send(ControlCommand::Start);
        pokes.try_push(PokeEvent::new(NodeId(1), 1.0));
        ctl.tick();

        let snap = ctl.snapshot_reader().load();
        assert_eq!(ctl.node().id(), NodeId(3));
        assert_eq!(snap.carrier_freq_hz, 660.0);
        assert!(snap.running);

        commands.send(ControlCommand::Reset);
        commands.send(ControlCommand::Stop);
        ctl.tick();
        let snap = ctl.snapshot_reader().load();
        assert_eq!(snap.amplitude, 0.0);
        assert!(!snap.running);
        assert_eq!(ctl.node().carrier_freq_hz(), 660.0);
    }

    #[test]
    fn test_command_burst_while_stalled() {
        let (mut ctl, _pokes, commands) = control(4);
        for _ in 0..50 {
            commands.send(ControlCommand::Reset);
        }
        let mut config = NodeConfig::new(NodeId(5));
        config.carrier_freq_hz = 330.0;
        commands.send(ControlCommand::Apply(Box::new(config)));
        commands.send(ControlCommand::Start);

        ctl.tick();
        assert_eq!(ctl.node().id(), NodeId(5));
        assert_eq!(ctl.node().carrier_freq_hz(), 330.0);
        assert!(ctl.node().is_running());
        assert_eq!(ctl.stats().target_updates(), 1);

        ctl.tick();
        assert_eq!(ctl.stats().target_updates(), 1);
    }

    #[test]
    fn test_thread_shutdown() {
        let (ctl, _pokes, commands) = control(4);
        let reader = ctl.snapshot_reader();
        commands.send(ControlCommand::Start);

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = ctl.spawn(shutdown.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        shutdown.store(true, Ordering::Release);

        let node = handle.join().unwrap();
        assert!(node.step_count() > 0);
        assert!(reader.load().step > 0);
    }
}
