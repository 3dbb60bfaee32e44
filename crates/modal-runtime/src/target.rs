//! Desired oscillator state
//!
//! Lifecycle commands are never queued. The network loop folds each one
//! into an [`EngineTarget`] and publishes it; the control loop reconciles
//! its oscillator against the latest target at the top of a tick. Publishing
//! never blocks and never drops a transition.

use std::sync::Arc;

use tokio::sync::watch;

use modal_core::NodeConfig;

/// Lifecycle commands emitted by the node session
#[derive(Clone, Debug, PartialEq)]
pub enum ControlCommand {
    /// Replace oscillator parameters; modal state is kept
    Apply(Box<NodeConfig>),
    Start,
    Stop,
    /// Zero modal state, keep parameters
    Reset,
}

/// What the oscillator should look like
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineTarget {
    pub config: Option<Arc<NodeConfig>>,
    /// Bumped by every `Apply`
    pub config_epoch: u64,
    /// Bumped by every `Reset`
    pub reset_epoch: u64,
    pub running: bool,
}

impl EngineTarget {
    pub fn record(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Apply(config) => {
                self.config = Some(Arc::from(config));
                self.config_epoch += 1;
            }
            ControlCommand::Start => self.running = true,
            ControlCommand::Stop => self.running = false,
            ControlCommand::Reset => self.reset_epoch += 1,
        }
    }
}

/// Network-loop end
pub struct TargetWriter {
    tx: watch::Sender<EngineTarget>,
}

impl TargetWriter {
    pub fn send(&self, command: ControlCommand) {
        self.tx.send_modify(|target| target.record(command));
    }

    pub fn current(&self) -> EngineTarget {
        self.tx.borrow().clone()
    }
}

/// Control-loop end
pub struct TargetReader {
    rx: watch::Receiver<EngineTarget>,
}

impl TargetReader {
    /// Latest target, if it changed since the previous call
    pub fn changed(&mut self) -> Option<EngineTarget> {
        let target = self.rx.borrow_and_update();
        target.has_changed().then(|| target.clone())
    }
}

pub fn engine_target() -> (TargetWriter, TargetReader) {
    let (tx, rx) = watch::channel(EngineTarget::default());
    (TargetWriter { tx }, TargetReader { rx })
}
