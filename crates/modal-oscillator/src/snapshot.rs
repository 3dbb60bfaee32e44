//! Single-writer snapshot handoff between the control and audio loops
//!
//! The control loop owns the [`SnapshotWriter`] (not `Clone`); any number of
//! audio-side [`SnapshotReader`]s load the latest published snapshot without
//! locking.

use std::sync::Arc;

use arc_swap::ArcSwap;
use num_complex::Complex32;

/// Observables of a node after one control step
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeSnapshot {
    /// Weighted modal amplitude in [0, 1]
    pub amplitude: f32,
    pub phase_modulation: f32,
    pub mode0: Complex32,
    pub carrier_freq_hz: f32,
    pub gain: f32,
    pub running: bool,
    pub step: u64,
}

impl Default for NodeSnapshot {
    fn default() -> Self {
        NodeSnapshot {
            amplitude: 0.0,
            phase_modulation: 0.0,
            mode0: Complex32::new(0.0, 0.0),
            carrier_freq_hz: 440.0,
            gain: 0.0,
            running: false,
            step: 0,
        }
    }
}

/// Create a connected writer/reader pair
pub fn snapshot_cell(initial: NodeSnapshot) -> (SnapshotWriter, SnapshotReader) {
    let cell = Arc::new(ArcSwap::from_pointee(initial));
    (
        SnapshotWriter { cell: cell.clone() },
        SnapshotReader { cell },
    )
}

/// Publishing side, held by exactly one owner
#[derive(Debug)]
pub struct SnapshotWriter {
    cell: Arc<ArcSwap<NodeSnapshot>>,
}

impl SnapshotWriter {
    pub fn publish(&self, snapshot: NodeSnapshot) {
        self.cell.store(Arc::new(snapshot));
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            cell: self.cell.clone(),
        }
    }
}

/// Read-only side
#[derive(Clone, Debug)]
pub struct SnapshotReader {
    cell: Arc<ArcSwap<NodeSnapshot>>,
}

impl SnapshotReader {
    /// Latest published snapshot
    pub fn load(&self) -> NodeSnapshot {
        **self.cell.load()
    }
}
