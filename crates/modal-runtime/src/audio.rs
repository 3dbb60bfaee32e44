//! Audio-rate loop
//!
//! Sample generation is delegated to an [`AudioRenderer`]. The loop only
//! reads published snapshots, so it never waits on the control or network
//! loops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use modal_oscillator::{NodeSnapshot, SnapshotReader};

use crate::{AudioConfig, PeriodicTimer};

/// Turns node observables into PCM samples
pub trait AudioRenderer: Send + 'static {
    /// Fill `out` (mono, `sample_rate` Hz) from the latest snapshot
    fn render(&mut self, snapshot: &NodeSnapshot, sample_rate: u32, out: &mut [f32]);
}

/// Renderer for nodes without an output device
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentRenderer;

impl AudioRenderer for SilentRenderer {
    fn render(&mut self, _snapshot: &NodeSnapshot, _sample_rate: u32, out: &mut [f32]) {
        out.fill(0.0);
    }
}

/// Block-based render loop
pub struct AudioLoop<R: AudioRenderer> {
    reader: SnapshotReader,
    renderer: R,
    config: AudioConfig,
    buffer: Vec<f32>,
    blocks: Arc<AtomicU64>,
}

impl<R: AudioRenderer> AudioLoop<R> {
    pub fn new(reader: SnapshotReader, renderer: R, config: AudioConfig) -> Self {
        AudioLoop {
            reader,
            renderer,
            buffer: vec![0.0; config.block_frames],
            config,
            blocks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Render one block and return it
    pub fn render_block(&mut self) -> &[f32] {
        let snapshot = self.reader.load();
        self.renderer
            .render(&snapshot, self.config.sample_rate, &mut self.buffer);
        self.blocks.fetch_add(1, Ordering::Relaxed);
        &self.buffer
    }

    /// Blocks rendered so far
    pub fn block_counter(&self) -> Arc<AtomicU64> {
        self.blocks.clone()
    }

    /// Render a block per block period until `shutdown` is set
    pub fn spawn(mut self, shutdown: Arc<AtomicBool>) -> std::io::Result<JoinHandle<R>> {
        let period = self.config.block_duration();
        std::thread::Builder::new()
            .name("modal-audio".into())
            .spawn(move || {
                let mut timer = PeriodicTimer::new(period);
                while !shutdown.load(Ordering::Acquire) {
                    self.render_block();
                    timer.wait();
                }
                self.renderer
            })
    }
}
