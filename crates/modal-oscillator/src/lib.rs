//! Modal Oscillator - Per-node modal resonator engine
//!
//! A node is a bank of up to four complex modes driven by sparse pokes:
//! - [`Mode`]: one complex oscillator with exact exponential integration
//! - [`ExcitationEnvelope`]: raised-cosine drive following a poke
//! - [`ModalNode`]: the bank, its personality and its observables
//! - [`SnapshotWriter`]/[`SnapshotReader`]: lock-free handoff of observables
//!   from the control loop to the audio loop

pub mod envelope;
pub mod mode;
pub mod node;
pub mod snapshot;

pub use envelope::*;
pub use mode::*;
pub use node::*;
pub use snapshot::*;
