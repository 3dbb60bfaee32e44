//! Modal Runtime - Node and hub orchestration
//!
//! A node runs three loops at different rates:
//! 1. Audio: renders blocks from the latest published snapshot
//! 2. Control: reconciles the oscillator with the latest lifecycle target,
//!    applies at most one excitation, then steps (500 Hz by default)
//! 3. Network: drives the session state machine from inbound messages,
//!    heartbeats and announcements
//!
//! The hub discovers nodes, distributes the session configuration and
//! turns note events into pokes.

pub mod audio;
pub mod clock;
pub mod config;
pub mod control;
pub mod hub;
pub mod node;
pub mod queue;
pub mod session;
pub mod target;
pub mod telemetry;

pub use audio::*;
pub use clock::*;
pub use config::*;
pub use control::*;
pub use hub::*;
pub use node::*;
pub use queue::*;
pub use session::*;
pub use target::*;
pub use telemetry::*;
