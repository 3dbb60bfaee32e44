//! Modal Topology
//!
//! Coupling graphs for a session of modal nodes and the synthesis of
//! complete session configurations from them.
//!
//! # Generators
//!
//! Ring, small-world, clustered, hub-and-spoke, random and complete graphs.
//! All are pure functions of `(node_count, ...)` and produce symmetric
//! adjacency without self-loops.
//!
//! # Presets
//!
//! Named sessions (ring of resonators, small-world drone, two clusters,
//! conductor hub) and the default ring a hub falls back to after discovery.

pub mod session;
pub mod topology;

pub use session::*;
pub use topology::*;
