//! Modal Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every layer of the modal mesh:
//! - Identifiers (NodeId, LinkAddr)
//! - Excitation events (PokeEvent, PhaseHint) and node personalities
//! - Session configuration (SessionConfig, NodeConfig, ModeParams)
//! - Fixed-capacity collections and the workspace error type

pub mod bounded;
pub mod config;
pub mod error;
pub mod event;
pub mod id;

pub use bounded::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use id::*;
