//! Modal Test Harness - Degraded links and whole-mesh simulation
//!
//! This crate provides:
//! - A seeded loss/jitter/duplication link decorator
//! - A hub plus N threaded nodes over an in-memory mesh
//! - End-to-end session scenarios

pub mod chaos;
pub mod integration;
pub mod simulator;

pub use chaos::*;
pub use simulator::*;
