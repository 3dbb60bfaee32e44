//! Modal Wire Protocol - Binary message format
//!
//! This crate implements the datagram format shared by the hub and nodes:
//! - Fixed 8-byte header
//! - Typed payloads for discovery, configuration transfer, session control
//!   and runtime excitation
//! - CRC-32 over serialized configurations
//! - Outbound sequencing

pub mod crc;
pub mod header;
pub mod message;
pub mod sequence;

pub use crc::*;
pub use header::*;
pub use message::*;
pub use sequence::*;
