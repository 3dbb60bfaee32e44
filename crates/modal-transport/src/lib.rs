//! Modal Transport Layer
//!
//! This crate provides:
//! - The [`Link`] abstraction over best-effort datagram media
//! - UDP broadcast links and an in-process mesh for tests
//! - The peer registry mapping node ids to link addresses
//! - [`Transport`], which stamps, retries and decodes messages

pub mod link;
pub mod memory;
pub mod registry;
pub mod transport;
pub mod udp;

pub use link::*;
pub use memory::*;
pub use registry::*;
pub use transport::*;
pub use udp::*;
