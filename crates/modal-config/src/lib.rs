//! Modal Config - Moving a session configuration onto every node
//!
//! A [`SessionConfig`](modal_core::SessionConfig) is serialized into a
//! portable binary blob, checksummed with CRC-32 and cut into chunks that
//! fit one datagram each.
//!
//! - [`codec`]: the binary configuration format
//! - [`transfer`]: chunk planning and the timed sender
//! - [`receiver`]: reassembly with duplicate and reorder tolerance
//! - [`bitmap`]: which chunks have arrived

pub mod bitmap;
pub mod codec;
pub mod receiver;
pub mod transfer;

pub use bitmap::*;
pub use codec::*;
pub use receiver::*;
pub use transfer::*;
