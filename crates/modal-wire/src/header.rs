//! Fixed message header
//!
//! Header is 8 bytes, little-endian, packed:
//! - Byte 0: Protocol version
//! - Byte 1: Message type
//! - Byte 2: Source node id
//! - Byte 3: Destination node id (0xFF = broadcast)
//! - Bytes 4-5: Sequence number
//! - Bytes 6-7: Sender timestamp (ms since boot, wrapping)

use modal_core::{ModalError, ModalResult, NodeId, PROTOCOL_VERSION};

use crate::MessageType;

/// Header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Fixed header structure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    pub source: NodeId,
    pub dest: NodeId,
    pub sequence: u16,
    pub timestamp_ms: u16,
}

impl Header {
    /// Create a header with the current protocol version
    pub fn new(msg_type: MessageType, source: NodeId, dest: NodeId) -> Self {
        Header {
            version: PROTOCOL_VERSION,
            msg_type,
            source,
            dest,
            sequence: 0,
            timestamp_ms: 0,
        }
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.dest.is_broadcast()
    }

    /// True if a node with id `me` should process this message
    #[inline]
    pub fn is_for(&self, me: NodeId) -> bool {
        self.dest.is_broadcast() || self.dest == me
    }

    /// Parse header from bytes, checking length, version and type tag
    pub fn parse(buf: &[u8]) -> ModalResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ModalError::BufferTooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(ModalError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let msg_type =
            MessageType::from_byte(buf[1]).ok_or(ModalError::UnknownMessageType(buf[1]))?;

        Ok(Header {
            version,
            msg_type,
            source: NodeId::from_byte(buf[2]),
            dest: NodeId::from_byte(buf[3]),
            sequence: u16::from_le_bytes([buf[4], buf[5]]),
            timestamp_ms: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    /// Serialize header into the first `HEADER_SIZE` bytes of `buf`
    pub fn serialize(&self, buf: &mut [u8]) -> ModalResult<()> {
        if buf.len() < HEADER_SIZE {
            return Err(ModalError::BufferTooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        buf[..HEADER_SIZE].copy_from_slice(&self.to_bytes());
        Ok(())
    }

    /// Serialize header to a fixed array
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.msg_type.to_byte();
        buf[2] = self.source.to_byte();
        buf[3] = self.dest.to_byte();
        buf[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        buf[6..8].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf
    }
}
