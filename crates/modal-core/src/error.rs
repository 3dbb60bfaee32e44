//! Error types for the modal mesh

use thiserror::Error;

use crate::NodeId;

/// Core modal mesh errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModalError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    // Transfer integrity errors
    #[error("Missing chunks: received {received} of {expected}")]
    MissingChunks { received: usize, expected: usize },

    #[error("Checksum mismatch: expected {expected:08X}, got {actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("No configuration transfer in progress")]
    TransferNotStarted,

    #[error("Configuration too large: {size} > {max}")]
    ConfigTooLarge { size: usize, max: usize },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Node {node} references unknown neighbor {neighbor}")]
    UnknownNeighbor { node: NodeId, neighbor: NodeId },

    #[error("Too many nodes: {count} > {max}")]
    TooManyNodes { count: usize, max: usize },

    #[error("Duplicate node id {0}")]
    DuplicateNode(NodeId),

    // Capacity errors
    #[error("{what} full (capacity {capacity})")]
    CapacityExceeded { what: &'static str, capacity: usize },

    // Transport errors
    #[error("Send to {dest} failed after {attempts} attempts")]
    SendFailed { dest: NodeId, attempts: u32 },

    #[error("Transport error: {0}")]
    TransportError(String),

    // Session errors
    #[error("Invalid transition: cannot {action} while {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },
}

impl ModalError {
    /// Status code a configuration receiver reports for this failure,
    /// or `None` when the error must not be answered at all.
    pub fn nack_status(&self) -> Option<AckStatus> {
        match self {
            ModalError::MissingChunks { .. } => Some(AckStatus::MissingChunks),
            ModalError::ChecksumMismatch { .. } => Some(AckStatus::ChecksumMismatch),
            ModalError::InvalidConfig(_)
            | ModalError::UnknownNeighbor { .. }
            | ModalError::TooManyNodes { .. }
            | ModalError::DuplicateNode(_)
            | ModalError::BufferTooShort { .. }
            | ModalError::ConfigTooLarge { .. } => Some(AckStatus::InvalidConfig),
            _ => None,
        }
    }

    /// Capacity errors are expected back-pressure, not failures
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            ModalError::CapacityExceeded { .. } | ModalError::TooManyNodes { .. }
        )
    }
}

/// Configuration acknowledgement status carried by `CfgAck` / `CfgNack`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    MissingChunks = 1,
    ChecksumMismatch = 2,
    InvalidConfig = 3,
}

impl AckStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AckStatus::Ok),
            1 => Some(AckStatus::MissingChunks),
            2 => Some(AckStatus::ChecksumMismatch),
            3 => Some(AckStatus::InvalidConfig),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Result type for modal mesh operations
pub type ModalResult<T> = Result<T, ModalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nack_status_mapping() {
        let missing = ModalError::MissingChunks {
            received: 2,
            expected: 3,
        };
        assert_eq!(missing.nack_status(), Some(AckStatus::MissingChunks));

        let crc = ModalError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert_eq!(crc.nack_status(), Some(AckStatus::ChecksumMismatch));

        assert_eq!(ModalError::TransferNotStarted.nack_status(), None);
    }

    #[test]
    fn test_ack_status_bytes() {
        for b in 0..=3u8 {
            assert_eq!(AckStatus::from_byte(b).map(AckStatus::to_byte), Some(b));
        }
        assert!(AckStatus::from_byte(9).is_none());
    }
}
