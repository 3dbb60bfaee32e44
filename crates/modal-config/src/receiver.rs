//! Chunked configuration transfer, receiving side
//!
//! State is keyed by the most recent `CfgBegin`: a new begin silently
//! replaces any transfer in progress. Chunks are idempotent. `CfgEnd`
//! consumes the transfer whether it succeeds or not.

use tracing::{debug, info, warn};

use modal_core::{ModalError, ModalResult, SessionConfig, CHUNK_SIZE, MAX_CONFIG_SIZE};
use modal_wire::crc32;

use crate::{decode_session, ChunkBitmap, MAX_TRACKED_CHUNKS};

/// Result of offering one chunk to the receiver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// New chunk copied into the buffer
    Stored,
    /// Index already received; nothing changed
    Duplicate,
    /// No transfer in progress or index out of range
    Ignored,
}

#[derive(Debug)]
struct Transfer {
    total_size: usize,
    num_chunks: u8,
    checksum: u32,
    buffer: Box<[u8; MAX_CONFIG_SIZE]>,
    received: ChunkBitmap,
}

/// Receive counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub transfers_started: u64,
    pub transfers_superseded: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub duplicate_chunks: u64,
    pub ignored_chunks: u64,
}

/// Reassembles a configuration from `CfgBegin`, `CfgChunk` and `CfgEnd`
#[derive(Debug, Default)]
pub struct ConfigReceiver {
    transfer: Option<Transfer>,
    stats: ReceiverStats,
}

impl ConfigReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_receiving(&self) -> bool {
        self.transfer.is_some()
    }

    /// Chunks received and expected for the transfer in progress
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.transfer
            .as_ref()
            .map(|t| (t.received.count(), t.num_chunks as usize))
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// Start a new transfer, discarding any previous one
    ///
    /// Announcements whose size and chunk count disagree are rejected and
    /// leave no transfer in progress.
    pub fn on_begin(&mut self, total_size: u16, num_chunks: u8, checksum: u32) -> ModalResult<()> {
        if self.transfer.take().is_some() {
            self.stats.transfers_superseded += 1;
            debug!("configuration transfer superseded");
        }

        let total_size = total_size as usize;
        if total_size > MAX_CONFIG_SIZE {
            return Err(ModalError::ConfigTooLarge {
                size: total_size,
                max: MAX_CONFIG_SIZE,
            });
        }
        let expected_chunks = total_size.div_ceil(CHUNK_SIZE);
        if total_size == 0 || num_chunks as usize != expected_chunks || expected_chunks > MAX_TRACKED_CHUNKS {
            return Err(ModalError::InvalidConfig(format!(
                "transfer of {total_size} bytes announced as {num_chunks} chunks"
            )));
        }

        self.stats.transfers_started += 1;
        debug!(total_size, num_chunks, checksum, "configuration transfer started");
        self.transfer = Some(Transfer {
            total_size,
            num_chunks,
            checksum,
            buffer: Box::new([0u8; MAX_CONFIG_SIZE]),
            received: ChunkBitmap::new(),
        });
        Ok(())
    }

    /// Copy a chunk into place unless already received
    pub fn on_chunk(&mut self, index: u8, data: &[u8]) -> ChunkOutcome {
        let Some(transfer) = self.transfer.as_mut() else {
            self.stats.ignored_chunks += 1;
            return ChunkOutcome::Ignored;
        };

        if index >= transfer.num_chunks {
            debug!(index, num_chunks = transfer.num_chunks, "chunk index out of range");
            self.stats.ignored_chunks += 1;
            return ChunkOutcome::Ignored;
        }

        if transfer.received.contains(index) {
            self.stats.duplicate_chunks += 1;
            return ChunkOutcome::Duplicate;
        }

        let offset = index as usize * CHUNK_SIZE;
        let len = data.len().min(transfer.total_size - offset).min(CHUNK_SIZE);
        transfer.buffer[offset..offset + len].copy_from_slice(&data[..len]);
        transfer.received.mark(index);
        ChunkOutcome::Stored
    }

    /// Finish the transfer and yield the validated configuration
    ///
    /// The transfer state is consumed in every case; a failed transfer must
    /// be restarted from `CfgBegin`. Use [`ModalError::nack_status`] on the
    /// error to pick the NACK code.
    pub fn on_end(&mut self, checksum: u32) -> ModalResult<SessionConfig> {
        let transfer = self.transfer.take().ok_or(ModalError::TransferNotStarted)?;
        let result = Self::finish(&transfer, checksum);

        match &result {
            Ok(config) => {
                self.stats.transfers_completed += 1;
                info!(
                    session = %config.session_id,
                    nodes = config.node_count(),
                    "configuration received"
                );
            }
            Err(e) => {
                self.stats.transfers_failed += 1;
                warn!(error = %e, "configuration transfer failed");
            }
        }
        result
    }

    fn finish(transfer: &Transfer, end_checksum: u32) -> ModalResult<SessionConfig> {
        if end_checksum != transfer.checksum {
            return Err(ModalError::ChecksumMismatch {
                expected: transfer.checksum,
                actual: end_checksum,
            });
        }

        if !transfer.received.is_complete(transfer.num_chunks) {
            return Err(ModalError::MissingChunks {
                received: transfer.received.count(),
                expected: transfer.num_chunks as usize,
            });
        }

        let data = &transfer.buffer[..transfer.total_size];
        let actual = crc32(data);
        if actual != transfer.checksum {
            return Err(ModalError::ChecksumMismatch {
                expected: transfer.checksum,
                actual,
            });
        }

        decode_session(data)
    }

    /// Drop any transfer in progress
    pub fn abort(&mut self) {
        self.transfer = None;
    }
}
