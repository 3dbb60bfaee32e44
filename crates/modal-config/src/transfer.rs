//! Chunked configuration transfer, sending side

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use modal_core::{ModalError, ModalResult, NodeId, SessionConfig, CHUNK_SIZE, MAX_CONFIG_SIZE};
use modal_transport::{Link, Transport};
use modal_wire::{crc32, Payload};

use crate::encode_session;

/// Delay between `CfgBegin` and the first chunk
pub const DEFAULT_BEGIN_DELAY: Duration = Duration::from_millis(50);

/// Delay between consecutive chunks
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(20);

/// A serialized configuration cut into datagram-sized chunks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferPlan {
    data: Bytes,
    checksum: u32,
}

impl TransferPlan {
    pub fn from_config(config: &SessionConfig) -> ModalResult<Self> {
        Self::from_bytes(encode_session(config)?)
    }

    /// Plan the transfer of an arbitrary blob
    pub fn from_bytes(data: Bytes) -> ModalResult<Self> {
        if data.is_empty() {
            return Err(ModalError::InvalidConfig("empty configuration".into()));
        }
        if data.len() > MAX_CONFIG_SIZE {
            return Err(ModalError::ConfigTooLarge {
                size: data.len(),
                max: MAX_CONFIG_SIZE,
            });
        }
        let checksum = crc32(&data);
        Ok(TransferPlan { data, checksum })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn total_size(&self) -> u16 {
        self.data.len() as u16
    }

    #[inline]
    pub fn num_chunks(&self) -> u8 {
        self.data.len().div_ceil(CHUNK_SIZE) as u8
    }

    #[inline]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Bytes of chunk `index`
    pub fn chunk(&self, index: u8) -> Option<Bytes> {
        let start = index as usize * CHUNK_SIZE;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + CHUNK_SIZE).min(self.data.len());
        Some(self.data.slice(start..end))
    }

    pub fn begin(&self) -> Payload {
        Payload::CfgBegin {
            total_size: self.total_size(),
            num_chunks: self.num_chunks(),
            checksum: self.checksum,
        }
    }

    pub fn chunks(&self) -> impl Iterator<Item = Payload> + '_ {
        (0..self.num_chunks()).filter_map(|index| {
            self.chunk(index)
                .map(|data| Payload::CfgChunk { index, data })
        })
    }

    pub fn end(&self) -> Payload {
        Payload::CfgEnd {
            checksum: self.checksum,
        }
    }
}

/// Pacing of a transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferTiming {
    pub begin_delay: Duration,
    pub chunk_delay: Duration,
}

impl Default for TransferTiming {
    fn default() -> Self {
        TransferTiming {
            begin_delay: DEFAULT_BEGIN_DELAY,
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }
}

/// Sends a [`TransferPlan`] over a transport with receiver-friendly pacing
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDistributor {
    timing: TransferTiming,
}

impl ConfigDistributor {
    pub fn new(timing: TransferTiming) -> Self {
        ConfigDistributor { timing }
    }

    pub fn timing(&self) -> TransferTiming {
        self.timing
    }

    /// Send begin, every chunk in order, then end
    ///
    /// `dest` is the broadcast id for a whole-network distribution or a
    /// single node for a retransmission. A send that fails after its
    /// retries abandons the transfer; the receiver will NACK or time out.
    pub async fn distribute<L: Link>(
        &self,
        transport: &Transport<L>,
        dest: NodeId,
        plan: &TransferPlan,
    ) -> ModalResult<()> {
        info!(
            dest = %dest,
            size = plan.total_size(),
            chunks = plan.num_chunks(),
            checksum = format_args!("{:#010x}", plan.checksum()),
            "distributing configuration"
        );

        transport.send(dest, plan.begin()).await?;
        tokio::time::sleep(self.timing.begin_delay).await;

        for (i, chunk) in plan.chunks().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.timing.chunk_delay).await;
            }
            transport.send(dest, chunk).await?;
        }

        transport.send(dest, plan.end()).await?;
        debug!(dest = %dest, "configuration sent");
        Ok(())
    }
}
