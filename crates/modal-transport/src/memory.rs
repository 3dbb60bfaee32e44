//! In-process link mesh
//!
//! Every [`MemoryLink`] attached to a [`MemoryMesh`] hears every broadcast
//! from the others, like radios sharing a channel. Inbound queues are
//! bounded; a full queue drops the datagram, as a saturated radio would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use modal_core::{LinkAddr, ModalError, ModalResult, MAX_PACKET_SIZE};

use crate::{Destination, Link};

/// Default per-link inbound queue depth
pub const DEFAULT_MESH_QUEUE: usize = 256;

type Datagram = (Vec<u8>, LinkAddr);

#[derive(Debug, Default)]
struct MeshInner {
    links: Mutex<HashMap<LinkAddr, mpsc::Sender<Datagram>>>,
    next_host: AtomicU16,
}

/// Shared medium connecting in-memory links
#[derive(Debug, Clone)]
pub struct MemoryMesh {
    inner: Arc<MeshInner>,
    queue_depth: usize,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_MESH_QUEUE)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        MemoryMesh {
            inner: Arc::new(MeshInner::default()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Attach a new link with a fresh address
    pub fn link(&self) -> MemoryLink {
        let host = self.inner.next_host.fetch_add(1, Ordering::Relaxed);
        let [lo, hi] = host.to_le_bytes();
        self.link_at(LinkAddr::new([10, 0, hi, lo, 0, 0]))
    }

    /// Attach a link at a chosen address, replacing any previous holder
    pub fn link_at(&self, addr: LinkAddr) -> MemoryLink {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.inner.links.lock().insert(addr, tx);
        MemoryLink {
            addr,
            inner: self.inner.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Number of attached links
    pub fn len(&self) -> usize {
        self.inner.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`MemoryMesh`]
#[derive(Debug)]
pub struct MemoryLink {
    addr: LinkAddr,
    inner: Arc<MeshInner>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
}

impl Link for MemoryLink {
    async fn send(&self, dest: Destination, bytes: &[u8]) -> ModalResult<()> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(ModalError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let links = self.inner.links.lock();
        match dest {
            Destination::Broadcast => {
                for (addr, tx) in links.iter() {
                    if *addr != self.addr {
                        let _ = tx.try_send((bytes.to_vec(), self.addr));
                    }
                }
            }
            Destination::Unicast(addr) => {
                if let Some(tx) = links.get(&addr) {
                    let _ = tx.try_send((bytes.to_vec(), self.addr));
                }
            }
        }
        Ok(())
    }

    async fn recv(&self) -> ModalResult<(Vec<u8>, LinkAddr)> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| ModalError::TransportError("mesh link detached".into()))
    }

    fn local_addr(&self) -> LinkAddr {
        self.addr
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.inner.links.lock().remove(&self.addr);
    }
}
