//! Message transport over a [`Link`]
//!
//! Adds what the raw link lacks: header stamping, id-to-address
//! resolution through the [`PeerRegistry`], bounded retries, and decoding
//! of inbound datagrams with silent rejection of malformed ones.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use modal_core::{LinkAddr, ModalError, ModalResult, NodeId};
use modal_wire::{Message, Payload, Sequencer};

use crate::{Destination, Link, PeerRegistry};

/// Retry behaviour for a single send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(5),
        }
    }
}

/// A decoded inbound message and the link address it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub message: Message,
    pub from: LinkAddr,
}

/// Addressed, retried, decoded messaging on top of a link
pub struct Transport<L: Link> {
    link: L,
    registry: Arc<Mutex<PeerRegistry>>,
    sequencer: Mutex<Sequencer>,
    retry: RetryPolicy,
}

impl<L: Link> Transport<L> {
    pub fn new(link: L, self_id: NodeId) -> Self {
        Self::with_retry(link, self_id, RetryPolicy::default())
    }

    pub fn with_retry(link: L, self_id: NodeId, retry: RetryPolicy) -> Self {
        Transport {
            link,
            registry: Arc::new(Mutex::new(PeerRegistry::new(self_id))),
            sequencer: Mutex::new(Sequencer::new(self_id)),
            retry: RetryPolicy {
                attempts: retry.attempts.max(1),
                ..retry
            },
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.sequencer.lock().source()
    }

    /// Adopt a new node id for outbound headers and peer bookkeeping
    pub fn set_local_id(&self, id: NodeId) {
        self.sequencer.lock().set_source(id);
        self.registry.lock().set_self_id(id);
    }

    pub fn local_addr(&self) -> LinkAddr {
        self.link.local_addr()
    }

    /// Milliseconds since this transport started
    pub fn uptime_ms(&self) -> u32 {
        self.sequencer.lock().uptime_ms()
    }

    pub fn registry(&self) -> &Arc<Mutex<PeerRegistry>> {
        &self.registry
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Send `payload` to one node, or to all when `dest` is the broadcast id
    ///
    /// An id with no known address is reached by broadcast; the header still
    /// names it, so other nodes ignore the message.
    pub async fn send(&self, dest: NodeId, payload: Payload) -> ModalResult<()> {
        let msg = self.sequencer.lock().message(dest, payload);
        self.send_message(&msg).await
    }

    pub async fn broadcast(&self, payload: Payload) -> ModalResult<()> {
        self.send(NodeId::BROADCAST, payload).await
    }

    /// Send an already stamped message
    pub async fn send_message(&self, msg: &Message) -> ModalResult<()> {
        let bytes = msg.encode()?;
        let dest_id = msg.dest();

        let target = if dest_id.is_broadcast() {
            self.registry.lock().record_broadcast(false);
            Destination::Broadcast
        } else {
            let addr = self.registry.lock().get(dest_id).map(|p| p.addr);
            match addr {
                Some(addr) => Destination::Unicast(addr),
                None => {
                    warn!(
                        dest = %dest_id,
                        msg_type = ?msg.msg_type(),
                        "peer unknown, falling back to broadcast"
                    );
                    self.registry.lock().record_broadcast(true);
                    Destination::Broadcast
                }
            }
        };

        let mut last_err = None;
        for attempt in 1..=self.retry.attempts {
            match self.link.send(target, &bytes).await {
                Ok(()) => {
                    if !dest_id.is_broadcast() {
                        self.registry.lock().record_send(dest_id, true);
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(dest = %dest_id, attempt, error = %e, "send attempt failed");
                    last_err = Some(e);
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }

        self.registry.lock().record_send(dest_id, false);
        warn!(
            dest = %dest_id,
            attempts = self.retry.attempts,
            error = ?last_err,
            "send abandoned"
        );
        Err(ModalError::SendFailed {
            dest: dest_id,
            attempts: self.retry.attempts,
        })
    }

    /// Wait for the next well-formed message
    ///
    /// Malformed datagrams and echoes of our own broadcasts are dropped.
    /// The sender is registered (or refreshed) unless it has no id yet.
    pub async fn recv(&self) -> ModalResult<Incoming> {
        loop {
            let (bytes, from) = self.link.recv().await?;
            if from == self.link.local_addr() {
                continue;
            }

            let message = match Message::decode(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    debug!(from = %from, len = bytes.len(), error = %e, "dropping malformed datagram");
                    self.registry.lock().record_decode_error();
                    continue;
                }
            };

            let source = message.source();
            if !source.is_broadcast() {
                let mut registry = self.registry.lock();
                if source != registry.self_id() {
                    if let Err(e) = registry.observe(source, from) {
                        debug!(peer = %source, error = %e, "peer not tracked");
                    }
                }
            }

            return Ok(Incoming { message, from });
        }
    }
}
