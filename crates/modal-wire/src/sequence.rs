//! Outbound header stamping

use std::time::Instant;

use modal_core::NodeId;

use crate::{Message, Payload};

/// Stamps outgoing messages with a source id, a wrapping sequence number
/// and the sender's uptime in milliseconds (truncated to 16 bits).
#[derive(Debug)]
pub struct Sequencer {
    source: NodeId,
    next: u16,
    started: Instant,
}

impl Sequencer {
    pub fn new(source: NodeId) -> Self {
        Sequencer {
            source,
            next: 0,
            started: Instant::now(),
        }
    }

    #[inline]
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// Change the source id, e.g. once a node has been assigned one
    pub fn set_source(&mut self, source: NodeId) {
        self.source = source;
    }

    /// Milliseconds since this sequencer was created
    pub fn uptime_ms(&self) -> u32 {
        self.started.elapsed().as_millis().min(u32::MAX as u128) as u32
    }

    /// Build a stamped message addressed to `dest`
    pub fn message(&mut self, dest: NodeId, payload: Payload) -> Message {
        let mut msg = Message::new(self.source, dest, payload);
        self.stamp(&mut msg);
        msg
    }

    /// Build a stamped broadcast message
    pub fn broadcast(&mut self, payload: Payload) -> Message {
        self.message(NodeId::BROADCAST, payload)
    }

    /// Overwrite source, sequence and timestamp of an existing message
    pub fn stamp(&mut self, msg: &mut Message) {
        msg.header.source = self.source;
        msg.header.sequence = self.next;
        msg.header.timestamp_ms = self.uptime_ms() as u16;
        self.next = self.next.wrapping_add(1);
    }
}
