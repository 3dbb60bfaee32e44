//! Datagram link abstraction
//!
//! A link moves opaque datagrams of at most `MAX_PACKET_SIZE` bytes between
//! [`LinkAddr`]esses, with best-effort broadcast. It neither orders nor
//! deduplicates nor guarantees delivery.

use std::future::Future;

use modal_core::{LinkAddr, ModalResult};

/// Where a datagram goes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Broadcast,
    Unicast(LinkAddr),
}

/// A best-effort datagram link
pub trait Link: Send + Sync + 'static {
    /// Hand one datagram to the link
    fn send(
        &self,
        dest: Destination,
        bytes: &[u8],
    ) -> impl Future<Output = ModalResult<()>> + Send;

    /// Wait for the next inbound datagram and its sender
    fn recv(&self) -> impl Future<Output = ModalResult<(Vec<u8>, LinkAddr)>> + Send;

    /// Address other peers see for this link
    fn local_addr(&self) -> LinkAddr;
}
