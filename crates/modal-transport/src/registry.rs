//! Peer registry
//!
//! Peers are created on first contact, refreshed by every message they
//! send, and marked inactive once silent past a timeout. Inactive peers
//! stay in the table for diagnostics until removed explicitly.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use modal_core::{LinkAddr, ModalError, ModalResult, NodeId};

/// Peer table capacity
pub const MAX_PEERS: usize = 20;

/// Default liveness timeout
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(10);

/// Weight of a new latency sample in the running estimate
const LATENCY_ALPHA: f32 = 1.0 / 8.0;

/// A remote node known to this registry
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub id: NodeId,
    pub addr: LinkAddr,
    pub active: bool,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Messages successfully handed to the link for this peer
    pub sent: u64,
    pub received: u64,
    /// Sends abandoned after all retries
    pub lost: u64,
    /// Smoothed one-way latency, `None` until measured
    pub latency_ms: Option<f32>,
}

impl Peer {
    fn new(id: NodeId, addr: LinkAddr, now: Instant) -> Self {
        Peer {
            id,
            addr,
            active: true,
            first_seen: now,
            last_seen: now,
            sent: 0,
            received: 0,
            lost: 0,
            latency_ms: None,
        }
    }

    /// Time since the peer was last heard from
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Registry-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sends_ok: u64,
    pub sends_failed: u64,
    pub broadcasts: u64,
    /// Unicasts sent as broadcasts because the peer was unknown
    pub fallback_broadcasts: u64,
    pub received: u64,
    pub decode_errors: u64,
    pub rejected_peers: u64,
}

/// Table of known peers keyed by node id
#[derive(Debug)]
pub struct PeerRegistry {
    self_id: NodeId,
    peers: BTreeMap<NodeId, Peer>,
    capacity: usize,
    stats: RegistryStats,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId) -> Self {
        Self::with_capacity(self_id, MAX_PEERS)
    }

    pub fn with_capacity(self_id: NodeId, capacity: usize) -> Self {
        PeerRegistry {
            self_id,
            peers: BTreeMap::new(),
            capacity,
            stats: RegistryStats::default(),
        }
    }

    #[inline]
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn set_self_id(&mut self, id: NodeId) {
        self.self_id = id;
        self.peers.remove(&id);
    }

    /// Register a peer or refresh its address and liveness
    pub fn add_or_update_peer(&mut self, id: NodeId, addr: LinkAddr) -> ModalResult<&Peer> {
        self.add_or_update_peer_at(id, addr, Instant::now())
    }

    pub fn add_or_update_peer_at(
        &mut self,
        id: NodeId,
        addr: LinkAddr,
        now: Instant,
    ) -> ModalResult<&Peer> {
        if id.is_broadcast() || id == self.self_id {
            return Err(ModalError::InvalidConfig(format!(
                "cannot register {id} as a peer"
            )));
        }

        if !self.peers.contains_key(&id) && self.peers.len() >= self.capacity {
            self.stats.rejected_peers += 1;
            return Err(ModalError::CapacityExceeded {
                what: "peer table",
                capacity: self.capacity,
            });
        }

        let peer = self
            .peers
            .entry(id)
            .and_modify(|p| {
                if p.addr != addr {
                    debug!(peer = %id, old = %p.addr, new = %addr, "peer address changed");
                    p.addr = addr;
                }
                if !p.active {
                    debug!(peer = %id, "peer active again");
                }
                p.active = true;
                p.last_seen = now;
            })
            .or_insert_with(|| {
                debug!(peer = %id, addr = %addr, "peer added");
                Peer::new(id, addr, now)
            });
        Ok(peer)
    }

    /// Account for one inbound message from `id` at `addr`
    pub fn observe(&mut self, id: NodeId, addr: LinkAddr) -> ModalResult<()> {
        self.observe_at(id, addr, Instant::now())
    }

    pub fn observe_at(&mut self, id: NodeId, addr: LinkAddr, now: Instant) -> ModalResult<()> {
        self.stats.received += 1;
        self.add_or_update_peer_at(id, addr, now)?;
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.received += 1;
        }
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn find_by_addr(&self, addr: LinkAddr) -> Option<&Peer> {
        self.peers.values().find(|p| p.addr == addr)
    }

    /// Drop a peer from the table
    pub fn remove(&mut self, id: NodeId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    /// Peers silent for longer than `timeout`
    ///
    /// They are marked inactive but kept; the caller decides whether to
    /// re-run discovery or merely report the degradation.
    pub fn check_stale(&mut self, timeout: Duration) -> Vec<NodeId> {
        self.check_stale_at(timeout, Instant::now())
    }

    pub fn check_stale_at(&mut self, timeout: Duration, now: Instant) -> Vec<NodeId> {
        let mut stale = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.silence(now) > timeout {
                if peer.active {
                    warn!(
                        peer = %peer.id,
                        silent_ms = peer.silence(now).as_millis() as u64,
                        "peer went stale"
                    );
                    peer.active = false;
                }
                stale.push(peer.id);
            }
        }
        stale
    }

    /// Fold a one-way latency sample into the peer's estimate
    pub fn record_latency(&mut self, id: NodeId, sample: Duration) {
        if let Some(peer) = self.peers.get_mut(&id) {
            let ms = sample.as_secs_f32() * 1000.0;
            peer.latency_ms = Some(match peer.latency_ms {
                Some(prev) => prev + LATENCY_ALPHA * (ms - prev),
                None => ms,
            });
        }
    }

    /// Account for the outcome of a send addressed to `dest`
    pub fn record_send(&mut self, dest: NodeId, delivered: bool) {
        if delivered {
            self.stats.sends_ok += 1;
        } else {
            self.stats.sends_failed += 1;
        }
        if let Some(peer) = self.peers.get_mut(&dest) {
            if delivered {
                peer.sent += 1;
            } else {
                peer.lost += 1;
            }
        }
    }

    pub fn record_broadcast(&mut self, fallback: bool) {
        self.stats.broadcasts += 1;
        if fallback {
            self.stats.fallback_broadcasts += 1;
        }
    }

    pub fn record_decode_error(&mut self) {
        self.stats.decode_errors += 1;
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn active_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.active)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> LinkAddr {
        LinkAddr::new([10, 0, 0, n, 0, 0])
    }

    #[test]
    fn test_add_and_refresh() {
        let mut reg = PeerRegistry::new(NodeId::HUB);
        let t0 = Instant::now();
        reg.add_or_update_peer_at(NodeId(1), addr(1), t0).unwrap();

        let t1 = t0 + Duration::from_secs(3);
        reg.observe_at(NodeId(1), addr(7), t1).unwrap();

        let peer = reg.get(NodeId(1)).unwrap();
        assert_eq!(peer.addr, addr(7));
        assert_eq!(peer.last_seen, t1);
        assert_eq!(peer.first_seen, t0);
        assert_eq!(peer.received, 1);
        assert_eq!(reg.find_by_addr(addr(7)).map(|p| p.id), Some(NodeId(1)));
    }

    #[test]
    fn test_stale_marked_not_removed() {
        let mut reg = PeerRegistry::new(NodeId::HUB);
        let t0 = Instant::now();
        reg.add_or_update_peer_at(NodeId(1), addr(1), t0).unwrap();
        reg.add_or_update_peer_at(NodeId(2), addr(2), t0 + Duration::from_secs(8))
            .unwrap();

        let stale = reg.check_stale_at(DEFAULT_STALE_TIMEOUT, t0 + Duration::from_secs(11));
        assert_eq!(stale, vec![NodeId(1)]);
        assert_eq!(reg.len(), 2);
        assert!(!reg.get(NodeId(1)).unwrap().active);
        assert_eq!(reg.active_peers().count(), 1);

        // Hearing from it again revives it
        reg.observe_at(NodeId(1), addr(1), t0 + Duration::from_secs(12))
            .unwrap();
        assert!(reg.get(NodeId(1)).unwrap().active);
    }

    #[test]
    fn test_capacity() {
        let mut reg = PeerRegistry::with_capacity(NodeId::HUB, 2);
        reg.add_or_update_peer(NodeId(1), addr(1)).unwrap();
        reg.add_or_update_peer(NodeId(2), addr(2)).unwrap();

        let err = reg.add_or_update_peer(NodeId(3), addr(3)).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(reg.stats().rejected_peers, 1);

        // Existing peers still refresh when full
        reg.add_or_update_peer(NodeId(2), addr(9)).unwrap();
        assert_eq!(reg.get(NodeId(2)).unwrap().addr, addr(9));
    }

    #[test]
    fn test_rejects_self_and_broadcast() {
        let mut reg = PeerRegistry::new(NodeId(4));
        assert!(reg.add_or_update_peer(NodeId(4), addr(4)).is_err());
        assert!(reg.add_or_update_peer(NodeId::BROADCAST, addr(4)).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_latency_ewma() {
        let mut reg = PeerRegistry::new(NodeId::HUB);
        reg.add_or_update_peer(NodeId(1), addr(1)).unwrap();

        reg.record_latency(NodeId(1), Duration::from_millis(8));
        assert_eq!(reg.get(NodeId(1)).unwrap().latency_ms, Some(8.0));

        reg.record_latency(NodeId(1), Duration::from_millis(16));
        let est = reg.get(NodeId(1)).unwrap().latency_ms.unwrap();
        assert!((est - 9.0).abs() < 1e-4);
    }

    #[test]
    fn test_send_counters() {
        let mut reg = PeerRegistry::new(NodeId::HUB);
        reg.add_or_update_peer(NodeId(1), addr(1)).unwrap();
        reg.record_send(NodeId(1), true);
        reg.record_send(NodeId(1), false);
        reg.record_send(NodeId(9), false);

        let peer = reg.get(NodeId(1)).unwrap();
        assert_eq!((peer.sent, peer.lost), (1, 1));
        assert_eq!(reg.stats().sends_ok, 1);
        assert_eq!(reg.stats().sends_failed, 2);
    }
}
