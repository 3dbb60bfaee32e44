//! Identity types for the modal mesh
//!
//! Node identifiers are a single byte on the wire; the mesh never holds
//! more than a handful of nodes, and the transport MTU is tight.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Node identity - one byte, assigned by the hub during discovery
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u8);

impl NodeId {
    /// Destination sentinel addressing every node
    pub const BROADCAST: NodeId = NodeId(0xFF);

    /// Source id used by a node that has not been assigned one yet
    pub const UNASSIGNED: NodeId = NodeId(0xFF);

    /// Default id of the coordinating hub, outside the auto-assigned range
    pub const HUB: NodeId = NodeId(0xFE);

    #[inline]
    pub fn new(id: u8) -> Self {
        NodeId(id)
    }

    #[inline]
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn from_byte(b: u8) -> Self {
        NodeId(b)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "Node(*)")
        } else {
            write!(f, "Node({})", self.0)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u8> for NodeId {
    fn from(b: u8) -> Self {
        NodeId(b)
    }
}

/// Link-layer address of a peer (6 bytes, the width of a radio MAC)
///
/// IP transports pack an IPv4 address and port into the same six bytes,
/// so the registry and the wire format stay transport agnostic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LinkAddr(pub [u8; 6]);

impl LinkAddr {
    pub const ZERO: LinkAddr = LinkAddr([0; 6]);
    pub const BROADCAST: LinkAddr = LinkAddr([0xFF; 6]);

    #[inline]
    pub fn new(bytes: [u8; 6]) -> Self {
        LinkAddr(bytes)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 6] {
        self.0
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        LinkAddr(bytes)
    }

    /// Interpret the address as IPv4 octets followed by a little-endian port
    pub fn to_socket_addr(self) -> SocketAddrV4 {
        let [a, b, c, d, lo, hi] = self.0;
        SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), u16::from_le_bytes([lo, hi]))
    }
}

impl From<SocketAddrV4> for LinkAddr {
    fn from(addr: SocketAddrV4) -> Self {
        let [a, b, c, d] = addr.ip().octets();
        let [lo, hi] = addr.port().to_le_bytes();
        LinkAddr([a, b, c, d, lo, hi])
    }
}

impl fmt::Debug for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({})", self)
    }
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}
