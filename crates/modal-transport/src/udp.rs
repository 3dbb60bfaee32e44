//! UDP link implementation

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;

use modal_core::{LinkAddr, ModalError, ModalResult, MAX_PACKET_SIZE};

use crate::{Destination, Link};

/// UDP link with subnet broadcast
///
/// Peers are addressed by IPv4 address and port packed into a [`LinkAddr`].
#[derive(Debug, Clone)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddrV4,
    broadcast_addr: SocketAddrV4,
}

impl UdpLink {
    /// Bind to a local address; broadcasts go to `broadcast_addr`
    pub async fn bind(addr: SocketAddrV4, broadcast_addr: SocketAddrV4) -> ModalResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ModalError::TransportError(e.to_string()))?;

        socket
            .set_broadcast(true)
            .map_err(|e| ModalError::TransportError(e.to_string()))?;

        let local_addr = match socket
            .local_addr()
            .map_err(|e| ModalError::TransportError(e.to_string()))?
        {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(v6) => {
                return Err(ModalError::TransportError(format!(
                    "IPv6 address {v6} not supported"
                )))
            }
        };

        Ok(UdpLink {
            socket: Arc::new(socket),
            local_addr,
            broadcast_addr,
        })
    }

    /// Bound socket address
    pub fn socket_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn broadcast_addr(&self) -> SocketAddrV4 {
        self.broadcast_addr
    }
}

impl Link for UdpLink {
    async fn send(&self, dest: Destination, bytes: &[u8]) -> ModalResult<()> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(ModalError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        let target = match dest {
            Destination::Broadcast => self.broadcast_addr,
            Destination::Unicast(addr) => addr.to_socket_addr(),
        };
        self.socket
            .send_to(bytes, target)
            .await
            .map_err(|e| ModalError::TransportError(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> ModalResult<(Vec<u8>, LinkAddr)> {
        // One spare byte so oversized datagrams are detectable
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        loop {
            let (len, addr) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| ModalError::TransportError(e.to_string()))?;

            match addr {
                SocketAddr::V4(v4) => return Ok((buf[..len].to_vec(), LinkAddr::from(v4))),
                SocketAddr::V6(v6) => tracing::debug!(from = %v6, "ignoring IPv6 datagram"),
            }
        }
    }

    fn local_addr(&self) -> LinkAddr {
        LinkAddr::from(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[tokio::test]
    async fn test_udp_link_bind() {
        let link = UdpLink::bind(loopback(0), loopback(9)).await.unwrap();
        assert_ne!(link.socket_addr().port(), 0);
        assert_eq!(link.local_addr().to_socket_addr(), link.socket_addr());
    }

    #[tokio::test]
    async fn test_udp_unicast_roundtrip() {
        let a = UdpLink::bind(loopback(0), loopback(9)).await.unwrap();
        let b = UdpLink::bind(loopback(0), loopback(9)).await.unwrap();

        a.send(Destination::Unicast(b.local_addr()), b"ping")
            .await
            .unwrap();
        let (bytes, from) = b.recv().await.unwrap();

        assert_eq!(bytes, b"ping");
        assert_eq!(from, a.local_addr());
    }

    #[tokio::test]
    async fn test_udp_broadcast_target() {
        let listener = UdpLink::bind(loopback(0), loopback(9)).await.unwrap();
        let sender = UdpLink::bind(loopback(0), listener.socket_addr())
            .await
            .unwrap();

        sender.send(Destination::Broadcast, b"hello").await.unwrap();
        let (bytes, _) = listener.recv().await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_udp_rejects_oversized() {
        let link = UdpLink::bind(loopback(0), loopback(9)).await.unwrap();
        let big = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(matches!(
            link.send(Destination::Broadcast, &big).await,
            Err(ModalError::MessageTooLarge { .. })
        ));
    }
}
