//! Datagram I/O for a single exchange.
//!
//! [`UdpTransport`] owns one socket and remembers the peer it is talking to.
//! Until a peer is bound, the first datagram received binds it; afterwards
//! datagrams from any other address are dropped.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::packet::{TftpPacket, MAX_PACKET_SIZE};
use crate::transfer::Event;

/// Packet-level send/receive used by the transfer driver.
pub trait Transport {
    /// Send `pkt` to the bound peer.
    fn send(&mut self, pkt: &TftpPacket) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait up to `timeout` for the next well-formed packet from the peer.
    fn recv(&mut self, timeout: Duration) -> impl Future<Output = io::Result<Event>> + Send;
}

#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    /// A transport whose peer is learned from the first datagram received.
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket, peer: None }
    }

    /// A transport already bound to `peer`.
    pub fn bound(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer: Some(peer),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Fix the destination for the rest of the exchange.
    pub fn bind_peer(&mut self, peer: SocketAddr) {
        debug!(%peer, "peer bound");
        self.peer = Some(peer);
    }

    /// Send to an explicit address, regardless of the bound peer.
    pub async fn send_to(&self, pkt: &TftpPacket, addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(&pkt.serialize(), addr).await?;
        Ok(())
    }

    /// Wait up to `timeout` for a well-formed packet from the bound peer, or
    /// from anyone while no peer is bound. `None` means the wait timed out.
    pub async fn recv_from(
        &mut self,
        timeout: Duration,
    ) -> io::Result<Option<(TftpPacket, SocketAddr)>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let Ok(res) = timeout_at(deadline, self.socket.recv_from(&mut buf)).await else {
                return Ok(None);
            };
            let (num, addr) = res?;

            if let Some(peer) = self.peer {
                if addr != peer {
                    warn!(%addr, %peer, "ignoring datagram from unknown source");
                    continue;
                }
            }

            match TftpPacket::deserialize(&buf[..num]) {
                Ok(pkt) => {
                    debug!(%addr, packet = %pkt, "recv");
                    return Ok(Some((pkt, addr)));
                }
                Err(e) => warn!(%addr, "malformed packet discarded: {e}"),
            }
        }
    }
}

impl Transport for UdpTransport {
    async fn send(&mut self, pkt: &TftpPacket) -> io::Result<()> {
        let peer = self
            .peer
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no peer bound"))?;
        debug!(%peer, packet = %pkt, "send");
        self.send_to(pkt, peer).await
    }

    async fn recv(&mut self, timeout: Duration) -> io::Result<Event> {
        match self.recv_from(timeout).await? {
            Some((pkt, addr)) => {
                if self.peer.is_none() {
                    self.bind_peer(addr);
                }
                Ok(Event::Packet(pkt))
            }
            None => Ok(Event::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn first_datagram_binds_peer() {
        let mut transport = UdpTransport::new(loopback().await);
        let addr = transport.local_addr().unwrap();
        let peer = loopback().await;

        peer.send_to(&TftpPacket::ACK(0).serialize(), addr).await.unwrap();
        let event = transport.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event, Event::Packet(TftpPacket::ACK(0)));
        assert_eq!(transport.peer(), Some(peer.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn ignores_strangers_and_garbage() {
        let peer = loopback().await;
        let stranger = loopback().await;
        let mut transport = UdpTransport::bound(loopback().await, peer.local_addr().unwrap());
        let addr = transport.local_addr().unwrap();

        stranger.send_to(&TftpPacket::ACK(9).serialize(), addr).await.unwrap();
        peer.send_to(&[0, 9], addr).await.unwrap();
        peer.send_to(&TftpPacket::ACK(1).serialize(), addr).await.unwrap();

        let event = transport.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event, Event::Packet(TftpPacket::ACK(1)));
    }

    #[tokio::test]
    async fn times_out_when_silent() {
        let mut transport = UdpTransport::new(loopback().await);
        let event = transport.recv(Duration::from_millis(20)).await.unwrap();
        assert_eq!(event, Event::Timeout);
    }

    #[tokio::test]
    async fn send_without_peer_fails() {
        let mut transport = UdpTransport::new(loopback().await);
        let err = transport.send(&TftpPacket::ACK(0)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
