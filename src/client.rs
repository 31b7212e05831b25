//! Client side of an exchange.
//!
//! The client sends its request to the server's well-known port. Whoever
//! answers (usually the same host from a fresh port) becomes the peer for the
//! rest of the transfer.

use std::fs::File;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::TransferError;
use crate::packet::TftpPacket;
use crate::transfer::{discard, drive, drive_from, Event, Receiver, RetryPolicy, Sender};
use crate::transfer::{TransferConfig, TransferSummary};
use crate::transport::{Transport, UdpTransport};

#[derive(Debug, Clone)]
pub struct Client {
    server: SocketAddr,
    config: TransferConfig,
}

impl Client {
    pub fn new(server: SocketAddr, config: TransferConfig) -> Self {
        Self { server, config }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Fetch `filename` from the server into `local`.
    ///
    /// `local` is only created once the first DATA block arrives and is
    /// removed again if the transfer fails.
    pub async fn download(
        &self,
        filename: &str,
        local: &Path,
    ) -> Result<TransferSummary, TransferError> {
        let mut transport = self.open().await?;
        transport
            .send_to(&TftpPacket::rrq(filename), self.server)
            .await
            .map_err(TransferError::Transport)?;
        info!(server = %self.server, file = filename, "read request sent");

        let reply = self
            .await_reply(&mut transport, |pkt| {
                matches!(pkt, TftpPacket::DATA { .. })
            })
            .await?;
        let Some((first, peer)) = reply else {
            return Err(TransferError::ResponseTimeout(self.server.to_string()));
        };
        transport.bind_peer(peer);

        let file = File::create(local)?;
        let mut receiver = Receiver::new(file, self.policy());
        let res = drive_from(
            &mut transport,
            &mut receiver,
            Some(Event::Packet(first)),
            self.config.timeout,
        )
        .await;
        if res.is_err() {
            drop(receiver);
            discard(local);
        }
        res
    }

    /// Send `local` to the server, stored there as `filename`.
    ///
    /// A missing local file is only detected after the server has accepted
    /// the request, so the server is told with an ERROR packet and can drop
    /// its partial copy.
    pub async fn upload(
        &self,
        local: &Path,
        filename: &str,
    ) -> Result<TransferSummary, TransferError> {
        let mut transport = self.open().await?;
        transport
            .send_to(&TftpPacket::wrq(filename), self.server)
            .await
            .map_err(TransferError::Transport)?;
        info!(server = %self.server, file = filename, "write request sent");

        let reply = self
            .await_reply(&mut transport, |pkt| *pkt == TftpPacket::ACK(0))
            .await?;
        let Some((_, peer)) = reply else {
            return Err(TransferError::HandshakeTimeout(self.server.to_string()));
        };
        transport.bind_peer(peer);
        info!(%peer, "handshake ack received");

        let file = match open_local(local) {
            Ok(file) => file,
            Err(e) => {
                warn!(file = %local.display(), "local file unavailable: {e}");
                transport
                    .send(&TftpPacket::file_not_found())
                    .await
                    .map_err(TransferError::Transport)?;
                return Err(TransferError::FileNotFound(local.to_path_buf()));
            }
        };

        let mut sender = Sender::new(file, self.policy())?;
        transport
            .send(sender.current())
            .await
            .map_err(TransferError::Transport)?;
        drive(&mut transport, &mut sender, self.config.timeout).await
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::Bounded(self.config.max_attempts)
    }

    async fn open(&self) -> Result<UdpTransport, TransferError> {
        let any = if self.server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(any)
            .await
            .map_err(TransferError::Transport)?;
        Ok(UdpTransport::new(socket))
    }

    // Wait one timeout period for the server's first answer. An ERROR packet
    // ends the exchange; anything `accept` rejects is skipped.
    async fn await_reply<F>(
        &self,
        transport: &mut UdpTransport,
        accept: F,
    ) -> Result<Option<(TftpPacket, SocketAddr)>, TransferError>
    where
        F: Fn(&TftpPacket) -> bool,
    {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some((pkt, addr)) = transport
                .recv_from(remaining)
                .await
                .map_err(TransferError::Transport)?
            else {
                return Ok(None);
            };

            if let TftpPacket::ERROR { code, msg } = pkt {
                return Err(TransferError::Remote { code, message: msg });
            }
            if accept(&pkt) {
                return Ok(Some((pkt, addr)));
            }
            warn!(%addr, packet = %pkt, "unexpected response from server");
        }
    }
}

/// Resolve `host:port`, preferring IPv4 since the server listens on
/// 0.0.0.0 by default.
pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
        })
}

fn open_local(path: &Path) -> io::Result<File> {
    if !path.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
    }
    File::open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolve_prefers_ipv4() {
        let addr = resolve("127.0.0.1", 9000).await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
    }

    #[tokio::test]
    async fn upload_without_server_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = TransferConfig {
            timeout: Duration::from_millis(50),
            max_attempts: 3,
        };
        let client = Client::new(silent.local_addr().unwrap(), config);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("payload");
        std::fs::write(&local, b"payload").unwrap();

        let err = client.upload(&local, "payload").await.unwrap_err();
        assert!(matches!(err, TransferError::HandshakeTimeout(_)));
    }

    #[tokio::test]
    async fn download_without_server_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = TransferConfig {
            timeout: Duration::from_millis(50),
            max_attempts: 3,
        };
        let client = Client::new(silent.local_addr().unwrap(), config);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("never");

        let err = client.download("never", &local).await.unwrap_err();
        assert!(matches!(err, TransferError::ResponseTimeout(_)));
        assert!(!local.exists());
    }
}
