//! Request dispatch.
//!
//! The listening socket only ever sees the first packet of an exchange. Each
//! accepted request gets its own task and its own ephemeral socket bound to
//! the requester's address, so the dispatch loop never waits on a transfer.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task;
use tracing::{error, info, warn};

use crate::error::TransferError;
use crate::packet::{TftpPacket, MAX_PACKET_SIZE};
use crate::transfer::{discard, drive, Receiver, RetryPolicy, Sender, TransferSummary};
use crate::transport::UdpTransport;
use crate::{DEF_PORT, DEF_TIMEOUT_MS, MODE_OCTET};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening address.
    pub addr: SocketAddr,
    /// Directory request filenames are resolved against.
    pub root: PathBuf,
    /// Wait for each ACK or DATA before retransmitting.
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEF_PORT)),
            root: PathBuf::from("."),
            timeout: Duration::from_millis(DEF_TIMEOUT_MS),
        }
    }
}

pub struct Server {
    socket: UdpSocket,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.addr).await?;
        Ok(Self { socket, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve requests forever.
    pub async fn run(self) -> io::Result<()> {
        info!(
            addr = %self.socket.local_addr()?,
            root = %self.config.root.display(),
            timeout_ms = self.config.timeout.as_millis() as u64,
            "TFTP server listening"
        );

        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let (num, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(e) => {
                    warn!("receive failed: {e}");
                    continue;
                }
            };

            match TftpPacket::deserialize(&buf[..num]) {
                Ok(pkt) => self.dispatch(pkt, addr).await,
                Err(e) => warn!(%addr, "malformed request discarded: {e}"),
            }
        }
    }

    async fn dispatch(&self, pkt: TftpPacket, addr: SocketAddr) {
        info!(%addr, packet = %pkt, "request");
        match pkt {
            TftpPacket::RRQ { filename, mode } => {
                check_mode(&mode, addr);
                let path = self.config.root.join(&filename);
                let file = match open_existing(&path) {
                    Ok(file) => file,
                    Err(e) => {
                        warn!(%addr, file = %filename, "file not found: {e}");
                        let reply = TftpPacket::file_not_found().serialize();
                        if let Err(e) = self.socket.send_to(&reply, addr).await {
                            error!(%addr, "failed to send error packet: {e}");
                        }
                        return;
                    }
                };

                let local = self.session_addr();
                let timeout = self.config.timeout;
                task::spawn(async move {
                    match serve_read(local, addr, file, timeout).await {
                        Ok(summary) => log_complete(addr, &filename, "sent", &summary),
                        Err(e) => error!(%addr, file = %filename, "read request failed: {e}"),
                    }
                });
            }
            TftpPacket::WRQ { filename, mode } => {
                check_mode(&mode, addr);
                let path = self.config.root.join(&filename);
                let local = self.session_addr();
                let timeout = self.config.timeout;
                task::spawn(async move {
                    match serve_write(local, addr, &path, timeout).await {
                        Ok(summary) => log_complete(addr, &filename, "received", &summary),
                        Err(e) => error!(%addr, file = %filename, "write request failed: {e}"),
                    }
                });
            }
            other => warn!(%addr, opcode = other.opcode(), "ignoring unsupported opcode"),
        }
    }

    // Sessions reply from the listening IP on a fresh port.
    fn session_addr(&self) -> SocketAddr {
        let ip = self
            .socket
            .local_addr()
            .map(|addr| addr.ip())
            .unwrap_or(self.config.addr.ip());
        SocketAddr::new(ip, 0)
    }
}

/// Send `file` to `peer`, retrying each block until it is acknowledged.
pub async fn serve_read(
    local: SocketAddr,
    peer: SocketAddr,
    file: File,
    timeout: Duration,
) -> Result<TransferSummary, TransferError> {
    let socket = UdpSocket::bind(local)
        .await
        .map_err(TransferError::Transport)?;
    let mut transport = UdpTransport::bound(socket, peer);

    let mut sender = Sender::new(file, RetryPolicy::Unbounded)?;
    transport
        .send_to(sender.current(), peer)
        .await
        .map_err(TransferError::Transport)?;
    drive(&mut transport, &mut sender, timeout).await
}

/// Accept an upload from `peer` into `path`.
///
/// The partial file is removed if the exchange fails for any reason,
/// including an ERROR packet from the peer.
pub async fn serve_write(
    local: SocketAddr,
    peer: SocketAddr,
    path: &Path,
    timeout: Duration,
) -> Result<TransferSummary, TransferError> {
    let socket = UdpSocket::bind(local)
        .await
        .map_err(TransferError::Transport)?;
    let mut transport = UdpTransport::bound(socket, peer);

    let file = File::create(path)?;
    let mut receiver = Receiver::new(file, RetryPolicy::Unbounded);
    let handshake = receiver.handshake();

    let res = match transport.send_to(&handshake, peer).await {
        Ok(()) => drive(&mut transport, &mut receiver, timeout).await,
        Err(e) => Err(TransferError::Transport(e)),
    };
    if res.is_err() {
        drop(receiver);
        discard(path);
    }
    res
}

fn open_existing(path: &Path) -> io::Result<File> {
    if !path.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
    }
    File::open(path)
}

fn check_mode(mode: &str, addr: SocketAddr) {
    if !mode.eq_ignore_ascii_case(MODE_OCTET) {
        warn!(%addr, mode, "unsupported mode, transferring as octet");
    }
}

fn log_complete(addr: SocketAddr, filename: &str, verb: &str, summary: &TransferSummary) {
    info!(
        %addr,
        file = filename,
        blocks = summary.blocks,
        bytes = summary.bytes,
        "{verb} in {:.3}s, speed: {:.2} MB/s",
        summary.elapsed.as_secs_f64(),
        summary.speed()
    );
}
