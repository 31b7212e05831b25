//! Error types for the transfer engine.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A datagram that cannot be decoded as a TFTP packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet length too short: {0} bytes")]
    TooShort(usize),

    #[error("invalid opcode: {0}")]
    UnknownOpcode(u16),

    #[error("missing {0} terminator")]
    MissingTerminator(&'static str),

    #[error("empty filename")]
    EmptyFilename,

    #[error("filename is not valid UTF-8")]
    InvalidFilename,
}

/// Errors that end a single exchange.
///
/// None of these propagate past the exchange that raised them; the server
/// dispatch loop keeps running regardless.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The local file to be sent does not exist.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// The peer aborted the exchange with an ERROR packet.
    #[error("peer sent error: code {code}, msg: {message}")]
    Remote { code: u16, message: String },

    /// No acknowledgment arrived for one block within the attempt bound.
    #[error("no ack for block #{block} after {attempts} attempts")]
    RetriesExhausted { block: u16, attempts: u8 },

    /// The write request was never answered with the handshake ack.
    #[error("no handshake ack from {0}")]
    HandshakeTimeout(String),

    /// The read request was never answered with data or an error.
    #[error("no response from {0}")]
    ResponseTimeout(String),

    /// The socket itself failed.
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),

    /// Reading or writing the local file failed.
    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),
}
