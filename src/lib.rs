pub mod cli;
pub mod client;
pub mod console;
pub mod error;
pub mod logging;
pub mod packet;
pub mod server;
pub mod transfer;
pub mod transport;

pub use crate::cli::Cli;
pub use crate::client::Client;
pub use crate::error::{PacketError, TransferError};
pub use crate::packet::TftpPacket;
pub use crate::server::{Server, ServerConfig};
pub use crate::transfer::{TransferConfig, TransferSummary};

pub const BLOCK_SIZE: usize = 512; // RFC 1350
pub const MODE_OCTET: &str = "octet";

pub const DEF_PORT: u16 = 9000;
pub const DEF_TIMEOUT_MS: u64 = 60_000;
pub const MAX_ATTEMPTS: u8 = 3;

/// Error code 1 and the exact message put on the wire for a missing file.
pub const ERR_FILE_NOT_FOUND: u16 = 1;
pub const MSG_FILE_NOT_FOUND: &str = "File not found ";
