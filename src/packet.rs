use std::fmt;
use std::str;

use crate::error::PacketError;
use crate::{BLOCK_SIZE, ERR_FILE_NOT_FOUND, MODE_OCTET, MSG_FILE_NOT_FOUND};

pub const OP_RRQ: u16 = 1;
pub const OP_WRQ: u16 = 2;
pub const OP_DATA: u16 = 3;
pub const OP_ACK: u16 = 4;
pub const OP_ERROR: u16 = 5;

/// Largest datagram this protocol produces: opcode + block + full payload.
pub const MAX_PACKET_SIZE: usize = BLOCK_SIZE + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    RRQ { filename: String, mode: String },
    WRQ { filename: String, mode: String },
    DATA { block: u16, data: Vec<u8> },
    ACK(u16),
    ERROR { code: u16, msg: String },
}

impl TftpPacket {
    pub fn rrq(filename: impl Into<String>) -> Self {
        TftpPacket::RRQ {
            filename: filename.into(),
            mode: MODE_OCTET.to_string(),
        }
    }

    pub fn wrq(filename: impl Into<String>) -> Self {
        TftpPacket::WRQ {
            filename: filename.into(),
            mode: MODE_OCTET.to_string(),
        }
    }

    /// The only error this system ever generates.
    pub fn file_not_found() -> Self {
        TftpPacket::ERROR {
            code: ERR_FILE_NOT_FOUND,
            msg: MSG_FILE_NOT_FOUND.to_string(),
        }
    }

    pub fn opcode(&self) -> u16 {
        match self {
            TftpPacket::RRQ { .. } => OP_RRQ,
            TftpPacket::WRQ { .. } => OP_WRQ,
            TftpPacket::DATA { .. } => OP_DATA,
            TftpPacket::ACK(_) => OP_ACK,
            TftpPacket::ERROR { .. } => OP_ERROR,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.extend_from_slice(&self.opcode().to_be_bytes());

        match self {
            TftpPacket::RRQ { filename, mode } | TftpPacket::WRQ { filename, mode } => {
                bytes.extend_from_slice(filename.as_bytes());
                bytes.push(0);
                bytes.extend_from_slice(mode.as_bytes());
                bytes.push(0);
            }
            TftpPacket::DATA { block, data } => {
                debug_assert!(data.len() <= BLOCK_SIZE, "payload exceeds block size");
                bytes.extend_from_slice(&block.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            TftpPacket::ACK(block) => {
                bytes.extend_from_slice(&block.to_be_bytes());
            }
            TftpPacket::ERROR { code, msg } => {
                bytes.extend_from_slice(&code.to_be_bytes());
                bytes.extend_from_slice(msg.as_bytes());
                bytes.push(0);
            }
        }
        bytes
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 2 {
            return Err(PacketError::TooShort(buf.len()));
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let pkt = match opcode {
            OP_RRQ | OP_WRQ => {
                let (filename, rest) = read_cstr(&buf[2..], "filename")?;
                let (mode, _) = read_cstr(rest, "mode")?;
                if filename.is_empty() {
                    return Err(PacketError::EmptyFilename);
                }
                let filename = str::from_utf8(filename)
                    .map_err(|_| PacketError::InvalidFilename)?
                    .to_string();
                let mode = String::from_utf8_lossy(mode).into_owned();

                if opcode == OP_RRQ {
                    TftpPacket::RRQ { filename, mode }
                } else {
                    TftpPacket::WRQ { filename, mode }
                }
            }
            OP_DATA => {
                let block = read_u16(buf)?;
                TftpPacket::DATA {
                    block,
                    data: buf[4..].to_vec(),
                }
            }
            OP_ACK => TftpPacket::ACK(read_u16(buf)?),
            OP_ERROR => {
                let code = read_u16(buf)?;
                // Peers that forget the trailing NUL are still understood.
                let msg = match read_cstr(&buf[4..], "message") {
                    Ok((msg, _)) => msg,
                    Err(_) => &buf[4..],
                };
                TftpPacket::ERROR {
                    code,
                    msg: String::from_utf8_lossy(msg).into_owned(),
                }
            }
            _ => return Err(PacketError::UnknownOpcode(opcode)),
        };

        Ok(pkt)
    }

    fn encoded_len(&self) -> usize {
        2 + match self {
            TftpPacket::RRQ { filename, mode } | TftpPacket::WRQ { filename, mode } => {
                filename.len() + mode.len() + 2
            }
            TftpPacket::DATA { data, .. } => 2 + data.len(),
            TftpPacket::ACK(_) => 2,
            TftpPacket::ERROR { msg, .. } => 2 + msg.len() + 1,
        }
    }
}

impl fmt::Display for TftpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TftpPacket::RRQ { filename, mode } => write!(f, "RRQ {filename:?} ({mode})"),
            TftpPacket::WRQ { filename, mode } => write!(f, "WRQ {filename:?} ({mode})"),
            TftpPacket::DATA { block, data } => write!(f, "DATA #{block} ({} bytes)", data.len()),
            TftpPacket::ACK(block) => write!(f, "ACK #{block}"),
            TftpPacket::ERROR { code, msg } => write!(f, "ERROR {code}: {msg}"),
        }
    }
}

fn read_u16(buf: &[u8]) -> Result<u16, PacketError> {
    if buf.len() < 4 {
        return Err(PacketError::TooShort(buf.len()));
    }
    Ok(u16::from_be_bytes([buf[2], buf[3]]))
}

// Split a NUL-terminated field off the front of `buf`.
fn read_cstr<'a>(buf: &'a [u8], field: &'static str) -> Result<(&'a [u8], &'a [u8]), PacketError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::MissingTerminator(field))?;
    Ok((&buf[..pos], &buf[pos + 1..]))
}
