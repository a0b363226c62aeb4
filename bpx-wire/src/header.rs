//! Frame headers.
//!
//! Three shapes survive on the wire, distinguished by the magic at offset 0:
//!
//! - v80:  magic(4) command(2) length(2)            - 8 bytes
//! - v95:  magic(2) command(2) length(4)            - 8 bytes
//! - v100: magic(4) command(2) length(4) volume(2) pad(2) - 14 bytes
//!
//! All fields big-endian. The negotiated protocol version determines how
//! many bytes the receive loop pulls off the socket; the decoder then
//! validates the magic for that shape and, for v100, that the pad is zero.

use crate::command::Command;
use crate::{MAGIC_V100, MAGIC_V80, MAGIC_V95};
use bpx_core::{PlexError, Result};

pub const HEADER_SIZE_V80: usize = 8;
pub const HEADER_SIZE_V95: usize = 8;
pub const HEADER_SIZE_V100: usize = 14;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub cmd: Command,
    /// Payload length in bytes, header excluded.
    pub size: u32,
    /// Volume index, or -1 for resource-scoped packets.
    pub volume: i16,
}

/// Header length used by the given protocol dialect.
#[inline]
#[must_use]
pub fn header_size(protocol_version: u32) -> usize {
    if protocol_version >= 100 {
        HEADER_SIZE_V100
    } else {
        // v80 and v95 headers are the same length, only the magic differs.
        HEADER_SIZE_V80
    }
}

/// Decode a header as the given dialect expects it.
pub fn decode_header(buf: &[u8], protocol_version: u32) -> Result<PacketInfo> {
    if buf.len() < header_size(protocol_version) {
        return Err(PlexError::MalformedFrame(format!(
            "short header: {} bytes",
            buf.len()
        )));
    }

    if protocol_version >= 100 {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC_V100 {
            return Err(PlexError::MalformedFrame(format!(
                "bad magic {magic:#010x}"
            )));
        }
        let cmd_raw = u16::from_be_bytes([buf[4], buf[5]]);
        let size = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let volume = i16::from_be_bytes([buf[10], buf[11]]);
        let pad = u16::from_be_bytes([buf[12], buf[13]]);
        if pad != 0 {
            return Err(PlexError::MalformedFrame(format!("nonzero pad {pad:#x}")));
        }
        let cmd = Command::from_u16(cmd_raw)
            .ok_or_else(|| PlexError::MalformedFrame(format!("unknown command {cmd_raw:#06x}")))?;
        return Ok(PacketInfo { cmd, size, volume });
    }

    if protocol_version >= 95 {
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != MAGIC_V95 {
            return Err(PlexError::MalformedFrame(format!(
                "bad magic {magic:#06x}"
            )));
        }
        let cmd_raw = u16::from_be_bytes([buf[2], buf[3]]);
        let size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let cmd = Command::from_u16(cmd_raw)
            .ok_or_else(|| PlexError::MalformedFrame(format!("unknown command {cmd_raw:#06x}")))?;
        return Ok(PacketInfo {
            cmd,
            size,
            volume: -1,
        });
    }

    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC_V80 {
        return Err(PlexError::MalformedFrame(format!(
            "bad magic {magic:#010x}"
        )));
    }
    let cmd_raw = u16::from_be_bytes([buf[4], buf[5]]);
    let size = u32::from(u16::from_be_bytes([buf[6], buf[7]]));
    let cmd = Command::from_u16(cmd_raw)
        .ok_or_else(|| PlexError::MalformedFrame(format!("unknown command {cmd_raw:#06x}")))?;
    Ok(PacketInfo {
        cmd,
        size,
        volume: -1,
    })
}

/// Encode a header for the given dialect. `volume` is ignored below v100.
#[must_use]
pub fn encode_header(cmd: Command, size: u32, volume: i16, protocol_version: u32) -> Vec<u8> {
    if protocol_version >= 100 {
        let mut buf = vec![0u8; HEADER_SIZE_V100];
        buf[0..4].copy_from_slice(&MAGIC_V100.to_be_bytes());
        buf[4..6].copy_from_slice(&(cmd as u16).to_be_bytes());
        buf[6..10].copy_from_slice(&size.to_be_bytes());
        buf[10..12].copy_from_slice(&volume.to_be_bytes());
        // pad stays zero
        return buf;
    }

    if protocol_version >= 95 {
        let mut buf = vec![0u8; HEADER_SIZE_V95];
        buf[0..2].copy_from_slice(&MAGIC_V95.to_be_bytes());
        buf[2..4].copy_from_slice(&(cmd as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&size.to_be_bytes());
        return buf;
    }

    let mut buf = vec![0u8; HEADER_SIZE_V80];
    buf[0..4].copy_from_slice(&MAGIC_V80.to_be_bytes());
    buf[4..6].copy_from_slice(&(cmd as u16).to_be_bytes());
    buf[6..8].copy_from_slice(&(size as u16).to_be_bytes());
    buf
}
