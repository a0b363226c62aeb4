//! Typed packet payloads.
//!
//! Every multi-byte field is big-endian. Decoders return `None` on short or
//! inconsistent input; the receive loop maps that to a malformed-frame error.

use bpx_core::HISTORY_UUIDS;
use bytes::{Bytes, BytesMut};

fn get_u32(data: &[u8], pos: usize) -> Option<u32> {
    data.get(pos..pos + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
}

fn get_u64(data: &[u8], pos: usize) -> Option<u64> {
    data.get(pos..pos + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
}

/// First packet exchanged on the data socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeaturesPayload {
    pub protocol_min: u32,
    pub protocol_max: u32,
    pub sender_node_id: u32,
    pub feature_flags: u32,
}

impl FeaturesPayload {
    pub const SIZE: usize = 16;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.protocol_min.to_be_bytes());
        buf.extend_from_slice(&self.protocol_max.to_be_bytes());
        buf.extend_from_slice(&self.sender_node_id.to_be_bytes());
        buf.extend_from_slice(&self.feature_flags.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            protocol_min: get_u32(data, 0)?,
            protocol_max: get_u32(data, 4)?,
            sender_node_id: get_u32(data, 8)?,
            feature_flags: get_u32(data, 12)?,
        })
    }
}

/// Fixed prefix of DATA / TRIM / DataReply / RsDataReply payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub sector: u64,
    pub block_id: u64,
    pub seq_num: u32,
    pub dp_flags: u32,
}

impl DataHeader {
    pub const SIZE: usize = 24;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.sector.to_be_bytes());
        buf.extend_from_slice(&self.block_id.to_be_bytes());
        buf.extend_from_slice(&self.seq_num.to_be_bytes());
        buf.extend_from_slice(&self.dp_flags.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            sector: get_u64(data, 0)?,
            block_id: get_u64(data, 8)?,
            seq_num: get_u32(data, 16)?,
            dp_flags: get_u32(data, 20)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierPayload {
    pub barrier_nr: u32,
}

impl BarrierPayload {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.barrier_nr.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            barrier_nr: get_u32(data, 0)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierAckPayload {
    pub barrier_nr: u32,
    pub set_size: u32,
}

impl BarrierAckPayload {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.barrier_nr.to_be_bytes());
        buf.extend_from_slice(&self.set_size.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            barrier_nr: get_u32(data, 0)?,
            set_size: get_u32(data, 4)?,
        })
    }
}

/// Block acknowledgement shape, shared by the whole BlockAck family,
/// NegAck, NegDReply, NegRSDReply, OVResult and RsIsInSync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAckPayload {
    pub sector: u64,
    pub block_id: u64,
    pub blksize: u32,
    pub seq_num: u32,
}

impl BlockAckPayload {
    pub const SIZE: usize = 24;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.sector.to_be_bytes());
        buf.extend_from_slice(&self.block_id.to_be_bytes());
        buf.extend_from_slice(&self.blksize.to_be_bytes());
        buf.extend_from_slice(&self.seq_num.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            sector: get_u64(data, 0)?,
            block_id: get_u64(data, 8)?,
            blksize: get_u32(data, 16)?,
            seq_num: get_u32(data, 20)?,
        })
    }
}

/// DataRequest / RsDataRequest / OvRequest shape. Checksum-based requests
/// append the digest after this fixed part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequestPayload {
    pub sector: u64,
    pub block_id: u64,
    pub blksize: u32,
}

impl BlockRequestPayload {
    pub const SIZE: usize = 24;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.sector.to_be_bytes());
        buf.extend_from_slice(&self.block_id.to_be_bytes());
        buf.extend_from_slice(&self.blksize.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            sector: get_u64(data, 0)?,
            block_id: get_u64(data, 8)?,
            blksize: get_u32(data, 16)?,
        })
    }
}

/// Settings that must agree between the two sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolPayload {
    pub wire_protocol: u32,
    pub after_sb_0p: u32,
    pub after_sb_1p: u32,
    pub after_sb_2p: u32,
    pub two_primaries: u32,
    pub conn_flags: u32,
    /// Integrity algorithm name, empty when disabled (protocol >= 87).
    pub integrity_alg: String,
}

impl ProtocolPayload {
    pub const FIXED_SIZE: usize = 24;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_SIZE + self.integrity_alg.len() + 1);
        buf.extend_from_slice(&self.wire_protocol.to_be_bytes());
        buf.extend_from_slice(&self.after_sb_0p.to_be_bytes());
        buf.extend_from_slice(&self.after_sb_1p.to_be_bytes());
        buf.extend_from_slice(&self.after_sb_2p.to_be_bytes());
        buf.extend_from_slice(&self.two_primaries.to_be_bytes());
        buf.extend_from_slice(&self.conn_flags.to_be_bytes());
        buf.extend_from_slice(self.integrity_alg.as_bytes());
        buf.extend_from_slice(&[0]);
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let tail = data.get(Self::FIXED_SIZE..)?;
        let name_end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let integrity_alg = std::str::from_utf8(&tail[..name_end]).ok()?.to_string();
        Some(Self {
            wire_protocol: get_u32(data, 0)?,
            after_sb_0p: get_u32(data, 4)?,
            after_sb_1p: get_u32(data, 8)?,
            after_sb_2p: get_u32(data, 12)?,
            two_primaries: get_u32(data, 16)?,
            conn_flags: get_u32(data, 20)?,
            integrity_alg,
        })
    }
}

/// Resync tuning parameters. The 89 dialect appends the verify and
/// checksum algorithm names as two NUL-terminated strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncParamPayload {
    pub resync_rate: u32,
    pub verify_alg: String,
    pub csums_alg: String,
}

impl SyncParamPayload {
    #[must_use]
    pub fn encode(&self, dialect_89: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.verify_alg.len() + self.csums_alg.len() + 2);
        buf.extend_from_slice(&self.resync_rate.to_be_bytes());
        if dialect_89 {
            buf.extend_from_slice(self.verify_alg.as_bytes());
            buf.extend_from_slice(&[0]);
            buf.extend_from_slice(self.csums_alg.as_bytes());
            buf.extend_from_slice(&[0]);
        }
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8], dialect_89: bool) -> Option<Self> {
        let resync_rate = get_u32(data, 0)?;
        if !dialect_89 {
            return Some(Self {
                resync_rate,
                verify_alg: String::new(),
                csums_alg: String::new(),
            });
        }
        let tail = data.get(4..)?;
        let mut parts = tail.split(|&b| b == 0);
        let verify_alg = std::str::from_utf8(parts.next()?).ok()?.to_string();
        let csums_alg = std::str::from_utf8(parts.next()?).ok()?.to_string();
        Some(Self {
            resync_rate,
            verify_alg,
            csums_alg,
        })
    }
}

/// Pre-110 UUID report: one bitmap slot, fixed history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UuidsPayload {
    pub current: u64,
    pub bitmap: u64,
    pub history: [u64; HISTORY_UUIDS],
    pub dirty_bits: u64,
    pub uuid_flags: u64,
}

impl UuidsPayload {
    pub const SIZE: usize = 48;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.current.to_be_bytes());
        buf.extend_from_slice(&self.bitmap.to_be_bytes());
        for h in &self.history {
            buf.extend_from_slice(&h.to_be_bytes());
        }
        buf.extend_from_slice(&self.dirty_bits.to_be_bytes());
        buf.extend_from_slice(&self.uuid_flags.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            current: get_u64(data, 0)?,
            bitmap: get_u64(data, 8)?,
            history: [get_u64(data, 16)?, get_u64(data, 24)?],
            dirty_bits: get_u64(data, 32)?,
            uuid_flags: get_u64(data, 40)?,
        })
    }
}

/// Protocol >= 110 UUID report: bitmap UUIDs for every slot named in the
/// node mask, then the history ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uuids110Payload {
    pub current: u64,
    pub dirty_bits: u64,
    pub uuid_flags: u64,
    /// Bit n set: `bitmap_uuids` carries a slot for node n, in ascending
    /// node order.
    pub node_mask: u64,
    pub bitmap_uuids: Vec<u64>,
    pub history: [u64; HISTORY_UUIDS],
}

impl Uuids110Payload {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(32 + 8 * (self.bitmap_uuids.len() + HISTORY_UUIDS));
        buf.extend_from_slice(&self.current.to_be_bytes());
        buf.extend_from_slice(&self.dirty_bits.to_be_bytes());
        buf.extend_from_slice(&self.uuid_flags.to_be_bytes());
        buf.extend_from_slice(&self.node_mask.to_be_bytes());
        for u in &self.bitmap_uuids {
            buf.extend_from_slice(&u.to_be_bytes());
        }
        for h in &self.history {
            buf.extend_from_slice(&h.to_be_bytes());
        }
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let current = get_u64(data, 0)?;
        let dirty_bits = get_u64(data, 8)?;
        let uuid_flags = get_u64(data, 16)?;
        let node_mask = get_u64(data, 24)?;
        let slots = node_mask.count_ones() as usize;
        let mut pos = 32;
        let mut bitmap_uuids = Vec::with_capacity(slots);
        for _ in 0..slots {
            bitmap_uuids.push(get_u64(data, pos)?);
            pos += 8;
        }
        let mut history = [0u64; HISTORY_UUIDS];
        for h in &mut history {
            *h = get_u64(data, pos)?;
            pos += 8;
        }
        Some(Self {
            current,
            dirty_bits,
            uuid_flags,
            node_mask,
            bitmap_uuids,
            history,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizesPayload {
    /// Backing device size in sectors.
    pub d_size: u64,
    /// Administratively requested size in sectors, 0 for auto.
    pub u_size: u64,
    /// Currently exposed size in sectors.
    pub c_size: u64,
    pub max_bio_size: u32,
    pub dds_flags: u32,
}

impl SizesPayload {
    pub const SIZE: usize = 32;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.d_size.to_be_bytes());
        buf.extend_from_slice(&self.u_size.to_be_bytes());
        buf.extend_from_slice(&self.c_size.to_be_bytes());
        buf.extend_from_slice(&self.max_bio_size.to_be_bytes());
        buf.extend_from_slice(&self.dds_flags.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            d_size: get_u64(data, 0)?,
            u_size: get_u64(data, 8)?,
            c_size: get_u64(data, 16)?,
            max_bio_size: get_u32(data, 24)?,
            dds_flags: get_u32(data, 28)?,
        })
    }
}

/// Packed peer state report: role(0-1) peer_disk(2-5) disk(6-9) repl(10-14).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStateWire(pub u32);

impl PeerStateWire {
    pub const SIZE: usize = 4;

    #[must_use]
    pub fn pack(role: u32, disk: u32, peer_disk: u32, repl: u32) -> Self {
        Self((role & 0x3) | ((peer_disk & 0xf) << 2) | ((disk & 0xf) << 6) | ((repl & 0x1f) << 10))
    }

    #[inline]
    #[must_use]
    pub fn role(&self) -> u32 {
        self.0 & 0x3
    }

    #[inline]
    #[must_use]
    pub fn peer_disk(&self) -> u32 {
        (self.0 >> 2) & 0xf
    }

    #[inline]
    #[must_use]
    pub fn disk(&self) -> u32 {
        (self.0 >> 6) & 0xf
    }

    #[inline]
    #[must_use]
    pub fn repl(&self) -> u32 {
        (self.0 >> 10) & 0x1f
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        get_u32(data, 0).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChgReqPayload {
    pub mask: u32,
    pub val: u32,
}

impl StateChgReqPayload {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.mask.to_be_bytes());
        buf.extend_from_slice(&self.val.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            mask: get_u32(data, 0)?,
            val: get_u32(data, 4)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChgReplyPayload {
    pub retcode: i32,
}

impl StateChgReplyPayload {
    pub const SIZE: usize = 4;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.retcode.to_be_bytes())
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        get_u32(data, 0).map(|v| Self { retcode: v as i32 })
    }
}

/// Two-phase-commit request, shared by Prepare/Abort/Commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwopcPayload {
    pub tid: u32,
    pub initiator_node_id: u32,
    /// -1 when the change targets the whole resource.
    pub target_node_id: i32,
    pub primary_nodes: u64,
    pub weak_nodes: u64,
    pub mask: u32,
    pub val: u32,
}

impl TwopcPayload {
    pub const SIZE: usize = 36;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.tid.to_be_bytes());
        buf.extend_from_slice(&self.initiator_node_id.to_be_bytes());
        buf.extend_from_slice(&self.target_node_id.to_be_bytes());
        buf.extend_from_slice(&self.primary_nodes.to_be_bytes());
        buf.extend_from_slice(&self.weak_nodes.to_be_bytes());
        buf.extend_from_slice(&self.mask.to_be_bytes());
        buf.extend_from_slice(&self.val.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            tid: get_u32(data, 0)?,
            initiator_node_id: get_u32(data, 4)?,
            target_node_id: get_u32(data, 8)? as i32,
            primary_nodes: get_u64(data, 12)?,
            weak_nodes: get_u64(data, 20)?,
            mask: get_u32(data, 28)?,
            val: get_u32(data, 32)?,
        })
    }
}

/// Reply to a two-phase-commit prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwopcReplyPayload {
    pub tid: u32,
    pub initiator_node_id: u32,
    pub reachable_nodes: u64,
    pub primary_nodes: u64,
    pub weak_nodes: u64,
}

impl TwopcReplyPayload {
    pub const SIZE: usize = 32;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.tid.to_be_bytes());
        buf.extend_from_slice(&self.initiator_node_id.to_be_bytes());
        buf.extend_from_slice(&self.reachable_nodes.to_be_bytes());
        buf.extend_from_slice(&self.primary_nodes.to_be_bytes());
        buf.extend_from_slice(&self.weak_nodes.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            tid: get_u32(data, 0)?,
            initiator_node_id: get_u32(data, 4)?,
            reachable_nodes: get_u64(data, 8)?,
            primary_nodes: get_u64(data, 16)?,
            weak_nodes: get_u64(data, 24)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncUuidPayload {
    pub uuid: u64,
}

impl SyncUuidPayload {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.uuid.to_be_bytes())
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        get_u64(data, 0).map(|uuid| Self { uuid })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfSyncPayload {
    pub sector: u64,
    pub blksize: u32,
}

impl OutOfSyncPayload {
    pub const SIZE: usize = 12;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.sector.to_be_bytes());
        buf.extend_from_slice(&self.blksize.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            sector: get_u64(data, 0)?,
            blksize: get_u32(data, 8)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DagtagPayload {
    pub dagtag: u64,
}

impl DagtagPayload {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.dagtag.to_be_bytes())
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        get_u64(data, 0).map(|dagtag| Self { dagtag })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDagtagPayload {
    pub dagtag: u64,
    pub node_id: u32,
}

impl PeerDagtagPayload {
    pub const SIZE: usize = 12;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.dagtag.to_be_bytes());
        buf.extend_from_slice(&self.node_id.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            dagtag: get_u64(data, 0)?,
            node_id: get_u32(data, 8)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUuidPayload {
    pub uuid: u64,
    pub weak_nodes: u64,
}

impl CurrentUuidPayload {
    pub const SIZE: usize = 16;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.uuid.to_be_bytes());
        buf.extend_from_slice(&self.weak_nodes.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            uuid: get_u64(data, 0)?,
            weak_nodes: get_u64(data, 8)?,
        })
    }
}

/// Peer-ack: which nodes have a write stream prefix in sync, identified by
/// dagtag rather than individual sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAckPayload {
    pub node_mask: u64,
    pub dagtag: u64,
}

impl PeerAckPayload {
    pub const SIZE: usize = 16;

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.node_mask.to_be_bytes());
        buf.extend_from_slice(&self.dagtag.to_be_bytes());
        buf.freeze()
    }

    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            node_mask: get_u64(data, 0)?,
            dagtag: get_u64(data, 8)?,
        })
    }
}

/// Sub-header of a COMPRESSED_BITMAP payload.
///
/// Encoding byte: low nibble = code (2 = RLE/VLI), bits 4-6 = count of
/// pad bits in the last byte, bit 7 = polarity of the first run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedBitmapInfo {
    pub code: u8,
    pub pad_bits: u8,
    pub first_run_set: bool,
}

pub const BITMAP_CODE_RLE: u8 = 2;

impl CompressedBitmapInfo {
    #[must_use]
    pub fn to_byte(self) -> u8 {
        (self.code & 0x0f)
            | ((self.pad_bits & 0x7) << 4)
            | if self.first_run_set { 0x80 } else { 0 }
    }

    #[must_use]
    pub fn from_byte(b: u8) -> Self {
        Self {
            code: b & 0x0f,
            pad_bits: (b >> 4) & 0x7,
            first_run_set: b & 0x80 != 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_data_header_roundtrip() {
        let p = DataHeader {
            sector: 0x0011_2233_4455_6677,
            block_id: 0x8899_aabb_ccdd_eeff,
            seq_num: 42,
            dp_flags: crate::DP_FLUSH | crate::DP_FUA,
        };
        let enc = p.encode();
        assert_eq!(enc.len(), DataHeader::SIZE);
        assert_eq!(DataHeader::decode(&enc), Some(p));
    }

    #[test]
    fn test_data_header_is_big_endian() {
        let p = DataHeader {
            sector: 1,
            block_id: 0,
            seq_num: 0,
            dp_flags: 0,
        };
        let enc = p.encode();
        assert_eq!(&enc[0..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_features_roundtrip() {
        let p = FeaturesPayload {
            protocol_min: 86,
            protocol_max: 112,
            sender_node_id: 3,
            feature_flags: crate::FF_TRIM,
        };
        assert_eq!(FeaturesPayload::decode(&p.encode()), Some(p));
    }

    #[test]
    fn test_protocol_payload_roundtrip() {
        let p = ProtocolPayload {
            wire_protocol: 3,
            after_sb_0p: 4,
            after_sb_1p: 0,
            after_sb_2p: 0,
            two_primaries: 1,
            conn_flags: crate::CF_DISCARD_MY_DATA,
            integrity_alg: "crc32c".to_string(),
        };
        assert_eq!(ProtocolPayload::decode(&p.encode()), Some(p));
    }

    #[test]
    fn test_protocol_payload_empty_alg() {
        let p = ProtocolPayload {
            wire_protocol: 3,
            after_sb_0p: 0,
            after_sb_1p: 0,
            after_sb_2p: 0,
            two_primaries: 0,
            conn_flags: 0,
            integrity_alg: String::new(),
        };
        let decoded = ProtocolPayload::decode(&p.encode()).unwrap();
        assert!(decoded.integrity_alg.is_empty());
    }

    #[test]
    fn test_sync_param_dialects() {
        let p = SyncParamPayload {
            resync_rate: 250,
            verify_alg: "sha256".to_string(),
            csums_alg: "crc32c".to_string(),
        };
        let old = SyncParamPayload::decode(&p.encode(false), false).unwrap();
        assert_eq!(old.resync_rate, 250);
        assert!(old.verify_alg.is_empty());

        let new = SyncParamPayload::decode(&p.encode(true), true).unwrap();
        assert_eq!(new, p);
    }

    #[test]
    fn test_uuids110_variable_slots() {
        let p = Uuids110Payload {
            current: 0xAAAA,
            dirty_bits: 7,
            uuid_flags: crate::UUID_FLAG_CRASHED_PRIMARY,
            node_mask: 0b1010,
            bitmap_uuids: vec![0x1111, 0x2222],
            history: [0x3333, 0x4444],
        };
        assert_eq!(Uuids110Payload::decode(&p.encode()), Some(p));
    }

    #[test]
    fn test_uuids110_short_input() {
        let p = Uuids110Payload {
            current: 1,
            dirty_bits: 0,
            uuid_flags: 0,
            node_mask: 0b1,
            bitmap_uuids: vec![9],
            history: [0, 0],
        };
        let enc = p.encode();
        assert!(Uuids110Payload::decode(&enc[..enc.len() - 1]).is_none());
    }

    #[test]
    fn test_twopc_roundtrip_negative_target() {
        let p = TwopcPayload {
            tid: 77,
            initiator_node_id: 0,
            target_node_id: -1,
            primary_nodes: 0b11,
            weak_nodes: 0,
            mask: 0x1f << 10,
            val: 3 << 10,
        };
        assert_eq!(TwopcPayload::decode(&p.encode()), Some(p));
    }

    #[test]
    fn test_peer_state_wire_fields() {
        let s = PeerStateWire::pack(1, 8, 4, 22);
        assert_eq!(s.role(), 1);
        assert_eq!(s.disk(), 8);
        assert_eq!(s.peer_disk(), 4);
        assert_eq!(s.repl(), 22);
        assert_eq!(PeerStateWire::decode(&s.encode()), Some(s));
    }

    #[test]
    fn test_compressed_bitmap_info_byte() {
        let i = CompressedBitmapInfo {
            code: BITMAP_CODE_RLE,
            pad_bits: 5,
            first_run_set: true,
        };
        let b = i.to_byte();
        assert_eq!(CompressedBitmapInfo::from_byte(b), i);
        assert_eq!(b & 0x0f, BITMAP_CODE_RLE);
        assert_eq!((b >> 4) & 0x7, 5);
        assert!(b & 0x80 != 0);
    }

    #[test]
    fn test_block_ack_roundtrip() {
        let p = BlockAckPayload {
            sector: 2048,
            block_id: crate::ID_SYNCER,
            blksize: 4096,
            seq_num: 17,
        };
        assert_eq!(BlockAckPayload::decode(&p.encode()), Some(p));
    }

    #[test]
    fn test_short_input_rejected() {
        assert!(BlockAckPayload::decode(&[0u8; 10]).is_none());
        assert!(UuidsPayload::decode(&[0u8; 47]).is_none());
        assert!(SizesPayload::decode(&[0u8; 31]).is_none());
    }
}
