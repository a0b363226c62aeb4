#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod bitmap;
mod command;
mod header;
mod packets;
mod vli;

pub use bitmap::{rle_decode, rle_encode, words_from_le_bytes, words_to_le_bytes};
pub use command::Command;
pub use header::{decode_header, encode_header, header_size, PacketInfo};
pub use packets::{
    BarrierAckPayload, BarrierPayload, BlockAckPayload, BlockRequestPayload, CompressedBitmapInfo,
    CurrentUuidPayload, DagtagPayload, DataHeader, FeaturesPayload, OutOfSyncPayload,
    PeerAckPayload, PeerDagtagPayload, PeerStateWire, ProtocolPayload, SizesPayload,
    StateChgReplyPayload, StateChgReqPayload, SyncParamPayload, SyncUuidPayload, TwopcPayload,
    TwopcReplyPayload, Uuids110Payload, UuidsPayload,
};
pub use vli::{vli_decode, vli_encode, BitstreamReader, BitstreamWriter};

/// Magic for the 16-bit-length legacy header (protocol < 95).
pub const MAGIC_V80: u32 = 0x8374_0267;
/// "Big" magic for the 32-bit-length header (95 <= protocol < 100).
pub const MAGIC_V95: u16 = 0x5BE4;
/// Magic for the volume-aware header (protocol >= 100).
pub const MAGIC_V100: u32 = 0xD0E9_A33B;

/// Oldest protocol dialect we still speak.
pub const PROTOCOL_MIN: u32 = 86;
/// Newest protocol dialect we speak.
pub const PROTOCOL_MAX: u32 = 112;

/// Feature bits exchanged in the features packet.
pub const FF_TRIM: u32 = 1;

/// Sentinel block ids used on resync/verify acknowledgements.
pub const ID_IN_SYNC: u64 = 4711;
pub const ID_OUT_OF_SYNC: u64 = 4712;
pub const ID_SYNCER: u64 = u64::MAX;

/// Data packet flags (`dp_flags` on DATA/TRIM).
pub const DP_RW_SYNC: u32 = 1 << 0;
pub const DP_MAY_SET_IN_SYNC: u32 = 1 << 1;
pub const DP_UNPLUG: u32 = 1 << 2;
pub const DP_FUA: u32 = 1 << 3;
pub const DP_FLUSH: u32 = 1 << 4;
pub const DP_DISCARD: u32 = 1 << 5;
pub const DP_SEND_RECEIVE_ACK: u32 = 1 << 6;
pub const DP_SEND_WRITE_ACK: u32 = 1 << 7;

/// Connection flags carried in the protocol packet.
pub const CF_DISCARD_MY_DATA: u32 = 1;
pub const CF_DRY_RUN: u32 = 2;

/// UUID flag bits carried alongside peer UUID reports.
pub const UUID_FLAG_CRASHED_PRIMARY: u64 = 1;
pub const UUID_FLAG_DISCARD_MY_DATA: u64 = 2;
