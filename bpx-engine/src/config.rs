//! Connection and resource configuration.

use bpx_core::{PlexError, Result};
use std::time::Duration;

/// Replication wire protocol: when a write is acknowledged to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// Fire and forget: acked when handed to the TCP stack.
    A = 1,
    /// Acked when received (RecvAck).
    B = 2,
    /// Acked when written to stable storage (WriteAck).
    C = 3,
}

impl WireProtocol {
    #[must_use]
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::A),
            2 => Some(Self::B),
            3 => Some(Self::C),
            _ => None,
        }
    }
}

/// Automatic split-brain recovery policies (`after-sb-[012]p`, `rr-conflict`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSbPolicy {
    Disconnect = 0,
    DiscardYoungerPrimary = 1,
    DiscardOlderPrimary = 2,
    DiscardZeroChanges = 3,
    DiscardLeastChanges = 4,
    DiscardLocal = 5,
    DiscardRemote = 6,
    Consensus = 7,
    DiscardSecondary = 8,
    CallHelper = 9,
    Violently = 10,
}

impl AfterSbPolicy {
    #[must_use]
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Disconnect),
            1 => Some(Self::DiscardYoungerPrimary),
            2 => Some(Self::DiscardOlderPrimary),
            3 => Some(Self::DiscardZeroChanges),
            4 => Some(Self::DiscardLeastChanges),
            5 => Some(Self::DiscardLocal),
            6 => Some(Self::DiscardRemote),
            7 => Some(Self::Consensus),
            8 => Some(Self::DiscardSecondary),
            9 => Some(Self::CallHelper),
            10 => Some(Self::Violently),
            _ => None,
        }
    }

    /// The peer reports its policy from its own point of view;
    /// discard-local and discard-remote swap sides on the way over.
    #[must_use]
    pub fn mirrored(self) -> Self {
        match self {
            Self::DiscardLocal => Self::DiscardRemote,
            Self::DiscardRemote => Self::DiscardLocal,
            other => other,
        }
    }
}

/// Integrity digest over data payloads, negotiated in the protocol packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityAlg {
    Crc32c,
    Sha256,
}

impl IntegrityAlg {
    pub fn from_name(name: &str) -> Result<Option<Self>> {
        match name {
            "" => Ok(None),
            "crc32c" => Ok(Some(Self::Crc32c)),
            "sha256" => Ok(Some(Self::Sha256)),
            other => Err(PlexError::ProtocolIncompatible(format!(
                "unknown integrity algorithm \"{other}\""
            ))),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Crc32c => "crc32c",
            Self::Sha256 => "sha256",
        }
    }

    #[must_use]
    pub fn digest_size(&self) -> usize {
        match self {
            Self::Crc32c => 4,
            Self::Sha256 => 32,
        }
    }

    #[must_use]
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Crc32c => {
                let mut h = crc32fast::Hasher::new();
                h.update(data);
                h.finalize().to_be_bytes().to_vec()
            }
            Self::Sha256 => {
                use sha2::{Digest, Sha256};
                let mut h = Sha256::new();
                h.update(data);
                h.finalize().to_vec()
            }
        }
    }
}

/// Per-connection network configuration.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub peer_node_id: u32,
    pub wire_protocol: WireProtocol,
    /// Allow writes from both sides concurrently; requires conflict
    /// resolution on the receive path.
    pub two_primaries: bool,
    pub after_sb_0p: AfterSbPolicy,
    pub after_sb_1p: AfterSbPolicy,
    pub after_sb_2p: AfterSbPolicy,
    /// Run the after-sb policies even for history-related split brain.
    pub always_asbp: bool,
    /// What to do when a primary is told to become SyncTarget.
    pub rr_conflict: AfterSbPolicy,
    /// Single-shot: yield our data in the next handshake.
    pub discard_my_data: bool,
    /// Dry-run connect: report the handshake outcome, then bail out.
    pub tentative: bool,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub connect_interval: Duration,
    pub socket_timeout: Duration,
    /// Inbound payload pool limit, in pages.
    pub max_buffers: u32,
    pub integrity_alg: Option<IntegrityAlg>,
    /// Shared secret enabling the HMAC challenge-response.
    pub shared_secret: Option<String>,
    /// Resync throttle: skip serving resync requests when application I/O
    /// is already moving faster than this rate (KiB/s, 0 disables).
    pub c_min_rate: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            peer_node_id: 1,
            wire_protocol: WireProtocol::C,
            two_primaries: false,
            after_sb_0p: AfterSbPolicy::Disconnect,
            after_sb_1p: AfterSbPolicy::Disconnect,
            after_sb_2p: AfterSbPolicy::Disconnect,
            always_asbp: false,
            rr_conflict: AfterSbPolicy::Disconnect,
            discard_my_data: false,
            tentative: false,
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_millis(500),
            connect_interval: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(6),
            max_buffers: 2048,
            integrity_alg: None,
            shared_secret: None,
            c_min_rate: 250,
        }
    }
}

/// Resource-wide options.
#[derive(Debug, Clone)]
pub struct ResourceOptions {
    pub name: String,
    pub node_id: u32,
    /// How long a prepared remote state change may stay open.
    pub twopc_timeout: Duration,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            name: "r0".to_string(),
            node_id: 0,
            twopc_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_sb_mirror() {
        assert_eq!(
            AfterSbPolicy::DiscardLocal.mirrored(),
            AfterSbPolicy::DiscardRemote
        );
        assert_eq!(
            AfterSbPolicy::DiscardRemote.mirrored(),
            AfterSbPolicy::DiscardLocal
        );
        assert_eq!(
            AfterSbPolicy::DiscardLeastChanges.mirrored(),
            AfterSbPolicy::DiscardLeastChanges
        );
    }

    #[test]
    fn test_integrity_alg_names() {
        assert_eq!(IntegrityAlg::from_name("").ok(), Some(None));
        assert_eq!(
            IntegrityAlg::from_name("crc32c").ok(),
            Some(Some(IntegrityAlg::Crc32c))
        );
        assert!(IntegrityAlg::from_name("md5").is_err());
    }

    #[test]
    fn test_digest_sizes() {
        let data = b"payload";
        assert_eq!(IntegrityAlg::Crc32c.digest(data).len(), 4);
        assert_eq!(IntegrityAlg::Sha256.digest(data).len(), 32);
    }
}
