/// Commands carried in the frame header.
///
/// The data socket carries everything up to the ack channel block; the ack
/// channel commands travel on the meta socket only.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Data socket (0x00-0x3f)
    Data = 0x00,
    DataReply = 0x01,
    RsDataReply = 0x02,
    Barrier = 0x03,
    Bitmap = 0x04,
    UnplugRemote = 0x07,
    DataRequest = 0x08,
    RsDataRequest = 0x09,
    SyncParam = 0x0a,
    Protocol = 0x0b,
    Uuids = 0x0c,
    Sizes = 0x0d,
    State = 0x0e,
    SyncUuid = 0x0f,
    AuthChallenge = 0x10,
    AuthResponse = 0x11,
    StateChgReq = 0x12,

    // Meta socket / ack channel (0x13-0x2c interleaved historically)
    Ping = 0x13,
    PingAck = 0x14,
    RecvAck = 0x15,
    WriteAck = 0x16,
    RsWriteAck = 0x17,
    Superseded = 0x18,
    NegAck = 0x19,
    NegDReply = 0x1a,
    NegRsDReply = 0x1b,
    BarrierAck = 0x1c,
    StateChgReply = 0x1d,

    OvRequest = 0x1e,
    OvReply = 0x1f,
    OvResult = 0x20,
    CsumRsRequest = 0x21,
    RsIsInSync = 0x22,
    SyncParam89 = 0x23,
    CompressedBitmap = 0x24,

    DelayProbe = 0x27,
    OutOfSync = 0x28,
    RsCancel = 0x29,
    ConnStChgReq = 0x2a,
    ConnStChgReply = 0x2b,
    RetryWrite = 0x2c,
    ProtocolUpdate = 0x2d,
    TwopcPrepare = 0x2e,
    TwopcAbort = 0x2f,

    Dagtag = 0x30,
    Trim = 0x31,

    // Multi-peer dialect (protocol >= 110)
    PeerAck = 0x40,
    PeersInSync = 0x41,
    Uuids110 = 0x42,
    PeerDagtag = 0x43,
    CurrentUuid = 0x44,
    TwopcYes = 0x45,
    TwopcNo = 0x46,
    TwopcRetry = 0x47,
    TwopcCommit = 0x48,
    PriReachable = 0x49,

    // Connection setup
    InitialMeta = 0xfff1,
    InitialData = 0xfff2,
    ConnectionFeatures = 0xfffe,
}

impl Command {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x00 => Self::Data,
            0x01 => Self::DataReply,
            0x02 => Self::RsDataReply,
            0x03 => Self::Barrier,
            0x04 => Self::Bitmap,
            0x07 => Self::UnplugRemote,
            0x08 => Self::DataRequest,
            0x09 => Self::RsDataRequest,
            0x0a => Self::SyncParam,
            0x0b => Self::Protocol,
            0x0c => Self::Uuids,
            0x0d => Self::Sizes,
            0x0e => Self::State,
            0x0f => Self::SyncUuid,
            0x10 => Self::AuthChallenge,
            0x11 => Self::AuthResponse,
            0x12 => Self::StateChgReq,
            0x13 => Self::Ping,
            0x14 => Self::PingAck,
            0x15 => Self::RecvAck,
            0x16 => Self::WriteAck,
            0x17 => Self::RsWriteAck,
            0x18 => Self::Superseded,
            0x19 => Self::NegAck,
            0x1a => Self::NegDReply,
            0x1b => Self::NegRsDReply,
            0x1c => Self::BarrierAck,
            0x1d => Self::StateChgReply,
            0x1e => Self::OvRequest,
            0x1f => Self::OvReply,
            0x20 => Self::OvResult,
            0x21 => Self::CsumRsRequest,
            0x22 => Self::RsIsInSync,
            0x23 => Self::SyncParam89,
            0x24 => Self::CompressedBitmap,
            0x27 => Self::DelayProbe,
            0x28 => Self::OutOfSync,
            0x29 => Self::RsCancel,
            0x2a => Self::ConnStChgReq,
            0x2b => Self::ConnStChgReply,
            0x2c => Self::RetryWrite,
            0x2d => Self::ProtocolUpdate,
            0x2e => Self::TwopcPrepare,
            0x2f => Self::TwopcAbort,
            0x30 => Self::Dagtag,
            0x31 => Self::Trim,
            0x40 => Self::PeerAck,
            0x41 => Self::PeersInSync,
            0x42 => Self::Uuids110,
            0x43 => Self::PeerDagtag,
            0x44 => Self::CurrentUuid,
            0x45 => Self::TwopcYes,
            0x46 => Self::TwopcNo,
            0x47 => Self::TwopcRetry,
            0x48 => Self::TwopcCommit,
            0x49 => Self::PriReachable,
            0xfff1 => Self::InitialMeta,
            0xfff2 => Self::InitialData,
            0xfffe => Self::ConnectionFeatures,
            _ => return None,
        })
    }

    /// Commands that travel on the meta socket.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        matches!(
            self,
            Self::Ping
                | Self::PingAck
                | Self::RecvAck
                | Self::WriteAck
                | Self::RsWriteAck
                | Self::Superseded
                | Self::NegAck
                | Self::NegDReply
                | Self::NegRsDReply
                | Self::BarrierAck
                | Self::StateChgReply
                | Self::OvResult
                | Self::RsIsInSync
                | Self::RsCancel
                | Self::ConnStChgReply
                | Self::RetryWrite
                | Self::PeerAck
                | Self::PeersInSync
                | Self::TwopcYes
                | Self::TwopcNo
                | Self::TwopcRetry
        )
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Data => "Data",
            Self::DataReply => "DataReply",
            Self::RsDataReply => "RsDataReply",
            Self::Barrier => "Barrier",
            Self::Bitmap => "Bitmap",
            Self::UnplugRemote => "UnplugRemote",
            Self::DataRequest => "DataRequest",
            Self::RsDataRequest => "RsDataRequest",
            Self::SyncParam => "SyncParam",
            Self::Protocol => "Protocol",
            Self::Uuids => "Uuids",
            Self::Sizes => "Sizes",
            Self::State => "State",
            Self::SyncUuid => "SyncUuid",
            Self::AuthChallenge => "AuthChallenge",
            Self::AuthResponse => "AuthResponse",
            Self::StateChgReq => "StateChgReq",
            Self::Ping => "Ping",
            Self::PingAck => "PingAck",
            Self::RecvAck => "RecvAck",
            Self::WriteAck => "WriteAck",
            Self::RsWriteAck => "RsWriteAck",
            Self::Superseded => "Superseded",
            Self::NegAck => "NegAck",
            Self::NegDReply => "NegDReply",
            Self::NegRsDReply => "NegRsDReply",
            Self::BarrierAck => "BarrierAck",
            Self::StateChgReply => "StateChgReply",
            Self::OvRequest => "OvRequest",
            Self::OvReply => "OvReply",
            Self::OvResult => "OvResult",
            Self::CsumRsRequest => "CsumRsRequest",
            Self::RsIsInSync => "RsIsInSync",
            Self::SyncParam89 => "SyncParam89",
            Self::CompressedBitmap => "CompressedBitmap",
            Self::DelayProbe => "DelayProbe",
            Self::OutOfSync => "OutOfSync",
            Self::RsCancel => "RsCancel",
            Self::ConnStChgReq => "ConnStChgReq",
            Self::ConnStChgReply => "ConnStChgReply",
            Self::RetryWrite => "RetryWrite",
            Self::ProtocolUpdate => "ProtocolUpdate",
            Self::TwopcPrepare => "TwopcPrepare",
            Self::TwopcAbort => "TwopcAbort",
            Self::Dagtag => "Dagtag",
            Self::Trim => "Trim",
            Self::PeerAck => "PeerAck",
            Self::PeersInSync => "PeersInSync",
            Self::Uuids110 => "Uuids110",
            Self::PeerDagtag => "PeerDagtag",
            Self::CurrentUuid => "CurrentUuid",
            Self::TwopcYes => "TwopcYes",
            Self::TwopcNo => "TwopcNo",
            Self::TwopcRetry => "TwopcRetry",
            Self::TwopcCommit => "TwopcCommit",
            Self::PriReachable => "PriReachable",
            Self::InitialMeta => "InitialMeta",
            Self::InitialData => "InitialData",
            Self::ConnectionFeatures => "ConnectionFeatures",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        for cmd in [
            Command::Data,
            Command::Barrier,
            Command::CompressedBitmap,
            Command::TwopcPrepare,
            Command::TwopcCommit,
            Command::PeerAck,
            Command::ConnectionFeatures,
        ] {
            assert_eq!(Command::from_u16(cmd as u16), Some(cmd));
        }
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(Command::from_u16(0x05), None);
        assert_eq!(Command::from_u16(0x9999), None);
    }

    #[test]
    fn test_meta_classification() {
        assert!(Command::WriteAck.is_meta());
        assert!(Command::BarrierAck.is_meta());
        assert!(Command::TwopcYes.is_meta());
        assert!(!Command::Data.is_meta());
        assert!(!Command::TwopcPrepare.is_meta());
    }
}
