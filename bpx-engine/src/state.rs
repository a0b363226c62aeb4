//! Connection, replication, disk and role state enums.

/// Connection state machine. The ordering matters: anything below
/// `Connected` means the replication pipeline is not live and its waits
/// must abort instead of blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    StandAlone,
    Disconnecting,
    Unconnected,
    Timeout,
    BrokenPipe,
    NetworkFailure,
    ProtocolError,
    TearDown,
    Connecting,
    Connected,
}

impl ConnState {
    #[inline]
    #[must_use]
    pub fn is_tearing_down(&self) -> bool {
        *self < Self::Connected
    }

    /// States the connection only leaves on an operator's request.
    #[inline]
    #[must_use]
    pub fn is_final(&self) -> bool {
        *self <= Self::Disconnecting
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StandAlone => "StandAlone",
            Self::Disconnecting => "Disconnecting",
            Self::Unconnected => "Unconnected",
            Self::Timeout => "Timeout",
            Self::BrokenPipe => "BrokenPipe",
            Self::NetworkFailure => "NetworkFailure",
            Self::ProtocolError => "ProtocolError",
            Self::TearDown => "TearDown",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
        };
        write!(f, "{s}")
    }
}

/// Per peer-device replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ReplState {
    Off = 0,
    Established = 1,
    StartingSyncS = 2,
    StartingSyncT = 3,
    WFBitmapS = 4,
    WFBitmapT = 5,
    WFSyncUuid = 6,
    SyncSource = 7,
    SyncTarget = 8,
    PausedSyncS = 9,
    PausedSyncT = 10,
    VerifyS = 11,
    VerifyT = 12,
    Ahead = 13,
    Behind = 14,
}

impl ReplState {
    #[must_use]
    pub fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Off,
            1 => Self::Established,
            2 => Self::StartingSyncS,
            3 => Self::StartingSyncT,
            4 => Self::WFBitmapS,
            5 => Self::WFBitmapT,
            6 => Self::WFSyncUuid,
            7 => Self::SyncSource,
            8 => Self::SyncTarget,
            9 => Self::PausedSyncS,
            10 => Self::PausedSyncT,
            11 => Self::VerifyS,
            12 => Self::VerifyT,
            13 => Self::Ahead,
            14 => Self::Behind,
            _ => return None,
        })
    }

    /// Any state where a resync is running or being set up.
    #[inline]
    #[must_use]
    pub fn is_resync(&self) -> bool {
        matches!(
            self,
            Self::StartingSyncS
                | Self::StartingSyncT
                | Self::WFBitmapS
                | Self::WFBitmapT
                | Self::WFSyncUuid
                | Self::SyncSource
                | Self::SyncTarget
                | Self::PausedSyncS
                | Self::PausedSyncT
        )
    }

    #[inline]
    #[must_use]
    pub fn is_verify(&self) -> bool {
        matches!(self, Self::VerifyS | Self::VerifyT)
    }
}

impl std::fmt::Display for ReplState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Off => "Off",
            Self::Established => "Established",
            Self::StartingSyncS => "StartingSyncS",
            Self::StartingSyncT => "StartingSyncT",
            Self::WFBitmapS => "WFBitmapS",
            Self::WFBitmapT => "WFBitmapT",
            Self::WFSyncUuid => "WFSyncUuid",
            Self::SyncSource => "SyncSource",
            Self::SyncTarget => "SyncTarget",
            Self::PausedSyncS => "PausedSyncS",
            Self::PausedSyncT => "PausedSyncT",
            Self::VerifyS => "VerifyS",
            Self::VerifyT => "VerifyT",
            Self::Ahead => "Ahead",
            Self::Behind => "Behind",
        };
        write!(f, "{s}")
    }
}

/// Disk state, ordered by how trustworthy the data is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum DiskState {
    Diskless = 0,
    Attaching = 1,
    Failed = 2,
    Negotiating = 3,
    Inconsistent = 4,
    Outdated = 5,
    Unknown = 6,
    Consistent = 7,
    UpToDate = 8,
}

impl DiskState {
    #[must_use]
    pub fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Diskless,
            1 => Self::Attaching,
            2 => Self::Failed,
            3 => Self::Negotiating,
            4 => Self::Inconsistent,
            5 => Self::Outdated,
            6 => Self::Unknown,
            7 => Self::Consistent,
            8 => Self::UpToDate,
            _ => return None,
        })
    }
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Diskless => "Diskless",
            Self::Attaching => "Attaching",
            Self::Failed => "Failed",
            Self::Negotiating => "Negotiating",
            Self::Inconsistent => "Inconsistent",
            Self::Outdated => "Outdated",
            Self::Unknown => "DUnknown",
            Self::Consistent => "Consistent",
            Self::UpToDate => "UpToDate",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Role {
    Unknown = 0,
    Primary = 1,
    Secondary = 2,
}

impl Role {
    #[must_use]
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Unknown),
            1 => Some(Self::Primary),
            2 => Some(Self::Secondary),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Primary => "Primary",
            Self::Secondary => "Secondary",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_state_ordering() {
        assert!(ConnState::StandAlone.is_tearing_down());
        assert!(ConnState::NetworkFailure.is_tearing_down());
        assert!(!ConnState::Connected.is_tearing_down());
        assert!(ConnState::Disconnecting.is_final());
        assert!(!ConnState::NetworkFailure.is_final());
        assert!(ConnState::Connecting < ConnState::Connected);
    }

    #[test]
    fn test_repl_state_wire_roundtrip() {
        for v in 0..=14 {
            let s = ReplState::from_wire(v).unwrap();
            assert_eq!(s as u32, v);
        }
        assert!(ReplState::from_wire(15).is_none());
    }

    #[test]
    fn test_repl_state_predicates() {
        assert!(ReplState::SyncTarget.is_resync());
        assert!(ReplState::WFBitmapS.is_resync());
        assert!(!ReplState::Established.is_resync());
        assert!(ReplState::VerifyT.is_verify());
    }

    #[test]
    fn test_disk_state_ordering() {
        assert!(DiskState::Inconsistent < DiskState::UpToDate);
        assert!(DiskState::Outdated < DiskState::Consistent);
        assert!(DiskState::Diskless < DiskState::Inconsistent);
    }
}
