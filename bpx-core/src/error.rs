use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect-phase errors that keep the connection in the retry loop
    /// (timeout, refused, unreachable, interrupted).
    #[error("transient network error: {0}")]
    NetworkTransient(String),

    /// Errors after the handshake that force a disconnect/reconnect cycle.
    #[error("network failure: {0}")]
    NetworkFatal(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Version negotiation or settings mismatch; the connection goes
    /// standalone instead of retrying.
    #[error("incompatible peer: {0}")]
    ProtocolIncompatible(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("data digest mismatch: expected {expected:#x}, got {actual:#x}")]
    DigestMismatch { expected: u64, actual: u64 },

    #[error("local I/O error: {0}")]
    LocalIo(String),

    #[error("buffer pool exhausted - {in_use} pages in use, limit {limit}")]
    PoolExhausted { in_use: u32, limit: u32 },

    #[error("state change conflict: {0}")]
    StateConflict(String),

    /// The sync handshake refused to bring replication up; the connection
    /// goes standalone until the operator intervenes.
    #[error("handshake refused: {0}")]
    HandshakeRefused(String),

    #[error("dry-run connect finished: {0}")]
    DryRun(String),

    #[error("split-brain detected, unresolved")]
    SplitBrain,

    #[error("unrelated data, no common ancestor")]
    UnrelatedData,

    /// Peer speaks a protocol too old for the requested operation.
    #[error("peer must support at least protocol {0}")]
    ProtocolTooOld(u32),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("channel disconnected: {0}")]
    ChannelDisconnected(&'static str),

    #[error("stale cookie: {0:#x}")]
    StaleCookie(u64),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PlexError {
    /// Transient errors keep the connect loop running; everything else
    /// escalates to the connection state machine.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            PlexError::NetworkTransient(_) => true,
            PlexError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Errors that take the connection standalone rather than into the
    /// reconnect loop.
    #[must_use]
    pub fn is_incompatible(&self) -> bool {
        matches!(
            self,
            PlexError::ProtocolIncompatible(_)
                | PlexError::AuthFailed(_)
                | PlexError::ProtocolTooOld(_)
                | PlexError::UnrelatedData
                | PlexError::SplitBrain
                | PlexError::HandshakeRefused(_)
                | PlexError::DryRun(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PlexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let e = PlexError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(e.is_transient());

        let e = PlexError::MalformedFrame("bad magic".into());
        assert!(!e.is_transient());
    }

    #[test]
    fn test_incompatible_classification() {
        assert!(PlexError::ProtocolTooOld(91).is_incompatible());
        assert!(PlexError::AuthFailed("digest mismatch".into()).is_incompatible());
        assert!(!PlexError::NetworkFatal("reset".into()).is_incompatible());
    }
}
