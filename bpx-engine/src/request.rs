//! Peer request store.
//!
//! Every inbound write, resync write, or served read lives in exactly one
//! queue at a time: Active (submitted to the device), Sync (resync write in
//! flight), Read (serving a read/verify request), Done (completed, ack not
//! yet sent) or Net (ack sent, payload still referenced by an outbound
//! socket). Moves name the expected source queue; a mismatch is a logic
//! error surfaced as a state conflict instead of silent corruption.

use bpx_core::{IntervalRef, PlexError, Result};
use bytes::Bytes;
use bpx_wire::Command;
use std::collections::{HashMap, VecDeque};

pub type RequestId = u64;

pub const EE_MAY_SET_IN_SYNC: u32 = 1 << 0;
pub const EE_TRIM: u32 = 1 << 1;
pub const EE_RESTART_REQUESTS: u32 = 1 << 2;
pub const EE_SEND_WRITE_ACK: u32 = 1 << 3;
pub const EE_IN_INTERVAL_TREE: u32 = 1 << 4;
pub const EE_IS_BARRIER: u32 = 1 << 5;
pub const EE_RS_WRITE: u32 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EeQueue {
    Active,
    Sync,
    Read,
    Done,
    Net,
}

impl std::fmt::Display for EeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Sync => "sync",
            Self::Read => "read",
            Self::Done => "done",
            Self::Net => "net",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub struct PeerRequest {
    pub id: RequestId,
    pub volume: u16,
    pub sector: u64,
    pub size: u32,
    /// Peer's opaque id, echoed verbatim in acknowledgements.
    pub block_id: u64,
    pub peer_seq: u32,
    pub flags: u32,
    pub epoch_serial: Option<u64>,
    pub dagtag_sector: u64,
    pub data: Option<Bytes>,
    /// Digest shipped with checksum resync / verify requests.
    pub digest: Option<Vec<u8>>,
    pub interval: Option<IntervalRef>,
    pub queue: EeQueue,
    pub result: Option<std::result::Result<(), String>>,
    /// Command driving the response when this request finishes: the reply
    /// kind for served reads, or a forced ack (Superseded/RetryWrite) for
    /// discarded conflicting writes. `None` derives the ack from flags and
    /// result.
    pub finish_cmd: Option<Command>,
}

impl PeerRequest {
    #[must_use]
    pub fn new_write(
        id: RequestId,
        volume: u16,
        sector: u64,
        size: u32,
        block_id: u64,
        peer_seq: u32,
        data: Option<Bytes>,
    ) -> Self {
        Self {
            id,
            volume,
            sector,
            size,
            block_id,
            peer_seq,
            flags: 0,
            epoch_serial: None,
            dagtag_sector: 0,
            data,
            digest: None,
            interval: None,
            queue: EeQueue::Active,
            result: None,
            finish_cmd: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Default)]
pub struct RequestStore {
    map: HashMap<RequestId, PeerRequest>,
    done_order: VecDeque<RequestId>,
}

impl RequestStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn insert(&mut self, mut req: PeerRequest, queue: EeQueue) -> RequestId {
        let id = req.id;
        req.queue = queue;
        if queue == EeQueue::Done {
            self.done_order.push_back(id);
        }
        self.map.insert(id, req);
        id
    }

    #[must_use]
    pub fn get(&self, id: RequestId) -> Option<&PeerRequest> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut PeerRequest> {
        self.map.get_mut(&id)
    }

    /// Move a request between queues, validating the source.
    pub fn move_to(&mut self, id: RequestId, from: EeQueue, to: EeQueue) -> Result<()> {
        let req = self
            .map
            .get_mut(&id)
            .ok_or_else(|| PlexError::NotFound(format!("peer request {id}")))?;
        if req.queue != from {
            return Err(PlexError::StateConflict(format!(
                "peer request {id} in queue {} (expected {from})",
                req.queue
            )));
        }
        req.queue = to;
        if to == EeQueue::Done {
            self.done_order.push_back(id);
        }
        Ok(())
    }

    /// Remove the request entirely.
    pub fn take(&mut self, id: RequestId) -> Option<PeerRequest> {
        self.done_order.retain(|&d| d != id);
        self.map.remove(&id)
    }

    /// Next request completed but not yet acknowledged, in completion order.
    pub fn pop_done(&mut self) -> Option<RequestId> {
        while let Some(id) = self.done_order.pop_front() {
            if self.map.get(&id).is_some_and(|r| r.queue == EeQueue::Done) {
                return Some(id);
            }
        }
        None
    }

    #[must_use]
    pub fn count(&self, queue: EeQueue) -> usize {
        self.map.values().filter(|r| r.queue == queue).count()
    }

    pub fn ids_in(&self, queue: EeQueue) -> Vec<RequestId> {
        self.map
            .values()
            .filter(|r| r.queue == queue)
            .map(|r| r.id)
            .collect()
    }

    pub fn iter_queue(&self, queue: EeQueue) -> impl Iterator<Item = &PeerRequest> {
        self.map.values().filter(move |r| r.queue == queue)
    }

    /// Any resync write overlapping the range still in flight?
    #[must_use]
    pub fn overlapping_resync_write(&self, sector: u64, size: u32) -> bool {
        let end = sector + u64::from(size >> bpx_core::SECTOR_SHIFT);
        self.iter_queue(EeQueue::Sync).any(|r| {
            let r_end = r.sector + u64::from(r.size >> bpx_core::SECTOR_SHIFT);
            r.sector < end && r_end > sector
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_req(id: RequestId, sector: u64) -> PeerRequest {
        PeerRequest::new_write(id, 0, sector, 4096, 0xdead, 0, None)
    }

    #[test]
    fn test_queue_lifecycle() {
        let mut store = RequestStore::new();
        store.insert(write_req(1, 0), EeQueue::Active);
        assert_eq!(store.count(EeQueue::Active), 1);

        store.move_to(1, EeQueue::Active, EeQueue::Done).unwrap();
        assert_eq!(store.count(EeQueue::Active), 0);
        assert_eq!(store.pop_done(), Some(1));

        store.move_to(1, EeQueue::Done, EeQueue::Net).unwrap();
        let req = store.take(1).unwrap();
        assert_eq!(req.queue, EeQueue::Net);
        assert!(store.is_empty());
    }

    #[test]
    fn test_wrong_source_queue_rejected() {
        let mut store = RequestStore::new();
        store.insert(write_req(1, 0), EeQueue::Active);
        let err = store.move_to(1, EeQueue::Sync, EeQueue::Done).unwrap_err();
        assert!(matches!(err, PlexError::StateConflict(_)));
        // The request stays where it was.
        assert_eq!(store.get(1).unwrap().queue, EeQueue::Active);
    }

    #[test]
    fn test_done_order_is_completion_order() {
        let mut store = RequestStore::new();
        for id in 1..=3 {
            store.insert(write_req(id, id * 8), EeQueue::Active);
        }
        store.move_to(2, EeQueue::Active, EeQueue::Done).unwrap();
        store.move_to(1, EeQueue::Active, EeQueue::Done).unwrap();
        store.move_to(3, EeQueue::Active, EeQueue::Done).unwrap();
        assert_eq!(store.pop_done(), Some(2));
        assert_eq!(store.pop_done(), Some(1));
        assert_eq!(store.pop_done(), Some(3));
        assert_eq!(store.pop_done(), None);
    }

    #[test]
    fn test_overlapping_resync_write() {
        let mut store = RequestStore::new();
        store.insert(write_req(1, 100), EeQueue::Sync);
        assert!(store.overlapping_resync_write(104, 4096));
        assert!(!store.overlapping_resync_write(108, 4096));
        assert!(!store.overlapping_resync_write(0, 4096));
    }

    #[test]
    fn test_take_removes_from_done_order() {
        let mut store = RequestStore::new();
        store.insert(write_req(1, 0), EeQueue::Active);
        store.move_to(1, EeQueue::Active, EeQueue::Done).unwrap();
        store.take(1).unwrap();
        assert_eq!(store.pop_done(), None);
    }
}
