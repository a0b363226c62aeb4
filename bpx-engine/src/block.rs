//! Narrow interfaces to the external collaborators: the block layer, the
//! on-disk out-of-sync bitmap, the activity log and the policy helper.
//!
//! The engine never blocks inside these: block I/O is submitted with a
//! completion callback which the caller wires to its worker channel (or a
//! oneshot for inline waits), and the bitmap/activity-log calls are plain
//! bookkeeping against in-memory or journaled state.

use bpx_core::Result;
use bytes::Bytes;

pub const SUBMIT_SYNC: u32 = 1 << 0;
pub const SUBMIT_FUA: u32 = 1 << 1;
pub const SUBMIT_FLUSH: u32 = 1 << 2;
pub const SUBMIT_DISCARD: u32 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Write,
    Read,
    Flush,
}

/// One submission to the block layer.
#[derive(Debug)]
pub struct IoRequest {
    /// Engine-side correlation token, echoed in the completion.
    pub token: u64,
    pub kind: IoKind,
    pub sector: u64,
    pub size: u32,
    /// Payload for writes; `None` for reads, flushes and discards.
    pub data: Option<Bytes>,
    pub flags: u32,
}

/// Completion of a submission.
#[derive(Debug, Clone)]
pub struct IoDone {
    pub token: u64,
    pub kind: IoKind,
    /// Data for completed reads.
    pub data: Option<Bytes>,
    pub result: std::result::Result<(), String>,
}

pub type IoCallback = Box<dyn FnOnce(IoDone) + Send + 'static>;

pub trait BlockIo: Send + Sync {
    /// Submit asynchronously. `done` fires exactly once, from any task.
    fn submit(&self, req: IoRequest, done: IoCallback) -> Result<()>;

    /// Kick any plugged request queue. Advisory.
    fn unplug(&self) {}

    /// Device capacity in sectors.
    fn capacity(&self) -> u64;

    /// Recent backing-device event count, used by the resync throttle.
    fn io_events(&self) -> u64 {
        0
    }
}

/// Out-of-sync tracking, one slot per peer.
pub trait SyncBitmap: Send + Sync {
    fn set_out_of_sync(&self, slot: usize, sector: u64, size: u32);
    /// Returns the number of bits actually cleared.
    fn clear_out_of_sync(&self, slot: usize, sector: u64, size: u32) -> u64;
    fn total_weight(&self, slot: usize) -> u64;
    fn total_bits(&self) -> u64;
    fn set_bits(&self, slot: usize, first_bit: u64, last_bit: u64);
    fn merge_words(&self, slot: usize, word_offset: u64, words: &[u64]);
    fn set_all(&self, slot: usize);
    fn clear_all(&self, slot: usize);
    fn copy_slot(&self, from: usize, to: usize);
    fn snapshot_words(&self, slot: usize) -> Vec<u64>;
}

/// Activity-log coverage for a sector range.
pub trait ActivityLog: Send + Sync {
    fn begin_io(&self, sector: u64, size: u32) -> Result<()>;
    fn complete_io(&self, sector: u64, size: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperEvent {
    InitialSplitBrain,
    SplitBrain,
    PriLost,
    PriLostAfterSb,
    FencePeer,
}

impl HelperEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitialSplitBrain => "initial-split-brain",
            Self::SplitBrain => "split-brain",
            Self::PriLost => "pri-lost",
            Self::PriLostAfterSb => "pri-lost-after-sb",
            Self::FencePeer => "fence-peer",
        }
    }
}

/// Pluggable policy hook, an external process in production.
pub trait PolicyHelper: Send + Sync {
    /// Returns the helper's exit code.
    fn invoke(&self, event: HelperEvent) -> i32;
}

/// Helper that is never configured; reports failure for every event.
pub struct NoHelper;

impl PolicyHelper for NoHelper {
    fn invoke(&self, _event: HelperEvent) -> i32 {
        -1
    }
}
