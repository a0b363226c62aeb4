//! Barrier-delimited write epochs.
//!
//! Writes attach to the connection's current epoch; a BARRIER frame stamps
//! the epoch with its number. An epoch finishes once it has writes, none of
//! them are still active, it carries a barrier number (or teardown is in
//! progress) and it is the oldest epoch of the connection. Finishing emits
//! the BarrierAck and either destroys the epoch or, when it is still the
//! current one, recycles it in place. Destroying the oldest epoch may
//! unblock its successor, so finishing cascades front to back.

use std::collections::VecDeque;
use tracing::{debug, info};

pub const EPOCH_HAS_BARRIER_NR: u8 = 1 << 0;
pub const EPOCH_CONTAINS_BARRIER: u8 = 1 << 1;
pub const EPOCH_BARRIER_NEXT_ISSUED: u8 = 1 << 2;
pub const EPOCH_BARRIER_NEXT_DONE: u8 = 1 << 3;
pub const EPOCH_IS_FINISHING: u8 = 1 << 4;

/// Write-ordering capability lattice. Degrades only downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteOrdering {
    None = 0,
    DrainIo = 1,
    BdevFlush = 2,
    BioBarrier = 3,
}

impl std::fmt::Display for WriteOrdering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::DrainIo => "drain",
            Self::BdevFlush => "flush",
            Self::BioBarrier => "barrier",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochEvent {
    /// A write of this epoch drained from the active count.
    Put,
    /// The BARRIER frame for this epoch arrived.
    GotBarrierNr,
    /// The device flush issued for this epoch completed.
    BarrierDone,
    /// The epoch ahead of this one was destroyed.
    BecameLast,
}

#[derive(Debug, Clone, Copy)]
pub struct Epoch {
    pub serial: u64,
    pub barrier_nr: Option<u32>,
    pub size: u32,
    pub active: u32,
    pub flags: u8,
}

impl Epoch {
    fn new(serial: u64) -> Self {
        Self {
            serial,
            barrier_nr: None,
            size: 0,
            active: 0,
            flags: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// What a state-machine step asks the caller to do.
#[derive(Debug, Default)]
pub struct EpochOutcome {
    /// BarrierAck(barrier_nr, set_size) to emit, oldest first.
    pub barrier_acks: Vec<(u32, u32)>,
    /// Epoch needing an asynchronous device flush (BioBarrier ordering).
    pub schedule_flush: Option<u64>,
    /// The current epoch was reset in place.
    pub recycled: bool,
    /// Number of epochs destroyed by the cascade.
    pub destroyed: u32,
}

impl EpochOutcome {
    /// Neither recycled nor destroyed: the epoch still has work in flight.
    #[inline]
    #[must_use]
    pub fn still_live(&self) -> bool {
        !self.recycled && self.destroyed == 0
    }
}

/// Result of attaching a write to the current epoch.
#[derive(Debug, Clone, Copy)]
pub struct AttachOutcome {
    pub epoch_serial: u64,
    /// The write must carry flush+FUA semantics down to the device.
    pub barrier_write: bool,
}

/// FIFO list of epochs; the back is the current epoch.
pub struct EpochList {
    epochs: VecDeque<Epoch>,
    next_serial: u64,
}

impl Default for EpochList {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochList {
    #[must_use]
    pub fn new() -> Self {
        let mut epochs = VecDeque::new();
        epochs.push_back(Epoch::new(1));
        Self {
            epochs,
            next_serial: 2,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    #[must_use]
    pub fn current(&self) -> &Epoch {
        // The list always keeps at least the current epoch.
        &self.epochs[self.epochs.len() - 1]
    }

    #[must_use]
    pub fn get(&self, serial: u64) -> Option<&Epoch> {
        self.epochs.iter().find(|e| e.serial == serial)
    }

    fn index_of(&self, serial: u64) -> Option<usize> {
        self.epochs.iter().position(|e| e.serial == serial)
    }

    /// Attach one write to the current epoch.
    ///
    /// Under BioBarrier ordering the first write of a new epoch carries the
    /// barrier itself, unless the previous epoch was a single-request
    /// barrier epoch already.
    pub fn attach_write(&mut self, write_ordering: WriteOrdering) -> AttachOutcome {
        let len = self.epochs.len();
        let cur = len - 1;
        self.epochs[cur].size += 1;
        self.epochs[cur].active += 1;
        let serial = self.epochs[cur].serial;

        let mut barrier_write = false;
        if write_ordering == WriteOrdering::BioBarrier && self.epochs[cur].size == 1 {
            if len == 1 {
                self.epochs[cur].flags |= EPOCH_CONTAINS_BARRIER;
                barrier_write = true;
            } else {
                let prev = &self.epochs[cur - 1];
                if prev.size > 1 || !prev.has(EPOCH_CONTAINS_BARRIER) {
                    self.epochs[cur - 1].flags |= EPOCH_BARRIER_NEXT_ISSUED;
                    self.epochs[cur].flags |= EPOCH_CONTAINS_BARRIER;
                    barrier_write = true;
                }
            }
        }

        AttachOutcome {
            epoch_serial: serial,
            barrier_write,
        }
    }

    /// Count a write that was drained instead of submitted (detached
    /// disk); it still belongs to the barrier's set size.
    pub fn note_drained_write(&mut self) {
        let cur = self.epochs.len() - 1;
        self.epochs[cur].size += 1;
    }

    /// Stamp the current epoch with its barrier number.
    pub fn set_barrier_nr(&mut self, barrier_nr: u32) -> u64 {
        let cur = self.epochs.len() - 1;
        self.epochs[cur].barrier_nr = Some(barrier_nr);
        self.epochs[cur].serial
    }

    /// Mark the current epoch's barrier as issued; returns the previous
    /// value of the flag.
    pub fn set_barrier_issued(&mut self, serial: u64) -> bool {
        match self.index_of(serial) {
            Some(i) => {
                let was = self.epochs[i].has(EPOCH_BARRIER_NEXT_ISSUED);
                self.epochs[i].flags |= EPOCH_BARRIER_NEXT_ISSUED;
                was
            }
            None => true,
        }
    }

    /// Open a fresh current epoch unless the current one is still empty
    /// (it was recycled while the barrier was processed).
    pub fn maybe_open_new(&mut self) {
        if self.current().size > 0 {
            let e = Epoch::new(self.next_serial);
            self.next_serial += 1;
            self.epochs.push_back(e);
        }
    }

    /// Apply an event to the epoch and run the finish cascade.
    pub fn apply(
        &mut self,
        serial: u64,
        event: EpochEvent,
        cleanup: bool,
        write_ordering: WriteOrdering,
    ) -> EpochOutcome {
        let mut out = EpochOutcome::default();
        let Some(mut idx) = self.index_of(serial) else {
            return out;
        };
        let mut event = Some(event);

        loop {
            let len = self.epochs.len();
            let is_front = idx == 0;
            let is_current = idx + 1 == len;
            let e = &mut self.epochs[idx];

            match event.take() {
                Some(EpochEvent::Put) => e.active = e.active.saturating_sub(1),
                Some(EpochEvent::GotBarrierNr) => {
                    e.flags |= EPOCH_HAS_BARRIER_NR;
                    // The mode degraded away from BioBarrier after this
                    // epoch's only write was issued as a barrier; keep the
                    // epoch open instead of finishing on its own write.
                    if e.has(EPOCH_CONTAINS_BARRIER)
                        && e.size == 1
                        && write_ordering != WriteOrdering::BioBarrier
                        && is_current
                    {
                        e.flags &= !EPOCH_CONTAINS_BARRIER;
                    }
                }
                Some(EpochEvent::BarrierDone) => e.flags |= EPOCH_BARRIER_NEXT_DONE,
                Some(EpochEvent::BecameLast) | None => {}
            }

            let finish_ready = e.size > 0
                && e.active == 0
                && (e.has(EPOCH_HAS_BARRIER_NR) || cleanup)
                && is_front
                && !e.has(EPOCH_IS_FINISHING);
            if !finish_ready {
                break;
            }

            let immediate = e.has(EPOCH_BARRIER_NEXT_DONE)
                || write_ordering == WriteOrdering::None
                || (e.size == 1 && e.has(EPOCH_CONTAINS_BARRIER))
                || cleanup;

            if immediate {
                e.flags |= EPOCH_IS_FINISHING;
                if !cleanup {
                    if let Some(nr) = e.barrier_nr {
                        out.barrier_acks.push((nr, e.size));
                    }
                }
                if is_current {
                    debug!(target: "bpx::epoch", serial = e.serial, "epoch recycled");
                    e.flags = 0;
                    e.size = 0;
                    e.active = 0;
                    e.barrier_nr = None;
                    out.recycled = true;
                    break;
                }
                debug!(target: "bpx::epoch", serial = e.serial, "epoch destroyed");
                self.epochs.pop_front();
                out.destroyed += 1;
                idx = 0;
                event = Some(EpochEvent::BecameLast);
                continue;
            }

            if !e.has(EPOCH_BARRIER_NEXT_ISSUED) && write_ordering == WriteOrdering::BioBarrier {
                // Hold the epoch open until the flush comes back.
                e.active += 1;
                e.flags |= EPOCH_BARRIER_NEXT_ISSUED;
                out.schedule_flush = Some(e.serial);
            }
            break;
        }

        out
    }

    /// Teardown: drive every epoch through the cleanup path.
    pub fn cleanup(&mut self, write_ordering: WriteOrdering) -> EpochOutcome {
        let mut out = EpochOutcome::default();
        while let Some(front) = self.epochs.front() {
            let serial = front.serial;
            let step = self.apply(serial, EpochEvent::BecameLast, true, write_ordering);
            let progressed = step.destroyed > 0 || step.recycled;
            out.destroyed += step.destroyed;
            out.recycled |= step.recycled;
            if !progressed {
                break;
            }
        }
        out
    }
}

/// Pick the strongest ordering the configuration and device support,
/// logging every downgrade.
#[must_use]
pub fn bump_write_ordering(current: WriteOrdering, wanted: WriteOrdering) -> WriteOrdering {
    let next = current.min(wanted);
    if next != current {
        info!(target: "bpx::epoch", from = %current, to = %next, "write ordering degraded");
    }
    next
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn drain_writes(el: &mut EpochList, serial: u64, n: u32, wo: WriteOrdering) -> EpochOutcome {
        let mut last = EpochOutcome::default();
        for _ in 0..n {
            last = el.apply(serial, EpochEvent::Put, false, wo);
        }
        last
    }

    #[test]
    fn test_barrier_ack_after_flush_done() {
        // Scenario: three writes, then the barrier, ordering BdevFlush.
        let wo = WriteOrdering::BdevFlush;
        let mut el = EpochList::new();
        let serial = el.current().serial;
        for _ in 0..3 {
            el.attach_write(wo);
        }
        el.set_barrier_nr(7);
        let out = el.apply(serial, EpochEvent::GotBarrierNr, false, wo);
        assert!(out.still_live());
        assert!(out.barrier_acks.is_empty());

        let out = drain_writes(&mut el, serial, 3, wo);
        // Writes drained, but the flush has not returned yet.
        assert!(out.barrier_acks.is_empty());

        let out = el.apply(serial, EpochEvent::BarrierDone, false, wo);
        assert_eq!(out.barrier_acks, vec![(7, 3)]);
        assert!(out.recycled);
    }

    #[test]
    fn test_ordering_none_finishes_without_flush() {
        let wo = WriteOrdering::None;
        let mut el = EpochList::new();
        let serial = el.current().serial;
        el.attach_write(wo);
        el.set_barrier_nr(1);
        el.apply(serial, EpochEvent::GotBarrierNr, false, wo);
        let out = el.apply(serial, EpochEvent::Put, false, wo);
        assert_eq!(out.barrier_acks, vec![(1, 1)]);
        assert!(out.recycled);
    }

    #[test]
    fn test_fifo_cascade() {
        let wo = WriteOrdering::None;
        let mut el = EpochList::new();
        let s1 = el.current().serial;
        el.attach_write(wo);
        el.set_barrier_nr(1);
        el.apply(s1, EpochEvent::GotBarrierNr, false, wo);
        el.maybe_open_new();

        let s2 = el.current().serial;
        el.attach_write(wo);
        el.set_barrier_nr(2);
        el.apply(s2, EpochEvent::GotBarrierNr, false, wo);
        el.maybe_open_new();
        assert_eq!(el.len(), 3);

        // Drain the second epoch first: it must wait for the first.
        let out = el.apply(s2, EpochEvent::Put, false, wo);
        assert!(out.barrier_acks.is_empty());

        // Draining the first finishes both, in barrier order.
        let out = el.apply(s1, EpochEvent::Put, false, wo);
        assert_eq!(out.barrier_acks, vec![(1, 1), (2, 1)]);
        assert_eq!(out.destroyed, 2);
        assert_eq!(el.len(), 1);
    }

    #[test]
    fn test_cleanup_suppresses_acks() {
        let wo = WriteOrdering::BdevFlush;
        let mut el = EpochList::new();
        let s1 = el.current().serial;
        el.attach_write(wo);
        el.set_barrier_nr(9);
        el.apply(s1, EpochEvent::GotBarrierNr, false, wo);
        el.apply(s1, EpochEvent::Put, false, wo);

        let out = el.cleanup(wo);
        assert!(out.recycled);
        // Teardown never acks.
        assert!(el.current().size == 0);
    }

    #[test]
    fn test_bio_barrier_schedules_flush_once() {
        let wo = WriteOrdering::BioBarrier;
        let mut el = EpochList::new();
        let serial = el.current().serial;
        el.attach_write(wo);
        el.attach_write(wo);
        el.set_barrier_nr(3);
        el.apply(serial, EpochEvent::GotBarrierNr, false, wo);
        el.apply(serial, EpochEvent::Put, false, wo);
        let out = el.apply(serial, EpochEvent::Put, false, wo);
        // All writes drained: the epoch holds itself open for the flush.
        assert_eq!(out.schedule_flush, Some(serial));
        assert!(el.get(serial).unwrap().active == 1);

        // Flush completion: Put for the held count, then BarrierDone.
        el.apply(serial, EpochEvent::BarrierDone, false, wo);
        let out = el.apply(serial, EpochEvent::Put, false, wo);
        assert_eq!(out.barrier_acks, vec![(3, 2)]);
    }

    #[test]
    fn test_first_write_of_epoch_carries_barrier() {
        let wo = WriteOrdering::BioBarrier;
        let mut el = EpochList::new();
        let a = el.attach_write(wo);
        assert!(a.barrier_write);
        let b = el.attach_write(wo);
        assert!(!b.barrier_write);
    }

    #[test]
    fn test_single_barrier_epoch_finishes_immediately() {
        let wo = WriteOrdering::BioBarrier;
        let mut el = EpochList::new();
        let serial = el.current().serial;
        let a = el.attach_write(wo);
        assert!(a.barrier_write);
        el.set_barrier_nr(5);
        el.apply(serial, EpochEvent::GotBarrierNr, false, wo);
        // A single write that itself is a barrier needs no extra flush.
        let out = el.apply(serial, EpochEvent::Put, false, wo);
        assert_eq!(out.barrier_acks, vec![(5, 1)]);
        assert!(out.recycled);
        assert!(out.schedule_flush.is_none());
    }

    #[test]
    fn test_degrade_is_monotone() {
        let wo = bump_write_ordering(WriteOrdering::BdevFlush, WriteOrdering::DrainIo);
        assert_eq!(wo, WriteOrdering::DrainIo);
        // Degrading never goes back up.
        let wo = bump_write_ordering(wo, WriteOrdering::BioBarrier);
        assert_eq!(wo, WriteOrdering::DrainIo);
    }

    #[test]
    fn test_recycled_epoch_accepts_new_writes() {
        let wo = WriteOrdering::None;
        let mut el = EpochList::new();
        let s1 = el.current().serial;
        el.attach_write(wo);
        el.set_barrier_nr(1);
        el.apply(s1, EpochEvent::GotBarrierNr, false, wo);
        let out = el.apply(s1, EpochEvent::Put, false, wo);
        assert!(out.recycled);

        // Recycled epoch is still current; no new epoch needed.
        el.maybe_open_new();
        assert_eq!(el.len(), 1);
        let a = el.attach_write(wo);
        assert_eq!(a.epoch_serial, s1);
    }
}
