//! In-memory collaborator doubles used by unit and integration tests.

use crate::block::{
    ActivityLog, BlockIo, HelperEvent, IoCallback, IoDone, IoKind, IoRequest, PolicyHelper,
    SyncBitmap,
};
use bpx_core::{Result, SECTOR_SHIFT};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Sector-addressed memory disk completing I/O inline.
pub struct MemBlockIo {
    capacity_sectors: u64,
    data: Mutex<HashMap<u64, [u8; 512]>>,
    pub flushes: AtomicU64,
    pub writes: AtomicU64,
    /// When set, the next flush fails with this message.
    pub fail_next_flush: Mutex<Option<String>>,
    /// When set, every write fails with this message.
    pub fail_writes: Mutex<Option<String>>,
}

impl MemBlockIo {
    #[must_use]
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            capacity_sectors,
            data: Mutex::new(HashMap::new()),
            flushes: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fail_next_flush: Mutex::new(None),
            fail_writes: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn read_sector(&self, sector: u64) -> [u8; 512] {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.get(&sector).copied().unwrap_or([0u8; 512])
    }
}

impl BlockIo for MemBlockIo {
    fn submit(&self, req: IoRequest, done: IoCallback) -> Result<()> {
        let result = match req.kind {
            IoKind::Write => {
                let fail = self
                    .fail_writes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(msg) = fail {
                    Err(msg)
                } else {
                    self.writes.fetch_add(1, Ordering::Relaxed);
                    let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
                    if req.flags & crate::block::SUBMIT_DISCARD != 0 {
                        for s in 0..u64::from(req.size >> SECTOR_SHIFT) {
                            data.remove(&(req.sector + s));
                        }
                    } else if let Some(payload) = &req.data {
                        for (i, chunk) in payload.chunks(512).enumerate() {
                            let mut sec = [0u8; 512];
                            sec[..chunk.len()].copy_from_slice(chunk);
                            data.insert(req.sector + i as u64, sec);
                        }
                    }
                    Ok(())
                }
            }
            IoKind::Read => {
                let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
                let sectors = u64::from(req.size >> SECTOR_SHIFT);
                let mut out = Vec::with_capacity(req.size as usize);
                for s in 0..sectors {
                    out.extend_from_slice(
                        &data.get(&(req.sector + s)).copied().unwrap_or([0u8; 512]),
                    );
                }
                let payload = Bytes::from(out);
                done(IoDone {
                    token: req.token,
                    kind: IoKind::Read,
                    data: Some(payload),
                    result: Ok(()),
                });
                return Ok(());
            }
            IoKind::Flush => {
                let fail = self
                    .fail_next_flush
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                if let Some(msg) = fail {
                    Err(msg)
                } else {
                    self.flushes.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }
        };
        done(IoDone {
            token: req.token,
            kind: req.kind,
            data: None,
            result,
        });
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity_sectors
    }
}

/// Word-per-slot bitmap double.
pub struct MemBitmap {
    bits: u64,
    slots: Mutex<Vec<Vec<u64>>>,
}

impl MemBitmap {
    #[must_use]
    pub fn new(slots: usize, bits: u64) -> Self {
        let words = (bits as usize).div_ceil(64);
        Self {
            bits,
            slots: Mutex::new(vec![vec![0u64; words]; slots]),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Vec<Vec<u64>>) -> R) -> R {
        let mut guard = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn range_bits(sector: u64, size: u32) -> (u64, u64) {
        // One bit per 4 KiB block, eight sectors.
        let first = sector >> 3;
        let last = (sector + u64::from(size >> SECTOR_SHIFT)).div_ceil(8).max(first + 1) - 1;
        (first, last)
    }
}

impl SyncBitmap for MemBitmap {
    fn set_out_of_sync(&self, slot: usize, sector: u64, size: u32) {
        let (first, last) = Self::range_bits(sector, size);
        self.set_bits(slot, first, last.min(self.bits - 1));
    }

    fn clear_out_of_sync(&self, slot: usize, sector: u64, size: u32) -> u64 {
        let (first, last) = Self::range_bits(sector, size);
        let last = last.min(self.bits - 1);
        self.with(|s| {
            let mut cleared = 0;
            for bit in first..=last {
                let w = &mut s[slot][(bit / 64) as usize];
                if *w & (1 << (bit % 64)) != 0 {
                    *w &= !(1 << (bit % 64));
                    cleared += 1;
                }
            }
            cleared
        })
    }

    fn total_weight(&self, slot: usize) -> u64 {
        self.with(|s| s[slot].iter().map(|w| u64::from(w.count_ones())).sum())
    }

    fn total_bits(&self) -> u64 {
        self.bits
    }

    fn set_bits(&self, slot: usize, first_bit: u64, last_bit: u64) {
        self.with(|s| {
            for bit in first_bit..=last_bit.min(self.bits - 1) {
                s[slot][(bit / 64) as usize] |= 1 << (bit % 64);
            }
        });
    }

    fn merge_words(&self, slot: usize, word_offset: u64, words: &[u64]) {
        self.with(|s| {
            for (i, w) in words.iter().enumerate() {
                if let Some(dst) = s[slot].get_mut(word_offset as usize + i) {
                    *dst |= w;
                }
            }
        });
    }

    fn set_all(&self, slot: usize) {
        self.set_bits(slot, 0, self.bits - 1);
    }

    fn clear_all(&self, slot: usize) {
        self.with(|s| s[slot].iter_mut().for_each(|w| *w = 0));
    }

    fn copy_slot(&self, from: usize, to: usize) {
        self.with(|s| {
            let src = s[from].clone();
            s[to] = src;
        });
    }

    fn snapshot_words(&self, slot: usize) -> Vec<u64> {
        self.with(|s| s[slot].clone())
    }
}

/// Activity log that only counts.
#[derive(Default)]
pub struct NullActivityLog {
    pub begun: AtomicU64,
    pub completed: AtomicU64,
}

impl ActivityLog for NullActivityLog {
    fn begin_io(&self, _sector: u64, _size: u32) -> Result<()> {
        self.begun.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn complete_io(&self, _sector: u64, _size: u32) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Helper double recording every invocation.
#[derive(Default)]
pub struct RecordingHelper {
    pub events: Mutex<Vec<HelperEvent>>,
    /// Exit code returned for every event.
    pub exit_code: std::sync::atomic::AtomicI32,
}

impl PolicyHelper for RecordingHelper {
    fn invoke(&self, event: HelperEvent) -> i32 {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        self.exit_code.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_block_io_write_read() {
        let disk = MemBlockIo::new(1024);
        let payload = Bytes::from(vec![0xabu8; 1024]);
        disk.submit(
            IoRequest {
                token: 1,
                kind: IoKind::Write,
                sector: 8,
                size: 1024,
                data: Some(payload),
                flags: 0,
            },
            Box::new(|done| assert!(done.result.is_ok())),
        )
        .unwrap();
        assert_eq!(disk.read_sector(8)[0], 0xab);
        assert_eq!(disk.read_sector(9)[511], 0xab);
        assert_eq!(disk.read_sector(10)[0], 0);
    }

    #[test]
    fn test_mem_bitmap_weight() {
        let bm = MemBitmap::new(2, 1024);
        bm.set_out_of_sync(0, 0, 4096);
        assert_eq!(bm.total_weight(0), 1);
        assert_eq!(bm.total_weight(1), 0);
        assert_eq!(bm.clear_out_of_sync(0, 0, 4096), 1);
        assert_eq!(bm.total_weight(0), 0);
    }

    #[test]
    fn test_mem_bitmap_copy_slot() {
        let bm = MemBitmap::new(2, 256);
        bm.set_bits(0, 3, 7);
        bm.copy_slot(0, 1);
        assert_eq!(bm.total_weight(1), 5);
    }
}
