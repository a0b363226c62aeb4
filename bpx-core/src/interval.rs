//! Augmented interval tree for in-flight write tracking.
//!
//! Keyed by [sector, sector + size) with every subtree carrying its maximum
//! end sector, so overlap queries run in O(log n + k). Entries are either
//! local requests (`local = true`, `token` points back at the request) or
//! peer requests inserted by the write pipeline. The `waiting` flag marks
//! intervals some task must be woken for when they leave the tree.
//!
//! The structure is a randomized treap over an index arena: no parent
//! pointers, no unsafe, deterministic priorities derived from the insertion
//! serial.

use crate::size_to_sectors;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    /// First sector covered.
    pub sector: u64,
    /// Length in bytes.
    pub size: u32,
    /// `true` for a local request interval, `false` for a peer request.
    pub local: bool,
    /// Some task must be woken when this interval is removed.
    pub waiting: bool,
    /// Opaque back-reference to the owning request.
    pub token: u64,
}

impl Interval {
    #[inline]
    #[must_use]
    pub fn end(&self) -> u64 {
        self.sector + size_to_sectors(self.size)
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, sector: u64, size: u32) -> bool {
        self.sector < sector + size_to_sectors(size) && self.end() > sector
    }

    /// `true` when [sector, sector+size) lies entirely inside this interval.
    #[inline]
    #[must_use]
    pub fn contains(&self, sector: u64, size: u32) -> bool {
        self.sector <= sector && self.end() >= sector + size_to_sectors(size)
    }
}

/// Handle to a tree entry. Valid until the entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntervalRef(u32);

struct Node {
    iv: Interval,
    serial: u64,
    prio: u64,
    max_end: u64,
    left: Option<u32>,
    right: Option<u32>,
    occupied: bool,
}

pub struct IntervalTree {
    nodes: Vec<Node>,
    free: Vec<u32>,
    root: Option<u32>,
    serial: u64,
    len: usize,
}

impl Default for IntervalTree {
    fn default() -> Self {
        Self::new()
    }
}

/// splitmix64; gives well-distributed treap priorities from the serial.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl IntervalTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            serial: 0,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn get(&self, r: IntervalRef) -> Option<&Interval> {
        self.nodes
            .get(r.0 as usize)
            .filter(|n| n.occupied)
            .map(|n| &n.iv)
    }

    pub fn set_waiting(&mut self, r: IntervalRef) {
        if let Some(n) = self.nodes.get_mut(r.0 as usize) {
            if n.occupied {
                n.iv.waiting = true;
            }
        }
    }

    #[must_use]
    pub fn is_waiting(&self, r: IntervalRef) -> bool {
        self.get(r).is_some_and(|iv| iv.waiting)
    }

    pub fn insert(&mut self, iv: Interval) -> IntervalRef {
        self.serial += 1;
        let serial = self.serial;
        let node = Node {
            max_end: iv.end(),
            iv,
            serial,
            prio: mix(serial),
            left: None,
            right: None,
            occupied: true,
        };
        let idx = match self.free.pop() {
            Some(i) => {
                self.nodes[i as usize] = node;
                i
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        };
        let key = self.key(idx);
        let (l, r) = self.split(self.root, key);
        let merged = self.merge(l, Some(idx));
        self.root = self.merge(merged, r);
        self.len += 1;
        IntervalRef(idx)
    }

    pub fn remove(&mut self, r: IntervalRef) -> Option<Interval> {
        let idx = r.0 as usize;
        if !self.nodes.get(idx).is_some_and(|n| n.occupied) {
            return None;
        }
        let key = self.key(r.0);
        let (root, removed) = self.remove_rec(self.root, key);
        self.root = root;
        let removed = removed?;
        let iv = {
            let node = &mut self.nodes[removed as usize];
            node.occupied = false;
            node.iv.clone()
        };
        self.free.push(removed);
        self.len -= 1;
        Some(iv)
    }

    /// All entries overlapping [sector, sector + size), in start order.
    #[must_use]
    pub fn overlaps(&self, sector: u64, size: u32) -> Vec<IntervalRef> {
        let mut out = Vec::new();
        self.collect(self.root, sector, sector + size_to_sectors(size), &mut out);
        out
    }

    /// First entry overlapping the range, skipping `exclude`.
    #[must_use]
    pub fn first_overlap(
        &self,
        sector: u64,
        size: u32,
        exclude: Option<IntervalRef>,
    ) -> Option<IntervalRef> {
        self.overlaps(sector, size)
            .into_iter()
            .find(|r| Some(*r) != exclude)
    }

    fn key(&self, idx: u32) -> (u64, u64) {
        let n = &self.nodes[idx as usize];
        (n.iv.sector, n.serial)
    }

    fn pull_up(&mut self, idx: u32) {
        let (l, r) = {
            let n = &self.nodes[idx as usize];
            (n.left, n.right)
        };
        let mut max_end = self.nodes[idx as usize].iv.end();
        if let Some(l) = l {
            max_end = max_end.max(self.nodes[l as usize].max_end);
        }
        if let Some(r) = r {
            max_end = max_end.max(self.nodes[r as usize].max_end);
        }
        self.nodes[idx as usize].max_end = max_end;
    }

    /// Split into (< key, >= key).
    fn split(&mut self, cur: Option<u32>, key: (u64, u64)) -> (Option<u32>, Option<u32>) {
        let Some(idx) = cur else {
            return (None, None);
        };
        if self.key(idx) < key {
            let right = self.nodes[idx as usize].right;
            let (l, r) = self.split(right, key);
            self.nodes[idx as usize].right = l;
            self.pull_up(idx);
            (Some(idx), r)
        } else {
            let left = self.nodes[idx as usize].left;
            let (l, r) = self.split(left, key);
            self.nodes[idx as usize].left = r;
            self.pull_up(idx);
            (l, Some(idx))
        }
    }

    /// Merge two trees where every key in `a` precedes every key in `b`.
    fn merge(&mut self, a: Option<u32>, b: Option<u32>) -> Option<u32> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(a), Some(b)) => {
                if self.nodes[a as usize].prio >= self.nodes[b as usize].prio {
                    let ar = self.nodes[a as usize].right;
                    let merged = self.merge(ar, Some(b));
                    self.nodes[a as usize].right = merged;
                    self.pull_up(a);
                    Some(a)
                } else {
                    let bl = self.nodes[b as usize].left;
                    let merged = self.merge(Some(a), bl);
                    self.nodes[b as usize].left = merged;
                    self.pull_up(b);
                    Some(b)
                }
            }
        }
    }

    fn remove_rec(&mut self, cur: Option<u32>, key: (u64, u64)) -> (Option<u32>, Option<u32>) {
        let Some(idx) = cur else {
            return (None, None);
        };
        let cur_key = self.key(idx);
        if cur_key == key {
            let (l, r) = {
                let n = &self.nodes[idx as usize];
                (n.left, n.right)
            };
            let merged = self.merge(l, r);
            return (merged, Some(idx));
        }
        if key < cur_key {
            let left = self.nodes[idx as usize].left;
            let (l, removed) = self.remove_rec(left, key);
            self.nodes[idx as usize].left = l;
            self.pull_up(idx);
            (Some(idx), removed)
        } else {
            let right = self.nodes[idx as usize].right;
            let (r, removed) = self.remove_rec(right, key);
            self.nodes[idx as usize].right = r;
            self.pull_up(idx);
            (Some(idx), removed)
        }
    }

    fn collect(&self, cur: Option<u32>, qs: u64, qe: u64, out: &mut Vec<IntervalRef>) {
        let Some(idx) = cur else { return };
        let n = &self.nodes[idx as usize];
        if n.max_end <= qs {
            return;
        }
        self.collect(n.left, qs, qe, out);
        if n.iv.sector < qe && n.iv.end() > qs {
            out.push(IntervalRef(idx));
        }
        if n.iv.sector < qe {
            self.collect(n.right, qs, qe, out);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn iv(sector: u64, size: u32) -> Interval {
        Interval {
            sector,
            size,
            local: false,
            waiting: false,
            token: 0,
        }
    }

    #[test]
    fn test_insert_and_overlap() {
        let mut t = IntervalTree::new();
        let a = t.insert(iv(0, 4096)); // [0, 8)
        let b = t.insert(iv(8, 4096)); // [8, 16)
        let _c = t.insert(iv(100, 8192)); // [100, 116)

        let hits = t.overlaps(4, 4096); // [4, 12)
        assert_eq!(hits, vec![a, b]);

        let hits = t.overlaps(16, 4096); // [16, 24)
        assert!(hits.is_empty());
    }

    #[test]
    fn test_adjacent_does_not_overlap() {
        let mut t = IntervalTree::new();
        t.insert(iv(0, 4096));
        assert!(t.overlaps(8, 4096).is_empty());
    }

    #[test]
    fn test_remove() {
        let mut t = IntervalTree::new();
        let a = t.insert(iv(0, 4096));
        let b = t.insert(iv(4, 4096));
        assert_eq!(t.len(), 2);

        let removed = t.remove(a).unwrap();
        assert_eq!(removed.sector, 0);
        assert_eq!(t.len(), 1);
        assert!(t.get(a).is_none());

        // Stale handle removal is a no-op.
        assert!(t.remove(a).is_none());

        let hits = t.overlaps(0, 8192);
        assert_eq!(hits, vec![b]);
    }

    #[test]
    fn test_first_overlap_excludes_self() {
        let mut t = IntervalTree::new();
        let me = t.insert(iv(100, 4096));
        assert!(t.first_overlap(100, 4096, Some(me)).is_none());

        let other = t.insert(iv(102, 4096));
        assert_eq!(t.first_overlap(100, 4096, Some(me)), Some(other));
    }

    #[test]
    fn test_contains() {
        let local = iv(100, 8192); // [100, 116)
        assert!(local.contains(100, 4096));
        assert!(local.contains(108, 4096));
        assert!(!local.contains(110, 4096)); // ends at 118
    }

    #[test]
    fn test_many_entries_ordered_query() {
        let mut t = IntervalTree::new();
        let mut refs = Vec::new();
        for i in 0..512u64 {
            refs.push(t.insert(iv(i * 16, 4096)));
        }
        // Query spanning entries 10..20 by start sector.
        let hits = t.overlaps(160, 160 * 512);
        let starts: Vec<u64> = hits.iter().map(|r| t.get(*r).unwrap().sector).collect();
        let expect: Vec<u64> = (10..20).map(|i| i * 16).collect();
        assert_eq!(starts, expect);

        for r in refs {
            assert!(t.remove(r).is_some());
        }
        assert!(t.is_empty());
    }

    #[test]
    fn test_waiting_flag() {
        let mut t = IntervalTree::new();
        let a = t.insert(iv(0, 512));
        assert!(!t.is_waiting(a));
        t.set_waiting(a);
        assert!(t.is_waiting(a));
    }

    #[test]
    fn test_slot_reuse() {
        let mut t = IntervalTree::new();
        let a = t.insert(iv(0, 512));
        t.remove(a).unwrap();
        let b = t.insert(iv(64, 512));
        // The recycled slot must not resurrect the old interval.
        assert_eq!(t.get(b).unwrap().sector, 64);
        assert_eq!(t.overlaps(0, 512), Vec::<IntervalRef>::new());
    }
}
