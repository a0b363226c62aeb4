//! Data-generation UUIDs and the resync-role comparison.
//!
//! Every device carries a current UUID, one bitmap UUID per peer slot and a
//! short history ring. Comparing our vectors against the peer's report
//! yields a rule-encoded integer: positive means we become SyncSource,
//! negative SyncTarget; magnitude 2 adds "set the whole bitmap first",
//! magnitude 3 "copy the bitmap from another peer's slot"; 100 is a
//! split-brain candidate, -1000 unrelated data, and anything below -1000
//! names the minimum protocol version that could disambiguate.
//!
//! The lowest bit of a UUID flags "was primary while this was current" and
//! is masked out of every comparison.

use bpx_core::{HISTORY_UUIDS, UUID_JUST_CREATED};
use tracing::info;

/// Distance between a current UUID and the bitmap UUID minted from it when
/// a resync starts (protocol >= 96 convention).
pub const UUID_NEW_BM_OFFSET: u64 = 0x0001_0000_0000_0000;

#[inline]
fn strip(u: u64) -> u64 {
    u & !1
}

/// Our own UUID vectors for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidSet {
    pub current: u64,
    /// Bitmap UUID per peer slot.
    pub bitmap: Vec<u64>,
    /// Node id owning each slot.
    pub slot_node_ids: Vec<u32>,
    pub history: [u64; HISTORY_UUIDS],
}

impl UuidSet {
    #[must_use]
    pub fn new(slot_node_ids: Vec<u32>) -> Self {
        Self {
            current: UUID_JUST_CREATED,
            bitmap: vec![0; slot_node_ids.len()],
            slot_node_ids,
            history: [0; HISTORY_UUIDS],
        }
    }

    pub fn push_history(&mut self, uuid: u64) {
        for i in (1..HISTORY_UUIDS).rev() {
            self.history[i] = self.history[i - 1];
        }
        self.history[0] = uuid;
    }

    pub fn pull_history(&mut self) -> u64 {
        let first = self.history[0];
        for i in 0..HISTORY_UUIDS - 1 {
            self.history[i] = self.history[i + 1];
        }
        self.history[HISTORY_UUIDS - 1] = 0;
        first
    }
}

/// The peer's UUID report for one device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerUuidView {
    pub current: u64,
    /// (node id, bitmap uuid) pairs as reported.
    pub bitmap_uuids: Vec<(u32, u64)>,
    pub history: [u64; HISTORY_UUIDS],
    pub dirty_bits: u64,
    pub flags: u64,
}

impl PeerUuidView {
    #[must_use]
    pub fn bitmap_for(&self, node_id: u32) -> u64 {
        self.bitmap_uuids
            .iter()
            .find(|(n, _)| *n == node_id)
            .map_or(0, |(_, u)| *u)
    }

    fn set_bitmap_for(&mut self, node_id: u32, uuid: u64) {
        for (n, u) in &mut self.bitmap_uuids {
            if *n == node_id {
                *u = uuid;
                return;
            }
        }
        self.bitmap_uuids.push((node_id, uuid));
    }

    fn push_history(&mut self, uuid: u64) {
        for i in (1..HISTORY_UUIDS).rev() {
            self.history[i] = self.history[i - 1];
        }
        self.history[0] = uuid;
    }

    fn pull_history(&mut self) -> u64 {
        let first = self.history[0];
        for i in 0..HISTORY_UUIDS - 1 {
            self.history[i] = self.history[i + 1];
        }
        self.history[HISTORY_UUIDS - 1] = 0;
        first
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompareCtx {
    pub my_node_id: u32,
    /// Our bitmap slot for this peer.
    pub peer_slot: usize,
    /// We were primary when we crashed.
    pub crashed_primary: bool,
    /// Peer reported the crashed-primary flag.
    pub peer_crashed_primary: bool,
    /// Tie-break owner (set on the side that accepted INITIAL_META last).
    pub resolve_conflicts: bool,
    pub protocol: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareResult {
    pub hg: i32,
    pub rule: u32,
    /// Node whose slot is involved in a rule 52/72 copy decision.
    pub peer_node_id: Option<u32>,
}

/// The rule ladder. Pre-110 dialects may correct UUID vectors in place for
/// sync-uuid and resync-end packets lost across a crash.
pub fn uuid_compare(
    local: &mut UuidSet,
    peer: &mut PeerUuidView,
    ctx: &CompareCtx,
) -> CompareResult {
    let res = |hg: i32, rule: u32| CompareResult {
        hg,
        rule,
        peer_node_id: None,
    };

    let self_cur = strip(local.current);
    let peer_cur = strip(peer.current);

    // rule 10: both sides never synced with anyone.
    if self_cur == UUID_JUST_CREATED && peer_cur == UUID_JUST_CREATED {
        return res(0, 10);
    }

    // rule 20/30: one side is brand new or empty; fresh full copy.
    if (self_cur == UUID_JUST_CREATED || self_cur == 0) && peer_cur != UUID_JUST_CREATED {
        return res(-2, 20);
    }
    if self_cur != UUID_JUST_CREATED && (peer_cur == UUID_JUST_CREATED || peer_cur == 0) {
        return res(2, 30);
    }

    if self_cur == peer_cur {
        if ctx.protocol < 110 {
            if let Some(r) = fixup_resync_end(local, peer, ctx) {
                return r;
            }
        }

        // Common power loss: lowest bit our role at crash, weight two the
        // peer's.
        let rct = u32::from(ctx.crashed_primary) + 2 * u32::from(ctx.peer_crashed_primary);
        let hg = match rct {
            0 => 0,
            1 => 1,
            2 => -1,
            _ => {
                if ctx.resolve_conflicts {
                    -1
                } else {
                    1
                }
            }
        };
        return res(hg, 40);
    }

    // rule 50: my current equals the peer's bitmap-for-me.
    if self_cur == strip(peer.bitmap_for(ctx.my_node_id)) {
        return res(-1, 50);
    }

    // rule 52: my current equals the peer's bitmap for some other node.
    for (node, uuid) in &peer.bitmap_uuids {
        if self_cur == strip(*uuid) {
            return CompareResult {
                hg: -3,
                rule: 52,
                peer_node_id: Some(*node),
            };
        }
    }

    if ctx.protocol < 110 {
        if let Some(r) = fixup_resync_start1(local, peer, ctx) {
            return r;
        }
    }

    // rule 60: my current is in the peer's history.
    for h in &peer.history {
        if self_cur == strip(*h) {
            return res(-2, 60);
        }
    }

    // rule 70: the peer's current equals my bitmap-for-peer.
    if strip(local.bitmap[ctx.peer_slot]) == peer_cur {
        return res(1, 70);
    }

    // rule 72: the peer's current equals my bitmap for some other node.
    for (slot, uuid) in local.bitmap.iter().enumerate() {
        if slot == ctx.peer_slot {
            continue;
        }
        if strip(*uuid) == peer_cur {
            return CompareResult {
                hg: 3,
                rule: 72,
                peer_node_id: Some(local.slot_node_ids[slot]),
            };
        }
    }

    if ctx.protocol < 110 {
        if let Some(r) = fixup_resync_start2(local, peer, ctx) {
            return r;
        }
    }

    // rule 80: the peer's current is in my history.
    for h in &local.history {
        if strip(*h) == peer_cur {
            return res(2, 80);
        }
    }

    // rule 90: both bitmap UUIDs equal and non-zero; split brain with a
    // recovery attempt.
    let my_bm = strip(local.bitmap[ctx.peer_slot]);
    if my_bm != 0 && my_bm == strip(peer.bitmap_for(ctx.my_node_id)) {
        return res(100, 90);
    }

    // rule 100: any history-to-history match; split brain, disconnect-grade.
    for h in &local.history {
        for ph in &peer.history {
            if strip(*h) == strip(*ph) && strip(*h) != 0 {
                return res(-100, 100);
            }
        }
    }

    res(-1000, 100)
}

/// Currents are equal but one side still carries a bitmap UUID: a resync
/// finished but one side missed the event across a crash.
fn fixup_resync_end(
    local: &mut UuidSet,
    peer: &mut PeerUuidView,
    ctx: &CompareCtx,
) -> Option<CompareResult> {
    let peer_bm = peer.bitmap_for(ctx.my_node_id);
    let my_bm = local.bitmap[ctx.peer_slot];

    if peer_bm == 0 && my_bm != 0 {
        if ctx.protocol < 91 {
            return Some(CompareResult {
                hg: -1091,
                rule: 34,
                peer_node_id: None,
            });
        }
        let rule = if strip(my_bm) == strip(peer.history[0])
            && strip(local.history[0]) == strip(peer.history[0])
        {
            info!(target: "bpx::sync", "was SyncSource, missed the resync finished event, corrected myself");
            local.push_history(my_bm);
            local.bitmap[ctx.peer_slot] = 0;
            34
        } else {
            info!(target: "bpx::sync", "was SyncSource (peer failed to write sync uuid)");
            36
        };
        return Some(CompareResult {
            hg: 1,
            rule,
            peer_node_id: None,
        });
    }

    if my_bm == 0 && peer_bm != 0 {
        if ctx.protocol < 91 {
            return Some(CompareResult {
                hg: -1091,
                rule: 35,
                peer_node_id: None,
            });
        }
        let rule = if strip(local.history[0]) == strip(peer_bm)
            && strip(local.history[1]) == strip(peer.history[0])
        {
            info!(target: "bpx::sync", "was SyncTarget, peer missed the resync finished event, corrected peer");
            peer.push_history(peer_bm);
            peer.set_bitmap_for(ctx.my_node_id, 0);
            35
        } else {
            info!(target: "bpx::sync", "was SyncTarget (failed to write sync uuid)");
            37
        };
        return Some(CompareResult {
            hg: -1,
            rule,
            peer_node_id: None,
        });
    }

    None
}

/// The last sync-uuid packet was lost: undo the peer-side start-of-resync
/// UUID rotation.
fn fixup_resync_start1(
    local: &mut UuidSet,
    peer: &mut PeerUuidView,
    ctx: &CompareCtx,
) -> Option<CompareResult> {
    let self_cur = strip(local.current);
    let peer_h0 = strip(peer.history[0]);
    if self_cur != peer_h0 {
        return None;
    }

    let evidence = if ctx.protocol < 96 {
        strip(local.history[0]) == strip(peer.history[1])
    } else {
        peer_h0 + UUID_NEW_BM_OFFSET == strip(peer.bitmap_for(ctx.my_node_id))
    };
    if !evidence {
        return None;
    }

    if ctx.protocol < 91 {
        return Some(CompareResult {
            hg: -1091,
            rule: 51,
            peer_node_id: None,
        });
    }

    let restored = peer.pull_history();
    peer.set_bitmap_for(ctx.my_node_id, restored);
    info!(target: "bpx::sync", "lost last sync uuid packet, corrected peer vectors");
    Some(CompareResult {
        hg: -1,
        rule: 51,
        peer_node_id: None,
    })
}

/// Same loss, seen from the other side: undo our own start-of-resync
/// rotation.
fn fixup_resync_start2(
    local: &mut UuidSet,
    peer: &mut PeerUuidView,
    ctx: &CompareCtx,
) -> Option<CompareResult> {
    let self_h0 = strip(local.history[0]);
    let peer_cur = strip(peer.current);
    if self_h0 != peer_cur {
        return None;
    }

    let evidence = if ctx.protocol < 96 {
        strip(local.history[1]) == strip(peer.history[0])
    } else {
        self_h0 + UUID_NEW_BM_OFFSET == strip(local.bitmap[ctx.peer_slot])
    };
    if !evidence {
        return None;
    }

    if ctx.protocol < 91 {
        return Some(CompareResult {
            hg: -1091,
            rule: 71,
            peer_node_id: None,
        });
    }

    let bitmap_uuid = local.pull_history();
    local.bitmap[ctx.peer_slot] = bitmap_uuid;
    info!(target: "bpx::sync", "last sync uuid did not get through, corrected own vectors");
    Some(CompareResult {
        hg: 1,
        rule: 71,
        peer_node_id: None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ctx() -> CompareCtx {
        CompareCtx {
            my_node_id: 0,
            peer_slot: 0,
            crashed_primary: false,
            peer_crashed_primary: false,
            resolve_conflicts: false,
            protocol: 110,
        }
    }

    fn local_with(current: u64) -> UuidSet {
        let mut l = UuidSet::new(vec![1]);
        l.current = current;
        l
    }

    fn peer_with(current: u64) -> PeerUuidView {
        PeerUuidView {
            current,
            ..Default::default()
        }
    }

    /// Build the peer-side inputs mirroring a local/peer pair, so that
    /// compare can be run from the other node's point of view.
    fn flipped(local: &UuidSet, peer: &PeerUuidView, c: &CompareCtx) -> (UuidSet, PeerUuidView, CompareCtx) {
        let mut l = UuidSet::new(vec![c.my_node_id]);
        l.current = peer.current;
        l.bitmap = vec![peer.bitmap_for(c.my_node_id)];
        l.history = peer.history;
        let p = PeerUuidView {
            current: local.current,
            bitmap_uuids: vec![(1, local.bitmap[c.peer_slot])],
            history: local.history,
            dirty_bits: 0,
            flags: 0,
        };
        let fc = CompareCtx {
            my_node_id: 1,
            peer_slot: 0,
            crashed_primary: c.peer_crashed_primary,
            peer_crashed_primary: c.crashed_primary,
            resolve_conflicts: !c.resolve_conflicts,
            protocol: c.protocol,
        };
        (l, p, fc)
    }

    #[test]
    fn test_rule10_both_just_created() {
        let mut l = local_with(UUID_JUST_CREATED);
        let mut p = peer_with(UUID_JUST_CREATED);
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!((r.hg, r.rule), (0, 10));
    }

    #[test]
    fn test_rule20_30_fresh_copy() {
        let mut l = local_with(UUID_JUST_CREATED);
        let mut p = peer_with(0x1234_5678_9abc_def0);
        assert_eq!(uuid_compare(&mut l, &mut p, &ctx()).hg, -2);

        let mut l = local_with(0x1234_5678_9abc_def0);
        let mut p = peer_with(UUID_JUST_CREATED);
        assert_eq!(uuid_compare(&mut l, &mut p, &ctx()).hg, 2);
    }

    #[test]
    fn test_rule40_equal_currents_no_crash() {
        // Boundary scenario 1: identical currents, no crashed primary.
        let mut l = local_with(0xAAAA_0000_0000_0000);
        let mut p = peer_with(0xAAAA_0000_0000_0000);
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!((r.hg, r.rule), (0, 40));
    }

    #[test]
    fn test_rule40_two_crashed_primaries_tiebreaks() {
        let mut c = ctx();
        c.crashed_primary = true;
        c.peer_crashed_primary = true;

        let mut l = local_with(0xAAAA);
        let mut p = peer_with(0xAAAA);
        c.resolve_conflicts = true;
        assert_eq!(uuid_compare(&mut l, &mut p, &c).hg, -1);
        c.resolve_conflicts = false;
        assert_eq!(uuid_compare(&mut l, &mut p, &c).hg, 1);
    }

    #[test]
    fn test_rule50_target_with_bitmap() {
        let mut l = local_with(0xAAAA);
        let mut p = peer_with(0xBBBB);
        p.bitmap_uuids = vec![(0, 0xAAAB)]; // stripped equal to 0xAAAA
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!((r.hg, r.rule), (-1, 50));
    }

    #[test]
    fn test_rule52_copy_slot() {
        let mut l = local_with(0xAAAA);
        let mut p = peer_with(0xBBBB);
        p.bitmap_uuids = vec![(3, 0xAAAA)];
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!((r.hg, r.rule), (-3, 52));
        assert_eq!(r.peer_node_id, Some(3));
    }

    #[test]
    fn test_rule60_target_set_bitmap() {
        // Boundary scenario 2: our current appears in the peer's history,
        // so the peer moved on without us. Full-bitmap resync, peer first.
        let mut a = local_with(0xAAAA);
        a.history = [0, 0];
        let mut b_view = peer_with(0xCCCC);
        b_view.history = [0xAAAA, 0];
        let r = uuid_compare(&mut a, &mut b_view, &ctx());
        assert_eq!((r.hg, r.rule), (-2, 60));
    }

    #[test]
    fn test_rule70_source_use_bitmap() {
        let mut l = local_with(0xAAAA);
        l.bitmap[0] = 0xBBBB;
        let mut p = peer_with(0xBBBB);
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!((r.hg, r.rule), (1, 70));
    }

    #[test]
    fn test_rule80_source_set_bitmap() {
        let mut l = local_with(0xAAAA);
        l.history[0] = 0xBBBB;
        let mut p = peer_with(0xBBBB);
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!((r.hg, r.rule), (2, 80));
    }

    #[test]
    fn test_rule90_split_brain_candidate() {
        let mut l = local_with(0xAAAA);
        l.bitmap[0] = 0xEEEE;
        let mut p = peer_with(0xBBBB);
        p.bitmap_uuids = vec![(0, 0xEEEE)];
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!((r.hg, r.rule), (100, 90));
    }

    #[test]
    fn test_rule100_history_split_brain() {
        let mut l = local_with(0xAAAA);
        l.history = [0xEEEE, 0];
        let mut p = peer_with(0xBBBB);
        p.history = [0xFFFF, 0xEEEE];
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!((r.hg, r.rule), (-100, 100));
    }

    #[test]
    fn test_unrelated_data() {
        let mut l = local_with(0xAAAA);
        let mut p = peer_with(0xBBBB);
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!(r.hg, -1000);
    }

    #[test]
    fn test_antisymmetry_rules_10_to_80() {
        let cases: Vec<(UuidSet, PeerUuidView)> = vec![
            // rule 50/70 pair
            {
                let mut l = local_with(0xAAAA);
                l.bitmap[0] = 0;
                let mut p = peer_with(0xBBBB);
                p.bitmap_uuids = vec![(0, 0xAAAA)];
                (l, p)
            },
            // rule 60/80 pair
            {
                let l = local_with(0xAAAA);
                let mut p = peer_with(0xBBBB);
                p.history = [0xAAAA, 0];
                (l, p)
            },
            // rule 20/30 pair
            {
                let l = local_with(UUID_JUST_CREATED);
                let p = peer_with(0xBBBB);
                (l, p)
            },
            // rule 40 symmetric zero
            {
                let l = local_with(0xAAAA);
                let p = peer_with(0xAAAA);
                (l, p)
            },
        ];

        for (l, p) in cases {
            let c = ctx();
            let mut l1 = l.clone();
            let mut p1 = p.clone();
            let fwd = uuid_compare(&mut l1, &mut p1, &c);
            let (mut l2, mut p2, c2) = flipped(&l, &p, &c);
            let rev = uuid_compare(&mut l2, &mut p2, &c2);
            assert_eq!(fwd.hg, -rev.hg, "rule {} vs {}", fwd.rule, rev.rule);
        }
    }

    #[test]
    fn test_fixup_resync_end_requires_proto_91() {
        let mut c = ctx();
        c.protocol = 90;
        let mut l = local_with(0xAAAA);
        l.bitmap[0] = 0xCCCC;
        let mut p = peer_with(0xAAAA);
        let r = uuid_compare(&mut l, &mut p, &c);
        assert_eq!(r.hg, -1091);
    }

    #[test]
    fn test_fixup_resync_end_corrects_self() {
        // We were SyncSource; the resync finished but we missed the event.
        let mut c = ctx();
        c.protocol = 100;
        let mut l = local_with(0xAAAA);
        l.bitmap[0] = 0xCCCC;
        l.history = [0xCCCC, 0];
        let mut p = peer_with(0xAAAA);
        p.history = [0xCCCC, 0];
        let r = uuid_compare(&mut l, &mut p, &c);
        assert_eq!((r.hg, r.rule), (1, 34));
        // The bitmap uuid rotated into history.
        assert_eq!(l.bitmap[0], 0);
        assert_eq!(l.history[0], 0xCCCC);
    }

    #[test]
    fn test_fixup_sync_uuid_lost_peer_side() {
        // Protocol >= 96 evidence: peer's bitmap-for-me is history[0] plus
        // the new-bitmap offset.
        let mut c = ctx();
        c.protocol = 100;
        let mut l = local_with(0xAAAA);
        let mut p = peer_with(0xBBBB);
        p.history = [0xAAAA, 0x9999];
        p.bitmap_uuids = vec![(0, 0xAAAA + UUID_NEW_BM_OFFSET)];
        let r = uuid_compare(&mut l, &mut p, &c);
        assert_eq!((r.hg, r.rule), (-1, 51));
        // The peer's vectors were rewound.
        assert_eq!(p.bitmap_for(0), 0xAAAA);
        assert_eq!(p.history[0], 0x9999);
    }

    #[test]
    fn test_fixups_disabled_at_110() {
        // Same vectors as the lost-sync-uuid case, but a 110 peer: the
        // fixup must not run, rule 60 wins instead.
        let mut l = local_with(0xAAAA);
        let mut p = peer_with(0xBBBB);
        p.history = [0xAAAA, 0x9999];
        p.bitmap_uuids = vec![(0, 0xAAAA + UUID_NEW_BM_OFFSET)];
        let r = uuid_compare(&mut l, &mut p, &ctx());
        assert_eq!((r.hg, r.rule), (-2, 60));
    }
}
