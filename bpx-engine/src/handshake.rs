//! The resync-role handshake.
//!
//! Runs when both sides have reported their UUIDs and states: compares the
//! UUID vectors, applies the disk-state override, walks the configured
//! split-brain recovery ladder if needed, and decides whether replication
//! starts clean or which side resyncs which.

use crate::block::{HelperEvent, PolicyHelper, SyncBitmap};
use crate::config::AfterSbPolicy;
use crate::connection::{Connection, CONN_DRY_RUN, CONN_RESOLVE_CONFLICTS};
use crate::peer_device::PeerDevice;
use crate::state::{DiskState, ReplState, Role};
use crate::uuids::{uuid_compare, CompareCtx};
use bpx_core::{PlexError, Result};
use tracing::{info, warn};

/// Outcome of the handshake: the replication state to enter.
pub fn sync_handshake(
    conn: &Connection,
    pd: &PeerDevice,
    peer_role: Role,
    peer_disk_state: DiskState,
) -> Result<ReplState> {
    let device = &pd.device;
    let disk_state = device.disk_state();
    let net = conn.net();

    let (mut hg, rule, peer_node_id) = {
        let mut local = device.uuids.lock().unwrap_or_else(|e| e.into_inner());
        let mut peer = pd.peer_uuids.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = CompareCtx {
            my_node_id: conn.resource.opts.node_id,
            peer_slot: pd.bitmap_slot,
            crashed_primary: device
                .crashed_primary
                .load(std::sync::atomic::Ordering::Acquire),
            peer_crashed_primary: peer.flags & bpx_wire::UUID_FLAG_CRASHED_PRIMARY != 0,
            resolve_conflicts: conn.flag(CONN_RESOLVE_CONFLICTS),
            protocol: conn.version(),
        };
        let r = uuid_compare(&mut local, &mut peer, &ctx);
        (r.hg, r.rule, r.peer_node_id)
    };

    info!(
        target: "bpx::sync",
        volume = pd.volume,
        hg,
        rule,
        "sync handshake"
    );

    if hg == -1000 {
        warn!(target: "bpx::sync", volume = pd.volume, "unrelated data, aborting");
        return Err(PlexError::UnrelatedData);
    }
    if hg < -1000 {
        return Err(PlexError::ProtocolTooOld((-hg - 1000) as u32));
    }

    // An inconsistent disk on one side forces the direction regardless of
    // the UUID verdict.
    if (disk_state == DiskState::Inconsistent && peer_disk_state > DiskState::Inconsistent)
        || (peer_disk_state == DiskState::Inconsistent && disk_state > DiskState::Inconsistent)
    {
        let full = hg == -100 || hg.abs() == 2;
        hg = if disk_state > DiskState::Inconsistent {
            1
        } else {
            -1
        };
        if full {
            hg *= 2;
        }
        info!(
            target: "bpx::sync",
            volume = pd.volume,
            direction = if hg > 0 { "source" } else { "target" },
            "becoming sync side due to disk states"
        );
    }

    if hg.abs() == 100 {
        conn.helper.invoke(HelperEvent::InitialSplitBrain);
    }

    if hg == 100 || (hg == -100 && net.always_asbp) {
        let pcount = u32::from(conn.resource.role() == Role::Primary)
            + u32::from(peer_role == Role::Primary);
        let forced = hg == -100;

        hg = match pcount {
            0 => recover_0p(conn, pd),
            1 => recover_1p(conn, pd, peer_role),
            _ => recover_2p(conn, pd),
        };
        if hg.abs() < 100 {
            warn!(
                target: "bpx::sync",
                volume = pd.volume,
                primaries = pcount,
                sync_from = if hg < 0 { "peer" } else { "this" },
                "split-brain detected, automatically solved"
            );
            if forced {
                warn!(target: "bpx::sync", "doing a full sync, since the UUIDs were ambiguous");
                hg *= 2;
            }
        }
    }

    if hg == -100 {
        let my_discard = device
            .discard_my_data
            .load(std::sync::atomic::Ordering::Acquire);
        let peer_discard = {
            let peer = pd.peer_uuids.lock().unwrap_or_else(|e| e.into_inner());
            peer.flags & bpx_wire::UUID_FLAG_DISCARD_MY_DATA != 0
        };
        if my_discard && !peer_discard {
            hg = -1;
        }
        if !my_discard && peer_discard {
            hg = 1;
        }
        if hg.abs() < 100 {
            warn!(
                target: "bpx::sync",
                volume = pd.volume,
                sync_from = if hg < 0 { "peer" } else { "this" },
                "split-brain detected, manually solved"
            );
        }
    }

    if hg == -100 {
        warn!(target: "bpx::sync", volume = pd.volume, "split-brain detected but unresolved, dropping connection");
        conn.helper.invoke(HelperEvent::SplitBrain);
        return Err(PlexError::SplitBrain);
    }

    if hg > 0 && disk_state <= DiskState::Inconsistent {
        warn!(target: "bpx::sync", volume = pd.volume, "I shall become SyncSource, but I am inconsistent");
        return Err(PlexError::HandshakeRefused(
            "sync source with inconsistent disk".into(),
        ));
    }

    if hg < 0 && conn.resource.role() == Role::Primary && disk_state >= DiskState::Consistent {
        match net.rr_conflict {
            AfterSbPolicy::CallHelper => {
                conn.helper.invoke(HelperEvent::PriLost);
                warn!(target: "bpx::sync", volume = pd.volume, "I shall become SyncTarget, but I am primary");
                return Err(PlexError::HandshakeRefused("primary as sync target".into()));
            }
            AfterSbPolicy::Violently => {
                warn!(target: "bpx::sync", volume = pd.volume, "becoming SyncTarget, violating the stable-data assumption");
            }
            _ => {
                warn!(target: "bpx::sync", volume = pd.volume, "I shall become SyncTarget, but I am primary");
                return Err(PlexError::HandshakeRefused("primary as sync target".into()));
            }
        }
    }

    if net.tentative || conn.flag(CONN_DRY_RUN) {
        if hg == 0 {
            info!(target: "bpx::sync", "dry-run connect: no resync, would become connected immediately");
        } else {
            info!(
                target: "bpx::sync",
                side = if hg > 0 { "SyncSource" } else { "SyncTarget" },
                kind = if hg.abs() >= 2 { "full" } else { "bit-map based" },
                "dry-run connect"
            );
        }
        return Err(PlexError::DryRun("handshake evaluated, disconnecting".into()));
    }

    let bitmap = &device.bitmap;
    if hg == 3 {
        // The peer synced up with a third node; take over that bitmap.
        if let Some(node) = peer_node_id {
            let uuids = device.uuids.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(from_slot) = uuids.slot_node_ids.iter().position(|&n| n == node) {
                info!(target: "bpx::sync", volume = pd.volume, node, "peer synced up with another node, copying bitmap");
                bitmap.copy_slot(from_slot, pd.bitmap_slot);
            }
        }
    } else if hg == -3 {
        info!(target: "bpx::sync", volume = pd.volume, "synced up with another node in the mean time");
        bitmap.clear_all(pd.bitmap_slot);
    } else if hg.abs() >= 2 {
        info!(target: "bpx::sync", volume = pd.volume, "writing the whole bitmap, full sync required");
        bitmap.set_all(pd.bitmap_slot);
    }

    if hg > 0 {
        return Ok(ReplState::WFBitmapS);
    }
    if hg < 0 {
        return Ok(ReplState::WFBitmapT);
    }

    let bm_uuid = {
        let uuids = device.uuids.lock().unwrap_or_else(|e| e.into_inner());
        uuids.bitmap[pd.bitmap_slot]
    };
    let weight = bitmap.total_weight(pd.bitmap_slot);
    if bm_uuid != 0 {
        info!(
            target: "bpx::sync",
            volume = pd.volume,
            bits = weight,
            "clearing bitmap UUID and bitmap content"
        );
        device
            .uuids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bitmap[pd.bitmap_slot] = 0;
        bitmap.clear_all(pd.bitmap_slot);
    } else if weight > 0 {
        info!(target: "bpx::sync", volume = pd.volume, bits = weight, "no resync, but bits in bitmap");
    }
    Ok(ReplState::Established)
}

/// Recover after split brain with no remaining primaries.
fn recover_0p(conn: &Connection, pd: &PeerDevice) -> i32 {
    let device = &pd.device;
    let net = conn.net();
    let (self_bit, peer_bit, ch_peer) = {
        let uuids = device.uuids.lock().unwrap_or_else(|e| e.into_inner());
        let peer = pd.peer_uuids.lock().unwrap_or_else(|e| e.into_inner());
        (
            uuids.bitmap[pd.bitmap_slot] & 1,
            peer.bitmap_for(conn.resource.opts.node_id) & 1,
            peer.dirty_bits,
        )
    };
    let ch_self = device.bitmap.total_weight(pd.bitmap_slot);
    let resolve = conn.flag(CONN_RESOLVE_CONFLICTS);

    let mut policy = net.after_sb_0p;
    let mut rv = -100;
    loop {
        match policy {
            AfterSbPolicy::Consensus
            | AfterSbPolicy::DiscardSecondary
            | AfterSbPolicy::CallHelper
            | AfterSbPolicy::Violently => {
                warn!(target: "bpx::sync", "configuration error in after-sb-0pri");
                break;
            }
            AfterSbPolicy::Disconnect => break,
            AfterSbPolicy::DiscardYoungerPrimary => {
                if self_bit == 0 && peer_bit == 1 {
                    rv = -1;
                    break;
                }
                if self_bit == 1 && peer_bit == 0 {
                    rv = 1;
                    break;
                }
                policy = AfterSbPolicy::DiscardOlderPrimary;
            }
            AfterSbPolicy::DiscardOlderPrimary => {
                if self_bit == 0 && peer_bit == 1 {
                    rv = 1;
                    break;
                }
                if self_bit == 1 && peer_bit == 0 {
                    rv = -1;
                    break;
                }
                warn!(
                    target: "bpx::sync",
                    "discard younger/older primary did not find a decision, using discard-least-changes instead"
                );
                policy = AfterSbPolicy::DiscardZeroChanges;
            }
            AfterSbPolicy::DiscardZeroChanges => {
                if ch_peer == 0 && ch_self == 0 {
                    rv = if resolve { -1 } else { 1 };
                    break;
                }
                if ch_peer == 0 {
                    rv = 1;
                    break;
                }
                if ch_self == 0 {
                    rv = -1;
                    break;
                }
                if net.after_sb_0p == AfterSbPolicy::DiscardZeroChanges {
                    break;
                }
                policy = AfterSbPolicy::DiscardLeastChanges;
            }
            AfterSbPolicy::DiscardLeastChanges => {
                rv = if ch_self < ch_peer {
                    -1
                } else if ch_self > ch_peer {
                    1
                } else if resolve {
                    -1
                } else {
                    1
                };
                break;
            }
            AfterSbPolicy::DiscardLocal => {
                rv = -1;
                break;
            }
            AfterSbPolicy::DiscardRemote => {
                rv = 1;
                break;
            }
        }
    }
    rv
}

/// Recover after split brain with one remaining primary.
fn recover_1p(conn: &Connection, pd: &PeerDevice, _peer_role: Role) -> i32 {
    let net = conn.net();
    let role = conn.resource.role();
    match net.after_sb_1p {
        AfterSbPolicy::Disconnect => -100,
        AfterSbPolicy::Consensus => {
            let hg = recover_0p(conn, pd);
            if (hg == -1 && role == Role::Secondary) || (hg == 1 && role == Role::Primary) {
                hg
            } else {
                -100
            }
        }
        AfterSbPolicy::Violently => recover_0p(conn, pd),
        AfterSbPolicy::DiscardSecondary => {
            if role == Role::Primary {
                1
            } else {
                -1
            }
        }
        AfterSbPolicy::CallHelper => {
            let hg = recover_0p(conn, pd);
            if hg == -1 && role == Role::Primary {
                // Yield the primary role to survive as sync target.
                conn.resource.set_role(Role::Secondary);
                warn!(target: "bpx::sync", "successfully gave up primary role");
                hg
            } else {
                hg
            }
        }
        _ => {
            warn!(target: "bpx::sync", "configuration error in after-sb-1pri");
            -100
        }
    }
}

/// Recover after split brain with two remaining primaries.
fn recover_2p(conn: &Connection, pd: &PeerDevice) -> i32 {
    let net = conn.net();
    match net.after_sb_2p {
        AfterSbPolicy::Disconnect => -100,
        AfterSbPolicy::Violently => recover_0p(conn, pd),
        AfterSbPolicy::CallHelper => {
            let hg = recover_0p(conn, pd);
            if hg == -1 {
                conn.resource.set_role(Role::Secondary);
                warn!(target: "bpx::sync", "successfully gave up primary role");
            }
            hg
        }
        _ => {
            warn!(target: "bpx::sync", "configuration error in after-sb-2pri");
            -100
        }
    }
}
