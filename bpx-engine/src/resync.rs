//! Resync driver.
//!
//! The SyncTarget side turns out-of-sync bits into a backlog of block
//! requests and keeps a bounded window of them in flight on the data
//! socket; each arriving RSDataReply is written out, acknowledged with
//! RsWriteAck and refills the window. The SyncSource side only serves
//! requests and watches its bitmap slot drain through the ack channel.
//! Verify runs the same loop with digests instead of payloads.

use crate::block::SyncBitmap;
use crate::connection::Connection;
use crate::peer_device::{PeerDevice, RsPending};
use crate::sender::{self, SocketKind};
use crate::state::ReplState;
use bpx_core::Result;
use bpx_wire::{BlockRequestPayload, Command};
use std::sync::atomic::Ordering;
use tracing::info;

/// In-flight resync requests per peer device.
const RS_WINDOW: usize = 32;
/// One out-of-sync bit covers a 4 KiB block, eight sectors.
pub const BM_BLOCK_SIZE: u32 = 4096;
pub const BM_SECT_PER_BIT: u64 = (BM_BLOCK_SIZE >> bpx_core::SECTOR_SHIFT) as u64;

pub async fn start_resync(conn: &Connection, volume: u16, side: ReplState) -> Result<()> {
    let Some(pd) = conn.peer_device(volume as i16) else {
        return Ok(());
    };
    let weight = pd.device.bitmap.total_weight(pd.bitmap_slot);
    pd.rs_total.store(weight, Ordering::Relaxed);
    pd.rs_failed.store(0, Ordering::Relaxed);

    match side {
        ReplState::SyncSource => {
            info!(
                target: "bpx::resync",
                volume,
                peer = pd.peer_node_id,
                out_of_sync = weight,
                "starting resync as source"
            );
            pd.set_repl_state(ReplState::SyncSource);
            if weight == 0 {
                finish_resync(conn, &pd, false);
            }
        }
        ReplState::SyncTarget => {
            info!(
                target: "bpx::resync",
                volume,
                peer = pd.peer_node_id,
                out_of_sync = weight,
                "starting resync as target"
            );
            pd.set_repl_state(ReplState::SyncTarget);
            {
                let words = pd.device.bitmap.snapshot_words(pd.bitmap_slot);
                let total_bits = pd.device.bitmap.total_bits();
                let mut backlog = pd.rs_backlog.lock().unwrap_or_else(|e| e.into_inner());
                backlog.clear();
                for bit in 0..total_bits {
                    if (words[(bit / 64) as usize] >> (bit % 64)) & 1 != 0 {
                        backlog.push_back(bit);
                    }
                }
            }
            request_more(conn, &pd).await?;
        }
        _ => {}
    }
    Ok(())
}

/// Top up the request window from the backlog.
pub async fn request_more(conn: &Connection, pd: &PeerDevice) -> Result<()> {
    loop {
        let next = {
            let mut pending = pd.rs_pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.len() >= RS_WINDOW {
                None
            } else {
                let mut backlog = pd.rs_backlog.lock().unwrap_or_else(|e| e.into_inner());
                backlog.pop_front().map(|bit| {
                    let sector = bit * BM_SECT_PER_BIT;
                    let cookie = pending.insert(RsPending {
                        sector,
                        size: BM_BLOCK_SIZE,
                    });
                    (cookie, sector)
                })
            }
        };
        let Some((cookie, sector)) = next else { break };
        let payload = BlockRequestPayload {
            sector,
            block_id: cookie.as_u64(),
            blksize: BM_BLOCK_SIZE,
        }
        .encode();
        sender::send_packet(
            conn,
            SocketKind::Data,
            Command::RsDataRequest,
            pd.volume as i16,
            &payload,
        )
        .await?;
    }
    maybe_finish_target(conn, pd);
    Ok(())
}

/// A resync write settled: refill the window and check for completion.
pub async fn note_rs_write_done(conn: &Connection, pd: &PeerDevice) -> Result<()> {
    if pd.repl_state() == ReplState::SyncTarget {
        request_more(conn, pd).await?;
    }
    Ok(())
}

fn maybe_finish_target(conn: &Connection, pd: &PeerDevice) {
    if pd.repl_state() != ReplState::SyncTarget {
        return;
    }
    let pending = pd
        .rs_pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .len();
    let backlog = pd
        .rs_backlog
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .len();
    if pending == 0 && backlog == 0 && pd.device.bitmap.total_weight(pd.bitmap_slot) == 0 {
        finish_resync(conn, pd, true);
    }
}

/// Source side: an RsWriteAck cleared bits; finish once the slot drains.
pub fn note_source_progress(conn: &Connection, pd: &PeerDevice) {
    if pd.repl_state() == ReplState::SyncSource
        && pd.device.bitmap.total_weight(pd.bitmap_slot) == 0
    {
        finish_resync(conn, pd, false);
    }
}

pub fn finish_resync(conn: &Connection, pd: &PeerDevice, as_target: bool) {
    let failed = pd.rs_failed.load(Ordering::Relaxed);
    let total = pd.rs_total.load(Ordering::Relaxed);
    info!(
        target: "bpx::resync",
        volume = pd.volume,
        peer = pd.peer_node_id,
        total,
        failed,
        role = if as_target { "target" } else { "source" },
        "resync finished"
    );

    {
        let mut uuids = pd
            .device
            .uuids
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if as_target {
            // Adopt the source's data generation.
            let peer_current = pd
                .peer_uuids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .current;
            if peer_current != 0 {
                let old = uuids.current;
                uuids.push_history(old);
                uuids.current = peer_current;
            }
            uuids.bitmap[pd.bitmap_slot] = 0;
        } else {
            let bm = uuids.bitmap[pd.bitmap_slot];
            if bm != 0 {
                uuids.push_history(bm);
                uuids.bitmap[pd.bitmap_slot] = 0;
            }
        }
    }

    pd.set_repl_state(ReplState::Established);
    conn.resource.state_notify.notify_waiters();
}

/// One verify result accounted; finish the verify pass when none remain.
pub async fn note_verify_progress(conn: &Connection, pd: &PeerDevice) -> Result<()> {
    let prev = pd
        .ov_left
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(1))
        })
        .unwrap_or(0);
    if prev <= 1 && pd.repl_state().is_verify() {
        info!(
            target: "bpx::resync",
            volume = pd.volume,
            peer = pd.peer_node_id,
            "online verify finished"
        );
        pd.set_repl_state(ReplState::Established);
        conn.resource.state_notify.notify_waiters();
    }
    Ok(())
}
