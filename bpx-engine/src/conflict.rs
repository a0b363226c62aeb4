//! Write conflict handling for two-primaries operation.
//!
//! A peer write entering the pipeline is inserted into the device's
//! interval tree, which blocks new conflicting local requests. Existing
//! overlaps are then walked: remote overlaps are waited out, local ones
//! are decided by the conflict-resolution owner (discard the peer write
//! when it is fully contained in ours, retry it otherwise) or waited on
//! when the peer owns the decision.

use crate::connection::{Connection, CONN_RESOLVE_CONFLICTS};
use crate::epoch::EpochEvent;
use crate::peer_device::PeerDevice;
use crate::request::{EeQueue, RequestId, EE_RESTART_REQUESTS};
use crate::resource::Device;
use crate::sender;
use crate::state::ConnState;
use bpx_core::{Cookie, IntervalRef, PlexError, Result};
use bpx_wire::Command;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// No live conflict remains; submit the write.
    Proceed,
    /// The write was discarded or deferred; the caller must not submit.
    Discarded,
}

enum Action {
    Proceed,
    /// Wait for this interval to leave the tree.
    Wait(IntervalRef),
    /// We own the tie-break: discard (fully contained) or ask for a retry.
    Resolve { discard: bool },
    /// The tree was released mid-walk; scan again from the top.
    Rescan,
}

pub async fn handle_write_conflicts(
    conn: &Connection,
    pd: &PeerDevice,
    req_id: RequestId,
) -> Result<ConflictOutcome> {
    let device = &pd.device;
    let resolve_conflicts = conn.flag(CONN_RESOLVE_CONFLICTS);

    loop {
        let action = next_action(device, req_id, resolve_conflicts)?;
        match action {
            Action::Proceed => return Ok(ConflictOutcome::Proceed),
            Action::Rescan => {}
            Action::Wait(iv) => {
                wait_for_interval(conn, device, iv).await.map_err(|e| {
                    fail_postponed_requests(device, req_id);
                    detach_interval(device, req_id);
                    e
                })?;
            }
            Action::Resolve { discard } => {
                let cmd = if discard {
                    Command::Superseded
                } else if conn.version() >= 100 {
                    Command::RetryWrite
                } else {
                    Command::Superseded
                };
                discard_peer_write(conn, pd, req_id, cmd).await?;
                return Ok(ConflictOutcome::Discarded);
            }
        }
    }
}

fn next_action(device: &Device, req_id: RequestId, resolve_conflicts: bool) -> Result<Action> {
    let (sector, size, my_iv) = {
        let ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
        let req = ee
            .get(req_id)
            .ok_or_else(|| PlexError::NotFound(format!("peer request {req_id}")))?;
        (req.sector, req.size, req.interval)
    };

    let mut intervals = device.intervals.lock().unwrap_or_else(|e| e.into_inner());
    let overlaps = intervals.overlaps(sector, size);
    for r in overlaps {
        if Some(r) == my_iv {
            continue;
        }
        let Some(iv) = intervals.get(r) else { continue };

        if !iv.local {
            // A conflicting write from the same peer; does not happen in a
            // two-node setup. Wait for it to settle.
            intervals.set_waiting(r);
            return Ok(Action::Wait(r));
        }

        let equal = iv.sector == sector && iv.size == size;
        if resolve_conflicts {
            let discard = iv.contains(sector, size);
            if !equal {
                warn!(
                    target: "bpx::recv",
                    local_sector = iv.sector,
                    local_size = iv.size,
                    remote_sector = sector,
                    remote_size = size,
                    winner = if discard { "local" } else { "remote" },
                    "concurrent writes detected"
                );
            }
            return Ok(Action::Resolve { discard });
        }

        // The peer owns the decision. If our local request is still being
        // written or has not been postponed, wait for it; otherwise
        // remember to restart it after the peer write completes.
        let token = iv.token;
        let waiting = {
            let locals = device
                .local_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            locals
                .get(Cookie::from_raw(token))
                .map_or(true, |l| l.pending_local || !l.postponed)
        };
        if waiting {
            if !equal {
                warn!(
                    target: "bpx::recv",
                    local_sector = iv.sector,
                    local_size = iv.size,
                    remote_sector = sector,
                    remote_size = size,
                    "concurrent writes detected, peer decides"
                );
            }
            intervals.set_waiting(r);
            return Ok(Action::Wait(r));
        }
        drop(intervals);
        let mut ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(req) = ee.get_mut(req_id) {
            req.flags |= EE_RESTART_REQUESTS;
        }
        return Ok(Action::Rescan);
    }
    Ok(Action::Proceed)
}

async fn wait_for_interval(conn: &Connection, device: &Device, iv: IntervalRef) -> Result<()> {
    loop {
        {
            let intervals = device.intervals.lock().unwrap_or_else(|e| e.into_inner());
            if intervals.get(iv).is_none() {
                return Ok(());
            }
        }
        if conn.cstate().is_tearing_down() {
            return Err(PlexError::NetworkFatal(
                "connection lost while waiting on a conflicting write".into(),
            ));
        }
        let timeout = conn.net().socket_timeout;
        let notified = device.misc_notify.notified();
        if tokio::time::timeout(timeout, notified).await.is_err()
            && conn.cstate() < ConnState::Connected
        {
            return Err(PlexError::Timeout("conflicting write"));
        }
    }
}

/// Emit the discard/retry ack, settle the epoch and drop the request.
async fn discard_peer_write(
    conn: &Connection,
    pd: &PeerDevice,
    req_id: RequestId,
    cmd: Command,
) -> Result<()> {
    let device = &pd.device;
    let req = {
        let mut ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
        ee.move_to(req_id, EeQueue::Active, EeQueue::Done)?;
        match ee.take(req_id) {
            Some(r) => r,
            None => return Ok(()),
        }
    };

    sender::send_block_ack(
        conn,
        cmd,
        req.volume as i16,
        req.sector,
        req.block_id,
        req.size,
        req.peer_seq,
    )
    .await?;

    if let Some(iv) = req.interval {
        device
            .intervals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(iv);
        device.misc_notify.notify_waiters();
    }

    if let Some(serial) = req.epoch_serial {
        let wo = conn.resource.write_ordering();
        let out = {
            let mut epochs = conn.epochs.lock().unwrap_or_else(|e| e.into_inner());
            epochs.apply(serial, EpochEvent::Put, false, wo)
        };
        crate::worker::handle_epoch_outcome(conn, out).await?;
    }

    conn.recv_order
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|&(v, id)| !(v == req.volume && id == req.id));

    if let Some(data) = req.data {
        device.pool.release(data.len(), None);
    }
    Ok(())
}

/// Remove a peer request's interval after a failed conflict wait.
fn detach_interval(device: &Device, req_id: RequestId) {
    let iv = {
        let mut ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
        ee.get_mut(req_id).and_then(|r| r.interval.take())
    };
    if let Some(iv) = iv {
        device
            .intervals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(iv);
        device.misc_notify.notify_waiters();
    }
}

/// Abandon local requests that were postponed waiting for a conflict
/// decision that will never arrive.
pub fn fail_postponed_requests(device: &Device, req_id: RequestId) {
    let (sector, size) = {
        let ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
        match ee.get(req_id) {
            Some(r) => (r.sector, r.size),
            None => return,
        }
    };
    loop {
        let target = {
            let intervals = device.intervals.lock().unwrap_or_else(|e| e.into_inner());
            let locals = device
                .local_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            intervals.overlaps(sector, size).into_iter().find_map(|r| {
                let iv = intervals.get(r)?;
                if !iv.local {
                    return None;
                }
                let cookie = Cookie::from_raw(iv.token);
                locals
                    .get(cookie)
                    .is_some_and(|l| l.postponed)
                    .then_some((r, cookie))
            })
        };
        let Some((r, cookie)) = target else { break };
        {
            let mut locals = device
                .local_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(mut l) = locals.take(cookie) {
                l.completed = Some(false);
            }
        }
        device
            .intervals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(r);
        device.misc_notify.notify_waiters();
    }
}

/// Data writes while we are SyncTarget wait for overlapping resync writes
/// to settle, so application data never loses to stale resync data.
pub async fn wait_no_overlapping_resync(
    conn: &Connection,
    device: &Arc<Device>,
    sector: u64,
    size: u32,
) -> Result<()> {
    loop {
        {
            let ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
            if !ee.overlapping_resync_write(sector, size) {
                return Ok(());
            }
        }
        if conn.cstate().is_tearing_down() {
            return Err(PlexError::NetworkFatal(
                "connection lost while waiting on a resync write".into(),
            ));
        }
        let notified = device.ee_notify.notified();
        let _ = tokio::time::timeout(conn.net().socket_timeout, notified).await;
    }
}
