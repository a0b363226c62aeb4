//! Per-connection worker task.
//!
//! Completions from the block layer and deferred sends arrive here as
//! typed messages; the worker finishes peer requests in completion order,
//! emits the corresponding acknowledgements on the meta socket and drives
//! the epoch state machine. Device flushes for barrier ordering also run
//! here, off the receiver's hot path.

use crate::block::{ActivityLog, BlockIo, IoKind, IoRequest, SyncBitmap};
use crate::connection::Connection;
use crate::epoch::{EpochEvent, EpochOutcome};
use crate::request::{
    EeQueue, RequestId, EE_IN_INTERVAL_TREE, EE_IS_BARRIER, EE_MAY_SET_IN_SYNC, EE_RESTART_REQUESTS,
    EE_RS_WRITE, EE_SEND_WRITE_ACK,
};
use crate::resource::Device;
use crate::sender::{self, SocketKind};
use crate::state::ReplState;
use bpx_core::Result;
use bpx_wire::{Command, DataHeader};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[derive(Debug)]
pub enum WorkItem {
    WriteDone {
        volume: u16,
        request: RequestId,
        result: std::result::Result<(), String>,
    },
    ReadDone {
        volume: u16,
        request: RequestId,
        result: std::result::Result<(), String>,
        data: Option<Bytes>,
    },
    /// Barrier ordering asked for an asynchronous device flush.
    EpochFlush { epoch_serial: u64 },
    BarrierAcks(Vec<(u32, u32)>),
    SendMeta {
        volume: i16,
        cmd: Command,
        payload: Bytes,
    },
    SendData {
        volume: i16,
        cmd: Command,
        payload: Bytes,
    },
    StartResync { volume: u16, side: ReplState },
    RsRequestMore { volume: u16 },
    Shutdown,
}

/// Spawn the worker for a connection; its sender is registered on the
/// connection for the receiver and ack-reader to use.
pub fn spawn(conn: Arc<Connection>) -> tokio::task::JoinHandle<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    conn.set_worker(tx);
    tokio::spawn(run(conn, rx))
}

async fn run(conn: Arc<Connection>, mut rx: mpsc::UnboundedReceiver<WorkItem>) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            WorkItem::Shutdown => break,
            WorkItem::WriteDone {
                volume,
                request,
                result,
            } => handle_write_done(&conn, volume, request, result).await,
            WorkItem::ReadDone {
                volume,
                request,
                result,
                data,
            } => handle_read_done(&conn, volume, request, result, data).await,
            WorkItem::EpochFlush { epoch_serial } => handle_epoch_flush(&conn, epoch_serial).await,
            WorkItem::BarrierAcks(acks) => send_barrier_acks(&conn, &acks).await,
            WorkItem::SendMeta {
                volume,
                cmd,
                payload,
            } => sender::send_packet(&conn, SocketKind::Meta, cmd, volume, &payload).await,
            WorkItem::SendData {
                volume,
                cmd,
                payload,
            } => sender::send_packet(&conn, SocketKind::Data, cmd, volume, &payload).await,
            WorkItem::StartResync { volume, side } => {
                crate::resync::start_resync(&conn, volume, side).await
            }
            WorkItem::RsRequestMore { volume } => match conn.peer_device(volume as i16) {
                Some(pd) => crate::resync::request_more(&conn, &pd).await,
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            if conn.cstate().is_tearing_down() {
                debug!(target: "bpx::worker", error = %e, "work item failed during teardown");
            } else {
                error!(target: "bpx::worker", error = %e, "work item failed");
                conn.set_cstate(crate::state::ConnState::NetworkFailure);
            }
        }
    }
}

async fn send_barrier_acks(conn: &Connection, acks: &[(u32, u32)]) -> Result<()> {
    for &(barrier_nr, set_size) in acks {
        sender::send_barrier_ack(conn, barrier_nr, set_size).await?;
    }
    Ok(())
}

/// Emit whatever an epoch state-machine step asked for.
pub async fn handle_epoch_outcome(conn: &Connection, out: EpochOutcome) -> Result<()> {
    if !out.barrier_acks.is_empty() {
        send_barrier_acks(conn, &out.barrier_acks).await?;
    }
    if let Some(serial) = out.schedule_flush {
        conn.queue_work(WorkItem::EpochFlush {
            epoch_serial: serial,
        })?;
    }
    Ok(())
}

/// Flush every attached device, then feed BarrierDone and the held Put
/// back into the epoch machine.
async fn handle_epoch_flush(conn: &Connection, epoch_serial: u64) -> Result<()> {
    let flush_result = flush_all_devices(conn).await;
    if let Err(e) = &flush_result {
        warn!(target: "bpx::epoch", error = %e, "device flush failed");
        conn.resource
            .degrade_write_ordering(crate::epoch::WriteOrdering::DrainIo);
    }

    let cleanup = conn.cstate().is_tearing_down();
    let wo = conn.resource.write_ordering();
    let out = {
        let mut epochs = conn.epochs.lock().unwrap_or_else(|e| e.into_inner());
        epochs.apply(epoch_serial, EpochEvent::BarrierDone, cleanup, wo);
        epochs.apply(epoch_serial, EpochEvent::Put, cleanup, wo)
    };
    handle_epoch_outcome(conn, out).await
}

/// Flush the backing device of every attached volume. Any failure
/// degrades the write ordering and is reported to the caller.
pub async fn flush_all_devices(conn: &Connection) -> std::result::Result<(), String> {
    for device in conn.resource.device_list() {
        if !device.have_disk() {
            continue;
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let submit = device.block.submit(
            IoRequest {
                token: 0,
                kind: IoKind::Flush,
                sector: 0,
                size: 0,
                data: None,
                flags: 0,
            },
            Box::new(move |done| {
                let _ = tx.send(done.result);
            }),
        );
        if let Err(e) = submit {
            return Err(e.to_string());
        }
        match rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err("flush completion dropped".to_string()),
        }
    }
    Ok(())
}

async fn handle_write_done(
    conn: &Connection,
    volume: u16,
    request: RequestId,
    result: std::result::Result<(), String>,
) -> Result<()> {
    let Some(device) = conn.resource.device(volume) else {
        return Ok(());
    };
    {
        let mut ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
        let Some(req) = ee.get_mut(request) else {
            return Ok(());
        };
        req.result = Some(result);
        let from = req.queue;
        if from == EeQueue::Active || from == EeQueue::Sync {
            ee.move_to(request, from, EeQueue::Done)?;
        }
    }
    device.ee_notify.notify_waiters();
    process_done_queue(conn, &device).await
}

/// Finish every completed peer request of the device, in completion
/// order: emit the ack, settle the epoch, release the interval, restart
/// postponed local writes.
pub async fn process_done_queue(conn: &Connection, device: &Arc<Device>) -> Result<()> {
    loop {
        let req = {
            let mut ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
            let Some(id) = ee.pop_done() else { break };
            match ee.take(id) {
                Some(r) => r,
                None => continue,
            }
        };
        let Some(pd) = conn.peer_device(req.volume as i16) else {
            continue;
        };

        let ok = matches!(req.result, Some(Ok(())) | None);
        let volume = req.volume as i16;

        if req.has_flag(EE_IS_BARRIER) {
            // The barrier write carried the previous epoch's flush.
            let prev_serial = {
                let epochs = conn.epochs.lock().unwrap_or_else(|e| e.into_inner());
                req.epoch_serial
                    .and_then(|s| epochs.get(s.wrapping_sub(1)).map(|e| e.serial))
            };
            if let Some(prev) = prev_serial {
                let cleanup = conn.cstate().is_tearing_down();
                let wo = conn.resource.write_ordering();
                let out = {
                    let mut epochs = conn.epochs.lock().unwrap_or_else(|e| e.into_inner());
                    epochs.apply(prev, EpochEvent::BarrierDone, cleanup, wo)
                };
                handle_epoch_outcome(conn, out).await?;
            }
        }

        if let Some(cmd) = req.finish_cmd {
            // Forced ack for a discarded or retried conflicting write.
            sender::send_block_ack(
                conn,
                cmd,
                volume,
                req.sector,
                req.block_id,
                req.size,
                req.peer_seq,
            )
            .await?;
        } else if req.has_flag(EE_RS_WRITE) {
            if ok {
                device
                    .bitmap
                    .clear_out_of_sync(pd.bitmap_slot, req.sector, req.size);
                sender::send_block_ack(
                    conn,
                    Command::RsWriteAck,
                    volume,
                    req.sector,
                    req.block_id,
                    req.size,
                    req.peer_seq,
                )
                .await?;
            } else {
                pd.rs_failed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                sender::send_block_ack(
                    conn,
                    Command::NegAck,
                    volume,
                    req.sector,
                    req.block_id,
                    req.size,
                    req.peer_seq,
                )
                .await?;
            }
        } else if req.has_flag(EE_SEND_WRITE_ACK) {
            if ok {
                let repl = pd.repl_state();
                let cmd = if repl.is_resync() && req.has_flag(EE_MAY_SET_IN_SYNC) {
                    Command::RsWriteAck
                } else {
                    Command::WriteAck
                };
                sender::send_block_ack(
                    conn,
                    cmd,
                    volume,
                    req.sector,
                    req.block_id,
                    req.size,
                    req.peer_seq,
                )
                .await?;
                if cmd == Command::RsWriteAck {
                    device
                        .bitmap
                        .clear_out_of_sync(pd.bitmap_slot, req.sector, req.size);
                }
            } else {
                device
                    .bitmap
                    .set_out_of_sync(pd.bitmap_slot, req.sector, req.size);
                sender::send_block_ack(
                    conn,
                    Command::NegAck,
                    volume,
                    req.sector,
                    req.block_id,
                    req.size,
                    req.peer_seq,
                )
                .await?;
            }
        }

        // The interval leaves the tree only after the ack went out, so the
        // peer sees sequence numbers in emission order.
        if req.has_flag(EE_IN_INTERVAL_TREE) {
            if let Some(iv) = req.interval {
                device
                    .intervals
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(iv);
            }
            if req.has_flag(EE_RESTART_REQUESTS) {
                restart_conflicting_writes(device, req.sector, req.size);
            }
            device.misc_notify.notify_waiters();
        }

        if let Some(serial) = req.epoch_serial {
            let cleanup = conn.cstate().is_tearing_down();
            let wo = conn.resource.write_ordering();
            let out = {
                let mut epochs = conn.epochs.lock().unwrap_or_else(|e| e.into_inner());
                epochs.apply(serial, EpochEvent::Put, cleanup, wo)
            };
            handle_epoch_outcome(conn, out).await?;
        }

        if !req.has_flag(EE_RS_WRITE) {
            device.act_log.complete_io(req.sector, req.size);
        }

        conn.recv_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|&(v, id)| !(v == req.volume && id == req.id));

        if let Some(ref data) = req.data {
            device.pool.release(data.len(), None);
        }

        if req.has_flag(EE_RS_WRITE) && ok {
            crate::resync::note_rs_write_done(conn, &pd).await?;
        }
    }
    device.ee_notify.notify_waiters();
    Ok(())
}

/// Local writes that lost conflict resolution and were postponed get
/// restarted once the peer's write has settled.
fn restart_conflicting_writes(device: &Arc<Device>, sector: u64, size: u32) {
    let overlaps: Vec<_> = {
        let intervals = device.intervals.lock().unwrap_or_else(|e| e.into_inner());
        intervals
            .overlaps(sector, size)
            .into_iter()
            .filter_map(|r| intervals.get(r).map(|iv| (iv.local, iv.token)))
            .collect()
    };
    let mut locals = device
        .local_requests
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    for (local, token) in overlaps {
        if !local {
            continue;
        }
        let cookie = bpx_core::Cookie::from_raw(token);
        if let Some(req) = locals.get_mut(cookie) {
            if req.postponed && !req.pending_local {
                req.postponed = false;
                debug!(target: "bpx::worker", sector = req.sector, "restarting postponed local write");
            }
        }
    }
    device.misc_notify.notify_waiters();
}

async fn handle_read_done(
    conn: &Connection,
    volume: u16,
    request: RequestId,
    result: std::result::Result<(), String>,
    data: Option<Bytes>,
) -> Result<()> {
    let Some(device) = conn.resource.device(volume) else {
        return Ok(());
    };
    let req = {
        let mut ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
        match ee.take(request) {
            Some(r) => r,
            None => return Ok(()),
        }
    };
    let Some(pd) = conn.peer_device(volume as i16) else {
        return Ok(());
    };
    let vol = volume as i16;

    let payload = match (result, data) {
        (Ok(()), Some(payload)) => payload,
        (result, _) => {
            let neg = match req.finish_cmd {
                Some(Command::DataRequest) => Command::NegDReply,
                _ => Command::NegRsDReply,
            };
            warn!(
                target: "bpx::worker",
                sector = req.sector,
                error = result.err().as_deref().unwrap_or("no data"),
                "read for peer request failed"
            );
            device.pool.release(req.size as usize, None);
            sender::send_block_ack(conn, neg, vol, req.sector, req.block_id, req.size, 0).await?;
            return Ok(());
        }
    };

    let reply_header = DataHeader {
        sector: req.sector,
        block_id: req.block_id,
        seq_num: 0,
        dp_flags: 0,
    };

    // Payload-carrying replies keep their pages charged to the network
    // hold until the send no longer references them.
    let mut sent_payload = false;
    match req.finish_cmd {
        Some(Command::DataRequest) => {
            let mut buf = reply_header.encode().to_vec();
            buf.extend_from_slice(&payload);
            device.pool.move_to_net(req.size as usize);
            sent_payload = true;
            sender::send_packet(conn, SocketKind::Data, Command::DataReply, vol, &buf).await?;
        }
        Some(Command::RsDataRequest) => {
            let mut buf = reply_header.encode().to_vec();
            buf.extend_from_slice(&payload);
            device.pool.move_to_net(req.size as usize);
            sent_payload = true;
            sender::send_packet(conn, SocketKind::Data, Command::RsDataReply, vol, &buf).await?;
        }
        Some(Command::OvRequest) => {
            let digest = pd
                .verify_alg()
                .map(|alg| alg.digest(&payload))
                .unwrap_or_default();
            let mut buf = bpx_wire::BlockRequestPayload {
                sector: req.sector,
                block_id: req.block_id,
                blksize: req.size,
            }
            .encode()
            .to_vec();
            buf.extend_from_slice(&digest);
            device.pool.release(req.size as usize, None);
            sender::send_packet(conn, SocketKind::Data, Command::OvReply, vol, &buf).await?;
        }
        Some(Command::OvReply) => {
            // The peer sent its digest; compare against our block.
            let local_digest = pd.verify_alg().map(|alg| alg.digest(&payload));
            let in_sync = match (&local_digest, &req.digest) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => false,
            };
            let block_id = if in_sync {
                bpx_wire::ID_IN_SYNC
            } else {
                device
                    .bitmap
                    .set_out_of_sync(pd.bitmap_slot, req.sector, req.size);
                bpx_wire::ID_OUT_OF_SYNC
            };
            device.pool.release(req.size as usize, None);
            sender::send_block_ack(
                conn,
                Command::OvResult,
                vol,
                req.sector,
                block_id,
                req.size,
                0,
            )
            .await?;
            crate::resync::note_verify_progress(conn, &pd).await?;
        }
        Some(Command::CsumRsRequest) => {
            let local_digest = pd.csums_alg().map(|alg| alg.digest(&payload));
            let equal = match (&local_digest, &req.digest) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => false,
            };
            if equal {
                device.pool.release(req.size as usize, None);
                sender::send_block_ack(
                    conn,
                    Command::RsIsInSync,
                    vol,
                    req.sector,
                    req.block_id,
                    req.size,
                    0,
                )
                .await?;
            } else {
                let mut buf = reply_header.encode().to_vec();
                buf.extend_from_slice(&payload);
                device.pool.move_to_net(req.size as usize);
                sent_payload = true;
                sender::send_packet(conn, SocketKind::Data, Command::RsDataReply, vol, &buf)
                    .await?;
            }
        }
        _ => {
            device.pool.release(req.size as usize, None);
        }
    }

    if sent_payload {
        // write_all returned: the stack owns a copy, the pages are free.
        device.pool.release_net(req.size as usize);
    }
    Ok(())
}
