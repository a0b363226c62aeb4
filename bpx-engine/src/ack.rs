//! The acknowledgement reader: a dedicated task on the meta socket.
//!
//! Dispatches the ack-channel commands, keeps the peer-seq serialization
//! fed, and runs the ping scheduler: a Ping goes out when the socket has
//! been idle for a ping interval, and a missing PingAck within the ping
//! timeout kills the connection. Traffic on the data socket counts as
//! liveness too, via the connection's last-received stamp.

use crate::block::SyncBitmap;
use crate::connection::{Connection, CONN_PING_PENDING};
use crate::peer_device::PeerDevice;
use crate::receiver::{recv_exact, recv_header};
use crate::sender::{self, SocketKind};
use crate::state::ReplState;
use bpx_core::{Cookie, PlexError, Result};
use bpx_wire::{
    BarrierAckPayload, BlockAckPayload, Command, OutOfSyncPayload, PacketInfo, PeerAckPayload,
    StateChgReplyPayload, TwopcReplyPayload, ID_SYNCER,
};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

pub async fn run_ack_reader<R: AsyncRead + Unpin>(conn: &Arc<Connection>, rx: &mut R) -> Result<()> {
    loop {
        if conn.cstate().is_tearing_down() {
            return Ok(());
        }
        let pi = read_header_with_pings(conn, rx).await?;
        conn.tick_received();
        handle(conn, rx, pi).await?;
    }
}

/// Wait for the next frame, interleaving the ping schedule without ever
/// abandoning a partially read header.
async fn read_header_with_pings<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
) -> Result<PacketInfo> {
    let hdr = recv_header(conn, rx);
    tokio::pin!(hdr);
    loop {
        let net = conn.net();
        let idle = if conn.flag(CONN_PING_PENDING) {
            net.ping_timeout
        } else {
            net.ping_interval
        };
        tokio::select! {
            r = &mut hdr => return r,
            () = tokio::time::sleep(idle) => {
                if conn.flag(CONN_PING_PENDING) {
                    if conn.since_last_received() < net.ping_timeout {
                        // The data socket kept the peer alive meanwhile.
                        conn.clear_flag(CONN_PING_PENDING);
                        continue;
                    }
                    warn!(target: "bpx::ack", "PingAck did not arrive in time");
                    return Err(PlexError::Timeout("PingAck"));
                }
                conn.set_flag(CONN_PING_PENDING);
                sender::send_packet(conn, SocketKind::Meta, Command::Ping, -1, &[]).await?;
            }
        }
    }
}

async fn handle<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    match pi.cmd {
        Command::Ping => {
            sender::send_packet(conn, SocketKind::Meta, Command::PingAck, -1, &[]).await
        }
        Command::PingAck => {
            conn.clear_flag(CONN_PING_PENDING);
            Ok(())
        }
        Command::RecvAck
        | Command::WriteAck
        | Command::RsWriteAck
        | Command::Superseded
        | Command::RetryWrite
        | Command::NegAck => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = BlockAckPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short block ack".into()))?;
            got_block_ack(conn, pi, &p).await
        }
        Command::NegDReply => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = BlockAckPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short neg dreply".into()))?;
            got_neg_dreply(conn, pi, &p)
        }
        Command::NegRsDReply | Command::RsCancel | Command::RsIsInSync => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = BlockAckPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short resync ack".into()))?;
            got_rs_reply(conn, pi, &p).await
        }
        Command::BarrierAck => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = BarrierAckPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short barrier ack".into()))?;
            got_barrier_ack(conn, &p)
        }
        Command::OvResult => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = BlockAckPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short ov result".into()))?;
            got_ov_result(conn, pi, &p).await
        }
        Command::StateChgReply | Command::ConnStChgReply => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = StateChgReplyPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short state change reply".into()))?;
            debug!(target: "bpx::ack", retcode = p.retcode, "state change reply");
            conn.resource.state_notify.notify_waiters();
            Ok(())
        }
        Command::TwopcYes | Command::TwopcNo | Command::TwopcRetry => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = TwopcReplyPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short twopc reply".into()))?;
            crate::twopc::handle_reply(conn, pi.cmd, &p);
            Ok(())
        }
        Command::PeerAck => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = PeerAckPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short peer ack".into()))?;
            got_peer_ack(conn, &p);
            Ok(())
        }
        Command::PeersInSync => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = OutOfSyncPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short peers-in-sync".into()))?;
            if let Some(pd) = conn.peer_device(pi.volume) {
                pd.device
                    .bitmap
                    .clear_out_of_sync(pd.bitmap_slot, p.sector, p.blksize);
            }
            Ok(())
        }
        other => Err(PlexError::Protocol(format!(
            "unexpected command {other} on the meta socket"
        ))),
    }
}

fn pd_for(conn: &Connection, pi: &PacketInfo) -> Result<Arc<PeerDevice>> {
    conn.peer_device(pi.volume)
        .ok_or_else(|| PlexError::Protocol(format!("{}: unknown volume {}", pi.cmd, pi.volume)))
}

async fn got_block_ack(conn: &Arc<Connection>, pi: PacketInfo, p: &BlockAckPayload) -> Result<()> {
    let pd = pd_for(conn, &pi)?;
    pd.update_peer_seq(conn, p.seq_num);
    let device = &pd.device;

    if pi.cmd == Command::RsWriteAck {
        // The target wrote a resync block; it is in sync for this peer.
        device
            .bitmap
            .clear_out_of_sync(pd.bitmap_slot, p.sector, p.blksize);
        crate::resync::note_source_progress(conn, &pd);
        return Ok(());
    }
    if pi.cmd == Command::NegAck && p.block_id == ID_SYNCER {
        pd.rs_failed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return Ok(());
    }

    // An ack for one of our own writes: resolve the cookie, apply the
    // request event, wake whoever waits on the interval.
    let cookie = Cookie::from_raw(p.block_id);
    let mut locals = device
        .local_requests
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    match pi.cmd {
        Command::WriteAck | Command::RecvAck | Command::Superseded => {
            let Some(mut req) = locals.take(cookie) else {
                debug!(target: "bpx::ack", sector = p.sector, "ack for unknown request");
                return Ok(());
            };
            req.completed = Some(true);
            let interval = req.interval;
            drop(locals);
            if let Some(iv) = interval {
                device
                    .intervals
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(iv);
            }
            device.misc_notify.notify_waiters();
        }
        Command::RetryWrite => {
            // We lost conflict resolution; the write is postponed until
            // the peer's conflicting write settles.
            if let Some(req) = locals.get_mut(cookie) {
                req.postponed = true;
                debug!(target: "bpx::ack", sector = p.sector, "write postponed by peer");
            }
            drop(locals);
            device.misc_notify.notify_waiters();
        }
        Command::NegAck => {
            let Some(mut req) = locals.take(cookie) else {
                return Ok(());
            };
            req.completed = Some(false);
            let (sector, size, interval) = (req.sector, req.size, req.interval);
            drop(locals);
            // The peer could not store the write; it is out of sync now.
            device.bitmap.set_out_of_sync(pd.bitmap_slot, sector, size);
            if let Some(iv) = interval {
                device
                    .intervals
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(iv);
            }
            device.misc_notify.notify_waiters();
        }
        _ => {}
    }
    Ok(())
}

fn got_neg_dreply(conn: &Arc<Connection>, pi: PacketInfo, p: &BlockAckPayload) -> Result<()> {
    let pd = pd_for(conn, &pi)?;
    let device = &pd.device;
    let cookie = Cookie::from_raw(p.block_id);
    let taken = device
        .local_requests
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take(cookie);
    if let Some(mut req) = taken {
        req.completed = Some(false);
        warn!(
            target: "bpx::ack",
            sector = p.sector,
            "peer could not serve read request"
        );
    }
    device.misc_notify.notify_waiters();
    Ok(())
}

/// Negative or short-circuit replies to our resync requests.
async fn got_rs_reply(conn: &Arc<Connection>, pi: PacketInfo, p: &BlockAckPayload) -> Result<()> {
    let pd = pd_for(conn, &pi)?;
    let cookie = Cookie::from_raw(p.block_id);
    let pending = pd
        .rs_pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take(cookie);
    if pending.is_none() {
        debug!(target: "bpx::ack", sector = p.sector, "resync reply for unknown request");
        return Ok(());
    }

    match pi.cmd {
        Command::RsIsInSync => {
            // Checksum resync: the block matched, no data will come.
            pd.device
                .bitmap
                .clear_out_of_sync(pd.bitmap_slot, p.sector, p.blksize);
        }
        Command::NegRsDReply => {
            pd.rs_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!(target: "bpx::ack", sector = p.sector, "resync read failed on the peer");
        }
        Command::RsCancel => {
            debug!(target: "bpx::ack", sector = p.sector, "resync request cancelled by peer");
        }
        _ => {}
    }
    crate::resync::note_rs_write_done(conn, &pd).await
}

fn got_barrier_ack(conn: &Arc<Connection>, p: &BarrierAckPayload) -> Result<()> {
    let released = {
        let mut log = conn
            .transmit_log
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut released = Vec::new();
        while let Some(front) = log.front() {
            let stop = front.barrier_nr == p.barrier_nr;
            if let Some(epoch) = log.pop_front() {
                released.extend(epoch.requests);
            }
            if stop {
                break;
            }
        }
        released
    };

    if !released.is_empty() {
        debug!(
            target: "bpx::ack",
            barrier_nr = p.barrier_nr,
            set_size = p.set_size,
            released = released.len(),
            "barrier acknowledged"
        );
        for device in conn.resource.device_list() {
            let mut locals = device
                .local_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for cookie in &released {
                if let Some(mut req) = locals.take(*cookie) {
                    req.completed = Some(true);
                }
            }
            drop(locals);
            device.misc_notify.notify_waiters();
        }
    }
    Ok(())
}

async fn got_ov_result(conn: &Arc<Connection>, pi: PacketInfo, p: &BlockAckPayload) -> Result<()> {
    let pd = pd_for(conn, &pi)?;
    if p.block_id == bpx_wire::ID_OUT_OF_SYNC {
        pd.device
            .bitmap
            .set_out_of_sync(pd.bitmap_slot, p.sector, p.blksize);
        info!(
            target: "bpx::ack",
            sector = p.sector,
            "online verify found an out-of-sync block"
        );
    }
    if pd.repl_state() == ReplState::VerifyT || pd.repl_state() == ReplState::VerifyS {
        crate::resync::note_verify_progress(conn, &pd).await?;
    }
    Ok(())
}

/// The peer tells us which nodes hold a prefix of its write stream: set
/// those writes in sync toward the named peers.
fn got_peer_ack(conn: &Arc<Connection>, p: &PeerAckPayload) {
    for device in conn.resource.device_list() {
        let ranges: Vec<(u64, u32)> = {
            let locals = device
                .local_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            locals
                .iter()
                .filter(|(_, r)| r.dagtag != 0 && r.dagtag <= p.dagtag)
                .map(|(_, r)| (r.sector, r.size))
                .collect()
        };
        if ranges.is_empty() {
            continue;
        }
        let uuids = device.uuids.lock().unwrap_or_else(|e| e.into_inner());
        for (slot, node) in uuids.slot_node_ids.iter().enumerate() {
            if p.node_mask & (1u64 << node) == 0 {
                continue;
            }
            for &(sector, size) in &ranges {
                device.bitmap.clear_out_of_sync(slot, sector, size);
            }
        }
    }
}
