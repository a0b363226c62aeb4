//! The data-socket receiver: feature negotiation, protocol parameters and
//! the main frame loop with one handler per command.
//!
//! Handlers return a typed error to the loop; the loop never tears the
//! connection down itself, it reports the error to the connect loop which
//! owns centralized teardown.

use crate::block::{
    ActivityLog, BlockIo, IoKind, IoRequest, SyncBitmap, SUBMIT_DISCARD, SUBMIT_FLUSH,
    SUBMIT_FUA, SUBMIT_SYNC,
};
use crate::conflict::{self, ConflictOutcome};
use crate::connection::{Connection, CONN_DRY_RUN};
use crate::epoch::{EpochEvent, WriteOrdering};
use crate::peer_device::{PeerDevice, PD_INITIAL_STATE_RECEIVED};
use crate::request::{
    EeQueue, PeerRequest, EE_IN_INTERVAL_TREE, EE_IS_BARRIER, EE_MAY_SET_IN_SYNC, EE_RS_WRITE,
    EE_SEND_WRITE_ACK, EE_TRIM,
};
use crate::sender::{self, SocketKind};
use crate::state::{DiskState, ReplState, Role};
use crate::worker::{self, WorkItem};
use bpx_core::{Cookie, Interval, PlexError, Result, SECTOR_SHIFT};
use bpx_wire::{
    decode_header, header_size, BarrierPayload, BlockRequestPayload, Command, CurrentUuidPayload,
    DagtagPayload, DataHeader, FeaturesPayload, OutOfSyncPayload, PacketInfo, PeerDagtagPayload,
    PeerStateWire, ProtocolPayload, SizesPayload, StateChgReplyPayload, StateChgReqPayload,
    SyncParamPayload, SyncUuidPayload, TwopcPayload, Uuids110Payload, UuidsPayload,
    DP_DISCARD, DP_FLUSH, DP_FUA, DP_MAY_SET_IN_SYNC, DP_RW_SYNC, DP_SEND_RECEIVE_ACK,
    DP_SEND_WRITE_ACK, DP_UNPLUG,
};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

pub(crate) async fn recv_exact<R: AsyncRead + Unpin>(rx: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    rx.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read and discard a payload we cannot use.
pub(crate) async fn drain<R: AsyncRead + Unpin>(rx: &mut R, mut len: usize) -> Result<()> {
    let mut scratch = [0u8; 4096];
    while len > 0 {
        let take = len.min(scratch.len());
        rx.read_exact(&mut scratch[..take]).await?;
        len -= take;
    }
    Ok(())
}

pub(crate) async fn recv_header<R: AsyncRead + Unpin>(
    conn: &Connection,
    rx: &mut R,
) -> Result<PacketInfo> {
    let size = header_size(conn.version());
    let buf = recv_exact(rx, size).await?;
    decode_header(&buf, conn.version())
}

/// Exchange the features packet and agree on a protocol version.
pub async fn exchange_features<R: AsyncRead + Unpin>(conn: &Connection, rx: &mut R) -> Result<()> {
    let ours = FeaturesPayload {
        protocol_min: bpx_wire::PROTOCOL_MIN,
        protocol_max: bpx_wire::PROTOCOL_MAX,
        sender_node_id: conn.resource.opts.node_id,
        feature_flags: bpx_wire::FF_TRIM,
    };
    sender::send_packet(
        conn,
        SocketKind::Data,
        Command::ConnectionFeatures,
        -1,
        &ours.encode(),
    )
    .await?;

    let pi = recv_header(conn, rx).await?;
    if pi.cmd != Command::ConnectionFeatures {
        return Err(PlexError::NetworkFatal(format!(
            "expected ConnectionFeatures, received {}",
            pi.cmd
        )));
    }
    let payload = recv_exact(rx, pi.size as usize).await?;
    let theirs = FeaturesPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short features payload".into()))?;

    if theirs.protocol_max < bpx_wire::PROTOCOL_MIN || theirs.protocol_min > bpx_wire::PROTOCOL_MAX
    {
        return Err(PlexError::ProtocolIncompatible(format!(
            "incompatible protocol range {}..{}",
            theirs.protocol_min, theirs.protocol_max
        )));
    }
    let agreed = theirs.protocol_max.min(bpx_wire::PROTOCOL_MAX);
    conn.set_version(agreed);
    conn.agreed_features.store(
        ours.feature_flags & theirs.feature_flags,
        Ordering::Release,
    );
    info!(
        target: "bpx::conn",
        version = agreed,
        features = conn.agreed_features.load(Ordering::Acquire),
        "handshake successful, agreed network protocol version"
    );
    Ok(())
}

/// Send our protocol parameters after features and auth.
pub async fn send_protocol(conn: &Connection) -> Result<()> {
    let net = conn.net();
    let mut conn_flags = 0;
    if net.discard_my_data {
        conn_flags |= bpx_wire::CF_DISCARD_MY_DATA;
    }
    if net.tentative {
        conn_flags |= bpx_wire::CF_DRY_RUN;
    }
    let p = ProtocolPayload {
        wire_protocol: net.wire_protocol as u32,
        after_sb_0p: net.after_sb_0p as u32,
        after_sb_1p: net.after_sb_1p as u32,
        after_sb_2p: net.after_sb_2p as u32,
        two_primaries: u32::from(net.two_primaries),
        conn_flags,
        integrity_alg: net
            .integrity_alg
            .map(|a| a.name().to_string())
            .unwrap_or_default(),
    };
    sender::send_packet(conn, SocketKind::Data, Command::Protocol, -1, &p.encode()).await
}

/// Main frame loop. Returns when the connection dies or is asked down.
pub async fn run_receiver<R: AsyncRead + Unpin>(conn: &Arc<Connection>, rx: &mut R) -> Result<()> {
    loop {
        if conn.cstate().is_tearing_down() {
            return Ok(());
        }
        let pi = recv_header(conn, rx).await?;
        conn.tick_received();
        dispatch(conn, rx, pi).await?;
    }
}

async fn dispatch<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    match pi.cmd {
        Command::Data | Command::Trim => receive_data(conn, rx, pi).await,
        Command::Barrier => receive_barrier(conn, rx, pi).await,
        Command::DataRequest
        | Command::RsDataRequest
        | Command::OvRequest
        | Command::OvReply
        | Command::CsumRsRequest => receive_data_request(conn, rx, pi).await,
        Command::DataReply => receive_data_reply(conn, rx, pi).await,
        Command::RsDataReply => receive_rs_data_reply(conn, rx, pi).await,
        Command::Bitmap | Command::CompressedBitmap => {
            crate::bitmap_recv::receive_bitmap(conn, rx, pi).await
        }
        Command::Protocol | Command::ProtocolUpdate => receive_protocol(conn, rx, pi).await,
        Command::SyncParam | Command::SyncParam89 => receive_sync_param(conn, rx, pi).await,
        Command::Uuids => receive_uuids(conn, rx, pi).await,
        Command::Uuids110 => receive_uuids110(conn, rx, pi).await,
        Command::Sizes => receive_sizes(conn, rx, pi).await,
        Command::State => receive_state(conn, rx, pi).await,
        Command::SyncUuid => receive_sync_uuid(conn, rx, pi).await,
        Command::OutOfSync => receive_out_of_sync(conn, rx, pi).await,
        Command::Dagtag => receive_dagtag(conn, rx, pi).await,
        Command::PeerDagtag => receive_peer_dagtag(conn, rx, pi).await,
        Command::CurrentUuid => receive_current_uuid(conn, rx, pi).await,
        Command::StateChgReq | Command::ConnStChgReq => receive_state_chg_req(conn, rx, pi).await,
        Command::TwopcPrepare | Command::TwopcAbort | Command::TwopcCommit => {
            let payload = recv_exact(rx, pi.size as usize).await?;
            let p = TwopcPayload::decode(&payload)
                .ok_or_else(|| PlexError::MalformedFrame("short twopc payload".into()))?;
            crate::twopc::receive_twopc(conn, pi.cmd, &p).await
        }
        Command::UnplugRemote => {
            for device in conn.resource.device_list() {
                device.block.unplug();
            }
            Ok(())
        }
        Command::DelayProbe | Command::PriReachable => {
            // Consumed for liveness; carries nothing the receive core acts on.
            drain(rx, pi.size as usize).await
        }
        other => Err(PlexError::Protocol(format!(
            "unexpected command {other} on the data socket"
        ))),
    }
}

fn wire_flags_to_submit(conn: &Connection, dp_flags: u32) -> u32 {
    if conn.version() >= 95 {
        let mut f = 0;
        if dp_flags & DP_RW_SYNC != 0 {
            f |= SUBMIT_SYNC;
        }
        if dp_flags & DP_FUA != 0 {
            f |= SUBMIT_FUA;
        }
        if dp_flags & DP_FLUSH != 0 {
            f |= SUBMIT_FLUSH;
        }
        if dp_flags & DP_DISCARD != 0 {
            f |= SUBMIT_DISCARD;
        }
        f
    } else if dp_flags & DP_RW_SYNC != 0 {
        SUBMIT_SYNC
    } else {
        0
    }
}

fn peer_device_for(conn: &Connection, pi: &PacketInfo) -> Result<Arc<PeerDevice>> {
    conn.peer_device(pi.volume)
        .ok_or_else(|| PlexError::Protocol(format!("{}: unknown volume {}", pi.cmd, pi.volume)))
}

/// Read a data payload: optional integrity digest, then the block itself
/// into pool pages.
async fn read_in_block<R: AsyncRead + Unpin>(
    conn: &Connection,
    pd: &PeerDevice,
    rx: &mut R,
    data_len: usize,
    has_payload: bool,
) -> Result<Option<Bytes>> {
    let alg = conn.peer_integrity();
    let digest_len = if has_payload {
        alg.map_or(0, |a| a.digest_size())
    } else {
        0
    };
    let expected = if digest_len > 0 {
        Some(recv_exact(rx, digest_len).await?)
    } else {
        None
    };
    let payload_len = data_len - digest_len;
    if !has_payload || payload_len == 0 {
        return Ok(None);
    }

    let device = &pd.device;
    let mut buf = device.pool.acquire(payload_len, || 0).await?;
    rx.read_exact(&mut buf).await?;
    let data = buf.freeze();

    if let (Some(alg), Some(expected)) = (alg, expected) {
        let computed = alg.digest(&data);
        if computed != expected {
            device.pool.release(data.len(), None);
            return Err(PlexError::NetworkFatal(format!(
                "data digest mismatch over {} bytes",
                data.len()
            )));
        }
    }
    Ok(Some(data))
}

/// A mirrored write from the peer.
async fn receive_data<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let device = pd.device.clone();
    let is_trim = pi.cmd == Command::Trim;

    let header = recv_exact(rx, DataHeader::SIZE).await?;
    let dh = DataHeader::decode(&header)
        .ok_or_else(|| PlexError::MalformedFrame("short data header".into()))?;
    let mut dp_flags = dh.dp_flags;

    // A discard carries its extent length instead of payload bytes.
    let (trim_size, data_len) = if is_trim {
        let raw = recv_exact(rx, 4).await?;
        let size = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        (size, pi.size as usize - DataHeader::SIZE - 4)
    } else {
        (0, pi.size as usize - DataHeader::SIZE)
    };

    if !device.have_disk() {
        // Detached disk: consume the write, tell the peer it went nowhere.
        let seq_err = pd.wait_for_and_update_peer_seq(conn, dh.seq_num).await;
        let size = if is_trim { trim_size } else { data_len as u32 };
        sender::send_block_ack(
            conn,
            Command::NegAck,
            pi.volume,
            dh.sector,
            dh.block_id,
            size,
            dh.seq_num,
        )
        .await?;
        conn.epochs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .note_drained_write();
        drain(rx, data_len).await?;
        return seq_err;
    }

    let data = read_in_block(conn, &pd, rx, data_len, !is_trim).await?;
    let size = if is_trim {
        trim_size
    } else {
        data.as_ref().map_or(0, |d| d.len() as u32)
    };

    let id = conn.next_id();
    let mut req = PeerRequest::new_write(
        id,
        pi.volume as u16,
        dh.sector,
        size,
        dh.block_id,
        dh.seq_num,
        data.clone(),
    );
    req.dagtag_sector =
        conn.last_dagtag.load(Ordering::Acquire) + u64::from(size >> SECTOR_SHIFT);
    conn.last_dagtag.store(req.dagtag_sector, Ordering::Release);

    if is_trim {
        req.flags |= EE_TRIM;
    }
    if dp_flags & DP_MAY_SET_IN_SYNC != 0 {
        req.flags |= EE_MAY_SET_IN_SYNC;
    }

    let mut submit_flags = wire_flags_to_submit(conn, dp_flags);
    if is_trim {
        submit_flags |= SUBMIT_DISCARD;
    }

    // Attach to the current epoch; under barrier ordering the first write
    // of a fresh epoch carries the flush itself.
    let write_ordering = conn.resource.write_ordering();
    let attach = {
        let mut epochs = conn.epochs.lock().unwrap_or_else(|e| e.into_inner());
        epochs.attach_write(write_ordering)
    };
    req.epoch_serial = Some(attach.epoch_serial);
    if attach.barrier_write {
        submit_flags |= SUBMIT_FLUSH | SUBMIT_FUA;
        req.flags |= EE_IS_BARRIER;
    }

    let net = conn.net();
    let two_primaries = net.two_primaries;

    let cleanup_on_error = |req: PeerRequest| {
        let wo = conn.resource.write_ordering();
        if let Some(serial) = req.epoch_serial {
            let mut epochs = conn.epochs.lock().unwrap_or_else(|e| e.into_inner());
            epochs.apply(serial, EpochEvent::Put, true, wo);
        }
        if let Some(data) = req.data {
            device.pool.release(data.len(), None);
        }
    };

    if two_primaries {
        if let Err(e) = pd.wait_for_and_update_peer_seq(conn, dh.seq_num).await {
            cleanup_on_error(req);
            return Err(e);
        }
        // Into the tree before walking it, so new local conflicts wait on
        // us while we resolve against the old ones.
        let iv = device
            .intervals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Interval {
                sector: req.sector,
                size: req.size,
                local: false,
                waiting: false,
                token: id,
            });
        req.interval = Some(iv);
        req.flags |= EE_IN_INTERVAL_TREE;

        device
            .ee
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(req, EeQueue::Active);

        match conflict::handle_write_conflicts(conn, &pd, id).await {
            Ok(ConflictOutcome::Proceed) => {}
            Ok(ConflictOutcome::Discarded) => return Ok(()),
            Err(e) => {
                let taken = device
                    .ee
                    .lock()
                    .unwrap_or_else(|e2| e2.into_inner())
                    .take(id);
                if let Some(taken) = taken {
                    cleanup_on_error(taken);
                }
                return Err(e);
            }
        }
    } else {
        pd.update_peer_seq(conn, dh.seq_num);
        device
            .ee
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(req, EeQueue::Active);
    }

    if conn.version() >= 110 {
        conn.recv_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((pi.volume as u16, id));
    }

    if pd.repl_state() == ReplState::SyncTarget {
        let (sector, size) = {
            let ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
            match ee.get(id) {
                Some(r) => (r.sector, r.size),
                None => return Ok(()),
            }
        };
        conflict::wait_no_overlapping_resync(conn, &device, sector, size).await?;
    }

    // Protocols below 100 derive the ack class from the wire protocol
    // setting rather than per-packet flags.
    if conn.version() < 100 {
        match net.wire_protocol {
            crate::config::WireProtocol::C => dp_flags |= DP_SEND_WRITE_ACK,
            crate::config::WireProtocol::B => dp_flags |= DP_SEND_RECEIVE_ACK,
            crate::config::WireProtocol::A => {}
        }
    }

    let (sector, size, payload) = {
        let mut ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
        let Some(r) = ee.get_mut(id) else {
            return Ok(());
        };
        if dp_flags & DP_SEND_WRITE_ACK != 0 {
            r.flags |= EE_SEND_WRITE_ACK;
        }
        (r.sector, r.size, r.data.clone())
    };

    if dp_flags & DP_SEND_RECEIVE_ACK != 0 {
        sender::send_block_ack(
            conn,
            Command::RecvAck,
            pi.volume,
            sector,
            dh.block_id,
            size,
            dh.seq_num,
        )
        .await?;
    }

    if dp_flags & DP_UNPLUG != 0 {
        device.block.unplug();
    }

    device.act_log.begin_io(sector, size)?;

    let done = {
        let conn = conn.clone();
        let volume = pi.volume as u16;
        Box::new(move |io: crate::block::IoDone| {
            let _ = conn.queue_work(WorkItem::WriteDone {
                volume,
                request: io.token,
                result: io.result,
            });
        })
    };
    let submit = device.block.submit(
        IoRequest {
            token: id,
            kind: IoKind::Write,
            sector,
            size,
            data: payload,
            flags: submit_flags,
        },
        done,
    );

    if let Err(e) = submit {
        warn!(target: "bpx::recv", volume = pi.volume, error = %e, "submit failed, triggering re-connect");
        let taken = {
            let mut ee = device.ee.lock().unwrap_or_else(|e2| e2.into_inner());
            ee.take(id)
        };
        if let Some(taken) = taken {
            if let Some(iv) = taken.interval {
                device
                    .intervals
                    .lock()
                    .unwrap_or_else(|e2| e2.into_inner())
                    .remove(iv);
                device.misc_notify.notify_waiters();
            }
            device.act_log.complete_io(taken.sector, taken.size);
            cleanup_on_error(taken);
        }
        conn.recv_order
            .lock()
            .unwrap_or_else(|e2| e2.into_inner())
            .retain(|&(_, rid)| rid != id);
        return Err(e);
    }
    Ok(())
}

/// Wait until no peer write of this connection is still submitted.
async fn wait_active_ee_empty(conn: &Connection) -> Result<()> {
    for device in conn.resource.device_list() {
        loop {
            {
                let ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
                if ee.count(EeQueue::Active) == 0 {
                    break;
                }
            }
            if conn.cstate().is_tearing_down() {
                return Ok(());
            }
            let notified = device.ee_notify.notified();
            let _ = tokio::time::timeout(conn.net().socket_timeout, notified).await;
        }
    }
    Ok(())
}

async fn receive_barrier<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = BarrierPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short barrier payload".into()))?;

    for device in conn.resource.device_list() {
        device.block.unplug();
    }

    let write_ordering = conn.resource.write_ordering();
    let (serial, out) = {
        let mut epochs = conn.epochs.lock().unwrap_or_else(|e| e.into_inner());
        let serial = epochs.set_barrier_nr(p.barrier_nr);
        let out = epochs.apply(serial, EpochEvent::GotBarrierNr, false, write_ordering);
        (serial, out)
    };
    let recycled_early = out.recycled;
    worker::handle_epoch_outcome(conn, out).await?;

    match write_ordering {
        WriteOrdering::None | WriteOrdering::BioBarrier => {
            if recycled_early {
                return Ok(());
            }
        }
        WriteOrdering::DrainIo | WriteOrdering::BdevFlush => {
            let mut recycled = recycled_early;
            if !recycled {
                conn.epochs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .set_barrier_issued(serial);
                wait_active_ee_empty(conn).await?;
                if conn.resource.write_ordering() >= WriteOrdering::BdevFlush {
                    if let Err(e) = worker::flush_all_devices(conn).await {
                        warn!(target: "bpx::epoch", error = %e, "flush after epoch failed");
                        conn.resource.degrade_write_ordering(WriteOrdering::DrainIo);
                    }
                }
                let out = {
                    let mut epochs = conn.epochs.lock().unwrap_or_else(|e| e.into_inner());
                    epochs.apply(
                        serial,
                        EpochEvent::BarrierDone,
                        false,
                        conn.resource.write_ordering(),
                    )
                };
                recycled = out.recycled;
                worker::handle_epoch_outcome(conn, out).await?;
            }
            if recycled {
                return Ok(());
            }
        }
    }

    conn.epochs
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .maybe_open_new();
    Ok(())
}

/// The peer asks for a block: normal read, resync read, verify read, a
/// verify digest to compare, or a checksum-resync probe.
async fn receive_data_request<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let device = pd.device.clone();

    let fixed = recv_exact(rx, BlockRequestPayload::SIZE).await?;
    let p = BlockRequestPayload::decode(&fixed)
        .ok_or_else(|| PlexError::MalformedFrame("short block request".into()))?;
    let trailer_len = pi.size as usize - BlockRequestPayload::SIZE;

    if !device.have_disk() {
        drain(rx, trailer_len).await?;
        let neg = if pi.cmd == Command::DataRequest {
            Command::NegDReply
        } else {
            Command::NegRsDReply
        };
        return sender::send_block_ack(
            conn,
            neg,
            pi.volume,
            p.sector,
            p.block_id,
            p.blksize,
            0,
        )
        .await;
    }

    let digest = if trailer_len > 0 {
        Some(recv_exact(rx, trailer_len).await?)
    } else {
        None
    };

    if p.blksize == 0 || p.blksize > bpx_core::MAX_BIO_SIZE {
        return Err(PlexError::Protocol(format!(
            "block request of {} bytes",
            p.blksize
        )));
    }

    // Resync and verify reads yield to busy application I/O.
    if pi.cmd != Command::DataRequest {
        let net = conn.net();
        if pd.rs_should_slow_down(net.c_min_rate) {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    if pi.cmd == Command::OvRequest && !pd.repl_state().is_verify() {
        pd.set_repl_state(ReplState::VerifyT);
        pd.ov_left
            .store(device.bitmap.total_bits(), Ordering::Release);
    }

    device.pool.charge(p.blksize as usize, || 0).await?;

    let id = conn.next_id();
    let mut req = PeerRequest::new_write(
        id,
        pi.volume as u16,
        p.sector,
        p.blksize,
        p.block_id,
        0,
        None,
    );
    req.finish_cmd = Some(pi.cmd);
    req.digest = digest;
    device
        .ee
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(req, EeQueue::Read);

    let done = {
        let conn = conn.clone();
        let volume = pi.volume as u16;
        Box::new(move |io: crate::block::IoDone| {
            let _ = conn.queue_work(WorkItem::ReadDone {
                volume,
                request: io.token,
                result: io.result,
                data: io.data,
            });
        })
    };
    let submit = device.block.submit(
        IoRequest {
            token: id,
            kind: IoKind::Read,
            sector: p.sector,
            size: p.blksize,
            data: None,
            flags: 0,
        },
        done,
    );
    if let Err(e) = submit {
        device
            .ee
            .lock()
            .unwrap_or_else(|e2| e2.into_inner())
            .take(id);
        device.pool.release(p.blksize as usize, None);
        return Err(e);
    }
    Ok(())
}

/// Reply to a read we requested from the peer (diskless operation).
async fn receive_data_reply<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let header = recv_exact(rx, DataHeader::SIZE).await?;
    let dh = DataHeader::decode(&header)
        .ok_or_else(|| PlexError::MalformedFrame("short data header".into()))?;
    let data = read_in_block(conn, &pd, rx, pi.size as usize - DataHeader::SIZE, true).await?;

    let device = &pd.device;
    let cookie = Cookie::from_raw(dh.block_id);
    let mut locals = device
        .local_requests
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if let Some(mut req) = locals.take(cookie) {
        req.completed = Some(true);
        debug!(target: "bpx::recv", sector = dh.sector, "read served by peer");
    } else {
        warn!(target: "bpx::recv", sector = dh.sector, "data reply for unknown request");
    }
    drop(locals);
    if let Some(data) = data {
        device.pool.release(data.len(), None);
    }
    device.misc_notify.notify_waiters();
    Ok(())
}

/// Resync data arriving for one of our out-of-sync requests.
async fn receive_rs_data_reply<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let device = pd.device.clone();

    let header = recv_exact(rx, DataHeader::SIZE).await?;
    let dh = DataHeader::decode(&header)
        .ok_or_else(|| PlexError::MalformedFrame("short data header".into()))?;
    let data = read_in_block(conn, &pd, rx, pi.size as usize - DataHeader::SIZE, true).await?;

    let cookie = Cookie::from_raw(dh.block_id);
    let pending = pd
        .rs_pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take(cookie);
    if pending.is_none() {
        // A reply that outlived its resync session.
        warn!(target: "bpx::recv", sector = dh.sector, "stale resync data reply");
        if let Some(data) = data {
            device.pool.release(data.len(), None);
        }
        return Ok(());
    }

    let Some(data) = data else {
        return Err(PlexError::MalformedFrame("resync reply without data".into()));
    };

    if !device.have_disk() {
        device.pool.release(data.len(), None);
        return sender::send_block_ack(
            conn,
            Command::NegRsDReply,
            pi.volume,
            dh.sector,
            dh.block_id,
            0,
            dh.seq_num,
        )
        .await;
    }

    let id = conn.next_id();
    let size = data.len() as u32;
    let mut req = PeerRequest::new_write(
        id,
        pi.volume as u16,
        dh.sector,
        size,
        dh.block_id,
        dh.seq_num,
        Some(data.clone()),
    );
    req.flags |= EE_RS_WRITE;
    device
        .ee
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(req, EeQueue::Sync);

    let done = {
        let conn = conn.clone();
        let volume = pi.volume as u16;
        Box::new(move |io: crate::block::IoDone| {
            let _ = conn.queue_work(WorkItem::WriteDone {
                volume,
                request: io.token,
                result: io.result,
            });
        })
    };
    let submit = device.block.submit(
        IoRequest {
            token: id,
            kind: IoKind::Write,
            sector: dh.sector,
            size,
            data: Some(data),
            flags: 0,
        },
        done,
    );
    if let Err(e) = submit {
        let taken = device
            .ee
            .lock()
            .unwrap_or_else(|e2| e2.into_inner())
            .take(id);
        if let Some(taken) = taken {
            if let Some(d) = taken.data {
                device.pool.release(d.len(), None);
            }
        }
        return Err(e);
    }
    Ok(())
}

async fn receive_protocol<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = ProtocolPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short protocol payload".into()))?;
    let net = conn.net();

    if pi.cmd != Command::ProtocolUpdate {
        conn.clear_flag(CONN_DRY_RUN);
        if p.conn_flags & bpx_wire::CF_DRY_RUN != 0 {
            conn.set_flag(CONN_DRY_RUN);
        }

        if p.wire_protocol != net.wire_protocol as u32 {
            return Err(PlexError::ProtocolIncompatible(
                "incompatible protocol settings".into(),
            ));
        }
        let mirror = |v: u32| {
            crate::config::AfterSbPolicy::from_wire(v).map(crate::config::AfterSbPolicy::mirrored)
        };
        if mirror(p.after_sb_0p) != Some(net.after_sb_0p) {
            return Err(PlexError::ProtocolIncompatible(
                "incompatible after-sb-0pri settings".into(),
            ));
        }
        if mirror(p.after_sb_1p) != Some(net.after_sb_1p) {
            return Err(PlexError::ProtocolIncompatible(
                "incompatible after-sb-1pri settings".into(),
            ));
        }
        if mirror(p.after_sb_2p) != Some(net.after_sb_2p) {
            return Err(PlexError::ProtocolIncompatible(
                "incompatible after-sb-2pri settings".into(),
            ));
        }
        if (p.two_primaries != 0) != net.two_primaries {
            return Err(PlexError::ProtocolIncompatible(
                "incompatible two-primaries settings".into(),
            ));
        }
        if p.conn_flags & bpx_wire::CF_DISCARD_MY_DATA != 0 && net.discard_my_data {
            return Err(PlexError::ProtocolIncompatible(
                "both sides asked to discard their data".into(),
            ));
        }
    }

    if conn.version() >= 87 {
        let alg = crate::config::IntegrityAlg::from_name(&p.integrity_alg)?;
        conn.set_peer_integrity(alg);
        if let Some(alg) = alg {
            info!(target: "bpx::conn", algorithm = alg.name(), "data integrity digest enabled");
        }
    }
    Ok(())
}

async fn receive_sync_param<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let payload = recv_exact(rx, pi.size as usize).await?;
    let dialect_89 = pi.cmd == Command::SyncParam89 && conn.version() >= 89;
    let p = SyncParamPayload::decode(&payload, dialect_89)
        .ok_or_else(|| PlexError::MalformedFrame("short sync param payload".into()))?;

    *pd.verify_alg.lock().unwrap_or_else(|e| e.into_inner()) =
        crate::config::IntegrityAlg::from_name(&p.verify_alg)?;
    *pd.csums_alg.lock().unwrap_or_else(|e| e.into_inner()) =
        crate::config::IntegrityAlg::from_name(&p.csums_alg)?;
    debug!(
        target: "bpx::recv",
        volume = pi.volume,
        resync_rate = p.resync_rate,
        "sync parameters updated"
    );
    Ok(())
}

async fn receive_uuids<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = UuidsPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short uuids payload".into()))?;

    let mut peer = pd.peer_uuids.lock().unwrap_or_else(|e| e.into_inner());
    peer.current = p.current;
    peer.bitmap_uuids = vec![(conn.resource.opts.node_id, p.bitmap)];
    peer.history = p.history;
    peer.dirty_bits = p.dirty_bits;
    peer.flags = p.uuid_flags;
    Ok(())
}

async fn receive_uuids110<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = Uuids110Payload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short uuids110 payload".into()))?;

    let mut bitmap_uuids = Vec::with_capacity(p.bitmap_uuids.len());
    let mut slot = 0;
    for node in 0..64u32 {
        if p.node_mask & (1 << node) != 0 {
            bitmap_uuids.push((node, p.bitmap_uuids[slot]));
            slot += 1;
        }
    }

    let mut peer = pd.peer_uuids.lock().unwrap_or_else(|e| e.into_inner());
    peer.current = p.current;
    peer.bitmap_uuids = bitmap_uuids;
    peer.history = p.history;
    peer.dirty_bits = p.dirty_bits;
    peer.flags = p.uuid_flags;
    Ok(())
}

async fn receive_sizes<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = SizesPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short sizes payload".into()))?;

    let device = &pd.device;
    let my_size = device.exposed_size.load(Ordering::Acquire);
    if p.c_size != 0 && p.c_size < my_size && pd.repl_state() >= ReplState::Established {
        warn!(
            target: "bpx::recv",
            volume = pi.volume,
            peer_size = p.c_size,
            my_size,
            "the peer's current size is too small"
        );
        return Err(PlexError::ProtocolIncompatible(
            "peer device shrank below our exposed size".into(),
        ));
    }
    device
        .peer_max_bio_size
        .store(p.max_bio_size.min(bpx_core::MAX_BIO_SIZE), Ordering::Release);
    *pd.peer_sizes.lock().unwrap_or_else(|e| e.into_inner()) = Some(p);
    Ok(())
}

async fn receive_state<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let payload = recv_exact(rx, pi.size as usize).await?;
    let s = PeerStateWire::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short state payload".into()))?;

    let peer_role = Role::from_wire(s.role()).unwrap_or(Role::Unknown);
    let peer_disk = DiskState::from_wire(s.disk()).unwrap_or(DiskState::Unknown);
    let peer_repl = ReplState::from_wire(s.repl()).unwrap_or(ReplState::Off);

    *pd.peer_role.lock().unwrap_or_else(|e| e.into_inner()) = peer_role;
    pd.set_peer_disk_state(peer_disk);

    let my_repl = pd.repl_state();

    // Peer finished a resync toward us while we stayed source.
    if my_repl == ReplState::SyncSource && peer_repl == ReplState::Established {
        crate::resync::note_source_progress(conn, &pd);
    }

    if !pd.flag(PD_INITIAL_STATE_RECEIVED) {
        pd.set_flag(PD_INITIAL_STATE_RECEIVED);
        let next = crate::handshake::sync_handshake(conn, &pd, peer_role, peer_disk)?;
        pd.set_repl_state(next);
        match next {
            ReplState::WFBitmapS => {
                crate::bitmap_recv::send_bitmap(conn, &pd).await?;
            }
            ReplState::Established => {
                info!(target: "bpx::recv", volume = pi.volume, "replication established, no resync needed");
            }
            _ => {}
        }
    }
    conn.resource.state_notify.notify_waiters();
    Ok(())
}

async fn receive_sync_uuid<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = SyncUuidPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short sync uuid payload".into()))?;

    let device = &pd.device;
    // The sync-uuid is only valid entering a resync as target.
    loop {
        let repl = pd.repl_state();
        if matches!(repl, ReplState::WFSyncUuid | ReplState::Behind | ReplState::WFBitmapT)
            || repl == ReplState::Off
            || !device.have_disk()
        {
            break;
        }
        if conn.cstate().is_tearing_down() {
            return Ok(());
        }
        let notified = device.misc_notify.notified();
        let _ = tokio::time::timeout(conn.net().socket_timeout, notified).await;
    }

    if device.have_disk() {
        {
            let mut uuids = device.uuids.lock().unwrap_or_else(|e| e.into_inner());
            uuids.current = p.uuid;
            uuids.bitmap[pd.bitmap_slot] = 0;
        }
        info!(target: "bpx::recv", volume = pi.volume, "updated sync uuid");
        conn.queue_work(WorkItem::StartResync {
            volume: pi.volume as u16,
            side: ReplState::SyncTarget,
        })?;
    } else {
        warn!(target: "bpx::recv", volume = pi.volume, "ignoring sync uuid packet without disk");
    }
    Ok(())
}

async fn receive_out_of_sync<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = OutOfSyncPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short out-of-sync payload".into()))?;
    pd.device
        .bitmap
        .set_out_of_sync(pd.bitmap_slot, p.sector, p.blksize);
    Ok(())
}

async fn receive_dagtag<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = DagtagPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short dagtag payload".into()))?;

    // The peer caught up after running Ahead; any Behind device can now
    // resync the skipped region from the bitmap.
    for pd in conn.peer_device_list() {
        if pd.repl_state() == ReplState::Behind {
            pd.resync_dagtag.store(p.dagtag, Ordering::Release);
            info!(
                target: "bpx::recv",
                volume = pd.volume,
                dagtag = p.dagtag,
                "peer left Ahead mode, starting resync"
            );
            conn.queue_work(WorkItem::StartResync {
                volume: pd.volume,
                side: ReplState::SyncTarget,
            })?;
        }
    }
    Ok(())
}

async fn receive_peer_dagtag<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = PeerDagtagPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short peer dagtag payload".into()))?;
    pd.resync_dagtag.store(p.dagtag, Ordering::Release);
    Ok(())
}

async fn receive_current_uuid<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let pd = peer_device_for(conn, &pi)?;
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = CurrentUuidPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short current uuid payload".into()))?;
    let mut peer = pd.peer_uuids.lock().unwrap_or_else(|e| e.into_inner());
    if peer.current != p.uuid {
        debug!(
            target: "bpx::recv",
            volume = pi.volume,
            uuid = format_args!("{:016X}", p.uuid),
            "peer rotated its current uuid"
        );
        peer.current = p.uuid;
    }
    Ok(())
}

const SS_SUCCESS: i32 = 1;
const SS_CW_FAILED_BY_PEER: i32 = -10;

/// One-phase state change request (pre-110 dialects).
async fn receive_state_chg_req<R: AsyncRead + Unpin>(
    conn: &Arc<Connection>,
    rx: &mut R,
    pi: PacketInfo,
) -> Result<()> {
    let payload = recv_exact(rx, pi.size as usize).await?;
    let p = StateChgReqPayload::decode(&payload)
        .ok_or_else(|| PlexError::MalformedFrame("short state change request".into()))?;

    let reply_cmd = if pi.cmd == Command::ConnStChgReq {
        Command::ConnStChgReply
    } else {
        Command::StateChgReply
    };

    let retcode = if p.mask & crate::twopc::MASK_ROLE != 0
        && crate::twopc::val_role(p.val) == Role::Primary as u32
        && conn.resource.role() == Role::Primary
        && !conn.net().two_primaries
    {
        SS_CW_FAILED_BY_PEER
    } else {
        if p.mask & crate::twopc::MASK_ROLE != 0 {
            if let Some(role) = Role::from_wire(crate::twopc::val_role(p.val)) {
                if let Some(pd) = conn.peer_device(pi.volume.max(0)) {
                    *pd.peer_role.lock().unwrap_or_else(|e| e.into_inner()) = role;
                }
            }
        }
        if p.mask & crate::twopc::MASK_CONN != 0
            && crate::twopc::val_conn(p.val) == crate::twopc::CONN_VAL_DISCONNECTING
        {
            conn.set_flag(crate::connection::CONN_DISCONNECT_EXPECTED);
        }
        SS_SUCCESS
    };

    let reply = StateChgReplyPayload { retcode };
    sender::send_packet(conn, SocketKind::Meta, reply_cmd, pi.volume, &reply.encode()).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_flags_mapping() {
        let res = crate::resource::Resource::new(crate::config::ResourceOptions::default());
        let conn = Connection::new(res, crate::config::NetConfig::default());
        conn.set_version(110);
        let f = wire_flags_to_submit(&conn, DP_RW_SYNC | DP_FUA | DP_FLUSH);
        assert_eq!(f, SUBMIT_SYNC | SUBMIT_FUA | SUBMIT_FLUSH);

        // Old dialect only understands the sync bit.
        conn.set_version(89);
        let f = wire_flags_to_submit(&conn, DP_RW_SYNC | DP_FUA);
        assert_eq!(f, SUBMIT_SYNC);
    }
}
