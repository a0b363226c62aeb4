//! End-to-end receiver tests: frames go in on an in-memory data socket,
//! acknowledgements come back on the meta socket, the block layer and
//! bitmap are in-memory doubles.

#![allow(clippy::unwrap_used)]

use bpx_engine::testing::{MemBitmap, MemBlockIo, NullActivityLog};
use bpx_engine::{
    run_ack_reader, run_receiver, spawn_worker, Connection, Device, LocalRequest, NetConfig,
    PeerDevice, ReplState, Resource, ResourceOptions, Role, SyncBitmap, WorkItem, WriteOrdering,
    CONN_RESOLVE_CONFLICTS,
};
use bpx_wire::{
    encode_header, BarrierAckPayload, BarrierPayload, BlockAckPayload, BlockRequestPayload,
    Command, DataHeader, PacketInfo, PeerStateWire, TwopcPayload, Uuids110Payload,
    DP_SEND_WRITE_ACK,
};
use bpx_core::Interval as CoreInterval;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

const VERSION: u32 = 110;

struct Harness {
    conn: Arc<Connection>,
    device: Arc<Device>,
    pd: Arc<PeerDevice>,
    disk: Arc<MemBlockIo>,
    bitmap: Arc<MemBitmap>,
    /// Peer side of the data socket.
    data_wr: WriteHalf<DuplexStream>,
    data_rd: ReadHalf<DuplexStream>,
    /// Peer side of the meta socket.
    meta_rd: ReadHalf<DuplexStream>,
    meta_wr: WriteHalf<DuplexStream>,
    receiver: tokio::task::JoinHandle<bpx_core::Result<()>>,
}

async fn setup(net: NetConfig) -> Harness {
    let resource = Resource::new(ResourceOptions {
        name: "r0".into(),
        node_id: 0,
        twopc_timeout: Duration::from_secs(5),
    });
    let disk = Arc::new(MemBlockIo::new(1 << 20));
    let bitmap = Arc::new(MemBitmap::new(2, 4096));
    let device = Device::new(
        0,
        vec![1],
        disk.clone(),
        bitmap.clone(),
        Arc::new(NullActivityLog::default()),
        256,
    );
    resource.add_device(device.clone());

    let conn = Connection::new(resource, net);
    conn.set_version(VERSION);
    let pd = PeerDevice::new(device.clone(), 1, 0);
    conn.add_peer_device(pd.clone());

    let (peer_data, our_data) = tokio::io::duplex(1 << 20);
    let (peer_meta, our_meta) = tokio::io::duplex(1 << 20);
    let (our_data_rd, our_data_wr) = tokio::io::split(our_data);
    let (our_meta_rd, our_meta_wr) = tokio::io::split(our_meta);
    let (peer_data_rd, peer_data_wr) = tokio::io::split(peer_data);
    let (peer_meta_rd, peer_meta_wr) = tokio::io::split(peer_meta);

    *conn.data_tx.lock().await = Some(Box::new(our_data_wr));
    *conn.meta_tx.lock().await = Some(Box::new(our_meta_wr));

    spawn_worker(conn.clone());
    conn.set_cstate(bpx_engine::ConnState::Connected);

    let ack_conn = conn.clone();
    tokio::spawn(async move {
        let mut rx = our_meta_rd;
        let _ = run_ack_reader(&ack_conn, &mut rx).await;
    });

    let recv_conn = conn.clone();
    let receiver = tokio::spawn(async move {
        let mut rx = our_data_rd;
        run_receiver(&recv_conn, &mut rx).await
    });

    Harness {
        conn,
        device,
        pd,
        disk,
        bitmap,
        data_wr: peer_data_wr,
        data_rd: peer_data_rd,
        meta_rd: peer_meta_rd,
        meta_wr: peer_meta_wr,
        receiver,
    }
}

async fn send_frame(
    wr: &mut WriteHalf<DuplexStream>,
    cmd: Command,
    volume: i16,
    payload: &[u8],
) {
    let header = encode_header(cmd, payload.len() as u32, volume, VERSION);
    wr.write_all(&header).await.unwrap();
    wr.write_all(payload).await.unwrap();
    wr.flush().await.unwrap();
}

async fn read_frame(rd: &mut ReadHalf<DuplexStream>) -> (PacketInfo, Vec<u8>) {
    let mut header = vec![0u8; bpx_wire::header_size(VERSION)];
    rd.read_exact(&mut header).await.unwrap();
    let pi = bpx_wire::decode_header(&header, VERSION).unwrap();
    let mut payload = vec![0u8; pi.size as usize];
    rd.read_exact(&mut payload).await.unwrap();
    (pi, payload)
}

async fn read_frame_timeout(rd: &mut ReadHalf<DuplexStream>) -> (PacketInfo, Vec<u8>) {
    tokio::time::timeout(Duration::from_secs(5), read_frame(rd))
        .await
        .expect("no frame within timeout")
}

fn data_frame(sector: u64, block_id: u64, seq: u32, dp_flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = DataHeader {
        sector,
        block_id,
        seq_num: seq,
        dp_flags,
    }
    .encode()
    .to_vec();
    buf.extend_from_slice(payload);
    buf
}

#[tokio::test]
async fn test_writes_then_barrier_ack() {
    // Three writes, then the barrier; with flush ordering the BarrierAck
    // arrives after the writes completed and the device flushed.
    let mut h = setup(NetConfig::default()).await;
    assert_eq!(h.conn.resource.write_ordering(), WriteOrdering::BdevFlush);

    let payload = vec![0x5au8; 4096];
    for i in 0..3u64 {
        let frame = data_frame(i * 8, 0x1000 + i, 0, DP_SEND_WRITE_ACK, &payload);
        send_frame(&mut h.data_wr, Command::Data, 0, &frame).await;
    }
    send_frame(
        &mut h.meta_wr,
        Command::Ping,
        -1,
        &[],
    )
    .await;
    send_frame(
        &mut h.data_wr,
        Command::Barrier,
        -1,
        &BarrierPayload { barrier_nr: 7 }.encode(),
    )
    .await;

    let mut write_acks = 0;
    let mut barrier_ack = None;
    while barrier_ack.is_none() {
        let (pi, payload) = read_frame_timeout(&mut h.meta_rd).await;
        match pi.cmd {
            Command::WriteAck => write_acks += 1,
            Command::BarrierAck => {
                barrier_ack = Some(BarrierAckPayload::decode(&payload).unwrap());
            }
            Command::PingAck => {}
            other => panic!("unexpected meta command {other}"),
        }
    }
    assert_eq!(write_acks, 3);
    let ack = barrier_ack.unwrap();
    assert_eq!(ack.barrier_nr, 7);
    assert_eq!(ack.set_size, 3);
    assert!(h.disk.flushes.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    assert_eq!(h.disk.read_sector(0)[0], 0x5a);
    assert_eq!(h.disk.read_sector(16)[0], 0x5a);
}

#[tokio::test]
async fn test_flush_failure_degrades_write_ordering() {
    let mut h = setup(NetConfig::default()).await;
    *h.disk.fail_next_flush.lock().unwrap() = Some("injected".into());

    let frame = data_frame(0, 1, 0, DP_SEND_WRITE_ACK, &vec![1u8; 4096]);
    send_frame(&mut h.data_wr, Command::Data, 0, &frame).await;
    send_frame(
        &mut h.data_wr,
        Command::Barrier,
        -1,
        &BarrierPayload { barrier_nr: 1 }.encode(),
    )
    .await;

    // The barrier still acks, but the next epoch takes the drained path.
    loop {
        let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
        if pi.cmd == Command::BarrierAck {
            break;
        }
    }
    assert_eq!(h.conn.resource.write_ordering(), WriteOrdering::DrainIo);
}

#[tokio::test]
async fn test_conflict_contained_write_superseded() {
    // Two-primaries, we own conflict resolution, and the incoming peer
    // write is fully contained in a live local write: discard ack.
    let net = NetConfig {
        two_primaries: true,
        ..NetConfig::default()
    };
    let mut h = setup(net).await;
    h.conn.set_flag(CONN_RESOLVE_CONFLICTS);

    // A local write covering [100, 108).
    let cookie = {
        let mut locals = h.device.local_requests.lock().unwrap();
        locals.insert(LocalRequest {
            sector: 100,
            size: 4096,
            pending_local: true,
            postponed: false,
            interval: None,
            completed: None,
            dagtag: 1,
        })
    };
    {
        let mut intervals = h.device.intervals.lock().unwrap();
        let iv = intervals.insert(CoreInterval {
            sector: 100,
            size: 4096,
            local: true,
            waiting: false,
            token: cookie.as_u64(),
        });
        let mut locals = h.device.local_requests.lock().unwrap();
        locals.get_mut(cookie).unwrap().interval = Some(iv);
    }

    // Peer write [102, 104), contained.
    let frame = data_frame(102, 0xbeef, 1, DP_SEND_WRITE_ACK, &vec![9u8; 1024]);
    send_frame(&mut h.data_wr, Command::Data, 0, &frame).await;

    let (pi, payload) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::Superseded);
    let ack = BlockAckPayload::decode(&payload).unwrap();
    assert_eq!(ack.sector, 102);
    assert_eq!(ack.block_id, 0xbeef);

    // The discarded write was never submitted; the local one lives on.
    assert_eq!(h.disk.writes.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert!(h.device.local_requests.lock().unwrap().get(cookie).is_some());

    // The epoch still counts the discarded write.
    send_frame(
        &mut h.data_wr,
        Command::Barrier,
        -1,
        &BarrierPayload { barrier_nr: 3 }.encode(),
    )
    .await;
    loop {
        let (pi, payload) = read_frame_timeout(&mut h.meta_rd).await;
        if pi.cmd == Command::BarrierAck {
            let ack = BarrierAckPayload::decode(&payload).unwrap();
            assert_eq!((ack.barrier_nr, ack.set_size), (3, 1));
            break;
        }
    }
}

#[tokio::test]
async fn test_overlapping_not_contained_write_retried() {
    let net = NetConfig {
        two_primaries: true,
        ..NetConfig::default()
    };
    let mut h = setup(net).await;
    h.conn.set_flag(CONN_RESOLVE_CONFLICTS);

    let cookie = {
        let mut locals = h.device.local_requests.lock().unwrap();
        locals.insert(LocalRequest {
            sector: 100,
            size: 4096,
            pending_local: true,
            postponed: false,
            interval: None,
            completed: None,
            dagtag: 1,
        })
    };
    {
        let mut intervals = h.device.intervals.lock().unwrap();
        let iv = intervals.insert(CoreInterval {
            sector: 100,
            size: 4096,
            local: true,
            waiting: false,
            token: cookie.as_u64(),
        });
        h.device
            .local_requests
            .lock()
            .unwrap()
            .get_mut(cookie)
            .unwrap()
            .interval = Some(iv);
    }

    // Peer write [104, 112) overlaps but is not contained: retry.
    let frame = data_frame(104, 0xcafe, 1, DP_SEND_WRITE_ACK, &vec![7u8; 4096]);
    send_frame(&mut h.data_wr, Command::Data, 0, &frame).await;

    let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::RetryWrite);
}

#[tokio::test]
async fn test_twopc_prepare_commit_duplicate_tolerant() {
    let mut h = setup(NetConfig::default()).await;

    let p = TwopcPayload {
        tid: 42,
        initiator_node_id: 1,
        target_node_id: -1,
        primary_nodes: 0,
        weak_nodes: 0,
        mask: 0x3, // role
        val: Role::Primary as u32,
    };
    send_frame(&mut h.data_wr, Command::TwopcPrepare, -1, &p.encode()).await;
    let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::TwopcYes);

    // Duplicate prepare: re-acked, not re-prepared.
    send_frame(&mut h.data_wr, Command::TwopcPrepare, -1, &p.encode()).await;
    let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::TwopcYes);

    // Commit twice; the second is a tolerated duplicate.
    send_frame(&mut h.data_wr, Command::TwopcCommit, -1, &p.encode()).await;
    send_frame(&mut h.data_wr, Command::TwopcCommit, -1, &p.encode()).await;

    // Settle: transaction closed, the peer role was applied exactly once.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let twopc = h.conn.resource.twopc.lock().unwrap();
                if !twopc.remote_state_change {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*h.pd.peer_role.lock().unwrap(), Role::Primary);
}

#[tokio::test]
async fn test_concurrent_twopc_gets_retry() {
    let mut h = setup(NetConfig::default()).await;
    let p1 = TwopcPayload {
        tid: 1,
        initiator_node_id: 1,
        target_node_id: -1,
        primary_nodes: 0,
        weak_nodes: 0,
        mask: 0,
        val: 0,
    };
    send_frame(&mut h.data_wr, Command::TwopcPrepare, -1, &p1.encode()).await;
    let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::TwopcYes);

    let p2 = TwopcPayload { tid: 2, ..p1 };
    send_frame(&mut h.data_wr, Command::TwopcPrepare, -1, &p2.encode()).await;
    let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::TwopcRetry);
}

#[tokio::test]
async fn test_handshake_equal_uuids_establishes() {
    // Fresh pairing with identical current UUIDs and no crashed-primary
    // flags: no resync, replication comes up Established.
    let mut h = setup(NetConfig::default()).await;
    {
        let mut uuids = h.device.uuids.lock().unwrap();
        uuids.current = 0xAAAA_0000_0000_0000;
    }
    let uuids = Uuids110Payload {
        current: 0xAAAA_0000_0000_0000,
        dirty_bits: 0,
        uuid_flags: 0,
        node_mask: 1, // slot for node 0 (us)
        bitmap_uuids: vec![0],
        history: [0, 0],
    };
    send_frame(&mut h.data_wr, Command::Uuids110, 0, &uuids.encode()).await;
    let state = PeerStateWire::pack(
        Role::Secondary as u32,
        bpx_engine::DiskState::UpToDate as u32,
        bpx_engine::DiskState::UpToDate as u32,
        ReplState::Off as u32,
    );
    send_frame(&mut h.data_wr, Command::State, 0, &state.encode()).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.pd.repl_state() != ReplState::Established {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("did not reach Established");
}

#[tokio::test]
async fn test_handshake_peer_history_means_full_sync_target() {
    // Our current UUID sits in the peer's history: we are behind, become
    // SyncTarget with the whole bitmap set before the first request.
    let mut h = setup(NetConfig::default()).await;
    {
        let mut uuids = h.device.uuids.lock().unwrap();
        uuids.current = 0xAAAA;
    }
    let uuids = Uuids110Payload {
        current: 0xCCCC,
        dirty_bits: 0,
        uuid_flags: 0,
        node_mask: 1,
        bitmap_uuids: vec![0],
        history: [0xAAAA, 0],
    };
    send_frame(&mut h.data_wr, Command::Uuids110, 0, &uuids.encode()).await;
    let state = PeerStateWire::pack(
        Role::Secondary as u32,
        bpx_engine::DiskState::UpToDate as u32,
        bpx_engine::DiskState::UpToDate as u32,
        ReplState::Off as u32,
    );
    send_frame(&mut h.data_wr, Command::State, 0, &state.encode()).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.pd.repl_state() != ReplState::WFBitmapT {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("did not reach WFBitmapT");
    // Full sync: every bit set before any resync request goes out.
    assert_eq!(h.bitmap.total_weight(0), h.bitmap.total_bits());
}

#[tokio::test]
async fn test_resync_target_requests_writes_and_finishes() {
    let mut h = setup(NetConfig::default()).await;

    // Two out-of-sync blocks.
    h.bitmap.set_out_of_sync(0, 0, 4096);
    h.bitmap.set_out_of_sync(0, 8, 4096);
    {
        let mut peer = h.pd.peer_uuids.lock().unwrap();
        peer.current = 0xBBBB;
    }
    h.conn
        .queue_work(WorkItem::StartResync {
            volume: 0,
            side: ReplState::SyncTarget,
        })
        .unwrap();

    // The engine asks for both blocks on the data socket.
    let mut requests = Vec::new();
    for _ in 0..2 {
        let (pi, payload) = read_frame_timeout(&mut h.data_rd).await;
        assert_eq!(pi.cmd, Command::RsDataRequest);
        requests.push(BlockRequestPayload::decode(&payload).unwrap());
    }
    requests.sort_by_key(|r| r.sector);
    assert_eq!(requests[0].sector, 0);
    assert_eq!(requests[1].sector, 8);

    // Serve both; the engine writes them and acks each with RsWriteAck.
    for req in &requests {
        let frame = data_frame(req.sector, req.block_id, 0, 0, &vec![0x42u8; 4096]);
        send_frame(&mut h.data_wr, Command::RsDataReply, 0, &frame).await;
    }
    let mut rs_acks = 0;
    while rs_acks < 2 {
        let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
        if pi.cmd == Command::RsWriteAck {
            rs_acks += 1;
        }
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.pd.repl_state() != ReplState::Established {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("resync did not finish");
    assert_eq!(h.bitmap.total_weight(0), 0);
    assert_eq!(h.disk.read_sector(0)[0], 0x42);
    assert_eq!(h.disk.read_sector(8)[0], 0x42);
    // The target adopted the source's data generation.
    assert_eq!(h.device.uuids.lock().unwrap().current, 0xBBBB);
}

#[tokio::test]
async fn test_source_serves_resync_requests() {
    let mut h = setup(NetConfig::default()).await;
    // Put known data on disk via a normal write first.
    let frame = data_frame(16, 1, 0, DP_SEND_WRITE_ACK, &vec![0x77u8; 4096]);
    send_frame(&mut h.data_wr, Command::Data, 0, &frame).await;
    let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::WriteAck);

    // Now ask for it back like a resync target would.
    let req = BlockRequestPayload {
        sector: 16,
        block_id: 0x5151,
        blksize: 4096,
    };
    send_frame(&mut h.data_wr, Command::RsDataRequest, 0, &req.encode()).await;
    let (pi, payload) = read_frame_timeout(&mut h.data_rd).await;
    assert_eq!(pi.cmd, Command::RsDataReply);
    let dh = DataHeader::decode(&payload).unwrap();
    assert_eq!(dh.sector, 16);
    assert_eq!(dh.block_id, 0x5151);
    assert_eq!(payload.len(), DataHeader::SIZE + 4096);
    assert!(payload[DataHeader::SIZE..].iter().all(|&b| b == 0x77));
}

#[tokio::test]
async fn test_bitmap_receive_starts_source_resync() {
    let mut h = setup(NetConfig::default()).await;
    h.pd.set_repl_state(ReplState::WFBitmapS);

    // The peer reports two dirty ranges via a compressed bitmap.
    let total_bits = h.bitmap.total_bits();
    let mut words = vec![0u64; (total_bits as usize).div_ceil(64)];
    words[0] = 0b11;
    let payload = bpx_wire::rle_encode(&words, total_bits).unwrap().unwrap();
    send_frame(&mut h.data_wr, Command::CompressedBitmap, 0, &payload).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.pd.repl_state() != ReplState::SyncSource {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("did not become SyncSource");
    assert_eq!(h.bitmap.total_weight(0), 2);
}

#[tokio::test]
async fn test_write_ack_completes_local_request() {
    let mut h = setup(NetConfig::default()).await;
    h.conn.set_flag(CONN_RESOLVE_CONFLICTS);

    let cookie = {
        let mut locals = h.device.local_requests.lock().unwrap();
        locals.insert(LocalRequest {
            sector: 64,
            size: 4096,
            pending_local: false,
            postponed: false,
            interval: None,
            completed: None,
            dagtag: 7,
        })
    };

    let ack = BlockAckPayload {
        sector: 64,
        block_id: cookie.as_u64(),
        blksize: 4096,
        seq_num: 1,
    };
    send_frame(&mut h.meta_wr, Command::WriteAck, 0, &ack.encode()).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.device.local_requests.lock().unwrap().get(cookie).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ack did not complete the local request");
    assert_eq!(h.pd.current_peer_seq(), 1);

    // A stale duplicate of the same ack resolves to nothing.
    send_frame(&mut h.meta_wr, Command::WriteAck, 0, &ack.encode()).await;
    send_frame(&mut h.meta_wr, Command::Ping, -1, &[]).await;
    let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::PingAck);
}

#[tokio::test]
async fn test_malformed_frame_tears_the_connection_down() {
    let mut h = setup(NetConfig::default()).await;
    // Garbage magic.
    h.data_wr.write_all(&[0xffu8; 14]).await.unwrap();
    h.data_wr.flush().await.unwrap();
    let res = tokio::time::timeout(Duration::from_secs(5), h.receiver)
        .await
        .unwrap()
        .unwrap();
    assert!(res.is_err());
    let _ = h.meta_rd;
}

#[tokio::test]
async fn test_detached_disk_drains_and_neg_acks() {
    let mut h = setup(NetConfig::default()).await;
    h.device.set_disk_state(bpx_engine::DiskState::Diskless);

    let frame = data_frame(0, 0xabad, 0, DP_SEND_WRITE_ACK, &vec![1u8; 4096]);
    send_frame(&mut h.data_wr, Command::Data, 0, &frame).await;

    let (pi, payload) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::NegAck);
    let ack = BlockAckPayload::decode(&payload).unwrap();
    assert_eq!(ack.block_id, 0xabad);
    assert_eq!(h.disk.writes.load(std::sync::atomic::Ordering::Relaxed), 0);

    // The receiver survives and keeps processing frames.
    h.device.set_disk_state(bpx_engine::DiskState::UpToDate);
    let frame = data_frame(8, 2, 0, DP_SEND_WRITE_ACK, &vec![2u8; 512]);
    send_frame(&mut h.data_wr, Command::Data, 0, &frame).await;
    let (pi, _) = read_frame_timeout(&mut h.meta_rd).await;
    assert_eq!(pi.cmd, Command::WriteAck);
}
