//! One TCP connection pair to one peer.

use crate::block::{BlockIo, NoHelper, PolicyHelper, SyncBitmap};
use crate::config::NetConfig;
use crate::epoch::EpochList;
use crate::peer_device::PeerDevice;
use crate::request::RequestId;
use crate::resource::Resource;
use crate::state::{ConnState, ReplState};
use crate::worker::WorkItem;
use bpx_core::{PlexError, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::info;

/// This side accepted INITIAL_META last and owns conflict tie-breaks.
pub const CONN_RESOLVE_CONFLICTS: u32 = 1 << 0;
/// A disconnect was requested; errors are expected and quiet.
pub const CONN_DISCONNECT_EXPECTED: u32 = 1 << 1;
/// Dry-run connect negotiated with the peer.
pub const CONN_DRY_RUN: u32 = 1 << 2;
/// A ping is on the wire awaiting its PingAck.
pub const CONN_PING_PENDING: u32 = 1 << 3;

pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Entries of the transmit log released by BarrierAck.
#[derive(Debug)]
pub struct TransmitEpoch {
    pub barrier_nr: u32,
    pub requests: Vec<bpx_core::Cookie>,
}

pub struct Connection {
    pub resource: Arc<Resource>,
    net: RwLock<Arc<NetConfig>>,
    cstate: Mutex<ConnState>,
    pub flags: AtomicU32,
    agreed_version: AtomicU32,
    pub agreed_features: AtomicU32,
    peer_devices: RwLock<BTreeMap<u16, Arc<PeerDevice>>>,
    pub epochs: Mutex<EpochList>,
    pub last_dagtag: AtomicU64,
    /// Receive order of peer writes (protocol >= 110 peer-ack bookkeeping).
    pub recv_order: Mutex<VecDeque<(u16, RequestId)>>,
    /// Our own sent-write epochs awaiting BarrierAck.
    pub transmit_log: Mutex<VecDeque<TransmitEpoch>>,
    pub data_tx: tokio::sync::Mutex<Option<BoxedWrite>>,
    pub meta_tx: tokio::sync::Mutex<Option<BoxedWrite>>,
    worker_tx: Mutex<Option<UnboundedSender<WorkItem>>>,
    pub helper: Arc<dyn PolicyHelper>,
    /// Integrity digest the peer applies to data payloads.
    peer_integrity: Mutex<Option<crate::config::IntegrityAlg>>,
    last_received: Mutex<Instant>,
    next_request_id: AtomicU64,
    /// Woken on connection state changes.
    pub state_notify: Notify,
}

impl Connection {
    #[must_use]
    pub fn new(resource: Arc<Resource>, net: NetConfig) -> Arc<Self> {
        Self::with_helper(resource, net, Arc::new(NoHelper))
    }

    #[must_use]
    pub fn with_helper(
        resource: Arc<Resource>,
        net: NetConfig,
        helper: Arc<dyn PolicyHelper>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource,
            net: RwLock::new(Arc::new(net)),
            cstate: Mutex::new(ConnState::StandAlone),
            flags: AtomicU32::new(0),
            agreed_version: AtomicU32::new(bpx_wire::PROTOCOL_MIN),
            agreed_features: AtomicU32::new(0),
            peer_devices: RwLock::new(BTreeMap::new()),
            epochs: Mutex::new(EpochList::new()),
            last_dagtag: AtomicU64::new(0),
            recv_order: Mutex::new(VecDeque::new()),
            transmit_log: Mutex::new(VecDeque::new()),
            data_tx: tokio::sync::Mutex::new(None),
            meta_tx: tokio::sync::Mutex::new(None),
            worker_tx: Mutex::new(None),
            helper,
            peer_integrity: Mutex::new(None),
            last_received: Mutex::new(Instant::now()),
            next_request_id: AtomicU64::new(1),
            state_notify: Notify::new(),
        })
    }

    #[must_use]
    pub fn net(&self) -> Arc<NetConfig> {
        self.net.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Publish a new configuration; readers holding the old `Arc` drain
    /// naturally.
    pub fn set_net(&self, net: NetConfig) {
        *self.net.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(net);
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.agreed_version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, v: u32) {
        self.agreed_version.store(v, Ordering::Release);
    }

    #[must_use]
    pub fn cstate(&self) -> ConnState {
        *self.cstate.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_cstate(&self, to: ConnState) {
        let mut guard = self.cstate.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != to {
            info!(
                target: "bpx::conn",
                peer = self.net().peer_node_id,
                from = %*guard,
                to = %to,
                "connection state change"
            );
            *guard = to;
        }
        drop(guard);
        self.state_notify.notify_waiters();
        self.resource.state_notify.notify_waiters();
    }

    #[must_use]
    pub fn flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    pub fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn add_peer_device(&self, pd: Arc<PeerDevice>) {
        self.peer_devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pd.volume, pd);
    }

    #[must_use]
    pub fn peer_device(&self, volume: i16) -> Option<Arc<PeerDevice>> {
        if volume < 0 {
            return None;
        }
        self.peer_devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(volume as u16))
            .cloned()
    }

    #[must_use]
    pub fn peer_device_list(&self) -> Vec<Arc<PeerDevice>> {
        self.peer_devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn next_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_worker(&self, tx: UnboundedSender<WorkItem>) {
        *self.worker_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    pub fn queue_work(&self, item: WorkItem) -> Result<()> {
        let guard = self.worker_tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx
                .send(item)
                .map_err(|_| PlexError::ChannelDisconnected("worker")),
            None => Err(PlexError::ChannelDisconnected("worker not started")),
        }
    }

    #[must_use]
    pub fn peer_integrity(&self) -> Option<crate::config::IntegrityAlg> {
        *self
            .peer_integrity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_peer_integrity(&self, alg: Option<crate::config::IntegrityAlg>) {
        *self
            .peer_integrity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = alg;
    }

    pub fn tick_received(&self) {
        *self
            .last_received
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    #[must_use]
    pub fn since_last_received(&self) -> std::time::Duration {
        self.last_received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Centralized, idempotent teardown of the replication pipeline.
    ///
    /// Called by the connect loop after the receiver, ack-reader and
    /// worker have stopped; never by individual handlers.
    pub fn teardown(&self) {
        let write_ordering = self.resource.write_ordering();

        for pd in self.peer_device_list() {
            pd.set_repl_state(ReplState::Off);
            pd.reset_peer_seq();
            let drained = pd
                .rs_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain();
            if !drained.is_empty() {
                info!(
                    target: "bpx::conn",
                    volume = pd.volume,
                    dropped = drained.len(),
                    "dropping in-flight resync requests"
                );
            }
            pd.rs_backlog
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();

            let device = &pd.device;
            let reqs: Vec<_> = {
                let mut ee = device.ee.lock().unwrap_or_else(|e| e.into_inner());
                let ids: Vec<_> = [
                    crate::request::EeQueue::Active,
                    crate::request::EeQueue::Sync,
                    crate::request::EeQueue::Read,
                    crate::request::EeQueue::Done,
                    crate::request::EeQueue::Net,
                ]
                .iter()
                .flat_map(|q| ee.ids_in(*q))
                .collect();
                ids.into_iter().filter_map(|id| ee.take(id)).collect()
            };
            for req in reqs {
                if let Some(iv) = req.interval {
                    device
                        .intervals
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(iv);
                }
                if let Some(serial) = req.epoch_serial {
                    // Cleanup events drain the epoch without acks.
                    self.epochs
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .apply(serial, crate::epoch::EpochEvent::Put, true, write_ordering);
                }
                if let Some(data) = req.data {
                    device.pool.release(data.len(), None);
                } else if req.queue == crate::request::EeQueue::Read {
                    device.pool.release(req.size as usize, None);
                }
            }
            device.misc_notify.notify_waiters();
            device.ee_notify.notify_waiters();

            // Local requests postponed in conflict resolution will never be
            // restarted by this peer.
            let stale_intervals: Vec<_> = {
                let mut locals = device
                    .local_requests
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let stale: Vec<_> = locals
                    .iter()
                    .filter(|(_, r)| r.postponed)
                    .map(|(c, _)| c)
                    .collect();
                stale
                    .into_iter()
                    .filter_map(|cookie| locals.take(cookie).and_then(|r| r.interval))
                    .collect()
            };
            for iv in stale_intervals {
                device
                    .intervals
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(iv);
            }
        }

        {
            let mut epochs = self.epochs.lock().unwrap_or_else(|e| e.into_inner());
            epochs.cleanup(write_ordering);
            // The connection is the unit of recovery: the next attempt
            // starts with a fresh epoch list.
            *epochs = EpochList::new();
        }
        self.recv_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.transmit_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.clear_flag(CONN_PING_PENDING);

        crate::twopc::abort_if_parent(self);
    }
}

/// Report our settings and per-device state to the peer, the way a fresh
/// connection introduces itself: sync parameters, sizes, UUIDs, state.
pub async fn send_initial_state(conn: &Arc<Connection>) -> Result<()> {
    use crate::sender::{send_packet, SocketKind};
    use bpx_wire::{PeerStateWire, SizesPayload, SyncParamPayload, Uuids110Payload, UuidsPayload};

    let net = conn.net();
    for pd in conn.peer_device_list() {
        let device = &pd.device;
        let volume = pd.volume as i16;

        let sp = SyncParamPayload {
            resync_rate: net.c_min_rate,
            verify_alg: pd
                .verify_alg()
                .map(|a| a.name().to_string())
                .unwrap_or_default(),
            csums_alg: pd
                .csums_alg()
                .map(|a| a.name().to_string())
                .unwrap_or_default(),
        };
        if conn.version() >= 89 {
            send_packet(
                conn,
                SocketKind::Data,
                bpx_wire::Command::SyncParam89,
                volume,
                &sp.encode(true),
            )
            .await?;
        } else {
            send_packet(
                conn,
                SocketKind::Data,
                bpx_wire::Command::SyncParam,
                volume,
                &sp.encode(false),
            )
            .await?;
        }

        let capacity = device.block.capacity();
        let sizes = SizesPayload {
            d_size: capacity,
            u_size: 0,
            c_size: device.exposed_size.load(Ordering::Acquire),
            max_bio_size: bpx_core::MAX_BIO_SIZE,
            dds_flags: 0,
        };
        send_packet(
            conn,
            SocketKind::Data,
            bpx_wire::Command::Sizes,
            volume,
            &sizes.encode(),
        )
        .await?;

        let mut uuid_flags = 0u64;
        if device.crashed_primary.load(Ordering::Acquire) {
            uuid_flags |= bpx_wire::UUID_FLAG_CRASHED_PRIMARY;
        }
        if net.discard_my_data {
            uuid_flags |= bpx_wire::UUID_FLAG_DISCARD_MY_DATA;
        }
        let dirty_bits = device.bitmap.total_weight(pd.bitmap_slot);

        if conn.version() >= 110 {
            let (current, bitmap_uuids, history, node_mask) = {
                let uuids = device.uuids.lock().unwrap_or_else(|e| e.into_inner());
                let mut mask = 0u64;
                let mut by_node: Vec<(u32, u64)> = uuids
                    .slot_node_ids
                    .iter()
                    .zip(uuids.bitmap.iter())
                    .map(|(n, u)| (*n, *u))
                    .collect();
                by_node.sort_unstable_by_key(|(n, _)| *n);
                for (n, _) in &by_node {
                    mask |= 1u64 << n;
                }
                (
                    uuids.current,
                    by_node.into_iter().map(|(_, u)| u).collect::<Vec<_>>(),
                    uuids.history,
                    mask,
                )
            };
            let p = Uuids110Payload {
                current,
                dirty_bits,
                uuid_flags,
                node_mask,
                bitmap_uuids,
                history,
            };
            send_packet(
                conn,
                SocketKind::Data,
                bpx_wire::Command::Uuids110,
                volume,
                &p.encode(),
            )
            .await?;
        } else {
            let p = {
                let uuids = device.uuids.lock().unwrap_or_else(|e| e.into_inner());
                UuidsPayload {
                    current: uuids.current,
                    bitmap: uuids.bitmap[pd.bitmap_slot],
                    history: uuids.history,
                    dirty_bits,
                    uuid_flags,
                }
            };
            send_packet(
                conn,
                SocketKind::Data,
                bpx_wire::Command::Uuids,
                volume,
                &p.encode(),
            )
            .await?;
        }

        let state = PeerStateWire::pack(
            conn.resource.role() as u32,
            device.disk_state() as u32,
            pd.peer_disk_state() as u32,
            pd.repl_state() as u32,
        );
        send_packet(
            conn,
            SocketKind::Data,
            bpx_wire::Command::State,
            volume,
            &state.encode(),
        )
        .await?;
    }
    Ok(())
}

async fn run_established(conn: &Arc<Connection>, pair: crate::listener::SocketPair) -> Result<()> {
    use tokio::time::timeout;

    if pair.resolve_conflicts {
        conn.set_flag(CONN_RESOLVE_CONFLICTS);
    } else {
        conn.clear_flag(CONN_RESOLVE_CONFLICTS);
    }

    let (mut data_rx, data_tx) = pair.data.into_split();
    let (meta_rx, meta_tx) = pair.meta.into_split();
    *conn.data_tx.lock().await = Some(Box::new(data_tx));
    *conn.meta_tx.lock().await = Some(Box::new(meta_tx));

    conn.set_version(bpx_wire::PROTOCOL_MIN);
    let hs_timeout = conn.net().ping_timeout * 4;

    timeout(
        hs_timeout,
        crate::receiver::exchange_features(conn, &mut data_rx),
    )
    .await
    .map_err(|_| PlexError::NetworkTransient("features exchange timed out".into()))??;

    timeout(hs_timeout, crate::auth::authenticate(conn, &mut data_rx))
        .await
        .map_err(|_| PlexError::NetworkTransient("authentication timed out".into()))??;

    crate::receiver::send_protocol(conn).await?;

    let net = conn.net();
    for device in conn.resource.device_list() {
        device
            .discard_my_data
            .store(net.discard_my_data, Ordering::Release);
    }
    for pd in conn.peer_device_list() {
        pd.reset_peer_seq();
        pd.clear_flag(crate::peer_device::PD_INITIAL_STATE_RECEIVED);
    }

    conn.set_cstate(ConnState::Connected);
    let worker_task = crate::worker::spawn(conn.clone());

    let ack_conn = conn.clone();
    let mut ack_task = tokio::spawn(async move {
        let mut meta_rx = meta_rx;
        crate::ack::run_ack_reader(&ack_conn, &mut meta_rx).await
    });

    send_initial_state(conn).await?;

    let res = tokio::select! {
        r = crate::receiver::run_receiver(conn, &mut data_rx) => {
            ack_task.abort();
            r
        }
        a = &mut ack_task => match a {
            Ok(r) => r.and(Err(PlexError::NetworkFatal("ack reader stopped".into()))),
            Err(e) => Err(PlexError::NetworkFatal(format!("ack reader died: {e}"))),
        },
    };

    let _ = conn.queue_work(WorkItem::Shutdown);
    let _ = worker_task.await;
    *conn.data_tx.lock().await = None;
    *conn.meta_tx.lock().await = None;
    res
}

/// The connect loop: pair sockets, run the replication pipeline, tear
/// down, retry. Transient failures loop; incompatibility goes standalone.
pub async fn run_connection(
    conn: Arc<Connection>,
    registry: Arc<crate::listener::ListenerRegistry>,
    bind: std::net::SocketAddr,
    peer: std::net::SocketAddr,
) -> Result<()> {
    let mut waiter = registry.register(bind, peer).await?;

    loop {
        conn.clear_flag(CONN_DISCONNECT_EXPECTED);
        conn.set_cstate(ConnState::Connecting);
        let net = conn.net();
        let deadline = std::time::Instant::now() + net.connect_interval * 6;

        let pair =
            match crate::listener::establish_pair(&mut waiter, peer, net.socket_timeout, deadline)
                .await
            {
                Ok(pair) => pair,
                Err(e) if e.is_transient() => {
                    tokio::time::sleep(net.connect_interval).await;
                    continue;
                }
                Err(e) => {
                    conn.set_cstate(ConnState::StandAlone);
                    return Err(e);
                }
            };

        let res = run_established(&conn, pair).await;
        conn.set_cstate(ConnState::NetworkFailure);
        conn.teardown();

        match res {
            Ok(()) => {
                conn.set_cstate(ConnState::StandAlone);
                return Ok(());
            }
            Err(e) if e.is_incompatible() => {
                conn.set_cstate(ConnState::StandAlone);
                return Err(e);
            }
            Err(e) => {
                if conn.flag(CONN_DISCONNECT_EXPECTED) {
                    info!(target: "bpx::conn", "connection closed as expected");
                    conn.set_cstate(ConnState::StandAlone);
                    return Ok(());
                }
                warn_reconnect(&conn, &e);
                conn.set_cstate(ConnState::Unconnected);
                tokio::time::sleep(net.connect_interval).await;
            }
        }
    }
}

fn warn_reconnect(conn: &Connection, e: &PlexError) {
    tracing::warn!(
        target: "bpx::conn",
        peer = conn.net().peer_node_id,
        error = %e,
        "connection failed, retrying"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ResourceOptions;

    #[test]
    fn test_flags() {
        let res = Resource::new(ResourceOptions::default());
        let conn = Connection::new(res, NetConfig::default());
        assert!(!conn.flag(CONN_RESOLVE_CONFLICTS));
        conn.set_flag(CONN_RESOLVE_CONFLICTS);
        conn.set_flag(CONN_DRY_RUN);
        assert!(conn.flag(CONN_RESOLVE_CONFLICTS));
        conn.clear_flag(CONN_DRY_RUN);
        assert!(!conn.flag(CONN_DRY_RUN));
        assert!(conn.flag(CONN_RESOLVE_CONFLICTS));
    }

    #[test]
    fn test_queue_work_without_worker() {
        let res = Resource::new(ResourceOptions::default());
        let conn = Connection::new(res, NetConfig::default());
        assert!(conn.queue_work(WorkItem::Shutdown).is_err());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let res = Resource::new(ResourceOptions::default());
        let conn = Connection::new(res, NetConfig::default());
        let a = conn.next_id();
        let b = conn.next_id();
        assert_ne!(a, b);
    }
}
