//! The (connection, device) pair: replication state, the peer's view of
//! the world, sequence-number serialization and resync bookkeeping.

use crate::block::{BlockIo, SyncBitmap};
use crate::connection::{Connection, CONN_RESOLVE_CONFLICTS};
use crate::resource::Device;
use crate::state::{DiskState, ReplState, Role};
use crate::uuids::PeerUuidView;
use bpx_core::{seq_greater, seq_max, PlexError, Result};
use bpx_wire::SizesPayload;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{info, warn};

pub const PD_INITIAL_STATE_RECEIVED: u32 = 1 << 0;

/// One outstanding resync or verify request we sent to the peer.
#[derive(Debug, Clone, Copy)]
pub struct RsPending {
    pub sector: u64,
    pub size: u32,
}

struct ThrottleMark {
    at: Instant,
    rs_left: u64,
    events: u64,
}

pub struct PeerDevice {
    pub device: Arc<Device>,
    pub volume: u16,
    pub peer_node_id: u32,
    /// Our bitmap slot for this peer.
    pub bitmap_slot: usize,
    pub repl_state: Mutex<ReplState>,
    pub peer_disk_state: Mutex<DiskState>,
    pub peer_role: Mutex<Role>,
    pub peer_uuids: Mutex<PeerUuidView>,
    /// Highest sequence number seen on the meta socket.
    pub peer_seq: Mutex<u32>,
    pub seq_notify: Notify,
    pub flags: AtomicU32,
    pub rs_total: AtomicU64,
    pub rs_failed: AtomicU64,
    pub ov_left: AtomicU64,
    /// Our in-flight resync/verify requests, cookie-addressed.
    pub rs_pending: Mutex<bpx_core::CookieTable<RsPending>>,
    /// Out-of-sync bits queued for resync requests, oldest first.
    pub rs_backlog: Mutex<std::collections::VecDeque<u64>>,
    pub peer_sizes: Mutex<Option<SizesPayload>>,
    /// Dagtag to wait for before resyncing out of Behind mode.
    pub resync_dagtag: AtomicU64,
    /// Online-verify digest algorithm from the sync parameters.
    pub verify_alg: Mutex<Option<crate::config::IntegrityAlg>>,
    /// Checksum-resync digest algorithm from the sync parameters.
    pub csums_alg: Mutex<Option<crate::config::IntegrityAlg>>,
    throttle: Mutex<Option<ThrottleMark>>,
}

impl PeerDevice {
    #[must_use]
    pub fn new(device: Arc<Device>, peer_node_id: u32, bitmap_slot: usize) -> Arc<Self> {
        let volume = device.volume;
        Arc::new(Self {
            device,
            volume,
            peer_node_id,
            bitmap_slot,
            repl_state: Mutex::new(ReplState::Off),
            peer_disk_state: Mutex::new(DiskState::Unknown),
            peer_role: Mutex::new(Role::Unknown),
            peer_uuids: Mutex::new(PeerUuidView::default()),
            peer_seq: Mutex::new(0),
            seq_notify: Notify::new(),
            flags: AtomicU32::new(0),
            rs_total: AtomicU64::new(0),
            rs_failed: AtomicU64::new(0),
            ov_left: AtomicU64::new(0),
            rs_pending: Mutex::new(bpx_core::CookieTable::new()),
            rs_backlog: Mutex::new(std::collections::VecDeque::new()),
            peer_sizes: Mutex::new(None),
            resync_dagtag: AtomicU64::new(0),
            verify_alg: Mutex::new(None),
            csums_alg: Mutex::new(None),
            throttle: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn verify_alg(&self) -> Option<crate::config::IntegrityAlg> {
        *self.verify_alg.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn csums_alg(&self) -> Option<crate::config::IntegrityAlg> {
        *self.csums_alg.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn repl_state(&self) -> ReplState {
        *self.repl_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_repl_state(&self, to: ReplState) {
        let mut guard = self.repl_state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != to {
            info!(
                target: "bpx::state",
                volume = self.volume,
                peer = self.peer_node_id,
                from = %*guard,
                to = %to,
                "replication state change"
            );
            *guard = to;
        }
        drop(guard);
        self.device.misc_notify.notify_waiters();
    }

    #[must_use]
    pub fn peer_disk_state(&self) -> DiskState {
        *self
            .peer_disk_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_peer_disk_state(&self, to: DiskState) {
        *self
            .peer_disk_state
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = to;
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

    /// Record an ack-channel sequence number. Wakes the data path only when
    /// the number actually advanced.
    pub fn update_peer_seq(&self, conn: &Connection, seq: u32) {
        if !conn.flag(CONN_RESOLVE_CONFLICTS) {
            return;
        }
        let newest = {
            let mut guard = self.peer_seq.lock().unwrap_or_else(|e| e.into_inner());
            let newest = seq_max(*guard, seq);
            *guard = newest;
            newest
        };
        if newest == seq {
            self.seq_notify.notify_waiters();
        }
    }

    /// Block a data packet until every ack that must precede it has been
    /// seen on the meta socket.
    ///
    /// Data and meta travel on different sockets; a write carrying
    /// `packet_seq` may only be processed once `peer_seq` reached
    /// `packet_seq - 1`. Only meaningful with conflict resolution; bounded
    /// by the ping timeout, after which the connection is dropped.
    pub async fn wait_for_and_update_peer_seq(
        &self,
        conn: &Connection,
        packet_seq: u32,
    ) -> Result<()> {
        if !conn.flag(CONN_RESOLVE_CONFLICTS) {
            return Ok(());
        }
        loop {
            {
                let mut guard = self.peer_seq.lock().unwrap_or_else(|e| e.into_inner());
                if !seq_greater(packet_seq.wrapping_sub(1), *guard) {
                    *guard = seq_max(*guard, packet_seq);
                    return Ok(());
                }
            }
            if !conn.net().two_primaries {
                return Ok(());
            }
            let timeout = conn.net().ping_timeout;
            let notified = self.seq_notify.notified();
            if tokio::time::timeout(timeout, notified).await.is_err() {
                warn!(
                    target: "bpx::recv",
                    volume = self.volume,
                    packet_seq,
                    "timed out waiting for missing ack packets; disconnecting"
                );
                return Err(PlexError::Timeout("peer sequence numbers"));
            }
        }
    }

    #[must_use]
    pub fn current_peer_seq(&self) -> u32 {
        *self.peer_seq.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reset_peer_seq(&self) {
        *self.peer_seq.lock().unwrap_or_else(|e| e.into_inner()) = 0;
    }

    /// Resync throttle: serving resync reads yields to application I/O
    /// when the recent resync rate already exceeds `c_min_rate`.
    #[must_use]
    pub fn rs_should_slow_down(&self, c_min_rate: u32) -> bool {
        if c_min_rate == 0 {
            return false;
        }
        let events = self.device.block.io_events();
        let rs_left = self
            .device
            .bitmap
            .total_weight(self.bitmap_slot)
            .saturating_sub(self.rs_failed.load(Ordering::Relaxed));

        let mut guard = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mark) = guard.as_ref() else {
            *guard = Some(ThrottleMark {
                at: Instant::now(),
                rs_left,
                events,
            });
            return false;
        };

        // Significant foreign activity we cannot account for with our own
        // resync progress means the device is busy.
        if events.saturating_sub(mark.events) <= 64 {
            return false;
        }

        let dt = mark.at.elapsed().as_secs().max(1);
        let db = mark.rs_left.saturating_sub(rs_left);
        let kib_per_sec = db * 4 / dt; // one bit is a 4 KiB block

        *guard = Some(ThrottleMark {
            at: Instant::now(),
            rs_left,
            events,
        });

        kib_per_sec > u64::from(c_min_rate)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::config::ResourceOptions;
    use crate::resource::{Device, Resource};
    use crate::testing::{MemBitmap, MemBlockIo, NullActivityLog};

    fn make_pd_conn(two_primaries: bool) -> (Arc<PeerDevice>, Arc<Connection>) {
        let res = Resource::new(ResourceOptions::default());
        let device = Device::new(
            0,
            vec![1],
            Arc::new(MemBlockIo::new(8192)),
            Arc::new(MemBitmap::new(2, 1024)),
            Arc::new(NullActivityLog::default()),
            64,
        );
        res.add_device(device.clone());
        let net = NetConfig {
            two_primaries,
            ping_timeout: std::time::Duration::from_millis(50),
            ..NetConfig::default()
        };
        let conn = Connection::new(res, net);
        let pd = PeerDevice::new(device, 1, 0);
        (pd, conn)
    }

    #[tokio::test]
    async fn test_peer_seq_without_resolve_conflicts() {
        let (pd, conn) = make_pd_conn(true);
        // Flag not set: packets pass straight through, seq untouched.
        pd.wait_for_and_update_peer_seq(&conn, 100).await.unwrap();
        assert_eq!(pd.current_peer_seq(), 0);
    }

    #[tokio::test]
    async fn test_peer_seq_in_order() {
        let (pd, conn) = make_pd_conn(true);
        conn.set_flag(CONN_RESOLVE_CONFLICTS);
        pd.wait_for_and_update_peer_seq(&conn, 1).await.unwrap();
        assert_eq!(pd.current_peer_seq(), 1);
        pd.wait_for_and_update_peer_seq(&conn, 2).await.unwrap();
        assert_eq!(pd.current_peer_seq(), 2);
    }

    #[tokio::test]
    async fn test_peer_seq_blocks_until_acks_arrive() {
        // Boundary scenario 5: a frame with seq 100 while peer_seq is 97
        // blocks until acks advance peer_seq to 99.
        let (pd, conn) = make_pd_conn(true);
        conn.set_flag(CONN_RESOLVE_CONFLICTS);
        pd.update_peer_seq(&conn, 97);

        let pd2 = pd.clone();
        let conn2 = conn.clone();
        let waiter =
            tokio::spawn(async move { pd2.wait_for_and_update_peer_seq(&conn2, 100).await });

        tokio::task::yield_now().await;
        pd.update_peer_seq(&conn, 98);
        tokio::task::yield_now().await;
        pd.update_peer_seq(&conn, 99);

        waiter.await.unwrap().unwrap();
        assert_eq!(pd.current_peer_seq(), 100);
    }

    #[tokio::test]
    async fn test_peer_seq_single_primary_does_not_wait() {
        // Same frame, two-primaries off: no blocking, and the monotonic
        // update path advances peer_seq to the packet's own number.
        let (pd, conn) = make_pd_conn(false);
        conn.set_flag(CONN_RESOLVE_CONFLICTS);
        pd.update_peer_seq(&conn, 97);
        pd.wait_for_and_update_peer_seq(&conn, 100).await.unwrap();
        pd.update_peer_seq(&conn, 100);
        assert_eq!(pd.current_peer_seq(), 100);
    }

    #[tokio::test]
    async fn test_peer_seq_timeout() {
        let (pd, conn) = make_pd_conn(true);
        conn.set_flag(CONN_RESOLVE_CONFLICTS);
        let err = pd
            .wait_for_and_update_peer_seq(&conn, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, PlexError::Timeout(_)));
    }
}
