//! Resource and device model.
//!
//! A resource is the unit of replication: one or more volumes plus the
//! connections to its peers. Devices are addressed by volume number;
//! lookups return `Option` so a frame naming a stale volume fails cleanly
//! instead of touching freed state.

use crate::block::{ActivityLog, BlockIo, SyncBitmap};
use crate::config::ResourceOptions;
use crate::epoch::{bump_write_ordering, WriteOrdering};
use crate::pool::PagePool;
use crate::request::RequestStore;
use crate::state::{DiskState, Role};
use crate::twopc::TwopcState;
use crate::uuids::UuidSet;
use bpx_core::{CookieTable, IntervalRef, IntervalTree};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::info;

/// A write request originated on this node, visible to the receive path
/// through the interval tree and the ack reader.
#[derive(Debug)]
pub struct LocalRequest {
    pub sector: u64,
    pub size: u32,
    /// Still being written to the local disk.
    pub pending_local: bool,
    /// Lost conflict resolution; restarted after the peer write completes.
    pub postponed: bool,
    pub interval: Option<IntervalRef>,
    /// Set once the peer acknowledged (success) or rejected the write.
    pub completed: Option<bool>,
    pub dagtag: u64,
}

pub struct Device {
    pub volume: u16,
    pub disk_state: Mutex<DiskState>,
    pub crashed_primary: AtomicBool,
    pub discard_my_data: AtomicBool,
    /// In-flight write intervals, local and peer.
    pub intervals: Mutex<IntervalTree>,
    pub local_requests: Mutex<CookieTable<LocalRequest>>,
    /// Peer requests in their typed queues.
    pub ee: Mutex<RequestStore>,
    /// Woken when the active or sync queues drain.
    pub ee_notify: Notify,
    /// Woken when an interval leaves the tree.
    pub misc_notify: Notify,
    pub uuids: Mutex<UuidSet>,
    pub block: Arc<dyn BlockIo>,
    pub bitmap: Arc<dyn SyncBitmap>,
    pub act_log: Arc<dyn ActivityLog>,
    pub pool: PagePool,
    /// Currently exposed size in sectors.
    pub exposed_size: AtomicU64,
    pub peer_max_bio_size: AtomicU32,
}

impl Device {
    #[must_use]
    pub fn new(
        volume: u16,
        slot_node_ids: Vec<u32>,
        block: Arc<dyn BlockIo>,
        bitmap: Arc<dyn SyncBitmap>,
        act_log: Arc<dyn ActivityLog>,
        max_buffers: u32,
    ) -> Arc<Self> {
        let capacity = block.capacity();
        Arc::new(Self {
            volume,
            disk_state: Mutex::new(DiskState::UpToDate),
            crashed_primary: AtomicBool::new(false),
            discard_my_data: AtomicBool::new(false),
            intervals: Mutex::new(IntervalTree::new()),
            local_requests: Mutex::new(CookieTable::new()),
            ee: Mutex::new(RequestStore::new()),
            ee_notify: Notify::new(),
            misc_notify: Notify::new(),
            uuids: Mutex::new(UuidSet::new(slot_node_ids)),
            block,
            bitmap,
            act_log,
            pool: PagePool::new(max_buffers),
            exposed_size: AtomicU64::new(capacity),
            peer_max_bio_size: AtomicU32::new(bpx_core::MAX_BIO_SIZE),
        })
    }

    #[must_use]
    pub fn disk_state(&self) -> DiskState {
        *self.disk_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_disk_state(&self, to: DiskState) {
        let mut guard = self.disk_state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != to {
            info!(target: "bpx::state", volume = self.volume, from = %*guard, to = %to, "disk state change");
            *guard = to;
        }
    }

    /// Readable disk: attached and at least inconsistent.
    #[must_use]
    pub fn have_disk(&self) -> bool {
        self.disk_state() >= DiskState::Inconsistent
    }
}

pub struct Resource {
    pub opts: ResourceOptions,
    pub role: Mutex<Role>,
    pub devices: RwLock<BTreeMap<u16, Arc<Device>>>,
    pub write_ordering: Mutex<WriteOrdering>,
    pub twopc: Mutex<TwopcState>,
    /// Woken when a two-phase-commit reply or timeout arrives.
    pub twopc_notify: Notify,
    /// Woken on any resource-wide state change.
    pub state_notify: Notify,
}

impl Resource {
    #[must_use]
    pub fn new(opts: ResourceOptions) -> Arc<Self> {
        Arc::new(Self {
            opts,
            role: Mutex::new(Role::Secondary),
            devices: RwLock::new(BTreeMap::new()),
            write_ordering: Mutex::new(WriteOrdering::BdevFlush),
            twopc: Mutex::new(TwopcState::default()),
            twopc_notify: Notify::new(),
            state_notify: Notify::new(),
        })
    }

    pub fn add_device(&self, device: Arc<Device>) {
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.volume, device);
    }

    #[must_use]
    pub fn device(&self, volume: u16) -> Option<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&volume)
            .cloned()
    }

    #[must_use]
    pub fn device_list(&self) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn role(&self) -> Role {
        *self.role.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_role(&self, to: Role) {
        let mut guard = self.role.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != to {
            info!(target: "bpx::state", resource = %self.opts.name, from = %*guard, to = %to, "role change");
            *guard = to;
        }
        drop(guard);
        self.state_notify.notify_waiters();
    }

    #[must_use]
    pub fn write_ordering(&self) -> WriteOrdering {
        *self
            .write_ordering
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Degrade the write ordering; never upgrades.
    pub fn degrade_write_ordering(&self, to: WriteOrdering) {
        let mut guard = self
            .write_ordering
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = bump_write_ordering(*guard, to);
    }

    /// Bitmask of this node plus every directly connected peer.
    #[must_use]
    pub fn node_mask_self(&self) -> u64 {
        1u64 << self.opts.node_id
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::block::NoHelper;
    use crate::testing::{MemBitmap, MemBlockIo, NullActivityLog};

    fn make_device(volume: u16) -> Arc<Device> {
        Device::new(
            volume,
            vec![1],
            Arc::new(MemBlockIo::new(8192)),
            Arc::new(MemBitmap::new(2, 1024)),
            Arc::new(NullActivityLog::default()),
            64,
        )
    }

    #[test]
    fn test_device_lookup() {
        let res = Resource::new(ResourceOptions::default());
        res.add_device(make_device(0));
        res.add_device(make_device(1));
        assert!(res.device(0).is_some());
        assert!(res.device(2).is_none());
        assert_eq!(res.device_list().len(), 2);
        let _ = NoHelper;
    }

    #[test]
    fn test_write_ordering_degrade_only() {
        let res = Resource::new(ResourceOptions::default());
        assert_eq!(res.write_ordering(), WriteOrdering::BdevFlush);
        res.degrade_write_ordering(WriteOrdering::DrainIo);
        assert_eq!(res.write_ordering(), WriteOrdering::DrainIo);
        res.degrade_write_ordering(WriteOrdering::BioBarrier);
        assert_eq!(res.write_ordering(), WriteOrdering::DrainIo);
    }
}
