//! Bounded pool for inbound payload pages.
//!
//! Two counters per device: `in_use` covers pages owned by the receive
//! path, `in_use_by_net` pages whose payload is still referenced by an
//! outbound send. Allocation first recycles a free page, then goes to the
//! allocator; once the device crosses `max_buffers` the caller waits,
//! nudging the reclaim of net-held pages. A soft throttle slows the
//! receiver down while limits are tight; after that the hard limit is
//! relaxed, since in a criss-cross topology two peers can be each other's
//! backlog and waiting forever deadlocks both.

use bpx_core::Result;
use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

pub const PAGE_SIZE: usize = 4096;

/// Waits before the soft throttle kicks in.
const SOFT_THROTTLE_AFTER: u32 = 4;
/// Waits before the hard limit is relaxed.
const RELAX_LIMIT_AFTER: u32 = 16;
const SOFT_THROTTLE: Duration = Duration::from_millis(100);
const POOL_WAIT: Duration = Duration::from_millis(25);

pub struct PagePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: ArrayQueue<BytesMut>,
    max_buffers: u32,
    in_use: AtomicU32,
    in_use_by_net: AtomicU32,
    freed: Notify,
}

impl Clone for PagePool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PagePool {
    #[must_use]
    pub fn new(max_buffers: u32) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(max_buffers.max(1) as usize),
                max_buffers,
                in_use: AtomicU32::new(0),
                in_use_by_net: AtomicU32::new(0),
                freed: Notify::new(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn in_use(&self) -> u32 {
        self.inner.in_use.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn in_use_by_net(&self) -> u32 {
        self.inner.in_use_by_net.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn pages_for(len: usize) -> u32 {
        len.div_ceil(PAGE_SIZE).max(1) as u32
    }

    /// Acquire a zeroed buffer of `len` bytes, charged as pages.
    ///
    /// `reclaim_net` is polled while waiting; it should try to release
    /// net-held requests whose send has completed and return how many pages
    /// it freed.
    pub async fn acquire(
        &self,
        len: usize,
        mut reclaim_net: impl FnMut() -> u32,
    ) -> Result<BytesMut> {
        let pages = Self::pages_for(len);
        let mut waits = 0u32;
        loop {
            let held = self.in_use() + self.in_use_by_net();
            if held + pages <= self.inner.max_buffers || waits >= RELAX_LIMIT_AFTER {
                if waits >= RELAX_LIMIT_AFTER {
                    warn!(
                        target: "bpx::pool",
                        in_use = self.in_use(),
                        by_net = self.in_use_by_net(),
                        limit = self.inner.max_buffers,
                        "max-buffers exceeded, allocating anyway"
                    );
                }
                self.inner.in_use.fetch_add(pages, Ordering::AcqRel);
                return Ok(self.take_buffer(len));
            }

            if reclaim_net() > 0 {
                continue;
            }

            waits += 1;
            if waits == SOFT_THROTTLE_AFTER {
                tokio::time::sleep(SOFT_THROTTLE).await;
                continue;
            }
            let _ = tokio::time::timeout(POOL_WAIT, self.inner.freed.notified()).await;
        }
    }

    /// Charge pages without handing out a buffer, for payloads the block
    /// layer allocates itself (served reads).
    pub async fn charge(&self, len: usize, reclaim_net: impl FnMut() -> u32) -> Result<()> {
        let buf = self.acquire(len, reclaim_net).await?;
        drop(buf);
        Ok(())
    }

    fn take_buffer(&self, len: usize) -> BytesMut {
        let mut buf = self
            .inner
            .free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(len.max(PAGE_SIZE)));
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Return receive-held pages.
    pub fn release(&self, len: usize, buf: Option<BytesMut>) {
        let pages = Self::pages_for(len);
        self.inner.in_use.fetch_sub(pages, Ordering::AcqRel);
        if let Some(buf) = buf {
            let _ = self.inner.free.push(buf);
        }
        self.inner.freed.notify_waiters();
    }

    /// Reclassify pages from receive-held to net-held when the payload is
    /// handed to an outbound socket.
    pub fn move_to_net(&self, len: usize) {
        let pages = Self::pages_for(len);
        self.inner.in_use.fetch_sub(pages, Ordering::AcqRel);
        self.inner.in_use_by_net.fetch_add(pages, Ordering::AcqRel);
    }

    /// Return net-held pages once the send no longer references them.
    pub fn release_net(&self, len: usize) {
        let pages = Self::pages_for(len);
        self.inner.in_use_by_net.fetch_sub(pages, Ordering::AcqRel);
        self.inner.freed.notify_waiters();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release_accounting() {
        let pool = PagePool::new(8);
        let buf = pool.acquire(PAGE_SIZE * 2, || 0).await.unwrap();
        assert_eq!(buf.len(), PAGE_SIZE * 2);
        assert_eq!(pool.in_use(), 2);
        pool.release(PAGE_SIZE * 2, Some(buf));
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_small_allocation_charges_one_page() {
        let pool = PagePool::new(8);
        let buf = pool.acquire(512, || 0).await.unwrap();
        assert_eq!(pool.in_use(), 1);
        pool.release(512, Some(buf));
    }

    #[tokio::test]
    async fn test_net_reclaim_unblocks() {
        let pool = PagePool::new(2);
        let b1 = pool.acquire(PAGE_SIZE, || 0).await.unwrap();
        let _b2 = pool.acquire(PAGE_SIZE, || 0).await.unwrap();
        // Pool full; hand one buffer to "the network", then acquire with a
        // reclaim closure releasing it.
        pool.move_to_net(PAGE_SIZE);
        drop(b1);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.in_use_by_net(), 1);

        let pool2 = pool.clone();
        let b3 = pool
            .acquire(PAGE_SIZE, move || {
                pool2.release_net(PAGE_SIZE);
                1
            })
            .await
            .unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.in_use_by_net(), 0);
        drop(b3);
    }

    #[tokio::test]
    async fn test_hard_limit_relaxes_instead_of_deadlocking() {
        let pool = PagePool::new(1);
        let _b1 = pool.acquire(PAGE_SIZE, || 0).await.unwrap();
        // Nothing will ever be reclaimed; the acquire must still complete
        // after the relax threshold.
        let b2 = pool.acquire(PAGE_SIZE, || 0).await.unwrap();
        assert_eq!(pool.in_use(), 2);
        drop(b2);
    }
}
