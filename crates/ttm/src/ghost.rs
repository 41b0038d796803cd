//! # Ghost Objects
//!
//! Deferred destruction of stale placements.
//!
//! ```text
//!   pipelined move
//!        │ spawn (old placement, old table?, fence clone)
//!        ▼
//!   ┌─────────────┐  release   idle & sole holder?  ──yes──▶ teardown
//!   │ GhostHandle │ ─────────▶       │
//!   └─────────────┘                  no
//!                                    ▼
//!                        ┌──────────────────────┐  reap / drain
//!                        │ PendingReleaseQueue  │ ─────────────▶ teardown
//!                        └──────────────────────┘
//! ```
//!
//! Teardown runs in `Drop` of the last holder: unbind and free the page
//! table if the ghost owns one, release the region, drop the fence
//! reference, then clear the owner's in-flight move count.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use helix_ttm_core::{FenceRef, Result, WaitParams};
use spin::Mutex;

use crate::device::MoveStats;
use crate::placement::Placement;
use crate::tt::PageTable;

// =============================================================================
// GHOST OBJECT
// =============================================================================

/// Stand-in that keeps an old placement alive until hardware drains
pub(crate) struct GhostObject {
    placement: Placement,
    table: Option<Box<PageTable>>,
    fence: Option<FenceRef>,
    /// In-flight move count of the buffer this ghost came from
    moving: Option<Arc<AtomicUsize>>,
    stats: Arc<MoveStats>,
}

impl Drop for GhostObject {
    fn drop(&mut self) {
        let span = self.placement.region().map(|r| r.span());

        drop(self.table.take());
        drop(self.placement.take_region());
        FenceRef::unreference(&mut self.fence);

        if let Some(moving) = self.moving.take() {
            let cleared = moving.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            if cleared.is_err() {
                log::error!("ghost: in-flight move count underflow");
                debug_assert!(false, "ghost teardown without a move in flight");
            }
        }

        self.stats.record_ghost_reaped();
        log::trace!("ghost: released {} {:?}", self.placement.mem_type(), span);
    }
}

// =============================================================================
// GHOST HANDLE
// =============================================================================

/// Shared handle to a ghost
pub(crate) struct GhostHandle(Arc<GhostObject>);

impl GhostHandle {
    /// Create a ghost holding `placement` and, optionally, `table`
    ///
    /// `fence` must be a fresh reference; the live buffer keeps its own.
    pub(crate) fn spawn(
        placement: Placement,
        table: Option<Box<PageTable>>,
        fence: Option<FenceRef>,
        moving: Option<Arc<AtomicUsize>>,
        stats: Arc<MoveStats>,
    ) -> Self {
        stats.record_ghost_spawned();
        log::trace!(
            "ghost: spawned for {} ({} pages, table {})",
            placement.mem_type(),
            placement.num_pages(),
            table.is_some()
        );
        Self(Arc::new(GhostObject {
            placement,
            table,
            fence,
            moving,
            stats,
        }))
    }

    /// Whether the protecting fence has signaled
    pub(crate) fn is_idle(&self) -> bool {
        self.0.fence.as_ref().map_or(true, FenceRef::is_signaled)
    }

    /// Whether the ghost owns a page table
    pub(crate) fn owns_page_table(&self) -> bool {
        self.0.table.is_some()
    }

    fn sole_holder(&self) -> bool {
        Arc::strong_count(&self.0) == 1
    }

    fn fence(&self) -> Option<FenceRef> {
        self.0.fence.clone()
    }

    /// Drop this holder
    ///
    /// Tears the ghost down at once when idle and unshared, otherwise
    /// parks it on `queue` until reaped.
    pub(crate) fn release(self, queue: &PendingReleaseQueue) {
        if self.sole_holder() && self.is_idle() {
            drop(self);
        } else {
            queue.push(self);
        }
    }
}

impl Clone for GhostHandle {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl fmt::Debug for GhostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GhostHandle")
            .field("mem_type", &self.0.placement.mem_type())
            .field("table", &self.0.table.is_some())
            .field("idle", &self.is_idle())
            .finish()
    }
}

// =============================================================================
// PENDING RELEASE QUEUE
// =============================================================================

/// Ghosts waiting for their fence
pub(crate) struct PendingReleaseQueue {
    entries: Mutex<VecDeque<GhostHandle>>,
}

impl PendingReleaseQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, ghost: GhostHandle) {
        self.entries.lock().push_back(ghost);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Tear down up to `limit` idle, unshared ghosts (0 = no limit)
    ///
    /// Teardown runs after the queue lock is dropped.
    pub(crate) fn reap(&self, limit: usize) -> usize {
        let ready: Vec<GhostHandle> = {
            let mut entries = self.entries.lock();
            let mut ready = Vec::new();
            let mut kept = VecDeque::with_capacity(entries.len());
            while let Some(ghost) = entries.pop_front() {
                let full = limit != 0 && ready.len() >= limit;
                if !full && ghost.sole_holder() && ghost.is_idle() {
                    ready.push(ghost);
                } else {
                    kept.push_back(ghost);
                }
            }
            *entries = kept;
            ready
        };

        let count = ready.len();
        drop(ready);
        count
    }

    /// Wait for every queued fence, then reap everything
    pub(crate) fn drain(&self, params: &WaitParams) -> Result<usize> {
        let fences: Vec<FenceRef> = self.entries.lock().iter().filter_map(GhostHandle::fence).collect();
        for fence in &fences {
            fence.wait(params)?;
        }
        drop(fences);
        Ok(self.reap(0))
    }

    #[cfg(test)]
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&VecDeque<GhostHandle>) -> R) -> R {
        f(&self.entries.lock())
    }
}

impl Drop for PendingReleaseQueue {
    /// Idle ghosts are torn down; busy ones are leaked, hardware may still
    /// access their storage.
    fn drop(&mut self) {
        let entries = core::mem::take(&mut *self.entries.lock());
        let mut leaked = 0;
        for ghost in entries {
            if ghost.sole_holder() && ghost.is_idle() {
                drop(ghost);
            } else {
                leaked += 1;
                core::mem::forget(ghost);
            }
        }
        if leaked != 0 {
            log::error!("ghost: leaking {} ghosts with busy fences", leaked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RegionSpan;
    use crate::mock::{FirstFitAllocator, MockFence};
    use crate::placement::{PlacementFlags, Region};
    use helix_ttm_core::{Error, MemType};

    fn ghost_with(
        alloc: &Arc<FirstFitAllocator>,
        fence: Option<FenceRef>,
        moving: &Arc<AtomicUsize>,
        stats: &Arc<MoveStats>,
    ) -> GhostHandle {
        let span = alloc.acquire_at(0, 2).unwrap();
        let placement =
            Placement::new(MemType::VRAM, 2, PlacementFlags::WC).with_region(Region::new(span, alloc.clone()));
        moving.fetch_add(1, Ordering::AcqRel);
        GhostHandle::spawn(placement, None, fence, Some(moving.clone()), stats.clone())
    }

    #[test]
    fn test_idle_ghost_torn_down_on_release() {
        let alloc = Arc::new(FirstFitAllocator::new(8));
        let moving = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(MoveStats::default());
        let queue = PendingReleaseQueue::new();

        let fence = MockFence::signaled();
        let ghost = ghost_with(&alloc, Some(MockFence::reference(&fence)), &moving, &stats);
        ghost.release(&queue);

        assert_eq!(queue.len(), 0);
        assert!(alloc.live().is_empty());
        assert_eq!(moving.load(Ordering::Acquire), 0);
        assert_eq!(Arc::strong_count(&fence), 1);
        assert_eq!(stats.snapshot().ghosts_reaped, 1);
    }

    #[test]
    fn test_busy_ghost_waits_for_fence() {
        let alloc = Arc::new(FirstFitAllocator::new(8));
        let moving = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(MoveStats::default());
        let queue = PendingReleaseQueue::new();

        let fence = MockFence::busy();
        ghost_with(&alloc, Some(MockFence::reference(&fence)), &moving, &stats).release(&queue);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.reap(0), 0);
        assert_eq!(alloc.live(), alloc::vec![RegionSpan::new(0, 2)]);
        assert_eq!(moving.load(Ordering::Acquire), 1);

        fence.signal();
        assert_eq!(queue.reap(0), 1);
        assert!(alloc.live().is_empty());
        assert_eq!(moving.load(Ordering::Acquire), 0);
        assert_eq!(Arc::strong_count(&fence), 1);
    }

    #[test]
    fn test_shared_ghost_outlives_fence() {
        let alloc = Arc::new(FirstFitAllocator::new(8));
        let moving = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(MoveStats::default());
        let queue = PendingReleaseQueue::new();

        let ghost = ghost_with(&alloc, None, &moving, &stats);
        let holder = ghost.clone();
        ghost.release(&queue);
        assert_eq!(queue.reap(0), 0);
        assert_eq!(moving.load(Ordering::Acquire), 1);

        drop(holder);
        assert_eq!(queue.reap(0), 1);
        assert_eq!(moving.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_reap_batch_limit() {
        let alloc = Arc::new(FirstFitAllocator::new(8));
        let moving = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(MoveStats::default());
        let queue = PendingReleaseQueue::new();

        for _ in 0..3 {
            queue.push(ghost_with(&alloc, None, &moving, &stats));
        }
        assert_eq!(queue.reap(2), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.reap(2), 1);
        assert_eq!(stats.snapshot().ghosts_reaped, 3);
    }

    #[test]
    fn test_drain_waits_and_reports_failure() {
        let alloc = Arc::new(FirstFitAllocator::new(8));
        let moving = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(MoveStats::default());
        let queue = PendingReleaseQueue::new();

        let stalled = MockFence::busy();
        stalled.stall();
        ghost_with(&alloc, Some(MockFence::reference(&stalled)), &moving, &stats).release(&queue);
        assert_eq!(queue.drain(&WaitParams::non_blocking()), Err(Error::WouldBlock));
        assert_eq!(queue.drain(&WaitParams::blocking()), Err(Error::Timeout));
        assert_eq!(queue.len(), 1);

        stalled.unstall();
        assert_eq!(queue.drain(&WaitParams::blocking()), Ok(1));
        assert!(alloc.live().is_empty());
        assert_eq!(moving.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_dropped_queue_leaks_busy_ghosts() {
        let alloc = Arc::new(FirstFitAllocator::new(8));
        let moving = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(MoveStats::default());
        let queue = PendingReleaseQueue::new();

        let busy = MockFence::busy();
        queue.push(ghost_with(&alloc, Some(MockFence::reference(&busy)), &moving, &stats));
        drop(queue);

        assert_eq!(alloc.live(), alloc::vec![RegionSpan::new(0, 2)]);
        assert_eq!(moving.load(Ordering::Acquire), 1);
        assert_eq!(stats.snapshot().ghosts_reaped, 0);
        assert_eq!(Arc::strong_count(&busy), 2);
    }

    #[test]
    fn test_dropped_queue_releases_idle_ghosts() {
        let alloc = Arc::new(FirstFitAllocator::new(8));
        let moving = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(MoveStats::default());
        let queue = PendingReleaseQueue::new();

        queue.push(ghost_with(&alloc, None, &moving, &stats));
        drop(queue);

        assert!(alloc.live().is_empty());
        assert_eq!(moving.load(Ordering::Acquire), 0);
    }
}
