//! # Buffer Objects
//!
//! A GPU allocation with a movable placement. The placement record, the
//! page table and the fence are only replaced together, through `commit`,
//! at the end of a relocation.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use helix_ttm_core::{pages_to_bytes, Error, FenceRef, MemType, Result, WaitParams, PAGE_SHIFT};

use crate::device::BoDevice;
use crate::ghost::GhostHandle;
use crate::mapper::{placement_prot, PageProt};
use crate::placement::{Placement, PlacementFlags};
use crate::tt::PageTable;

bitflags::bitflags! {
    /// Private buffer state
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrivFlags: u32 {
        /// An accelerated move is in flight; its ghost is not torn down yet
        const MOVING = 1 << 0;
    }
}

/// What a commit does with the live page table
pub(crate) enum TableUpdate {
    /// Leave it in place
    Keep,
    /// Detach it and hand it back to the caller
    Release,
    /// Replace it, handing any previous table back
    Install(Box<PageTable>),
}

/// State a commit displaced
pub(crate) struct Displaced {
    pub(crate) placement: Placement,
    pub(crate) table: Option<Box<PageTable>>,
}

/// Buffer object
pub struct BufferObject {
    device: Arc<BoDevice>,
    mem: Placement,
    proposed_flags: PlacementFlags,
    num_pages: u64,
    fence: Option<FenceRef>,
    ttm: Option<Box<PageTable>>,
    /// Ghosts spawned by this buffer and not yet torn down
    moves_in_flight: Arc<AtomicUsize>,
}

impl BufferObject {
    /// Create a buffer in `placement`
    ///
    /// Non-fixed domains get a host page table, bound into the aperture
    /// when the placement is not system memory.
    pub fn new(device: Arc<BoDevice>, placement: Placement) -> Result<Self> {
        let domain = device.domain(placement.mem_type())?;
        let num_pages = placement.num_pages();
        if num_pages == 0 {
            return Err(Error::InvalidParameter);
        }

        let ttm = if domain.is_fixed() {
            None
        } else {
            let mut table = device.create_page_table(num_pages);
            table.set_caching(placement.flags().caching());
            if let (false, Some(region)) = (placement.mem_type().is_system(), placement.region()) {
                table.bind(placement.mem_type(), region.span())?;
            }
            Some(table)
        };

        log::trace!("bo: created {} pages in {}", num_pages, placement.mem_type());
        Ok(Self {
            device,
            mem: placement,
            proposed_flags: PlacementFlags::empty(),
            num_pages,
            fence: None,
            ttm,
            moves_in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Owning device
    pub fn device(&self) -> &Arc<BoDevice> {
        &self.device
    }

    /// Committed placement
    pub fn placement(&self) -> &Placement {
        &self.mem
    }

    /// Memory type of the committed placement
    pub fn mem_type(&self) -> MemType {
        self.mem.mem_type()
    }

    /// Size in pages
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        pages_to_bytes(self.num_pages)
    }

    /// Flags of the placement under negotiation
    pub fn proposed_flags(&self) -> PlacementFlags {
        self.proposed_flags
    }

    /// Record the flags of the placement under negotiation
    pub fn set_proposed_flags(&mut self, flags: PlacementFlags) {
        self.proposed_flags = flags;
    }

    /// Fence guarding the last GPU operation, if outstanding
    pub fn fence(&self) -> Option<&FenceRef> {
        self.fence.as_ref()
    }

    /// Install the fence of a new GPU operation, dropping the previous one
    pub fn attach_fence(&mut self, fence: FenceRef) {
        self.fence = Some(fence);
    }

    pub(crate) fn replace_fence(&mut self, fence: FenceRef) -> Option<FenceRef> {
        self.fence.replace(fence)
    }

    /// Private flags
    pub fn priv_flags(&self) -> PrivFlags {
        if self.moves_in_flight.load(Ordering::Acquire) > 0 {
            PrivFlags::MOVING
        } else {
            PrivFlags::empty()
        }
    }

    /// Whether an accelerated move is still in flight
    pub fn is_moving(&self) -> bool {
        self.priv_flags().contains(PrivFlags::MOVING)
    }

    pub(crate) fn moves_in_flight(&self) -> &Arc<AtomicUsize> {
        &self.moves_in_flight
    }

    /// Host page table
    pub fn page_table(&self) -> Option<&PageTable> {
        self.ttm.as_deref()
    }

    /// Host page table (mutable)
    pub fn page_table_mut(&mut self) -> Option<&mut PageTable> {
        self.ttm.as_deref_mut()
    }

    /// Attach a page table to a buffer that has none
    pub(crate) fn install_page_table(&mut self, table: Box<PageTable>) {
        debug_assert!(self.ttm.is_none(), "buffer already has a page table");
        self.ttm = Some(table);
    }

    /// Whether no GPU operation is outstanding
    pub fn is_idle(&self) -> bool {
        self.fence.as_ref().map_or(true, FenceRef::is_signaled)
    }

    /// Wait for the outstanding GPU operation and drop its fence
    pub fn wait(&mut self, params: &WaitParams) -> Result<()> {
        if let Some(fence) = self.fence.as_ref() {
            if !fence.is_signaled() {
                if params.no_wait {
                    return Err(Error::WouldBlock);
                }
                fence.flush()?;
                fence.wait(params)?;
            }
        }
        FenceRef::unreference(&mut self.fence);
        Ok(())
    }

    /// Page frame number and protection for a CPU fault at `byte_offset`
    ///
    /// Aperture placements resolve from the bus window, host placements from
    /// the page table, populating the page if needed. Cached placements get
    /// the default kernel protection either way.
    pub fn pfn_prot(&mut self, byte_offset: u64) -> Result<(u64, PageProt)> {
        if byte_offset >= self.size() {
            return Err(Error::InvalidRange);
        }
        let page_offset = byte_offset >> PAGE_SHIFT;
        let flags = self.mem.flags();

        if let Some(window) = self.device.bus_placement(&self.mem.snapshot())? {
            let pfn = (window.bus_addr() >> PAGE_SHIFT) + page_offset;
            return Ok((pfn, placement_prot(flags)));
        }

        let table = self.ttm.as_deref_mut().ok_or(Error::InvalidParameter)?;
        let page = table.get_page(page_offset)?;
        Ok((page.pfn(), placement_prot(flags)))
    }

    /// Swap in `next` as the committed placement
    ///
    /// The single commit point of every relocation. Proposed flags and the
    /// fence are left untouched.
    pub(crate) fn commit(&mut self, next: Placement, update: TableUpdate) -> Displaced {
        let table = match update {
            TableUpdate::Keep => None,
            TableUpdate::Release => self.ttm.take(),
            TableUpdate::Install(table) => self.ttm.replace(table),
        };
        let placement = core::mem::replace(&mut self.mem, next);

        log::debug!(
            "bo: committed {} -> {} ({} pages, table {})",
            placement.mem_type(),
            self.mem.mem_type(),
            self.num_pages,
            self.ttm.is_some()
        );

        #[cfg(feature = "validation")]
        self.check_committed();

        Displaced { placement, table }
    }

    #[cfg(feature = "validation")]
    fn check_committed(&self) {
        let fixed = self.device.domain(self.mem.mem_type()).map_or(false, |d| d.is_fixed());
        if self.mem.num_pages() != self.num_pages {
            log::error!("bo: committed placement of {} pages into a {} page buffer", self.mem.num_pages(), self.num_pages);
            debug_assert!(false, "placement size mismatch");
        }
        if fixed && self.ttm.is_some() {
            log::error!("bo: page table kept in fixed domain {}", self.mem.mem_type());
            debug_assert!(false, "page table in fixed domain");
        }
        if let Some(table) = self.ttm.as_deref() {
            if table.num_pages() != self.num_pages {
                log::error!("bo: page table of {} pages in a {} page buffer", table.num_pages(), self.num_pages);
                debug_assert!(false, "page table size mismatch");
            }
        }
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        if self.is_idle() {
            return;
        }
        // Busy storage outlives the buffer through a ghost
        let placement = core::mem::replace(
            &mut self.mem,
            Placement::new(MemType::SYSTEM, 0, PlacementFlags::empty()),
        );
        let ghost = GhostHandle::spawn(
            placement,
            self.ttm.take(),
            self.fence.take(),
            None,
            self.device.stats_handle().clone(),
        );
        ghost.release(self.device.ghosts());
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("mem", &self.mem)
            .field("proposed_flags", &self.proposed_flags)
            .field("num_pages", &self.num_pages)
            .field("fence", &self.fence)
            .field("ttm", &self.ttm)
            .field("priv_flags", &self.priv_flags())
            .finish()
    }
}
