//! # Host Page Tables
//!
//! Host-backed storage of a buffer object: an array of page frames that is
//! populated on demand, carries a caching mode, and may be bound into a GPU
//! aperture through a driver backend.
//!
//! ```text
//!   Unpopulated ──get_page/populate──▶ Unbound ──bind──▶ Bound(mem_type)
//!                                         ▲                 │
//!                                         └─────unbind──────┘
//! ```
//!
//! Dropping a table unbinds it first, then frees every page.

use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use helix_ttm_core::{Caching, Error, MemType, Result, PAGE_SHIFT, PAGE_SIZE};
use static_assertions::assert_impl_all;

use crate::domain::RegionSpan;

// =============================================================================
// PAGE FRAME
// =============================================================================

/// One page of host memory
pub struct PageFrame {
    ptr: NonNull<u8>,
}

impl PageFrame {
    fn layout() -> Layout {
        // SAFETY: PAGE_SIZE is a non-zero power of two
        unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) }
    }

    /// Allocate a zeroed, page-aligned frame from the global allocator
    pub fn alloc() -> Option<Self> {
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(Self::layout()) };
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    /// Kernel address of the frame
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Page frame number
    pub fn pfn(&self) -> u64 {
        (self.ptr.as_ptr() as usize as u64) >> PAGE_SHIFT
    }

    /// Frame contents
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the frame owns PAGE_SIZE initialized bytes
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Frame contents (mutable)
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the frame owns PAGE_SIZE initialized bytes
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }
}

impl Drop for PageFrame {
    fn drop(&mut self) {
        // SAFETY: allocated in `alloc` with the same layout
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout()) }
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageFrame(pfn {:#x})", self.pfn())
    }
}

// SAFETY: the frame is uniquely owned heap memory
unsafe impl Send for PageFrame {}
unsafe impl Sync for PageFrame {}

// =============================================================================
// PAGE POOL
// =============================================================================

/// Source of host pages
pub trait PagePool: Send + Sync {
    /// Allocate one zeroed page, `None` under memory pressure
    fn alloc_page(&self) -> Option<PageFrame>;
}

/// Pages straight from the global allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPagePool;

impl PagePool for SystemPagePool {
    fn alloc_page(&self) -> Option<PageFrame> {
        PageFrame::alloc()
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// Driver hook that makes host pages visible in a GPU aperture
pub trait TtBackend: Send + Sync {
    /// Point the aperture range `span` of `mem_type` at `pfns`
    fn bind(&mut self, mem_type: MemType, span: RegionSpan, pfns: &[u64], caching: Caching) -> Result<()>;

    /// Tear the binding down
    fn unbind(&mut self) -> Result<()>;
}

/// Creates one backend per page table
pub trait BackendFactory: Send + Sync {
    /// New unbound backend
    fn create(&self) -> Box<dyn TtBackend>;
}

// =============================================================================
// PAGE TABLE
// =============================================================================

/// Binding state of a page table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtState {
    /// Not bound into any aperture
    Unbound,
    /// Bound into an aperture of this memory type
    Bound(MemType, RegionSpan),
}

/// Host page table of a buffer object
pub struct PageTable {
    pages: Vec<Option<PageFrame>>,
    pool: Arc<dyn PagePool>,
    backend: Option<Box<dyn TtBackend>>,
    caching: Caching,
    state: TtState,
}

assert_impl_all!(PageTable: Send, Sync);

impl PageTable {
    /// Create an unpopulated table of `num_pages` pages
    pub fn new(num_pages: u64, pool: Arc<dyn PagePool>, backend: Option<Box<dyn TtBackend>>) -> Self {
        let mut pages = Vec::with_capacity(num_pages as usize);
        pages.resize_with(num_pages as usize, || None);
        Self {
            pages,
            pool,
            backend,
            caching: Caching::Cached,
            state: TtState::Unbound,
        }
    }

    /// Number of pages
    pub fn num_pages(&self) -> u64 {
        self.pages.len() as u64
    }

    /// Number of populated pages
    pub fn resident_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    /// Caching mode
    pub fn caching(&self) -> Caching {
        self.caching
    }

    /// Binding state
    pub fn state(&self) -> TtState {
        self.state
    }

    /// Whether the table is bound into an aperture
    pub fn is_bound(&self) -> bool {
        matches!(self.state, TtState::Bound(..))
    }

    /// Page at `index`, if populated
    pub fn page(&self, index: u64) -> Option<&PageFrame> {
        self.pages.get(index as usize).and_then(Option::as_ref)
    }

    /// Page at `index`, allocating it when absent
    pub fn get_page(&mut self, index: u64) -> Result<&mut PageFrame> {
        let pool = &self.pool;
        let slot = self.pages.get_mut(index as usize).ok_or(Error::InvalidRange)?;
        if slot.is_none() {
            *slot = Some(pool.alloc_page().ok_or(Error::OutOfMemory)?);
        }
        slot.as_mut().ok_or(Error::OutOfMemory)
    }

    /// Make pages `start..start + count` resident
    pub fn populate_range(&mut self, start: u64, count: u64) -> Result<()> {
        for index in start..start + count {
            self.get_page(index)?;
        }
        Ok(())
    }

    /// Make every page resident
    pub fn populate(&mut self) -> Result<()> {
        self.populate_range(0, self.num_pages())
    }

    /// Resident pages `start..start + count`, `None` if any is missing
    pub fn pages_in(&self, start: u64, count: u64) -> Option<Vec<&PageFrame>> {
        (start..start + count).map(|i| self.page(i)).collect()
    }

    /// Switch caching mode for subsequent mappings and bindings
    pub fn set_caching(&mut self, caching: Caching) {
        if self.caching != caching {
            log::trace!("tt: caching {:?} -> {:?}", self.caching, caching);
            self.caching = caching;
        }
    }

    /// Populate and bind into `span` of `mem_type`
    pub fn bind(&mut self, mem_type: MemType, span: RegionSpan) -> Result<()> {
        if let TtState::Bound(bound_type, bound_span) = self.state {
            if bound_type == mem_type && bound_span == span {
                return Ok(());
            }
            return Err(Error::InvalidParameter);
        }

        self.populate()?;

        if let Some(backend) = self.backend.as_mut() {
            let pfns: Vec<u64> = self.pages.iter().flatten().map(PageFrame::pfn).collect();
            backend.bind(mem_type, span, &pfns, self.caching)?;
        }

        self.state = TtState::Bound(mem_type, span);
        Ok(())
    }

    /// Remove the aperture binding, if any
    pub fn unbind(&mut self) {
        if !self.is_bound() {
            return;
        }
        if let Some(backend) = self.backend.as_mut() {
            if let Err(e) = backend.unbind() {
                log::warn!("tt: unbind failed: {}", e);
            }
        }
        self.state = TtState::Unbound;
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        self.unbind();
        log::trace!("tt: freeing {} resident pages", self.resident_pages());
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("num_pages", &self.num_pages())
            .field("resident", &self.resident_pages())
            .field("caching", &self.caching)
            .field("state", &self.state)
            .finish()
    }
}
