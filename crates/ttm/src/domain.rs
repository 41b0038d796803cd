//! # Placement Domains
//!
//! Per memory-type managers: aperture geometry, CPU visibility and the
//! free-space allocator that hands out regions.

use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;

use helix_ttm_core::{Caching, Error, MemType, Result};

use crate::placement::Region;

// =============================================================================
// DOMAIN FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Memory type manager flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DomainFlags: u32 {
        /// Fixed memory; host page tables cannot back it
        const FIXED = 1 << 0;
        /// Reachable from the CPU through some window
        const MAPPABLE = 1 << 1;
        /// Aperture must be ioremapped before CPU access
        const NEEDS_IOREMAP = 1 << 2;
        /// Backing pages are host pages even though the domain has an aperture
        const CMA = 1 << 3;
        /// Domain keeps no content; moves into it drop the page table
        const DISCARD = 1 << 4;
    }
}

// =============================================================================
// REGION ALLOCATOR
// =============================================================================

/// Page range inside a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionSpan {
    /// First page
    pub start: u64,
    /// Length in pages
    pub num_pages: u64,
}

impl RegionSpan {
    /// Create a span
    pub const fn new(start: u64, num_pages: u64) -> Self {
        Self { start, num_pages }
    }

    /// One past the last page
    pub const fn end(&self) -> u64 {
        self.start + self.num_pages
    }

    /// Check if spans share at least one page
    pub const fn overlaps(&self, other: &RegionSpan) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Free-space allocator of one domain
///
/// Implementations guard their free list with their own lock. The engine
/// only calls in for the instant of acquiring or releasing a span and never
/// holds the allocator across a copy or a fence wait.
pub trait RegionAllocator: Send + Sync {
    /// Reserve `num_pages` pages aligned to `page_alignment` pages
    ///
    /// Fails with `Error::OutOfSpace` when no free span fits.
    fn acquire_region(&self, num_pages: u64, page_alignment: u64) -> Result<RegionSpan>;

    /// Return a span obtained from `acquire_region`
    fn release_region(&self, span: RegionSpan);
}

// =============================================================================
// CPU WINDOW
// =============================================================================

/// Permanent CPU mapping of a domain's aperture
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IoAddr(NonNull<u8>);

impl IoAddr {
    /// Pointer to the start of the window
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer `offset` bytes into the window
    pub(crate) fn offset(self, offset: usize) -> NonNull<u8> {
        // SAFETY: callers stay within the window, which never wraps
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(offset)) }
    }
}

impl fmt::Debug for IoAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoAddr({:p})", self.0)
    }
}

// SAFETY: the window is device memory mapped for the life of the domain;
// concurrent access is serialized by the per-buffer lock held by callers.
unsafe impl Send for IoAddr {}
unsafe impl Sync for IoAddr {}

// =============================================================================
// DOMAIN MANAGER
// =============================================================================

/// Manager of one memory type
pub struct DomainManager {
    mem_type: MemType,
    flags: DomainFlags,
    default_caching: Caching,
    /// Bus address of the aperture
    io_offset: u64,
    /// Aperture size in bytes
    io_size: u64,
    /// Permanent CPU window, when the aperture needs no ioremap
    io_addr: Option<IoAddr>,
    allocator: Option<Arc<dyn RegionAllocator>>,
}

impl DomainManager {
    /// Create a manager with no aperture and no allocator
    pub fn new(mem_type: MemType, flags: DomainFlags) -> Self {
        Self {
            mem_type,
            flags,
            default_caching: Caching::Cached,
            io_offset: 0,
            io_size: 0,
            io_addr: None,
            allocator: None,
        }
    }

    /// Set the bus aperture
    pub fn with_aperture(mut self, io_offset: u64, io_size: u64) -> Self {
        self.io_offset = io_offset;
        self.io_size = io_size;
        self
    }

    /// Set the permanent CPU window over the aperture
    ///
    /// # Safety
    /// `addr` must map the whole aperture for as long as the domain and
    /// every placement in it are alive.
    pub unsafe fn with_cpu_window(mut self, addr: NonNull<u8>) -> Self {
        self.io_addr = Some(IoAddr(addr));
        self
    }

    /// Set the free-space allocator
    pub fn with_allocator(mut self, allocator: Arc<dyn RegionAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Set the caching used when a placement does not ask for one
    pub fn with_default_caching(mut self, caching: Caching) -> Self {
        self.default_caching = caching;
        self
    }

    /// Memory type
    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    /// Flags
    pub fn flags(&self) -> DomainFlags {
        self.flags
    }

    /// Default caching
    pub fn default_caching(&self) -> Caching {
        self.default_caching
    }

    /// Bus address of the aperture
    pub fn io_offset(&self) -> u64 {
        self.io_offset
    }

    /// Aperture size in bytes
    pub fn io_size(&self) -> u64 {
        self.io_size
    }

    /// Permanent CPU window
    pub fn io_addr(&self) -> Option<IoAddr> {
        self.io_addr
    }

    /// Host page tables cannot back this domain
    pub fn is_fixed(&self) -> bool {
        self.flags.contains(DomainFlags::FIXED)
    }

    /// Reachable from the CPU
    pub fn is_mappable(&self) -> bool {
        self.flags.contains(DomainFlags::MAPPABLE)
    }

    /// Aperture access requires a temporary remap
    pub fn needs_ioremap(&self) -> bool {
        self.flags.contains(DomainFlags::NEEDS_IOREMAP)
    }

    /// Moves into this domain discard content
    pub fn is_discard(&self) -> bool {
        self.flags.contains(DomainFlags::DISCARD)
    }

    /// Whether placements in this domain own a region
    pub fn has_allocator(&self) -> bool {
        self.allocator.is_some()
    }

    /// Reserve a region in this domain
    pub fn alloc_region(&self, num_pages: u64, page_alignment: u64) -> Result<Region> {
        let allocator = self.allocator.as_ref().ok_or(Error::InvalidParameter)?;
        let span = allocator.acquire_region(num_pages, page_alignment.max(1))?;
        log::trace!("{}: acquired pages {}..{}", self.mem_type, span.start, span.end());
        Ok(Region::new(span, allocator.clone()))
    }
}

impl fmt::Debug for DomainManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainManager")
            .field("mem_type", &self.mem_type)
            .field("flags", &self.flags)
            .field("io_offset", &self.io_offset)
            .field("io_size", &self.io_size)
            .field("io_addr", &self.io_addr)
            .field("has_allocator", &self.allocator.is_some())
            .finish()
    }
}
