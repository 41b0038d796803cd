//! # CPU Mapping Primitives
//!
//! The OS hooks the engine uses to make backing storage CPU-addressable:
//! temporary remaps of bus apertures, virtually contiguous maps over host
//! pages and single-page kernel maps. Also the protection selection a
//! mapping or fault handler applies for a placement.

use core::ptr::NonNull;

use helix_ttm_core::Caching;

use crate::placement::PlacementFlags;
use crate::tt::PageFrame;

// =============================================================================
// PAGE PROTECTION
// =============================================================================

/// Page protection of a CPU mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageProt {
    /// Default kernel protection (write-back)
    Kernel,
    /// Write-combined
    WriteCombined,
    /// Uncached
    Uncached,
}

impl PageProt {
    /// Caching mode this protection implies
    pub fn caching(self) -> Caching {
        match self {
            Self::Kernel => Caching::Cached,
            Self::WriteCombined => Caching::WriteCombined,
            Self::Uncached => Caching::Uncached,
        }
    }
}

/// Protection for aperture (I/O) access to a placement
pub fn io_prot(flags: PlacementFlags) -> PageProt {
    if flags.contains(PlacementFlags::WC) {
        PageProt::WriteCombined
    } else {
        PageProt::Uncached
    }
}

/// Protection for host-page access to a placement
///
/// Cached placements keep the default kernel protection.
pub fn placement_prot(flags: PlacementFlags) -> PageProt {
    if flags.contains(PlacementFlags::CACHED) {
        PageProt::Kernel
    } else {
        io_prot(flags)
    }
}

// =============================================================================
// CPU MAPPER
// =============================================================================

/// OS mapping hooks
///
/// # Safety
/// A pointer returned by `ioremap`, `vmap` or `kmap` must be valid for reads
/// and writes of the requested length until the matching unmap call.
pub unsafe trait CpuMapper: Send + Sync {
    /// Map `size` bytes of bus address space starting at `bus_addr`
    fn ioremap(&self, bus_addr: u64, size: usize, caching: Caching) -> Option<NonNull<u8>>;

    /// Release a mapping returned by `ioremap`
    fn iounmap(&self, addr: NonNull<u8>, size: usize);

    /// Map `pages` at consecutive virtual addresses
    fn vmap(&self, pages: &[&PageFrame], prot: PageProt) -> Option<NonNull<u8>>;

    /// Release a mapping returned by `vmap`
    fn vunmap(&self, addr: NonNull<u8>, num_pages: usize);

    /// Map a single page with default attributes
    fn kmap(&self, page: &PageFrame) -> Option<NonNull<u8>> {
        NonNull::new(page.as_ptr())
    }

    /// Release a mapping returned by `kmap`
    fn kunmap(&self, _page: &PageFrame) {}
}
