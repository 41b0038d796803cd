//! # Placement Records
//!
//! Where a buffer object currently lives: memory type, the region its
//! domain handed out, caching flags and size.
//!
//! A `Region` returns itself to its allocator when dropped, so replacing or
//! destroying a placement record releases its space exactly once.

use alloc::sync::Arc;
use core::fmt;

use helix_ttm_core::{Caching, MemType};

use crate::domain::{RegionAllocator, RegionSpan};

// =============================================================================
// PLACEMENT FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Placement flags
    ///
    /// The low half names acceptable memory types (bit `n` for
    /// `MemType::new(n)`), the high half carries caching and hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PlacementFlags: u32 {
        /// Host memory
        const SYSTEM = 1 << 0;
        /// Translation-table aperture
        const TT = 1 << 1;
        /// Video memory
        const VRAM = 1 << 2;
        /// First driver-private domain
        const PRIV0 = 1 << 3;

        /// Write-back caching
        const CACHED = 1 << 16;
        /// No caching
        const UNCACHED = 1 << 17;
        /// Write-combining
        const WC = 1 << 18;

        /// Never evict
        const NO_EVICT = 1 << 21;

        /// All memory type bits
        const MASK_MEM = 0x0000_ffff;
        /// All caching bits
        const MASK_CACHING = Self::CACHED.bits() | Self::UNCACHED.bits() | Self::WC.bits();
    }
}

impl PlacementFlags {
    /// Memory type bit for `mem_type`
    pub fn for_mem_type(mem_type: MemType) -> Self {
        Self::from_bits_retain(1 << (mem_type.index() as u32 & 0xf))
    }

    /// Replace the memory type bits with the single bit of `mem_type`
    pub fn with_mem_type(self, mem_type: MemType) -> Self {
        (self - Self::MASK_MEM) | Self::for_mem_type(mem_type)
    }

    /// Caching mode requested by these flags
    pub fn caching(self) -> Caching {
        if self.contains(Self::CACHED) {
            Caching::Cached
        } else if self.contains(Self::WC) {
            Caching::WriteCombined
        } else {
            Caching::Uncached
        }
    }

    /// Flags for a caching mode
    pub fn from_caching(caching: Caching) -> Self {
        match caching {
            Caching::Cached => Self::CACHED,
            Caching::WriteCombined => Self::WC,
            Caching::Uncached => Self::UNCACHED,
        }
    }
}

// =============================================================================
// REGION
// =============================================================================

/// Region owned by a placement, released to its allocator on drop
pub struct Region {
    span: RegionSpan,
    allocator: Arc<dyn RegionAllocator>,
}

impl Region {
    /// Take ownership of a span obtained from `allocator`
    pub fn new(span: RegionSpan, allocator: Arc<dyn RegionAllocator>) -> Self {
        Self { span, allocator }
    }

    /// Page span
    pub fn span(&self) -> RegionSpan {
        self.span
    }

    /// First page
    pub fn start(&self) -> u64 {
        self.span.start
    }

    /// Length in pages
    pub fn num_pages(&self) -> u64 {
        self.span.num_pages
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.allocator.release_region(self.span);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Region").field(&self.span).finish()
    }
}

// =============================================================================
// PLACEMENT
// =============================================================================

/// Placement record
#[derive(Debug)]
pub struct Placement {
    mem_type: MemType,
    region: Option<Region>,
    flags: PlacementFlags,
    num_pages: u64,
}

impl Placement {
    /// Placement with no region (host memory or a domain without allocator)
    pub fn new(mem_type: MemType, num_pages: u64, flags: PlacementFlags) -> Self {
        Self {
            mem_type,
            region: None,
            flags: flags.with_mem_type(mem_type),
            num_pages,
        }
    }

    /// Attach the region this placement occupies
    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    /// Memory type
    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    /// Region, if any
    pub fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    /// Flags
    pub fn flags(&self) -> PlacementFlags {
        self.flags
    }

    /// Size in pages
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Detach the region, leaving the record without space
    pub(crate) fn take_region(&mut self) -> Option<Region> {
        self.region.take()
    }

    /// Immutable copy of the fields a copy or mapping needs
    pub fn snapshot(&self) -> PlacementSnapshot {
        PlacementSnapshot {
            mem_type: self.mem_type,
            span: self.region.as_ref().map(Region::span),
            flags: self.flags,
            num_pages: self.num_pages,
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Detached view of a placement record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementSnapshot {
    /// Memory type
    pub mem_type: MemType,
    /// Region span, if the placement owns one
    pub span: Option<RegionSpan>,
    /// Flags
    pub flags: PlacementFlags,
    /// Size in pages
    pub num_pages: u64,
}

impl PlacementSnapshot {
    /// Whether both placements share pages of the same domain
    pub fn aliases(&self, other: &PlacementSnapshot) -> bool {
        match (self.span, other.span) {
            (Some(a), Some(b)) => self.mem_type == other.mem_type && a.overlaps(&b),
            _ => false,
        }
    }
}
