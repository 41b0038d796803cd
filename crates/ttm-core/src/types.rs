//! # Core Types
//!
//! Page geometry and memory-type identifiers.

use core::fmt;

use static_assertions::const_assert_eq;

// =============================================================================
// PAGE GEOMETRY
// =============================================================================

/// Log2 of the page size
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

const_assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);

/// Convert a page count to bytes
#[inline]
pub const fn pages_to_bytes(pages: u64) -> u64 {
    pages << PAGE_SHIFT
}

/// Convert a byte count to pages, rounding up
#[inline]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    (bytes + PAGE_SIZE as u64 - 1) >> PAGE_SHIFT
}

// =============================================================================
// MEMORY TYPE
// =============================================================================

/// Maximum number of memory types a device can register
pub const MAX_MEM_TYPES: usize = 8;

/// Memory type (placement domain) identifier
///
/// Indexes the device's domain table. The first three slots have fixed
/// meaning; the rest are driver private.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MemType(u32);

impl MemType {
    /// Cached host pages, no GPU aperture
    pub const SYSTEM: Self = Self(0);
    /// Host pages bound through a GPU translation table
    pub const TT: Self = Self(1);
    /// Device-local video memory
    pub const VRAM: Self = Self(2);
    /// First driver-private memory type
    pub const PRIV0: Self = Self(3);

    /// Create a memory type from its raw index
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Raw index into the domain table
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the plain host-memory domain
    #[inline]
    pub const fn is_system(self) -> bool {
        self.0 == Self::SYSTEM.0
    }
}

impl fmt::Debug for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SYSTEM => write!(f, "MemType(SYSTEM)"),
            Self::TT => write!(f, "MemType(TT)"),
            Self::VRAM => write!(f, "MemType(VRAM)"),
            Self(n) => write!(f, "MemType(PRIV{})", n - Self::PRIV0.0),
        }
    }
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// CACHING
// =============================================================================

/// CPU caching mode of a backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Caching {
    /// Fully cached (write-back)
    #[default]
    Cached,
    /// Write-combined
    WriteCombined,
    /// Uncached
    Uncached,
}
