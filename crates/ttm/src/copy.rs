//! # Region Copy Engine
//!
//! Page-by-page CPU copy between two backing stores.
//!
//! | source     | destination | primitive                              |
//! |------------|-------------|----------------------------------------|
//! | bus window | bus window  | volatile word copy                     |
//! | host pages | bus window  | kmap source page, copy into window     |
//! | bus window | host pages  | kmap destination page, copy from window|
//!
//! Host-to-host moves never reach the engine; both sides are the same
//! page table.

use core::ptr::{self, NonNull};
use core::sync::atomic::{self, Ordering};

use helix_ttm_core::{Error, Result, PAGE_SIZE};

use crate::device::IoMapping;
use crate::mapper::CpuMapper;
use crate::placement::PlacementSnapshot;
use crate::tt::PageTable;

// =============================================================================
// COPY ORDER
// =============================================================================

/// Page iteration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOrder {
    /// First page to last
    Ascending,
    /// Last page to first
    Descending,
}

impl CopyOrder {
    /// Order that never overwrites a source page before it is read
    ///
    /// Descending only when both placements share a domain and the
    /// destination starts strictly inside the source range. A destination
    /// starting below an overlapping source copies ascending: each source
    /// page is read before the copy reaches it.
    pub fn select(src: &PlacementSnapshot, dst: &PlacementSnapshot) -> Self {
        match (src.span, dst.span) {
            (Some(s), Some(d)) if src.aliases(dst) && s.start < d.start => Self::Descending,
            _ => Self::Ascending,
        }
    }

    /// Page index of the `n`th step over `num_pages` pages
    fn page(self, n: u64, num_pages: u64) -> u64 {
        match self {
            Self::Ascending => n,
            Self::Descending => num_pages - 1 - n,
        }
    }
}

// =============================================================================
// ENDPOINTS
// =============================================================================

/// One side of a copy
#[derive(Debug, Clone, Copy)]
pub(crate) enum Endpoint {
    /// CPU view of a bus window
    Io { base: NonNull<u8>, len: usize },
    /// Pages of the buffer's page table
    Host,
}

impl Endpoint {
    pub(crate) fn from_mapping(mapping: Option<&IoMapping>) -> Self {
        match mapping {
            Some(map) => Self::Io {
                base: map.as_ptr(),
                len: map.len(),
            },
            None => Self::Host,
        }
    }

    fn io_page(self, index: u64) -> Result<NonNull<u8>> {
        match self {
            Self::Io { base, len } => {
                let offset = index as usize * PAGE_SIZE;
                if offset + PAGE_SIZE > len {
                    return Err(Error::IoFailure);
                }
                // SAFETY: offset + PAGE_SIZE lies within the mapping
                Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) })
            }
            Self::Host => Err(Error::InvalidParameter),
        }
    }
}

// =============================================================================
// PRIMITIVES
// =============================================================================

/// Copy one page between CPU views of device memory
///
/// # Safety
/// Both pointers must be valid for `PAGE_SIZE` bytes.
unsafe fn copy_io_page(dst: NonNull<u8>, src: NonNull<u8>) {
    let (dst, src) = (dst.as_ptr(), src.as_ptr());
    if dst as usize % 4 != 0 || src as usize % 4 != 0 {
        // SAFETY: caller guarantees both ranges
        unsafe { ptr::copy(src, dst, PAGE_SIZE) };
        return;
    }
    let (dst, src) = (dst as *mut u32, src as *const u32);
    for i in 0..PAGE_SIZE / 4 {
        // SAFETY: aligned and within the page
        unsafe { ptr::write_volatile(dst.add(i), ptr::read_volatile(src.add(i))) };
    }
}

fn copy_host_to_io(mapper: &dyn CpuMapper, table: &mut PageTable, index: u64, dst: NonNull<u8>) -> Result<()> {
    let page = &*table.get_page(index)?;
    let src = mapper.kmap(page).ok_or(Error::OutOfMemory)?;
    // SAFETY: kmap maps PAGE_SIZE bytes; dst checked by the caller
    unsafe { copy_io_page(dst, src) };
    mapper.kunmap(page);
    Ok(())
}

fn copy_io_to_host(mapper: &dyn CpuMapper, table: &mut PageTable, index: u64, src: NonNull<u8>) -> Result<()> {
    let page = &*table.get_page(index)?;
    let dst = mapper.kmap(page).ok_or(Error::OutOfMemory)?;
    // SAFETY: as above
    unsafe { copy_io_page(dst, src) };
    mapper.kunmap(page);
    Ok(())
}

// =============================================================================
// ENGINE
// =============================================================================

/// Copy `num_pages` pages from `src` to `dst` in `order`
///
/// `table` backs whichever side is `Endpoint::Host`. Returns the number of
/// bytes copied. A failing page aborts the loop.
pub(crate) fn copy_pages(
    mapper: &dyn CpuMapper,
    dst: Endpoint,
    src: Endpoint,
    mut table: Option<&mut PageTable>,
    num_pages: u64,
    order: CopyOrder,
) -> Result<u64> {
    for n in 0..num_pages {
        let index = order.page(n, num_pages);
        match (src, dst) {
            (Endpoint::Io { .. }, Endpoint::Io { .. }) => {
                let (d, s) = (dst.io_page(index)?, src.io_page(index)?);
                // SAFETY: both pages bounds-checked against their mappings
                unsafe { copy_io_page(d, s) };
            }
            (Endpoint::Host, Endpoint::Io { .. }) => {
                let table = table.as_deref_mut().ok_or(Error::InvalidParameter)?;
                copy_host_to_io(mapper, table, index, dst.io_page(index)?)?;
            }
            (Endpoint::Io { .. }, Endpoint::Host) => {
                let table = table.as_deref_mut().ok_or(Error::InvalidParameter)?;
                copy_io_to_host(mapper, table, index, src.io_page(index)?)?;
            }
            (Endpoint::Host, Endpoint::Host) => return Err(Error::InvalidParameter),
        }
    }

    atomic::fence(Ordering::SeqCst);
    Ok(num_pages * PAGE_SIZE as u64)
}
