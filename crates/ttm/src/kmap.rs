//! # Kernel Mappings
//!
//! CPU access to a page range of a buffer's current backing storage,
//! wherever it lives.
//!
//! ```text
//!   bus window? ──yes──▶ permanent CPU window? ──yes──▶ Premapped
//!        │                        │
//!        no                       no ─────────────────▶ Iomap (ioremap WC/UC)
//!        │
//!        ▼
//!   single page & cached? ──yes──▶ Kmap
//!        │
//!        no ──▶ populate range ──▶ Vmap (virtually contiguous)
//! ```
//!
//! A `Kmap` borrows its buffer, so the placement cannot move while the
//! mapping is live. Unmapping is idempotent and also happens on drop.

use core::fmt;
use core::ptr::NonNull;

use helix_ttm_core::{Error, Result, PAGE_SIZE};

use crate::buffer::BufferObject;
use crate::mapper::{io_prot, placement_prot, CpuMapper};
use crate::placement::PlacementFlags;
use crate::tt::PageFrame;

/// How a mapping was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmapKind {
    /// Slice of the domain's permanent CPU window; nothing to release
    Premapped,
    /// Temporary remap of bus address space
    Iomap,
    /// Virtually contiguous map over host pages
    Vmap,
    /// Single host page
    Kmap,
}

/// Active CPU mapping of a buffer range
pub struct Kmap<'a> {
    mapper: &'a dyn CpuMapper,
    kind: KmapKind,
    virt: Option<NonNull<u8>>,
    len: usize,
    page: Option<&'a PageFrame>,
}

impl<'a> Kmap<'a> {
    /// Mapping kind
    pub fn kind(&self) -> KmapKind {
        self.kind
    }

    /// Start of the mapping, `None` once unmapped
    pub fn virtual_addr(&self) -> Option<*mut u8> {
        self.virt.map(NonNull::as_ptr)
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping has been released
    pub fn is_unmapped(&self) -> bool {
        self.virt.is_none()
    }

    /// Mapped bytes, empty once unmapped
    pub fn as_slice(&self) -> &[u8] {
        match self.virt {
            // SAFETY: the mapper guarantees `len` valid bytes until unmap
            Some(virt) => unsafe { core::slice::from_raw_parts(virt.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// Mapped bytes (mutable), empty once unmapped
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.virt {
            // SAFETY: as above; `&mut self` keeps the view unique
            Some(virt) => unsafe { core::slice::from_raw_parts_mut(virt.as_ptr(), self.len) },
            None => &mut [],
        }
    }

    /// Release the mapping; later calls do nothing
    pub fn unmap(&mut self) {
        let virt = match self.virt.take() {
            Some(virt) => virt,
            None => return,
        };
        match self.kind {
            KmapKind::Premapped => {}
            KmapKind::Iomap => self.mapper.iounmap(virt, self.len),
            KmapKind::Vmap => self.mapper.vunmap(virt, self.len / PAGE_SIZE),
            KmapKind::Kmap => {
                if let Some(page) = self.page.take() {
                    self.mapper.kunmap(page);
                }
            }
        }
        log::trace!("kmap: released {:?} of {:#x} bytes", self.kind, self.len);
    }
}

impl Drop for Kmap<'_> {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl fmt::Debug for Kmap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kmap")
            .field("kind", &self.kind)
            .field("virt", &self.virt)
            .field("len", &self.len)
            .finish()
    }
}

impl BufferObject {
    /// Map pages `start_page..start_page + num_pages` for CPU access
    pub fn kmap(&mut self, start_page: u64, num_pages: u64) -> Result<Kmap<'_>> {
        let end = start_page.checked_add(num_pages).ok_or(Error::InvalidRange)?;
        if num_pages == 0 || end > self.num_pages() {
            return Err(Error::InvalidRange);
        }

        let snapshot = self.placement().snapshot();
        match self.device().bus_placement(&snapshot)? {
            Some(window) => {
                let this: &BufferObject = self;
                let device = this.device();
                let domain = device.domain(snapshot.mem_type)?;
                let offset = start_page as usize * PAGE_SIZE;
                let len = num_pages as usize * PAGE_SIZE;

                let (kind, virt) = match domain.io_addr().filter(|_| !domain.needs_ioremap()) {
                    Some(io_addr) => (KmapKind::Premapped, io_addr.offset(window.offset as usize + offset)),
                    None => {
                        let caching = io_prot(snapshot.flags).caching();
                        let virt = device
                            .mapper()
                            .ioremap(window.bus_addr() + offset as u64, len, caching)
                            .ok_or(Error::OutOfMemory)?;
                        (KmapKind::Iomap, virt)
                    }
                };
                log::trace!("kmap: {:?} {} pages at {}", kind, num_pages, start_page);
                Ok(Kmap {
                    mapper: &**device.mapper(),
                    kind,
                    virt: Some(virt),
                    len,
                    page: None,
                })
            }
            None => self.kmap_host(start_page, num_pages, snapshot.flags),
        }
    }

    fn kmap_host(&mut self, start_page: u64, num_pages: u64, flags: PlacementFlags) -> Result<Kmap<'_>> {
        let single = num_pages == 1 && flags.contains(PlacementFlags::CACHED);

        let table = self.page_table_mut().ok_or(Error::InvalidParameter)?;
        table.populate_range(start_page, num_pages)?;

        let this: &BufferObject = self;
        let mapper: &dyn CpuMapper = &**this.device().mapper();
        let table = this.page_table().ok_or(Error::InvalidParameter)?;

        if single {
            let page = table.page(start_page).ok_or(Error::OutOfMemory)?;
            let virt = mapper.kmap(page).ok_or(Error::OutOfMemory)?;
            return Ok(Kmap {
                mapper,
                kind: KmapKind::Kmap,
                virt: Some(virt),
                len: PAGE_SIZE,
                page: Some(page),
            });
        }

        let pages = table.pages_in(start_page, num_pages).ok_or(Error::OutOfMemory)?;
        let virt = mapper
            .vmap(&pages, placement_prot(flags))
            .ok_or(Error::OutOfMemory)?;
        log::trace!("kmap: vmap {} pages at {}", num_pages, start_page);
        Ok(Kmap {
            mapper,
            kind: KmapKind::Vmap,
            virt: Some(virt),
            len: num_pages as usize * PAGE_SIZE,
            page: None,
        })
    }
}
