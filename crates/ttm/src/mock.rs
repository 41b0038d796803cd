//! Test fakes: controllable fences, a first-fit allocator, a host-memory
//! aperture with its mapper, a recording page-table backend and a device
//! rig wiring them together.

#![allow(missing_docs)]

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::alloc::{alloc_zeroed, dealloc, Layout};

use helix_ttm_core::{Caching, Error, FenceRef, MemType, Result, SyncObject, WaitParams, PAGE_SIZE};
use spin::Mutex;

use crate::buffer::BufferObject;
use crate::device::{BoDevice, DeviceConfig};
use crate::domain::{DomainFlags, DomainManager, RegionAllocator, RegionSpan};
use crate::mapper::{CpuMapper, PageProt};
use crate::placement::PlacementFlags;
use crate::tt::{BackendFactory, PageFrame, PagePool, TtBackend};

/// Memory type of the rig's discard domain
pub const DISCARD: MemType = MemType::new(4);

// =============================================================================
// FENCE
// =============================================================================

/// Fence the test signals by hand
///
/// A blocking wait completes the fence unless it is stalled, in which case
/// the wait times out.
#[derive(Default)]
pub struct MockFence {
    signaled: AtomicBool,
    stalled: AtomicBool,
    waits: AtomicUsize,
}

impl MockFence {
    pub fn busy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signaled() -> Arc<Self> {
        let fence = Self::busy();
        fence.signal();
        fence
    }

    pub fn reference(this: &Arc<Self>) -> FenceRef {
        FenceRef::new(this.clone(), 0)
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub fn stall(&self) {
        self.stalled.store(true, Ordering::Release);
    }

    pub fn unstall(&self) {
        self.stalled.store(false, Ordering::Release);
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::Acquire)
    }
}

impl SyncObject for MockFence {
    fn is_signaled(&self, _context: u64) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    fn wait(&self, context: u64, params: &WaitParams) -> Result<()> {
        self.waits.fetch_add(1, Ordering::AcqRel);
        if self.is_signaled(context) {
            Ok(())
        } else if params.no_wait {
            Err(Error::WouldBlock)
        } else if self.stalled.load(Ordering::Acquire) {
            Err(Error::Timeout)
        } else {
            self.signal();
            Ok(())
        }
    }
}

// =============================================================================
// ALLOCATOR
// =============================================================================

/// First-fit allocator over `capacity` pages
pub struct FirstFitAllocator {
    capacity: u64,
    live: Mutex<Vec<RegionSpan>>,
}

impl FirstFitAllocator {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            live: Mutex::new(Vec::new()),
        }
    }

    /// Reserve an exact span, even one overlapping a live span
    pub fn acquire_at(&self, start: u64, num_pages: u64) -> Result<RegionSpan> {
        let span = RegionSpan::new(start, num_pages);
        if span.end() > self.capacity {
            return Err(Error::OutOfSpace);
        }
        self.live.lock().push(span);
        Ok(span)
    }

    /// Live spans, sorted
    pub fn live(&self) -> Vec<RegionSpan> {
        let mut live = self.live.lock().clone();
        live.sort_by_key(|s| (s.start, s.num_pages));
        live
    }
}

impl RegionAllocator for FirstFitAllocator {
    fn acquire_region(&self, num_pages: u64, page_alignment: u64) -> Result<RegionSpan> {
        let mut live = self.live.lock();
        live.sort_by_key(|s| s.start);
        let mut candidate: u64 = 0;
        for span in live.iter() {
            let aligned = candidate.div_ceil(page_alignment) * page_alignment;
            if aligned + num_pages <= span.start {
                break;
            }
            candidate = candidate.max(span.end());
        }
        let start = candidate.div_ceil(page_alignment) * page_alignment;
        if start + num_pages > self.capacity {
            return Err(Error::OutOfSpace);
        }
        let span = RegionSpan::new(start, num_pages);
        live.push(span);
        Ok(span)
    }

    fn release_region(&self, span: RegionSpan) {
        let mut live = self.live.lock();
        match live.iter().position(|s| *s == span) {
            Some(index) => {
                live.swap_remove(index);
            }
            None => panic!("release of unknown span {:?}", span),
        }
    }
}

// =============================================================================
// APERTURE AND MAPPER
// =============================================================================

/// Host memory standing in for a device aperture
pub struct HostAperture {
    bus_base: u64,
    ptr: NonNull<u8>,
    pages: usize,
}

// SAFETY: plain heap memory, tests coordinate access
unsafe impl Send for HostAperture {}
unsafe impl Sync for HostAperture {}

impl HostAperture {
    pub fn new(bus_base: u64, pages: usize) -> Self {
        let ptr = unsafe { alloc_zeroed(Self::layout(pages)) };
        Self {
            bus_base,
            ptr: NonNull::new(ptr).expect("aperture allocation"),
            pages,
        }
    }

    fn layout(pages: usize) -> Layout {
        Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).expect("aperture layout")
    }

    pub fn bus_base(&self) -> u64 {
        self.bus_base
    }

    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len());
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.len());
        unsafe { core::slice::from_raw_parts(self.ptr_at(offset), len) }.to_vec()
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len());
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr_at(offset), bytes.len()) }
    }
}

impl Drop for HostAperture {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout(self.pages)) }
    }
}

struct Bounce {
    addr: usize,
    pages: Vec<usize>,
}

/// Mapper over a `HostAperture`
///
/// `vmap` hands out a bounce buffer that is written back on `vunmap`.
pub struct MockMapper {
    aperture: Arc<HostAperture>,
    iomaps: AtomicUsize,
    kmaps: AtomicUsize,
    bounces: Mutex<Vec<Bounce>>,
    fail_ioremap: AtomicBool,
    fail_vmap: AtomicBool,
    last_ioremap: Mutex<Option<Caching>>,
    last_vmap: Mutex<Option<PageProt>>,
}

impl MockMapper {
    pub fn new(aperture: Arc<HostAperture>) -> Self {
        Self {
            aperture,
            iomaps: AtomicUsize::new(0),
            kmaps: AtomicUsize::new(0),
            bounces: Mutex::new(Vec::new()),
            fail_ioremap: AtomicBool::new(false),
            fail_vmap: AtomicBool::new(false),
            last_ioremap: Mutex::new(None),
            last_vmap: Mutex::new(None),
        }
    }

    pub fn live_iomaps(&self) -> usize {
        self.iomaps.load(Ordering::Acquire)
    }

    pub fn live_vmaps(&self) -> usize {
        self.bounces.lock().len()
    }

    pub fn live_kmaps(&self) -> usize {
        self.kmaps.load(Ordering::Acquire)
    }

    pub fn fail_ioremap(&self, fail: bool) {
        self.fail_ioremap.store(fail, Ordering::Release);
    }

    pub fn fail_vmap(&self, fail: bool) {
        self.fail_vmap.store(fail, Ordering::Release);
    }

    pub fn last_ioremap(&self) -> Option<Caching> {
        *self.last_ioremap.lock()
    }

    pub fn last_vmap(&self) -> Option<PageProt> {
        *self.last_vmap.lock()
    }
}

unsafe impl CpuMapper for MockMapper {
    fn ioremap(&self, bus_addr: u64, size: usize, caching: Caching) -> Option<NonNull<u8>> {
        if self.fail_ioremap.load(Ordering::Acquire) {
            return None;
        }
        let offset = bus_addr.checked_sub(self.aperture.bus_base())? as usize;
        if offset + size > self.aperture.len() {
            return None;
        }
        self.iomaps.fetch_add(1, Ordering::AcqRel);
        *self.last_ioremap.lock() = Some(caching);
        NonNull::new(self.aperture.ptr_at(offset))
    }

    fn iounmap(&self, _addr: NonNull<u8>, _size: usize) {
        let prev = self.iomaps.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "iounmap without ioremap");
    }

    fn vmap(&self, pages: &[&PageFrame], prot: PageProt) -> Option<NonNull<u8>> {
        if self.fail_vmap.load(Ordering::Acquire) || pages.is_empty() {
            return None;
        }
        let layout = Layout::from_size_align(pages.len() * PAGE_SIZE, PAGE_SIZE).ok()?;
        let addr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        for (i, page) in pages.iter().enumerate() {
            unsafe {
                core::ptr::copy_nonoverlapping(page.as_ptr(), addr.as_ptr().add(i * PAGE_SIZE), PAGE_SIZE);
            }
        }
        self.bounces.lock().push(Bounce {
            addr: addr.as_ptr() as usize,
            pages: pages.iter().map(|p| p.as_ptr() as usize).collect(),
        });
        *self.last_vmap.lock() = Some(prot);
        Some(addr)
    }

    fn vunmap(&self, addr: NonNull<u8>, num_pages: usize) {
        let bounce = {
            let mut bounces = self.bounces.lock();
            let index = bounces
                .iter()
                .position(|b| b.addr == addr.as_ptr() as usize)
                .expect("vunmap without vmap");
            bounces.swap_remove(index)
        };
        assert_eq!(bounce.pages.len(), num_pages);
        for (i, page) in bounce.pages.iter().enumerate() {
            unsafe {
                core::ptr::copy_nonoverlapping(addr.as_ptr().add(i * PAGE_SIZE), *page as *mut u8, PAGE_SIZE);
            }
        }
        let layout = Layout::from_size_align(num_pages * PAGE_SIZE, PAGE_SIZE).expect("bounce layout");
        unsafe { dealloc(addr.as_ptr(), layout) }
    }

    fn kmap(&self, page: &PageFrame) -> Option<NonNull<u8>> {
        self.kmaps.fetch_add(1, Ordering::AcqRel);
        NonNull::new(page.as_ptr())
    }

    fn kunmap(&self, _page: &PageFrame) {
        let prev = self.kmaps.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "kunmap without kmap");
    }
}

// =============================================================================
// PAGE TABLE BACKEND
// =============================================================================

/// Backend call record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    Bind(MemType, RegionSpan, Caching),
    Unbind,
}

/// Shared log of backend calls, also a `BackendFactory`
#[derive(Clone, Default)]
pub struct BackendLog {
    events: Arc<Mutex<Vec<BackendEvent>>>,
    fail_bind: Arc<AtomicBool>,
}

impl BackendLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self) -> Box<dyn TtBackend> {
        Box::new(RecordingBackend { log: self.clone() })
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::Release);
    }
}

impl BackendFactory for BackendLog {
    fn create(&self) -> Box<dyn TtBackend> {
        self.backend()
    }
}

struct RecordingBackend {
    log: BackendLog,
}

impl TtBackend for RecordingBackend {
    fn bind(&mut self, mem_type: MemType, span: RegionSpan, pfns: &[u64], caching: Caching) -> Result<()> {
        assert_eq!(pfns.len() as u64, span.num_pages);
        if self.log.fail_bind.load(Ordering::Acquire) {
            return Err(Error::OutOfSpace);
        }
        self.log.events.lock().push(BackendEvent::Bind(mem_type, span, caching));
        Ok(())
    }

    fn unbind(&mut self) -> Result<()> {
        self.log.events.lock().push(BackendEvent::Unbind);
        Ok(())
    }
}

// =============================================================================
// PAGE POOL
// =============================================================================

/// Pool that runs dry after a fixed number of pages
pub struct LimitedPagePool {
    remaining: AtomicUsize,
}

impl LimitedPagePool {
    pub fn new(pages: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(pages),
        }
    }

    pub fn refill(&self, pages: usize) {
        self.remaining.store(pages, Ordering::Release);
    }
}

impl PagePool for LimitedPagePool {
    fn alloc_page(&self) -> Option<PageFrame> {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()?;
        PageFrame::alloc()
    }
}

// =============================================================================
// RIG
// =============================================================================

/// Aperture pages given to VRAM (the rest backs PRIV0)
pub const VRAM_PAGES: u64 = 32;

/// Device with every domain kind registered
///
/// | type    | flags                          | backing                         |
/// |---------|--------------------------------|---------------------------------|
/// | SYSTEM  | MAPPABLE                       | host pages                      |
/// | TT      | MAPPABLE, CMA                  | host pages bound through backend|
/// | VRAM    | FIXED, MAPPABLE, NEEDS_IOREMAP | aperture pages 0..32, ioremap   |
/// | PRIV0   | FIXED, MAPPABLE                | aperture pages 32..64, premapped|
/// | DISCARD | MAPPABLE, DISCARD              | nothing                         |
pub struct TestRig {
    pub device: Arc<BoDevice>,
    pub mapper: Arc<MockMapper>,
    pub aperture: Arc<HostAperture>,
    pub pool: Arc<LimitedPagePool>,
    pub backend: BackendLog,
    pub tt_alloc: Arc<FirstFitAllocator>,
    pub vram_alloc: Arc<FirstFitAllocator>,
    pub priv_alloc: Arc<FirstFitAllocator>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_config(DeviceConfig::default())
    }

    pub fn with_config(config: DeviceConfig) -> Self {
        let aperture = Arc::new(HostAperture::new(0xE000_0000, 2 * VRAM_PAGES as usize));
        let mapper = Arc::new(MockMapper::new(aperture.clone()));
        let pool = Arc::new(LimitedPagePool::new(usize::MAX));
        let backend = BackendLog::new();
        let tt_alloc = Arc::new(FirstFitAllocator::new(64));
        let vram_alloc = Arc::new(FirstFitAllocator::new(VRAM_PAGES));
        let priv_alloc = Arc::new(FirstFitAllocator::new(VRAM_PAGES));
        let window_bytes = VRAM_PAGES * PAGE_SIZE as u64;

        let mut device = BoDevice::new(mapper.clone(), config)
            .with_page_pool(pool.clone())
            .with_backend_factory(Arc::new(backend.clone()));

        let domains = [
            DomainManager::new(MemType::SYSTEM, DomainFlags::MAPPABLE),
            DomainManager::new(MemType::TT, DomainFlags::MAPPABLE | DomainFlags::CMA)
                .with_allocator(tt_alloc.clone()),
            DomainManager::new(
                MemType::VRAM,
                DomainFlags::FIXED | DomainFlags::MAPPABLE | DomainFlags::NEEDS_IOREMAP,
            )
            .with_aperture(aperture.bus_base(), window_bytes)
            .with_allocator(vram_alloc.clone())
            .with_default_caching(Caching::WriteCombined),
            unsafe {
                DomainManager::new(MemType::PRIV0, DomainFlags::FIXED | DomainFlags::MAPPABLE)
                    .with_aperture(aperture.bus_base() + window_bytes, window_bytes)
                    .with_allocator(priv_alloc.clone())
                    .with_default_caching(Caching::Uncached)
                    .with_cpu_window(NonNull::new(aperture.ptr_at(window_bytes as usize)).expect("window"))
            },
            DomainManager::new(DISCARD, DomainFlags::MAPPABLE | DomainFlags::DISCARD),
        ];
        for domain in domains {
            device.register_domain(domain).expect("register domain");
        }

        Self {
            device: Arc::new(device),
            mapper,
            aperture,
            pool,
            backend,
            tt_alloc,
            vram_alloc,
            priv_alloc,
        }
    }

    /// Byte offset of a region's first page inside the aperture
    pub fn aperture_offset(&self, mem_type: MemType, span: RegionSpan) -> usize {
        let base = if mem_type == MemType::PRIV0 { VRAM_PAGES } else { 0 };
        ((base + span.start) as usize) * PAGE_SIZE
    }

    /// Buffer in `mem_type` with `num_pages` pages
    pub fn buffer(&self, mem_type: MemType, num_pages: u64) -> BufferObject {
        let placement = self
            .device
            .placement(mem_type, num_pages, PlacementFlags::empty())
            .expect("placement");
        BufferObject::new(self.device.clone(), placement).expect("buffer")
    }

    /// Host buffer whose page `i` is filled with `fill(i)`
    pub fn host_buffer(&self, mem_type: MemType, num_pages: u64, fill: impl Fn(u64) -> u8) -> BufferObject {
        let mut bo = self.buffer(mem_type, num_pages);
        let table = bo.page_table_mut().expect("host buffer has a page table");
        for i in 0..num_pages {
            table.get_page(i).expect("page").as_mut_slice().fill(fill(i));
        }
        bo
    }

    /// Contents of a bus-addressable buffer
    pub fn read_aperture(&self, bo: &BufferObject) -> Vec<u8> {
        let span = bo.placement().region().expect("region").span();
        self.aperture
            .read(self.aperture_offset(bo.mem_type(), span), bo.size() as usize)
    }

    /// Contents of a host buffer
    pub fn read_pages(&self, bo: &BufferObject) -> Vec<u8> {
        let table = bo.page_table().expect("page table");
        let mut bytes = Vec::new();
        for i in 0..bo.num_pages() {
            match table.page(i) {
                Some(page) => bytes.extend_from_slice(page.as_slice()),
                None => bytes.extend(core::iter::repeat(0u8).take(PAGE_SIZE)),
            }
        }
        bytes
    }
}

/// `num_pages` pages where page `i` holds `fill(i)`
pub fn pattern(num_pages: u64, fill: impl Fn(u64) -> u8) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(num_pages as usize * PAGE_SIZE);
    for i in 0..num_pages {
        bytes.extend(core::iter::repeat(fill(i)).take(PAGE_SIZE));
    }
    bytes
}
