//! # Buffer Object Device
//!
//! Per-device state shared by every buffer object: the registered domains,
//! the OS mapping hooks, page-table plumbing, the pending release queue and
//! move statistics.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

use helix_ttm_core::{Error, MemType, Result, WaitParams, MAX_MEM_TYPES, PAGE_SIZE};
use static_assertions::assert_impl_all;

use crate::domain::DomainManager;
use crate::ghost::PendingReleaseQueue;
use crate::mapper::CpuMapper;
use crate::placement::{Placement, PlacementFlags, PlacementSnapshot};
use crate::tt::{BackendFactory, PagePool, PageTable, SystemPagePool};

// =============================================================================
// BUS WINDOW
// =============================================================================

/// Contiguous bus-visible range backing a placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusWindow {
    /// Aperture base
    pub base: u64,
    /// Offset of the placement inside the aperture
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
}

impl BusWindow {
    /// Bus address of the first byte
    pub fn bus_addr(&self) -> u64 {
        self.base + self.offset
    }
}

/// Decides whether a placement is reachable through a bus window
pub trait BusResolver: Send + Sync {
    /// Window of `mem` in `domain`, `None` when host pages back it
    fn resolve(&self, domain: &DomainManager, mem: &PlacementSnapshot) -> Result<Option<BusWindow>>;
}

/// Resolution from the domain's aperture geometry
///
/// Fixed domains are always reached through the aperture. Other domains are
/// only when neither the domain (`CMA`) nor the placement (`CACHED`) asks
/// for host pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApertureResolver;

impl BusResolver for ApertureResolver {
    fn resolve(&self, domain: &DomainManager, mem: &PlacementSnapshot) -> Result<Option<BusWindow>> {
        if mem.mem_type.is_system() {
            return Ok(None);
        }
        if !domain.is_mappable() {
            return Err(Error::NotMappable);
        }

        let bus = domain.is_fixed()
            || !(domain.flags().contains(crate::domain::DomainFlags::CMA)
                || mem.flags.contains(PlacementFlags::CACHED));
        if !bus {
            return Ok(None);
        }

        Ok(mem.span.map(|span| BusWindow {
            base: domain.io_offset(),
            offset: span.start * PAGE_SIZE as u64,
            size: mem.num_pages * PAGE_SIZE as u64,
        }))
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Device configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Ghosts torn down per reap pass (0 = unlimited)
    pub reap_batch: usize,
    /// Bound for fence waits that do not carry their own
    pub default_timeout: Option<Duration>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            reap_batch: 0,
            default_timeout: None,
        }
    }
}

impl DeviceConfig {
    /// Set reap batch size
    pub fn with_reap_batch(mut self, batch: usize) -> Self {
        self.reap_batch = batch;
        self
    }

    /// Set default wait bound
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Move counters
#[derive(Debug, Default)]
pub struct MoveStats {
    copy_moves: AtomicU64,
    reset_moves: AtomicU64,
    accel_moves: AtomicU64,
    ghosts_spawned: AtomicU64,
    ghosts_reaped: AtomicU64,
    bytes_copied: AtomicU64,
}

/// Point-in-time copy of `MoveStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveStatsSnapshot {
    /// Completed `move_via_copy` calls
    pub copy_moves: u64,
    /// Completed `move_via_reset` calls
    pub reset_moves: u64,
    /// Completed `move_via_accel_cleanup` calls
    pub accel_moves: u64,
    /// Ghosts created
    pub ghosts_spawned: u64,
    /// Ghosts torn down
    pub ghosts_reaped: u64,
    /// Bytes moved by the CPU copy engine
    pub bytes_copied: u64,
}

impl MoveStats {
    pub(crate) fn record_copy(&self, bytes: u64) {
        self.copy_moves.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_reset(&self) {
        self.reset_moves.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accel(&self) {
        self.accel_moves.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ghost_spawned(&self) {
        self.ghosts_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ghost_reaped(&self) {
        self.ghosts_reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters
    pub fn snapshot(&self) -> MoveStatsSnapshot {
        MoveStatsSnapshot {
            copy_moves: self.copy_moves.load(Ordering::Relaxed),
            reset_moves: self.reset_moves.load(Ordering::Relaxed),
            accel_moves: self.accel_moves.load(Ordering::Relaxed),
            ghosts_spawned: self.ghosts_spawned.load(Ordering::Relaxed),
            ghosts_reaped: self.ghosts_reaped.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// WHOLE-REGION MAPPING
// =============================================================================

/// CPU view of a whole bus-addressable placement
pub(crate) struct IoMapping {
    ptr: NonNull<u8>,
    len: usize,
    /// Set when the view is a temporary remap
    mapper: Option<Arc<dyn CpuMapper>>,
}

impl IoMapping {
    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_remapped(&self) -> bool {
        self.mapper.is_some()
    }
}

impl Drop for IoMapping {
    fn drop(&mut self) {
        if let Some(mapper) = self.mapper.take() {
            mapper.iounmap(self.ptr, self.len);
        }
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// Buffer object device
pub struct BoDevice {
    domains: Vec<Option<Arc<DomainManager>>>,
    mapper: Arc<dyn CpuMapper>,
    resolver: Box<dyn BusResolver>,
    page_pool: Arc<dyn PagePool>,
    backend_factory: Option<Arc<dyn BackendFactory>>,
    config: DeviceConfig,
    stats: Arc<MoveStats>,
    ghosts: PendingReleaseQueue,
}

assert_impl_all!(BoDevice: Send, Sync);

impl BoDevice {
    /// Create a device with no domains
    pub fn new(mapper: Arc<dyn CpuMapper>, config: DeviceConfig) -> Self {
        let mut domains = Vec::with_capacity(MAX_MEM_TYPES);
        domains.resize_with(MAX_MEM_TYPES, || None);
        Self {
            domains,
            mapper,
            resolver: Box::new(ApertureResolver),
            page_pool: Arc::new(SystemPagePool),
            backend_factory: None,
            config,
            stats: Arc::new(MoveStats::default()),
            ghosts: PendingReleaseQueue::new(),
        }
    }

    /// Use `pool` for host pages
    pub fn with_page_pool(mut self, pool: Arc<dyn PagePool>) -> Self {
        self.page_pool = pool;
        self
    }

    /// Override bus window resolution
    pub fn with_resolver(mut self, resolver: Box<dyn BusResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Give page tables a driver backend for aperture binding
    pub fn with_backend_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.backend_factory = Some(factory);
        self
    }

    /// Register the manager of one memory type
    pub fn register_domain(&mut self, domain: DomainManager) -> Result<()> {
        let mem_type = domain.mem_type();
        let slot = self.domains.get_mut(mem_type.index()).ok_or(Error::InvalidParameter)?;
        if slot.is_some() {
            return Err(Error::InvalidParameter);
        }
        log::debug!("ttm: registered {} ({:?})", mem_type, domain.flags());
        *slot = Some(Arc::new(domain));
        Ok(())
    }

    /// Manager of `mem_type`
    pub fn domain(&self, mem_type: MemType) -> Result<&Arc<DomainManager>> {
        self.domains
            .get(mem_type.index())
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidParameter)
    }

    /// Configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Mapping hooks
    pub fn mapper(&self) -> &Arc<dyn CpuMapper> {
        &self.mapper
    }

    /// Statistics
    pub fn stats(&self) -> MoveStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> &Arc<MoveStats> {
        &self.stats
    }

    pub(crate) fn ghosts(&self) -> &PendingReleaseQueue {
        &self.ghosts
    }

    /// Build a placement in `mem_type`, reserving a region when the domain
    /// has an allocator
    ///
    /// Flags without caching bits get the domain's default caching.
    pub fn placement(&self, mem_type: MemType, num_pages: u64, flags: PlacementFlags) -> Result<Placement> {
        if num_pages == 0 {
            return Err(Error::InvalidParameter);
        }
        let domain = self.domain(mem_type)?;
        let flags = if flags.intersects(PlacementFlags::MASK_CACHING) {
            flags
        } else {
            flags | PlacementFlags::from_caching(domain.default_caching())
        };

        let placement = Placement::new(mem_type, num_pages, flags);
        if domain.has_allocator() {
            Ok(placement.with_region(domain.alloc_region(num_pages, 1)?))
        } else {
            Ok(placement)
        }
    }

    /// Bus window of a placement, `None` when host pages back it
    pub fn bus_placement(&self, mem: &PlacementSnapshot) -> Result<Option<BusWindow>> {
        let domain = self.domain(mem.mem_type)?;
        self.resolver.resolve(domain, mem)
    }

    /// Fresh unpopulated page table
    pub fn create_page_table(&self, num_pages: u64) -> Box<PageTable> {
        let backend = self.backend_factory.as_ref().map(|f| f.create());
        Box::new(PageTable::new(num_pages, self.page_pool.clone(), backend))
    }

    /// Map a whole placement for the copy engine
    ///
    /// Returns `None` without a bus window, the domain's permanent window
    /// when it has one, otherwise a temporary remap tagged write-combined or
    /// uncached from the placement flags.
    pub(crate) fn map_placement(&self, mem: &PlacementSnapshot, window: Option<BusWindow>) -> Result<Option<IoMapping>> {
        let window = match window {
            Some(window) => window,
            None => return Ok(None),
        };
        let domain = self.domain(mem.mem_type)?;
        let len = window.size as usize;

        if let Some(io_addr) = domain.io_addr().filter(|_| !domain.needs_ioremap()) {
            return Ok(Some(IoMapping {
                ptr: io_addr.offset(window.offset as usize),
                len,
                mapper: None,
            }));
        }

        let caching = crate::mapper::io_prot(mem.flags).caching();
        let ptr = self
            .mapper
            .ioremap(window.bus_addr(), len, caching)
            .ok_or(Error::OutOfMemory)?;
        log::trace!("ttm: ioremap {:#x}+{:#x} {:?}", window.bus_addr(), len, caching);
        Ok(Some(IoMapping {
            ptr,
            len,
            mapper: Some(self.mapper.clone()),
        }))
    }

    /// Number of ghosts waiting for their fence
    pub fn pending_ghosts(&self) -> usize {
        self.ghosts.len()
    }

    /// Tear down ghosts whose fence has signaled
    ///
    /// Processes at most `DeviceConfig::reap_batch` ghosts per call.
    pub fn reap_ghosts(&self) -> usize {
        self.ghosts.reap(self.config.reap_batch)
    }

    /// Wait for every pending ghost and tear it down
    pub fn drain_ghosts(&self, params: &WaitParams) -> Result<usize> {
        self.ghosts.drain(params)
    }
}

impl Drop for BoDevice {
    fn drop(&mut self) {
        let params = WaitParams {
            timeout: self.config.default_timeout,
            ..WaitParams::blocking()
        };
        if let Err(e) = self.ghosts.drain(&params) {
            log::warn!("ttm: {} ghosts still busy at teardown: {}", self.ghosts.len(), e);
        }
    }
}

impl fmt::Debug for BoDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoDevice")
            .field("domains", &self.domains.iter().flatten().count())
            .field("config", &self.config)
            .field("pending_ghosts", &self.ghosts.len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
