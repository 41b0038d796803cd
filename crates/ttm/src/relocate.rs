//! # Relocation Protocol
//!
//! Moves a buffer object to a new placement.
//!
//! ```text
//!   Requested ──▶ wait idle ──▶ map old/new ──▶ copy ──▶ unmap ──┐
//!       │           (move_via_copy)                              │
//!       ├──▶ wait idle ──▶ retarget page table ──────────────────┤
//!       │           (move_via_reset)                             ├──▶ commit
//!       └──▶ install fence ──▶ evict? wait : spawn ghost ────────┘
//!                   (move_via_accel_cleanup)
//! ```
//!
//! An accelerated move into a non-fixed domain needs its host pages bound
//! before the hardware copy is issued: `prepare_accel_move` does that, and
//! `move_via_accel_cleanup` then commits without touching the binding.
//!
//! The caller holds the buffer exclusively (`&mut BufferObject`). Every
//! failure happens before `commit`, so the committed placement is either
//! the old one or the new one. Ownership of the target placement passes in;
//! a failed move drops it, returning its region to the domain allocator.

use alloc::boxed::Box;
use core::sync::atomic::Ordering;
use core::time::Duration;

use helix_ttm_core::{Error, FenceRef, MemType, Result, WaitParams};

use crate::buffer::{BufferObject, TableUpdate};
use crate::copy::{copy_pages, CopyOrder, Endpoint};
use crate::device::DeviceConfig;
use crate::domain::{DomainManager, RegionSpan};
use crate::ghost::GhostHandle;
use crate::placement::{Placement, PlacementSnapshot};
use crate::tt::{PageTable, TtState};

// =============================================================================
// MOVE CONTEXT
// =============================================================================

/// Blocking behaviour of a move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveContext {
    /// Waits may be interrupted
    pub interruptible: bool,
    /// Fail with `WouldBlock` instead of waiting for a busy fence
    pub no_wait: bool,
    /// Bound on fence waits, falls back to `DeviceConfig::default_timeout`
    pub timeout: Option<Duration>,
}

impl MoveContext {
    /// Blocking, uninterruptible move
    pub fn new() -> Self {
        Self::default()
    }

    /// Move that never sleeps on a fence
    pub fn non_blocking() -> Self {
        Self {
            no_wait: true,
            ..Self::default()
        }
    }

    /// Set interruptible
    pub fn with_interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }

    /// Bound fence waits
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn wait_params(&self, config: &DeviceConfig) -> WaitParams {
        WaitParams {
            interruptible: self.interruptible,
            no_wait: self.no_wait,
            lazy: false,
            timeout: self.timeout.or(config.default_timeout),
        }
    }
}

// =============================================================================
// PAGE TABLE RETARGETING
// =============================================================================

/// Point `table` at `new`: unbind, switch caching, bind when `new` is an
/// aperture placement. Restores the previous binding on failure.
/// Aperture range a page table backing `new` is bound into, if any
fn aperture_target(new: &PlacementSnapshot) -> Option<(MemType, RegionSpan)> {
    match (new.mem_type.is_system(), new.span) {
        (false, Some(span)) => Some((new.mem_type, span)),
        _ => None,
    }
}

/// Binding state a page table must be in to back `new`
fn expected_state(new: &PlacementSnapshot) -> TtState {
    match aperture_target(new) {
        Some((mem_type, span)) => TtState::Bound(mem_type, span),
        None => TtState::Unbound,
    }
}

fn retarget(table: &mut PageTable, new: &PlacementSnapshot) -> Result<()> {
    let previous = table.state();
    let target = aperture_target(new);
    if let (TtState::Bound(mem_type, span), Some(target)) = (previous, target) {
        if (mem_type, span) == target {
            table.set_caching(new.flags.caching());
            return Ok(());
        }
    }

    let previous_caching = table.caching();
    table.unbind();
    table.set_caching(new.flags.caching());

    let (mem_type, span) = match target {
        Some(target) => target,
        None => return Ok(()),
    };
    if let Err(e) = table.bind(mem_type, span) {
        table.set_caching(previous_caching);
        if let TtState::Bound(old_type, old_span) = previous {
            if let Err(rebind) = table.bind(old_type, old_span) {
                log::warn!("relocate: rebinding to {} failed: {}", old_type, rebind);
            }
        }
        return Err(e);
    }
    Ok(())
}

// =============================================================================
// PROTOCOL
// =============================================================================

impl BufferObject {
    fn check_target(&self, new: &Placement) -> Result<alloc::sync::Arc<DomainManager>> {
        if new.num_pages() != self.num_pages() {
            return Err(Error::InvalidParameter);
        }
        Ok(self.device().domain(new.mem_type())?.clone())
    }

    /// Decide what happens to the page table on commit
    ///
    /// Fixed (and, for resets, discarding) domains drop it. Others keep the
    /// live table, or install `staged` or a fresh one, retargeted at `new`.
    fn table_update(
        &mut self,
        release: bool,
        new: &PlacementSnapshot,
        staged: Option<Box<PageTable>>,
    ) -> Result<TableUpdate> {
        if release {
            return Ok(TableUpdate::Release);
        }
        if let Some(table) = self.page_table_mut() {
            retarget(table, new)?;
            return Ok(TableUpdate::Keep);
        }
        let mut table = match staged {
            Some(table) => table,
            None => self.device().create_page_table(self.num_pages()),
        };
        retarget(&mut table, new)?;
        Ok(TableUpdate::Install(table))
    }

    /// Move by CPU copy
    ///
    /// Waits for the buffer to go idle, maps both placements (host pages
    /// where a placement has no bus window), copies every page, then
    /// commits. The old region is released once the new placement is in.
    pub fn move_via_copy(&mut self, ctx: &MoveContext, new: Placement) -> Result<()> {
        let new_domain = self.check_target(&new)?;
        let device = self.device().clone();
        self.wait(&ctx.wait_params(device.config()))?;

        let num_pages = self.num_pages();
        let old_snap = self.placement().snapshot();
        let new_snap = new.snapshot();
        let old_window = device.bus_placement(&old_snap)?;
        let new_window = device.bus_placement(&new_snap)?;

        let had_table = self.page_table().is_some();
        let mut staged = if !had_table && !new_domain.is_fixed() {
            Some(device.create_page_table(num_pages))
        } else {
            None
        };

        let nothing_to_copy = old_window.is_none() && (new_window.is_none() || !had_table);
        let mut bytes = 0;
        if !nothing_to_copy {
            let old_map = device.map_placement(&old_snap, old_window)?;
            let new_map = device.map_placement(&new_snap, new_window)?;
            let order = CopyOrder::select(&old_snap, &new_snap);
            let table = match staged.as_deref_mut() {
                Some(table) => Some(table),
                None => self.page_table_mut(),
            };
            bytes = copy_pages(
                &**device.mapper(),
                Endpoint::from_mapping(new_map.as_ref()),
                Endpoint::from_mapping(old_map.as_ref()),
                table,
                num_pages,
                order,
            )
            .map_err(|e| {
                log::warn!("relocate: copy {} -> {} failed: {}", old_snap.mem_type, new_snap.mem_type, e);
                e
            })?;
            drop(new_map);
            drop(old_map);
        }

        let update = self.table_update(new_domain.is_fixed(), &new_snap, staged)?;
        drop(self.commit(new, update));

        device.stats_handle().record_copy(bytes);
        log::debug!(
            "relocate: copied {} pages {} -> {} ({} bytes)",
            num_pages,
            old_snap.mem_type,
            new_snap.mem_type,
            bytes
        );
        Ok(())
    }

    /// Move without migrating content
    ///
    /// The page table follows the buffer to the new placement, unless the
    /// destination discards content or is fixed memory, in which case the
    /// table is unbound and freed. Buffers without a table get a fresh one
    /// in non-fixed destinations.
    pub fn move_via_reset(&mut self, ctx: &MoveContext, new: Placement) -> Result<()> {
        let new_domain = self.check_target(&new)?;
        let device = self.device().clone();
        self.wait(&ctx.wait_params(device.config()))?;

        let old_type = self.mem_type();
        let new_snap = new.snapshot();
        let release = new_domain.is_discard() || new_domain.is_fixed();
        let update = self.table_update(release, &new_snap, None)?;
        drop(self.commit(new, update));

        device.stats_handle().record_reset();
        log::debug!("relocate: reset {} -> {} (table released: {})", old_type, new_snap.mem_type, release);
        Ok(())
    }

    /// Bind host pages for an accelerated move into `new`
    ///
    /// Call before issuing the hardware copy. Fixed destinations need
    /// nothing. Otherwise the buffer's page table (created when missing)
    /// takes the caching of `new` and is bound into its aperture range. A
    /// table bound to a different range still backs the old placement and
    /// is rejected with `InvalidParameter`.
    pub fn prepare_accel_move(&mut self, new: &Placement) -> Result<()> {
        let new_domain = self.check_target(new)?;
        if new_domain.is_fixed() {
            return Ok(());
        }
        let new_snap = new.snapshot();
        let target = aperture_target(&new_snap);

        if self.page_table().is_none() {
            let mut table = self.device().create_page_table(self.num_pages());
            table.set_caching(new_snap.flags.caching());
            if let Some((mem_type, span)) = target {
                table.bind(mem_type, span)?;
            }
            self.install_page_table(table);
            log::trace!("relocate: staged page table for {}", new_snap.mem_type);
            return Ok(());
        }

        let table = self.page_table_mut().ok_or(Error::InvalidParameter)?;
        match (table.state(), target) {
            (TtState::Bound(mem_type, span), Some(target)) if (mem_type, span) == target => Ok(()),
            (TtState::Bound(..), _) => Err(Error::InvalidParameter),
            (TtState::Unbound, None) => {
                table.set_caching(new_snap.flags.caching());
                Ok(())
            }
            (TtState::Unbound, Some((mem_type, span))) => {
                let previous = table.caching();
                table.set_caching(new_snap.flags.caching());
                table.bind(mem_type, span).map_err(|e| {
                    table.set_caching(previous);
                    e
                })
            }
        }
    }

    /// Commit a move the GPU is performing
    ///
    /// `fence` signals completion of the already issued hardware copy and
    /// replaces the buffer's fence. With `evict`, waits for it and releases
    /// the old placement synchronously. Otherwise the old placement moves
    /// into a ghost that is torn down once `fence` signals, and the buffer
    /// reports `MOVING` until then. A fixed destination drops the page
    /// table; for pipelined moves the ghost takes it. A non-fixed
    /// destination keeps the table as `prepare_accel_move` left it and
    /// fails with `InvalidParameter` when it was not prepared.
    pub fn move_via_accel_cleanup(
        &mut self,
        fence: FenceRef,
        evict: bool,
        ctx: &MoveContext,
        new: Placement,
    ) -> Result<()> {
        let new_domain = self.check_target(&new)?;
        let device = self.device().clone();
        let old_type = self.mem_type();
        let new_snap = new.snapshot();

        let update = if new_domain.is_fixed() {
            TableUpdate::Release
        } else {
            match self.page_table() {
                Some(table) if table.state() == expected_state(&new_snap) => TableUpdate::Keep,
                _ => {
                    log::warn!("relocate: {} -> {} without prepared page table", old_type, new_snap.mem_type);
                    return Err(Error::InvalidParameter);
                }
            }
        };

        drop(self.replace_fence(fence.reference()));

        if evict {
            self.wait(&ctx.wait_params(device.config())).map_err(|e| {
                log::warn!("relocate: evict wait {} -> {} failed: {}", old_type, new_snap.mem_type, e);
                e
            })?;
            drop(self.commit(new, update));
        } else {
            let moving = self.moves_in_flight().clone();
            moving.fetch_add(1, Ordering::AcqRel);
            let displaced = self.commit(new, update);
            let ghost = GhostHandle::spawn(
                displaced.placement,
                displaced.table,
                Some(fence.reference()),
                Some(moving),
                device.stats_handle().clone(),
            );
            log::trace!("relocate: ghost for {} (table {})", old_type, ghost.owns_page_table());
            ghost.release(device.ghosts());
        }

        device.stats_handle().record_accel();
        log::debug!(
            "relocate: accelerated {} -> {} ({})",
            old_type,
            new_snap.mem_type,
            if evict { "evict" } else { "pipelined" }
        );
        Ok(())
    }
}
