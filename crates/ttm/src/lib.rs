//! # Helix TTM
//!
//! Buffer object placement engine: moves GPU allocations between host
//! memory, fixed video memory and remapped apertures while the display
//! pipeline and command processor may still reference the old storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         helix-ttm                               │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                  Relocation Protocol                      │  │
//! │  │   move_via_copy · move_via_reset · move_via_accel_cleanup │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │          │                   │                     │            │
//! │  ┌───────┴───────┐  ┌────────┴────────┐  ┌─────────┴─────────┐  │
//! │  │  Region Copy  │  │ Placement Record│  │  Ghost Manager    │  │
//! │  │    Engine     │  │   (commit)      │  │ (pending release) │  │
//! │  └───────────────┘  └─────────────────┘  └───────────────────┘  │
//! │          │                                                      │
//! │  ┌───────┴───────────────────────────────────────────────────┐  │
//! │  │  Mapping Manager (kmap) · Page Tables · Domain Managers   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │          │                                                      │
//! │  ┌───────┴───────────────────────────────────────────────────┐  │
//! │  │  Driver hooks: CpuMapper · TtBackend · RegionAllocator    │  │
//! │  │                SyncObject · BusResolver                   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership
//!
//! A buffer owns its placement record, its page table and a reference to
//! its fence. A relocation replaces all three in one `commit`. Storage that
//! hardware may still read after a pipelined move is handed to a ghost,
//! which the device releases once the ghost's fence signals.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod buffer;
pub mod copy;
pub mod device;
pub mod domain;
mod ghost;
pub mod kmap;
pub mod mapper;
pub mod placement;
pub mod relocate;
pub mod tt;

#[cfg(test)]
mod mock;

// Re-exports
pub use buffer::{BufferObject, PrivFlags};
pub use copy::CopyOrder;
pub use device::{ApertureResolver, BoDevice, BusResolver, BusWindow, DeviceConfig, MoveStats, MoveStatsSnapshot};
pub use domain::{DomainFlags, DomainManager, IoAddr, RegionAllocator, RegionSpan};
pub use helix_ttm_core::{Caching, Error, FenceRef, MemType, Result, SyncObject, WaitParams, PAGE_SIZE};
pub use kmap::{Kmap, KmapKind};
pub use mapper::{io_prot, placement_prot, CpuMapper, PageProt};
pub use placement::{Placement, PlacementFlags, PlacementSnapshot, Region};
pub use relocate::MoveContext;
pub use tt::{BackendFactory, PageFrame, PagePool, PageTable, SystemPagePool, TtBackend, TtState};
