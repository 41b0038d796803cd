//! # Helix TTM Core
//!
//! Foundational types shared by the buffer placement engine.
//!
//! This crate holds the pieces every layer of the engine agrees on:
//!
//! - Page geometry and memory-type identifiers
//! - The unified error type
//! - The narrow interface through which the engine talks to fences
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                   helix-ttm-core                      │
//! │  ┌────────────┐  ┌─────────────┐  ┌────────────────┐  │
//! │  │   Types    │  │    Error    │  │      Sync      │  │
//! │  │ (MemType,  │  │  Handling   │  │ (SyncObject,   │  │
//! │  │  PAGE_*)   │  │             │  │  FenceRef)     │  │
//! │  └────────────┘  └─────────────┘  └────────────────┘  │
//! └───────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod error;
pub mod sync;
pub mod types;

pub use error::{Error, Result};
pub use sync::{FenceRef, SyncObject, WaitParams};
pub use types::*;
