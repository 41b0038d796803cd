//! # Synchronization Objects
//!
//! The engine never implements a fence. It only holds shared references to
//! driver sync objects and asks them to wait.
//!
//! References are counted through `Arc`: taking a reference clones the
//! handle, dropping the last reference runs the sync object's destructor.

use alloc::sync::Arc;
use core::fmt;
use core::time::Duration;

use static_assertions::assert_impl_all;

use crate::error::Result;

// =============================================================================
// WAIT PARAMETERS
// =============================================================================

/// How a fence wait may behave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitParams {
    /// Wait may be interrupted by a signal
    pub interruptible: bool,
    /// Fail with `WouldBlock` instead of sleeping
    pub no_wait: bool,
    /// Poll lazily (driver may sleep between polls)
    pub lazy: bool,
    /// Upper bound on the wait, `None` for unbounded
    pub timeout: Option<Duration>,
}

impl WaitParams {
    /// Unbounded, uninterruptible wait
    pub const fn blocking() -> Self {
        Self {
            interruptible: false,
            no_wait: false,
            lazy: false,
            timeout: None,
        }
    }

    /// Non-blocking probe
    pub const fn non_blocking() -> Self {
        Self {
            interruptible: false,
            no_wait: true,
            lazy: false,
            timeout: None,
        }
    }

    /// Set interruptible
    pub const fn interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }

    /// Set lazy polling
    pub const fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Bound the wait
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// =============================================================================
// SYNC OBJECT
// =============================================================================

/// Driver synchronization object
///
/// Signals when the GPU operation it was created for has completed.
/// The `context` argument is the opaque value the engine stored alongside
/// the reference (the driver's per-submission argument).
pub trait SyncObject: Send + Sync {
    /// Check for completion without blocking
    fn is_signaled(&self, context: u64) -> bool;

    /// Block until signaled
    ///
    /// Must return `Error::WouldBlock` immediately when `params.no_wait` is
    /// set and the object is busy, `Error::Timeout` when the bound elapses.
    fn wait(&self, context: u64, params: &WaitParams) -> Result<()>;

    /// Make sure the operation has been submitted to hardware
    fn flush(&self, _context: u64) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// FENCE REFERENCE
// =============================================================================

/// Counted reference to a driver sync object
#[derive(Clone)]
pub struct FenceRef {
    obj: Arc<dyn SyncObject>,
    context: u64,
}

assert_impl_all!(FenceRef: Send, Sync);

impl FenceRef {
    /// Wrap a sync object
    pub fn new(obj: Arc<dyn SyncObject>, context: u64) -> Self {
        Self { obj, context }
    }

    /// Take an additional reference
    #[inline]
    pub fn reference(&self) -> Self {
        self.clone()
    }

    /// Drop the reference held in `slot`, leaving it empty
    #[inline]
    pub fn unreference(slot: &mut Option<FenceRef>) {
        slot.take();
    }

    /// Opaque driver argument
    #[inline]
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Check for completion without blocking
    pub fn is_signaled(&self) -> bool {
        self.obj.is_signaled(self.context)
    }

    /// Wait for completion
    pub fn wait(&self, params: &WaitParams) -> Result<()> {
        if self.is_signaled() {
            return Ok(());
        }
        self.obj.wait(self.context, params)
    }

    /// Flush the underlying operation
    pub fn flush(&self) -> Result<()> {
        self.obj.flush(self.context)
    }

    /// Number of live references to the underlying object
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.obj)
    }

    /// Whether both references point at the same sync object
    pub fn same_object(&self, other: &FenceRef) -> bool {
        Arc::ptr_eq(&self.obj, &other.obj)
    }
}

impl fmt::Debug for FenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceRef")
            .field("obj", &Arc::as_ptr(&self.obj))
            .field("context", &self.context)
            .field("refs", &self.ref_count())
            .finish()
    }
}
