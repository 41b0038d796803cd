//! # Error Handling
//!
//! Error type for the buffer placement engine.
//!
//! Every failure reported by the engine happens before a placement is
//! committed, so an `Err` always means the buffer object is exactly as it
//! was before the call.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Placement engine result type
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Placement engine error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Page range lies outside the buffer object
    InvalidRange,
    /// Malformed request
    InvalidParameter,
    /// Placement has no CPU-reachable window
    NotMappable,

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Page population or kernel mapping failed
    OutOfMemory,
    /// Domain allocator has no free region
    OutOfSpace,

    // =========================================================================
    // Synchronization Errors
    // =========================================================================
    /// Fence wait exceeded its bound
    Timeout,
    /// Fence busy and the caller asked not to wait
    WouldBlock,
    /// Interruptible wait was interrupted
    Interrupted,

    // =========================================================================
    // Copy Errors
    // =========================================================================
    /// Copy primitive failed
    IoFailure,
}

impl Error {
    /// Whether the caller may retry the same request later
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::OutOfSpace | Self::Timeout | Self::WouldBlock | Self::Interrupted
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange => write!(f, "page range outside buffer object"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotMappable => write!(f, "placement is not CPU mappable"),

            Self::OutOfMemory => write!(f, "out of memory"),
            Self::OutOfSpace => write!(f, "no free region in domain"),

            Self::Timeout => write!(f, "fence wait timed out"),
            Self::WouldBlock => write!(f, "fence busy"),
            Self::Interrupted => write!(f, "wait interrupted"),

            Self::IoFailure => write!(f, "copy failed"),
        }
    }
}
