//! # HSE Error Handling
//!
//! Error taxonomy for the sequencing engine stack.
//!
//! - Allocation and usage errors are returned synchronously
//! - Hardware command errors and timeouts only ever reach a caller through a
//!   completion callback
//! - Errors are `Copy` and `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// HSE Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// HSE unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Queue Errors
    // =========================================================================
    /// DMA-coherent or heap allocation failed
    OutOfMemory,
    /// Compact queue has no room left for the words plus a padding unit
    QueueFull,
    /// Merging another queue would exceed capacity
    MergeFailed,
    /// Queue was already sealed for hardware
    AlreadySealed,

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Engine reported a command error for this queue
    HardwareCommandError,
    /// Completion did not arrive within the allotted time
    Timeout,
    /// Caller bug: queue not acceptable in the engine's dispatch mode
    InvalidUsage,

    // =========================================================================
    // Front-End Validation Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Operation not supported on this chip
    NotSupported,
    /// Resource not found
    NotFound,
    /// Buffer access mode does not allow the request
    AccessDenied,
    /// Address arithmetic overflowed or range exceeds buffer
    Overflow,
    /// No buffer backs the requested address
    NoBuffer,
    /// Buffer is not physically contiguous
    NotContiguous,
}

impl Error {
    /// Errors that can only be delivered by a completion callback
    #[inline]
    pub const fn is_async(self) -> bool {
        matches!(self, Self::HardwareCommandError | Self::Timeout)
    }

    /// Negative errno equivalent, for front ends that speak errno
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => -12,
            Self::QueueFull | Self::MergeFailed | Self::AlreadySealed => -1,
            Self::HardwareCommandError => -14,
            Self::Timeout => -62,
            Self::InvalidUsage | Self::InvalidParameter => -22,
            Self::NotSupported => -95,
            Self::NotFound => -2,
            Self::AccessDenied => -13,
            Self::Overflow => -75,
            Self::NoBuffer => -105,
            Self::NotContiguous => -22,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Queue
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::QueueFull => write!(f, "command queue full"),
            Self::MergeFailed => write!(f, "command queue merge failed"),
            Self::AlreadySealed => write!(f, "command queue already sealed"),

            // Execution
            Self::HardwareCommandError => write!(f, "engine reported command error"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::InvalidUsage => write!(f, "invalid usage"),

            // Front end
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::NotFound => write!(f, "resource not found"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::Overflow => write!(f, "address range overflow"),
            Self::NoBuffer => write!(f, "no buffer for address"),
            Self::NotContiguous => write!(f, "buffer not contiguous"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
