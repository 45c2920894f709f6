//! # Transfer Descriptors
//!
//! A descriptor carries one client transfer: its encoded commands in a
//! compact queue, the transaction cookie and the completion hooks.

use alloc::boxed::Box;
use core::fmt;

use hse_cmd::CommandQueue;
use hse_core::{ByteSize, DescriptorHandle, Error, Result};

// =============================================================================
// COOKIE
// =============================================================================

/// Transaction id returned by submit, always greater than zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cookie(u64);

impl Cookie {
    /// First cookie a channel hands out
    pub const FIRST: Self = Self(1);

    /// Raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    pub(crate) const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

// =============================================================================
// RESULT
// =============================================================================

/// Outcome handed to a transfer callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    /// Transfer done
    NoError,
    /// Transfer failed; nothing can be assumed about the destination
    Failed(Error),
}

impl TxResult {
    /// Check for success
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::NoError
    }
}

impl From<Result<()>> for TxResult {
    fn from(r: Result<()>) -> Self {
        match r {
            Ok(()) => Self::NoError,
            Err(e) => Self::Failed(e),
        }
    }
}

/// Transfer callback, given the outcome and the residue in bytes
pub type TxCallback = Box<dyn FnOnce(TxResult, u32) + Send>;

/// Releases client mappings before the callback runs
pub type UnmapHook = Box<dyn FnOnce() + Send>;

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// One client transfer
pub(crate) struct Descriptor {
    /// Stable identity, kept across reuse
    pub(crate) handle: DescriptorHandle,
    /// Encoded commands
    pub(crate) queue: CommandQueue,
    /// Assigned at submit
    pub(crate) cookie: Option<Cookie>,
    /// Bytes the transfer writes
    pub(crate) len: u32,
    /// Completion callback
    pub(crate) callback: Option<TxCallback>,
    /// Unmap hook
    pub(crate) unmap: Option<UnmapHook>,
    /// Set when the descriptor reaches the completed list
    pub(crate) result: Option<TxResult>,
}

impl Descriptor {
    pub(crate) fn new(handle: DescriptorHandle, compact_size: ByteSize) -> Result<Self> {
        Ok(Self {
            handle,
            queue: CommandQueue::compact(compact_size)?,
            cookie: None,
            len: 0,
            callback: None,
            unmap: None,
            result: None,
        })
    }

    /// Forget the previous transfer, keeping the queue memory
    pub(crate) fn recycle(&mut self) {
        self.queue.reset();
        self.cookie = None;
        self.len = 0;
        self.callback = None;
        self.unmap = None;
        self.result = None;
    }

    /// Residue reported with `result`
    pub(crate) fn residue(&self, result: TxResult) -> u32 {
        if result.is_ok() {
            0
        } else {
            self.len
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("handle", &self.handle)
            .field("cookie", &self.cookie)
            .field("len", &self.len)
            .field("queue_len", &self.queue.len())
            .field("result", &self.result)
            .finish()
    }
}
