//! # Command Queue
//!
//! Append-only buffer of 32-bit command words.
//!
//! A queue is either *normal*, backed by a growable DMA-coherent buffer that
//! the engine fetches from, or *compact*, a small fixed inline buffer that
//! has no bus address and is only ever copied (into a normal queue or into
//! the inline command registers).
//!
//! Before a normal queue is handed to a queue-pointer engine it is sealed:
//! zero padding terminates the stream and every 128-bit group is word-swapped
//! into the order the engine fetches. A sealed queue is immutable until
//! [`CommandQueue::reset`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use hse_core::{ByteSize, DmaAddr, Error, Result};
use hse_hal::{DmaAllocator, DmaBuffer, HwStatus};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Initial capacity of a normal queue (one page)
pub const NORMAL_INITIAL_SIZE: ByteSize = ByteSize::KIB_4;

/// Headroom, in bytes, always kept free for the terminating padding
pub const PAD_UNIT: usize = 16;

/// Zero words appended when sealing, indexed by the fill level in words mod 4
const PAD_WORDS: [usize; 4] = [1, 4, 3, 2];

static_assertions::const_assert_eq!(PAD_UNIT % 4, 0);
static_assertions::const_assert!(NORMAL_INITIAL_SIZE.as_bytes() as usize % PAD_UNIT == 0);

// =============================================================================
// QUEUE ID
// =============================================================================

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a queue, stable for its whole life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl QueueId {
    fn next() -> Self {
        Self(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cq#{}", self.0)
    }
}

// =============================================================================
// QUEUE KIND
// =============================================================================

/// Backing memory kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Growable DMA-coherent buffer with a bus address
    Normal,
    /// Fixed inline buffer without a bus address
    Compact,
}

enum Backing {
    Normal(DmaBuffer),
    Compact(Box<[u32]>),
}

impl Backing {
    fn words(&self) -> &[u32] {
        match self {
            Self::Normal(buf) => buf.words(),
            Self::Compact(buf) => buf,
        }
    }

    fn words_mut(&mut self) -> &mut [u32] {
        match self {
            Self::Normal(buf) => buf.words_mut(),
            Self::Compact(buf) => buf,
        }
    }
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// Invoked exactly once when a submitted queue finishes
///
/// The queue is handed back by value together with the outcome.
pub type CompletionCallback = Box<dyn FnOnce(CommandQueue, Result<()>) + Send>;

/// Buffer of command words
pub struct CommandQueue {
    /// Identity
    id: QueueId,
    /// Backing memory
    backing: Backing,
    /// Write offset in bytes
    pos: usize,
    /// Number of queues merged in with [`CommandQueue::append_from`]
    merge_count: u32,
    /// Padded and swapped for the engine
    sealed: bool,
    /// Status recorded by the engine
    status: HwStatus,
    /// Completion callback
    callback: Option<CompletionCallback>,
}

impl CommandQueue {
    /// Allocate a normal queue of one page
    pub fn normal(dma: &Arc<dyn DmaAllocator>) -> Result<Self> {
        let buf = DmaBuffer::alloc(dma, NORMAL_INITIAL_SIZE)?;
        let queue = Self::with_backing(Backing::Normal(buf));
        log::debug!("{}: alloc normal, phys={:?}", queue.id, queue.phys());
        Ok(queue)
    }

    /// Allocate a compact queue of `capacity` bytes
    pub fn compact(capacity: ByteSize) -> Result<Self> {
        let count = capacity.as_words();
        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|_| Error::OutOfMemory)?;
        words.resize(count, 0u32);
        let queue = Self::with_backing(Backing::Compact(words.into_boxed_slice()));
        log::debug!("{}: alloc compact, capacity={}", queue.id, capacity);
        Ok(queue)
    }

    fn with_backing(backing: Backing) -> Self {
        Self {
            id: QueueId::next(),
            backing,
            pos: 0,
            merge_count: 0,
            sealed: false,
            status: HwStatus::empty(),
            callback: None,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Identity
    #[inline]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Backing kind
    pub fn kind(&self) -> QueueKind {
        match self.backing {
            Backing::Normal(_) => QueueKind::Normal,
            Backing::Compact(_) => QueueKind::Compact,
        }
    }

    /// Check for compact backing
    #[inline]
    pub fn is_compact(&self) -> bool {
        self.kind() == QueueKind::Compact
    }

    /// Bus address, `None` for compact queues
    pub fn phys(&self) -> Option<DmaAddr> {
        match &self.backing {
            Backing::Normal(buf) => Some(buf.phys()),
            Backing::Compact(_) => None,
        }
    }

    /// Capacity in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.backing.words().len() * 4
    }

    /// Write offset in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.pos
    }

    /// Check for an empty queue
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Words written so far (swapped if sealed)
    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.backing.words()[..self.pos / 4]
    }

    /// Number of queues merged in
    #[inline]
    pub fn merge_count(&self) -> u32 {
        self.merge_count
    }

    /// Check if sealed
    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Status recorded by the engine
    #[inline]
    pub fn hardware_status(&self) -> HwStatus {
        self.status
    }

    /// Record status bits (accumulates)
    pub fn record_status(&mut self, status: HwStatus) {
        self.status |= status;
    }

    /// Clear the recorded status
    pub fn clear_status(&mut self) {
        self.status = HwStatus::empty();
    }

    /// Outcome implied by the recorded status
    ///
    /// Any bit besides `OK` is a command error.
    pub fn hardware_result(&self) -> Result<()> {
        if self.status.difference(HwStatus::OK).is_empty() {
            Ok(())
        } else {
            Err(Error::HardwareCommandError)
        }
    }

    // =========================================================================
    // Building
    // =========================================================================

    /// Append command words
    ///
    /// A normal queue doubles its capacity until the words plus a padding
    /// unit fit; a compact queue fails with [`Error::QueueFull`] instead.
    pub fn append(&mut self, words: &[u32]) -> Result<()> {
        if self.sealed {
            return Err(Error::AlreadySealed);
        }

        let len = words.len() * 4;
        match self.backing {
            Backing::Compact(_) => {
                if self.pos + len + PAD_UNIT > self.capacity() {
                    return Err(Error::QueueFull);
                }
            }
            Backing::Normal(_) => {
                while self.pos + len + PAD_UNIT >= self.capacity() {
                    self.grow(self.capacity() * 2)?;
                }
            }
        }

        self.write_words(words);
        Ok(())
    }

    /// Copy the written words of `other` onto the end of this queue
    ///
    /// Never grows; fails with [`Error::MergeFailed`] when the result would
    /// not leave a padding unit free.
    pub fn append_from(&mut self, other: &CommandQueue) -> Result<()> {
        if self.sealed {
            return Err(Error::AlreadySealed);
        }
        if self.pos + other.pos + PAD_UNIT > self.capacity() {
            return Err(Error::MergeFailed);
        }

        self.write_words(other.words());
        self.merge_count += 1;
        Ok(())
    }

    fn write_words(&mut self, words: &[u32]) {
        let start = self.pos / 4;
        self.backing.words_mut()[start..start + words.len()].copy_from_slice(words);
        self.pos += words.len() * 4;
    }

    fn grow(&mut self, new_size: usize) -> Result<()> {
        let Backing::Normal(old) = &self.backing else {
            return Err(Error::QueueFull);
        };

        let mut new = match old.alloc_sibling(ByteSize::from_bytes(new_size as u64)) {
            Ok(buf) => buf,
            Err(e) => {
                log::warn!("{}: failed to resize to {}: {}", self.id, new_size, e);
                return Err(e);
            }
        };
        let used = self.pos / 4;
        new.words_mut()[..used].copy_from_slice(&old.words()[..used]);
        // Old buffer is returned to the allocator on drop
        self.backing = Backing::Normal(new);

        log::debug!("{}: resized to {}", self.id, new_size);
        Ok(())
    }

    /// Prepare the queue for a queue-pointer engine
    ///
    /// Appends 1, 4, 3 or 2 zero words for a fill level of 0, 1, 2 or 3
    /// words mod 4, then swaps each 128-bit group in place (word 0 with 3,
    /// word 1 with 2), covering the final partial group, and syncs the buffer
    /// for the device. A sealed queue is left untouched.
    pub fn seal_for_hardware(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }

        let start = self.pos / 4;
        let end = start + PAD_WORDS[start & 3];
        let group_end = (end + 3) & !3;

        let words = self.backing.words_mut();
        if group_end > words.len() {
            // Unreachable while the append paths keep their headroom
            log::error!("{}: no room to seal", self.id);
            return Err(Error::QueueFull);
        }

        words[start..group_end].fill(0);
        for group in words[..group_end].chunks_exact_mut(4) {
            group.swap(0, 3);
            group.swap(1, 2);
        }

        self.pos = end * 4;
        self.sealed = true;

        if let Backing::Normal(buf) = &self.backing {
            buf.sync_for_device(self.capacity());
        }
        Ok(())
    }

    /// Forget the contents but keep the memory
    pub fn reset(&mut self) {
        self.pos = 0;
        self.merge_count = 0;
        self.sealed = false;
        self.status = HwStatus::empty();
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Set the completion callback, replacing any previous one
    pub fn set_completion_callback(
        &mut self,
        callback: impl FnOnce(CommandQueue, Result<()>) + Send + 'static,
    ) {
        self.callback = Some(Box::new(callback));
    }

    /// Drop the completion callback
    pub fn clear_completion_callback(&mut self) {
        self.callback = None;
    }

    /// Check for a pending callback
    pub fn has_completion_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Hand the queue to its callback
    ///
    /// Without a callback the queue is dropped.
    pub fn complete(mut self, result: Result<()>) {
        match self.callback.take() {
            Some(callback) => callback(self, result),
            None => log::debug!("{}: completed without callback", self.id),
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("len", &self.pos)
            .field("capacity", &self.capacity())
            .field("merge_count", &self.merge_count)
            .field("sealed", &self.sealed)
            .field("status", &self.status)
            .finish()
    }
}
