//! # Synchronization Primitives
//!
//! One-shot completion slot for callers that block on an asynchronous result.
//!
//! The waiter supplies its own relax step, so the same primitive works in a
//! kernel (busy poll) and on a host (sleeping between polls).

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

// =============================================================================
// COMPLETION
// =============================================================================

/// One-shot completion carrying a value from the completer to a waiter
pub struct Completion<T> {
    /// Set once the value has been stored
    done: AtomicBool,
    /// The delivered value, taken by the waiter
    value: Mutex<Option<T>>,
}

impl<T> Completion<T> {
    /// Create an empty completion
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            value: Mutex::new(None),
        }
    }

    /// Deliver the value
    ///
    /// Returns `false` if the completion was already completed; the new value
    /// is dropped in that case.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.value.lock();
        if self.done.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(value);
        self.done.store(true, Ordering::Release);
        true
    }

    /// Check if a value has been delivered
    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Take the value if it has been delivered
    pub fn try_take(&self) -> Option<T> {
        if !self.is_done() {
            return None;
        }
        self.value.lock().take()
    }

    /// Wait for the value
    ///
    /// `relax` is called between polls; returning `false` abandons the wait
    /// (deadline reached) and yields `None`. A value that races in with the
    /// final `relax` is still returned.
    pub fn wait(&self, mut relax: impl FnMut() -> bool) -> Option<T> {
        loop {
            if let Some(v) = self.try_take() {
                return Some(v);
            }
            if !relax() {
                return self.try_take();
            }
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}
