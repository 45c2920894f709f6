//! # Deferred Work
//!
//! Channels never run client callbacks from the engine interrupt. They
//! schedule a work item on a [`WorkExecutor`] instead.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;

use hse_core::Result;
use spin::Mutex;

/// A unit of deferred work
pub type Work = Box<dyn FnOnce() + Send>;

/// Runs deferred work outside interrupt context
pub trait WorkExecutor: Send + Sync {
    /// Queue `work` to run later
    ///
    /// Fails, dropping `work`, once the executor has stopped.
    fn schedule(&self, work: Work) -> Result<()>;

    /// Block until the work scheduled before this call has run
    ///
    /// Work scheduled during the flush is not waited for. Must not be called
    /// from inside a work item.
    fn flush(&self);
}

// =============================================================================
// INLINE
// =============================================================================

/// Runs work immediately on the scheduling context
///
/// For bring-up without a worker; callbacks then run wherever the engine
/// interrupt is serviced.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl WorkExecutor for InlineExecutor {
    fn schedule(&self, work: Work) -> Result<()> {
        work();
        Ok(())
    }

    fn flush(&self) {}
}

// =============================================================================
// MANUAL
// =============================================================================

/// Holds work until [`ManualExecutor::run_pending`] is called
///
/// Gives tests and polled environments full control over when completions
/// fan out.
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Work>>,
}

impl ManualExecutor {
    /// Create an empty executor
    pub fn new() -> Self {
        Self::default()
    }

    /// Work items waiting to run
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run queued work, including work scheduled while running, and return
    /// how many items ran
    pub fn run_pending(&self) -> usize {
        self.run_at_most(usize::MAX)
    }

    fn run_at_most(&self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit {
            let Some(work) = self.queue.lock().pop_front() else {
                break;
            };
            work();
            ran += 1;
        }
        ran
    }
}

impl WorkExecutor for ManualExecutor {
    fn schedule(&self, work: Work) -> Result<()> {
        self.queue.lock().push_back(work);
        Ok(())
    }

    fn flush(&self) {
        // New work goes to the back, so the first `due` items are the old ones
        let due = self.pending();
        self.run_at_most(due);
    }
}

impl fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("pending", &self.pending())
            .finish()
    }
}

// =============================================================================
// THREAD (std)
// =============================================================================

#[cfg(feature = "std")]
pub use thread::ThreadExecutor;

#[cfg(feature = "std")]
mod thread {
    use super::{Work, WorkExecutor};
    use alloc::sync::Arc;
    use core::fmt;
    use core::sync::atomic::{AtomicU64, Ordering};
    use hse_core::{Error, Result};
    use spin::Mutex;
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    /// Single worker thread draining a work queue in order
    ///
    /// Every accepted item takes the next sequence number; the worker runs
    /// items in that order, so `finished >= n` means items `0..n` have run.
    pub struct ThreadExecutor {
        sender: Mutex<Option<mpsc::Sender<Work>>>,
        worker: Mutex<Option<JoinHandle<()>>>,
        /// Items accepted
        scheduled: AtomicU64,
        /// Items run, shared with the worker
        finished: Arc<AtomicU64>,
    }

    impl ThreadExecutor {
        /// Start a worker thread called `name`
        pub fn spawn(name: &str) -> Result<Self> {
            let (sender, receiver) = mpsc::channel::<Work>();
            let finished = Arc::new(AtomicU64::new(0));
            let counter = finished.clone();

            let worker = std::thread::Builder::new()
                .name(name.into())
                .spawn(move || {
                    while let Ok(work) = receiver.recv() {
                        work();
                        counter.fetch_add(1, Ordering::AcqRel);
                    }
                })
                .map_err(|_| Error::OutOfMemory)?;

            Ok(Self {
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
                scheduled: AtomicU64::new(0),
                finished,
            })
        }

        /// Stop accepting work, run what is queued and join the worker
        pub fn shutdown(&self) {
            self.sender.lock().take();
            if let Some(worker) = self.worker.lock().take() {
                if worker.join().is_err() {
                    log::error!("work: worker thread panicked");
                }
            }
        }

        fn worker_gone(&self) -> bool {
            self.worker.lock().as_ref().map_or(true, |w| w.is_finished())
        }
    }

    impl WorkExecutor for ThreadExecutor {
        fn schedule(&self, work: Work) -> Result<()> {
            // Sequence numbers follow send order under the sender lock
            let sender = self.sender.lock();
            let sent = match sender.as_ref() {
                Some(sender) => sender.send(work).is_ok(),
                None => false,
            };
            if !sent {
                log::warn!("work: executor stopped, item dropped");
                return Err(Error::InvalidUsage);
            }
            self.scheduled.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        fn flush(&self) {
            let mark = self.scheduled.load(Ordering::Acquire);
            while self.finished.load(Ordering::Acquire) < mark {
                if self.worker_gone() {
                    return;
                }
                std::thread::yield_now();
            }
        }
    }

    impl Drop for ThreadExecutor {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

    impl fmt::Debug for ThreadExecutor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ThreadExecutor")
                .field("scheduled", &self.scheduled.load(Ordering::Relaxed))
                .field("finished", &self.finished.load(Ordering::Relaxed))
                .finish()
        }
    }
}
