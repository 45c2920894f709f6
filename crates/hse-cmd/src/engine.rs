//! # Engine Dispatcher
//!
//! One [`Engine`] per hardware execution unit. It owns a FIFO of pending
//! command queues and at most one executing queue, programs the unit and
//! reacts to its completion interrupt.
//!
//! ```text
//!            enqueue            issue (idle)
//!  caller ───────────▶ pending ─────────────▶ executing
//!                                                 │ IRQ
//!                     callback (lock released) ◀──┘
//!                     then issue next
//! ```
//!
//! Completion callbacks run in interrupt context with the engine lock
//! released, so a callback may enqueue and issue further work on the same
//! engine.

use alloc::collections::VecDeque;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use hse_core::{Error, Result};
use hse_hal::mmio::registers::{self, inline, queue};
use hse_hal::{EngineDesc, EngineMode, HardwareRegisters, IntStatus, IrqReturn};
use spin::{Mutex, MutexGuard};

use crate::queue::{CommandQueue, QueueId};

/// Largest queue an inline-register engine accepts, in bytes
pub const INLINE_MAX_BYTES: usize = inline::RCMD_COUNT * 4;

// =============================================================================
// REJECTION
// =============================================================================

/// A queue the engine refused, handed back untouched
#[derive(Debug)]
pub struct Rejected {
    /// Why
    pub error: Error,
    /// The queue
    pub queue: CommandQueue,
}

impl From<Rejected> for Error {
    fn from(r: Rejected) -> Self {
        r.error
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Observable engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing executing
    Idle,
    /// A queue is executing or completing
    Executing,
}

enum Slot {
    Idle,
    Executing(CommandQueue),
    /// Callback of this queue is running outside the lock
    Completing(QueueId),
}

struct Inner {
    slot: Slot,
    pending: VecDeque<CommandQueue>,
}

/// Engine statistics
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Queues started on the hardware
    pub dispatched: u64,
    /// Queues completed by interrupt
    pub completed: u64,
    /// Completions carrying a command error
    pub cmd_errors: u64,
    /// Interrupts with no status bits set
    pub spurious: u64,
    /// Queues removed before completion
    pub removed: u64,
    /// Queues refused by enqueue
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    cmd_errors: AtomicU64,
    spurious: AtomicU64,
    removed: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Dispatcher for one hardware execution unit
pub struct Engine {
    /// Index in the device's engine table
    id: usize,
    /// Registers, based at the engine offset
    regs: HardwareRegisters,
    /// Dispatch mode
    mode: EngineMode,
    /// Queue state
    inner: Mutex<Inner>,
    /// Statistics
    counters: Counters,
}

impl Engine {
    /// Bring up an engine described by `desc` inside the register block
    pub fn new(id: usize, block: &HardwareRegisters, desc: EngineDesc) -> Self {
        let regs = block.at(desc.offset);

        regs.write(desc.mode.ctrl_offset(), 0);
        if desc.mode == EngineMode::QueuePointer {
            regs.write(queue::QCL, 0);
            regs.write(queue::QCH, 0);
        }

        log::debug!("eng@{:03x}: init, mode={:?}", desc.offset, desc.mode);

        Self {
            id,
            regs,
            mode: desc.mode,
            inner: Mutex::new(Inner {
                slot: Slot::Idle,
                pending: VecDeque::new(),
            }),
            counters: Counters::default(),
        }
    }

    /// Index in the device's engine table
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Dispatch mode
    #[inline]
    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Register offset of this engine
    #[inline]
    pub fn base_offset(&self) -> u32 {
        self.regs.base()
    }

    /// Current state
    pub fn state(&self) -> EngineState {
        match self.inner.lock().slot {
            Slot::Idle => EngineState::Idle,
            Slot::Executing(_) | Slot::Completing(_) => EngineState::Executing,
        }
    }

    /// Identity of the executing queue
    pub fn current(&self) -> Option<QueueId> {
        match &self.inner.lock().slot {
            Slot::Idle => None,
            Slot::Executing(q) => Some(q.id()),
            Slot::Completing(id) => Some(*id),
        }
    }

    /// Number of queues waiting behind the executing one
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            cmd_errors: c.cmd_errors.load(Ordering::Relaxed),
            spurious: c.spurious.load(Ordering::Relaxed),
            removed: c.removed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Append a queue to the pending FIFO
    ///
    /// Queue-pointer engines need a bus address, so compact queues are
    /// refused; inline-register engines take at most eight words.
    pub fn enqueue(&self, queue: CommandQueue) -> core::result::Result<(), Rejected> {
        let acceptable = match self.mode {
            EngineMode::QueuePointer => !queue.is_compact(),
            EngineMode::InlineRegister => queue.len() <= INLINE_MAX_BYTES,
        };
        if !acceptable {
            log::error!(
                "eng@{:03x}: invalid queue {} ({:?}, {} bytes)",
                self.base_offset(),
                queue.id(),
                queue.kind(),
                queue.len()
            );
            Counters::bump(&self.counters.rejected);
            return Err(Rejected {
                error: Error::InvalidUsage,
                queue,
            });
        }

        self.inner.lock().pending.push_back(queue);
        Ok(())
    }

    /// Start the head of the FIFO if the engine is idle
    pub fn issue(&self) {
        let inner = self.inner.lock();
        self.run_next(inner);
    }

    /// [`Engine::enqueue`] followed by [`Engine::issue`]
    pub fn submit(&self, queue: CommandQueue) -> Result<()> {
        self.enqueue(queue)?;
        self.issue();
        Ok(())
    }

    /// Take a queue back before it completes
    ///
    /// An executing queue is stopped and the next pending one started. The
    /// queue's callback is not invoked. Returns `None` if the queue is not
    /// held by this engine (never enqueued, or already completing).
    pub fn remove(&self, id: QueueId) -> Option<CommandQueue> {
        let mut inner = self.inner.lock();

        if matches!(&inner.slot, Slot::Executing(q) if q.id() == id) {
            self.stop();
            let Slot::Executing(queue) = core::mem::replace(&mut inner.slot, Slot::Idle) else {
                return None;
            };
            log::debug!("eng@{:03x}: removed executing {}", self.base_offset(), id);
            Counters::bump(&self.counters.removed);
            self.run_next(inner);
            return Some(queue);
        }

        let index = inner.pending.iter().position(|q| q.id() == id)?;
        let queue = inner.pending.remove(index);
        if queue.is_some() {
            log::debug!("eng@{:03x}: removed pending {}", self.base_offset(), id);
            Counters::bump(&self.counters.removed);
        }
        queue
    }

    // =========================================================================
    // Interrupt
    // =========================================================================

    /// Service the completion interrupt
    pub fn handle_interrupt(&self) -> IrqReturn {
        let (mut queue, raw) = {
            let mut inner = self.inner.lock();
            let raw = IntStatus::from_bits_retain(self.regs.read(self.mode.ints_offset()));
            if raw.is_empty() {
                Counters::bump(&self.counters.spurious);
                return IrqReturn::None;
            }
            self.stop();

            match core::mem::replace(&mut inner.slot, Slot::Idle) {
                Slot::Executing(queue) => {
                    inner.slot = Slot::Completing(queue.id());
                    log::debug!(
                        "eng@{:03x}: {} done, ints={:#x}",
                        self.base_offset(),
                        queue.id(),
                        raw.bits()
                    );
                    (queue, raw)
                }
                other => {
                    inner.slot = other;
                    log::debug!(
                        "eng@{:03x}: interrupt raised with no queue, ints={:#x}",
                        self.base_offset(),
                        raw.bits()
                    );
                    return IrqReturn::Handled;
                }
            }
        };

        queue.record_status(raw.to_hw_status());
        let result = queue.hardware_result();
        Counters::bump(&self.counters.completed);
        if result.is_err() {
            Counters::bump(&self.counters.cmd_errors);
            log::error!(
                "eng@{:03x}: {} command error, status={:?}",
                self.base_offset(),
                queue.id(),
                queue.hardware_status()
            );
        }

        queue.complete(result);

        let mut inner = self.inner.lock();
        if matches!(inner.slot, Slot::Completing(_)) {
            inner.slot = Slot::Idle;
        }
        self.run_next(inner);
        IrqReturn::Handled
    }

    // =========================================================================
    // Hardware
    // =========================================================================

    /// Disable interrupts, clear start, acknowledge pending status
    fn stop(&self) {
        self.regs.write(self.mode.intc_offset(), 0);
        self.regs.write(self.mode.ctrl_offset(), 0);
        self.regs
            .write(self.mode.ints_offset(), IntStatus::ENABLE_MASK.bits());
    }

    /// Start pending queues until one runs; queues that cannot be programmed
    /// are completed with an error outside the lock
    fn run_next<'a>(&'a self, mut inner: MutexGuard<'a, Inner>) {
        while let Some((queue, error)) = self.start_next(&mut inner) {
            drop(inner);
            queue.complete(Err(error));
            inner = self.inner.lock();
        }
    }

    fn start_next(&self, inner: &mut Inner) -> Option<(CommandQueue, Error)> {
        if !matches!(inner.slot, Slot::Idle) {
            return None;
        }
        let mut queue = inner.pending.pop_front()?;

        match self.mode {
            EngineMode::QueuePointer => {
                if let Err(e) = queue.seal_for_hardware() {
                    return Some((queue, e));
                }
                let Some(phys) = queue.phys() else {
                    return Some((queue, Error::InvalidUsage));
                };

                self.regs.write(queue::QB, phys.lo32());
                self.regs
                    .write(queue::QL, phys.offset(queue.capacity() as u64).lo32());
                self.regs.write(queue::QR, phys.lo32());
                self.regs
                    .write(queue::QW, phys.offset(queue.len() as u64).lo32());

                log::debug!(
                    "eng@{:03x}: {} qb={:#x}, ql={:#x}, qr={:#x}, qw={:#x}",
                    self.base_offset(),
                    queue.id(),
                    self.regs.read(queue::QB),
                    self.regs.read(queue::QL),
                    self.regs.read(queue::QR),
                    self.regs.read(queue::QW)
                );
            }
            EngineMode::InlineRegister => {
                let words = queue.words();
                for i in 0..inline::RCMD_COUNT {
                    let value = words.get(i).copied().unwrap_or(0);
                    self.regs.write(inline::RCMD0 + (i as u32) * 4, value);
                }
                log::debug!(
                    "eng@{:03x}: {} inline, {} words",
                    self.base_offset(),
                    queue.id(),
                    words.len()
                );
            }
        }

        self.regs
            .write(self.mode.intc_offset(), IntStatus::ENABLE_MASK.bits());
        self.regs
            .write(self.mode.ctrl_offset(), registers::CTRL_START);

        Counters::bump(&self.counters.dispatched);
        inner.slot = Slot::Executing(queue);
        None
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base_offset()))
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}
