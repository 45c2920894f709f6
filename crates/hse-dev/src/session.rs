//! # Request Session
//!
//! Synchronous front end: one session owns one normal command queue, encodes
//! requests into it and runs them on an engine, blocking until the engine
//! interrupt hands the queue back or the timeout expires.

use alloc::sync::Arc;
use core::fmt;

use arrayvec::ArrayVec;
use bitflags::bitflags;
use hse_cmd::encoder::{MAX_COMMAND_WORDS, MAX_XOR_SOURCES};
use hse_cmd::{encode_into, CommandQueue, CopyFlags, Engine, Operation, QueueId, Rejected};
use hse_core::sync::Completion;
use hse_core::{BufferHandle, DmaAddr, Error, Result};
use hse_hal::platform::poll_until;

use crate::buffer::{Access, BufferInfo, BufferRef, BufferRegistry};
use crate::device::{Features, HseDevice};

/// Interface major version
pub const VERSION_MAJOR: u16 = 3;
/// Interface minor version
pub const VERSION_MINOR: u16 = 4;

bitflags! {
    /// Per-request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionFlags: u64 {
        /// Append to the session queue without running it
        const PREPARE_ONLY = 1 << 32;
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest wait for a submitted queue
    pub timeout_us: u64,
    /// Poll interval while waiting
    pub poll_interval_us: u64,
    /// Engine used until [`Session::set_engine`]
    pub engine: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_us: 500_000,
            poll_interval_us: 100,
            engine: 0,
        }
    }
}

type Outcome = (CommandQueue, Result<()>);

/// A client of the device
pub struct Session {
    device: Arc<HseDevice>,
    engine: Arc<Engine>,
    /// `None` only while submitted
    queue: Option<CommandQueue>,
    buffers: BufferRegistry,
    config: SessionConfig,
}

impl Session {
    /// Open a session with the default configuration
    pub fn open(device: &Arc<HseDevice>) -> Result<Self> {
        Self::open_with(device, SessionConfig::default())
    }

    /// Open a session
    pub fn open_with(device: &Arc<HseDevice>, config: SessionConfig) -> Result<Self> {
        let queue = CommandQueue::normal(device.dma())?;
        let engine = device.engine_or_default(config.engine).clone();
        Ok(Self {
            device: device.clone(),
            engine,
            queue: Some(queue),
            buffers: BufferRegistry::new(),
            config,
        })
    }

    /// Interface version, major in the upper half
    pub const fn version() -> u32 {
        ((VERSION_MAJOR as u32) << 16) | VERSION_MINOR as u32
    }

    /// Capabilities of the device
    pub fn features(&self) -> Features {
        self.device.features()
    }

    /// Engine requests run on
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Select the engine; unknown ids select engine 0
    pub fn set_engine(&mut self, id: usize) {
        self.engine = self.device.engine_or_default(id).clone();
    }

    /// Words prepared so far
    pub fn prepared(&self) -> &[u32] {
        self.queue.as_ref().map(CommandQueue::words).unwrap_or_default()
    }

    fn queue_mut(&mut self) -> Result<&mut CommandQueue> {
        self.queue.as_mut().ok_or(Error::InvalidUsage)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Encode `op` and, unless `PREPARE_ONLY` is set, run it
    ///
    /// Without `PREPARE_ONLY` anything prepared earlier is discarded first.
    /// An encoding error discards the whole queue.
    pub fn execute(&mut self, op: &Operation, flags: SessionFlags) -> Result<()> {
        let quirks = self.device.profile().quirks;
        let prepare_only = flags.contains(SessionFlags::PREPARE_ONLY);

        let queue = self.queue_mut()?;
        if !prepare_only {
            queue.reset();
        }
        if let Err(e) = encode_into(queue, op, quirks) {
            log::debug!("session: failed to prepare {}: {}", op.name(), e);
            queue.reset();
            return Err(e);
        }

        if prepare_only {
            return Ok(());
        }
        self.submit()
    }

    /// Append one raw command of 1 to 9 words
    pub fn prepare_raw(&mut self, words: &[u32]) -> Result<()> {
        if words.is_empty() || words.len() > MAX_COMMAND_WORDS {
            return Err(Error::InvalidParameter);
        }
        self.queue_mut()?.append(words)
    }

    /// Run what has been prepared
    pub fn start(&mut self) -> Result<()> {
        self.submit()
    }

    /// Copy `len` bytes between imported buffers
    pub fn copy(
        &mut self,
        dst: BufferRef,
        src: BufferRef,
        len: u32,
        copy_flags: CopyFlags,
        flags: SessionFlags,
    ) -> Result<()> {
        let dst = self.buffers.resolve(dst, Access::WRITE, len)?;
        let src = self.buffers.resolve(src, Access::READ, len)?;
        self.execute(&Operation::Copy { dst, src, len, flags: copy_flags }, flags)
    }

    /// Fill `len` bytes of an imported buffer with `value`
    pub fn fill(&mut self, dst: BufferRef, value: u32, len: u32, flags: SessionFlags) -> Result<()> {
        let dst = self.buffers.resolve(dst, Access::WRITE, len)?;
        self.execute(&Operation::ConstantFill { dst, value, len }, flags)
    }

    /// XOR imported buffers into `dst`
    pub fn xor(&mut self, dst: BufferRef, srcs: &[BufferRef], len: u32, flags: SessionFlags) -> Result<()> {
        let dst = self.buffers.resolve(dst, Access::WRITE, len)?;
        let mut addrs: ArrayVec<DmaAddr, MAX_XOR_SOURCES> = ArrayVec::new();
        for src in srcs {
            let addr = self.buffers.resolve(*src, Access::READ, len)?;
            addrs.try_push(addr).map_err(|_| Error::InvalidParameter)?;
        }
        self.execute(&Operation::Xor { dst, srcs: addrs, len }, flags)
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Import a client buffer
    pub fn import_buffer(&mut self, info: BufferInfo) -> Result<BufferHandle> {
        self.buffers.import(info)
    }

    /// Release an imported buffer
    pub fn release_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        self.buffers.release(handle).map(|_| ())
    }

    /// Imported buffers
    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Hand the queue to the engine and wait for it
    ///
    /// The queue comes back reset in every case.
    fn submit(&mut self) -> Result<()> {
        let mut queue = self.queue.take().ok_or(Error::InvalidUsage)?;
        let id = queue.id();

        let done: Arc<Completion<Outcome>> = Arc::new(Completion::new());
        let slot = done.clone();
        queue.set_completion_callback(move |queue, result| {
            slot.complete((queue, result));
        });

        if let Err(Rejected { error, mut queue }) = self.engine.enqueue(queue) {
            queue.clear_completion_callback();
            queue.reset();
            self.queue = Some(queue);
            return Err(error);
        }
        self.engine.issue();

        let (mut queue, result) = match self.wait(&done) {
            Some(outcome) => outcome,
            None => self.recover(id, &done)?,
        };

        if let Err(e) = result {
            log::debug!("session: {} failed: {}", id, e);
        }
        queue.clear_completion_callback();
        queue.reset();
        self.queue = Some(queue);
        result
    }

    fn wait(&self, done: &Completion<Outcome>) -> Option<Outcome> {
        poll_until(
            self.device.platform().as_ref(),
            self.config.timeout_us,
            self.config.poll_interval_us,
            || done.is_done(),
        );
        done.try_take()
    }

    /// Pull a timed-out queue back from the engine and fail it
    fn recover(&mut self, id: QueueId, done: &Completion<Outcome>) -> Result<Outcome> {
        log::warn!(
            "session: {} timed out after {} us on engine {}",
            id,
            self.config.timeout_us,
            self.engine.id()
        );

        if let Some(queue) = self.engine.remove(id) {
            queue.complete(Err(Error::Timeout));
        }

        // Failed just above, or finished on its own before the remove
        if let Some(outcome) = done.try_take() {
            return Ok(outcome);
        }

        // Its completion is running elsewhere
        if let Some((queue, _)) = self.wait(done) {
            return Ok((queue, Err(Error::Timeout)));
        }

        log::error!("session: {} lost, allocating a new queue", id);
        self.queue = Some(CommandQueue::normal(self.device.dma())?);
        Err(Error::Timeout)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.buffers.release_all();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.engine.id())
            .field("prepared", &self.prepared().len())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}
