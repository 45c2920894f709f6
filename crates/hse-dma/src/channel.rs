//! # Transfer Channel
//!
//! One channel per engine. Descriptors move through the lists
//! `Allocated → Submitted → Issued → Running → Completed` and back to the
//! pool; each descriptor sits on exactly one list or in the pool.
//!
//! Locking: the list lock is never held while taking the pool lock, and it is
//! released before anything is handed to the engine, so an engine completion
//! can re-enter the channel from the same context.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hse_cmd::{encode_into, CommandQueue, Engine, Operation, QueueId, Rejected};
use hse_core::{DescriptorHandle, DmaAddr, Error, Result};
use hse_hal::{ChipProfile, DmaAllocator, Quirks};
use spin::Mutex;

use crate::descriptor::{Cookie, Descriptor, TxResult};
use crate::pool::{DescriptorPool, PoolStats};
use crate::work::WorkExecutor;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Descriptors created up front
    pub prealloc: usize,
    /// Honour [`Channel::terminate_all`]; when false it is a no-op
    pub allow_terminate: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prealloc: 128,
            allow_terminate: false,
        }
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Callback has run
    Complete,
    /// Not yet completed
    InProgress,
}

/// Channel statistics
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// Descriptors submitted
    pub submitted: u64,
    /// Hardware dispatches
    pub dispatches: u64,
    /// Descriptors carried by those dispatches
    pub merged: u64,
    /// Descriptors whose callback ran
    pub completed: u64,
    /// Of those, descriptors that failed
    pub failed: u64,
    /// Descriptor pool
    pub pool: PoolStats,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dispatches: AtomicU64,
    merged: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

// =============================================================================
// STATE
// =============================================================================

struct Lists {
    allocated: VecDeque<Descriptor>,
    submitted: VecDeque<Descriptor>,
    issued: VecDeque<Descriptor>,
    running: VecDeque<Descriptor>,
    completed: VecDeque<Descriptor>,
    /// Merge buffer; `None` while it is with the engine
    merge: Option<CommandQueue>,
    /// Merge buffer currently with the engine
    in_flight: Option<QueueId>,
    next_cookie: Cookie,
    last_completed: Option<Cookie>,
    released: bool,
}

impl Lists {
    fn take_all(&mut self) -> Vec<Descriptor> {
        let mut all = Vec::new();
        for list in [
            &mut self.allocated,
            &mut self.submitted,
            &mut self.issued,
            &mut self.running,
            &mut self.completed,
        ] {
            all.extend(list.drain(..));
        }
        all
    }

    fn outstanding(&self) -> usize {
        self.allocated.len()
            + self.submitted.len()
            + self.issued.len()
            + self.running.len()
            + self.completed.len()
    }

    fn find_allocated(&self, handle: DescriptorHandle) -> Result<usize> {
        self.allocated
            .iter()
            .position(|d| d.handle == handle)
            .ok_or(Error::NotFound)
    }

    /// Move every running descriptor to the completed list with `result`
    fn finish_running(&mut self, result: TxResult) -> bool {
        let any = !self.running.is_empty();
        while let Some(mut desc) = self.running.pop_front() {
            desc.result = Some(result);
            self.completed.push_back(desc);
        }
        any
    }
}

/// What to do once the list lock is dropped
#[derive(Default)]
struct Kick {
    /// Merged queue for the engine
    queue: Option<CommandQueue>,
    /// Completed list is non-empty
    fanout: bool,
}

struct Shared {
    me: Weak<Shared>,
    engine: Arc<Engine>,
    quirks: Quirks,
    merge_limit: usize,
    config: ChannelConfig,
    executor: Arc<dyn WorkExecutor>,
    lists: Mutex<Lists>,
    pool: Mutex<DescriptorPool>,
    work_scheduled: AtomicBool,
    counters: Counters,
}

// =============================================================================
// CHANNEL
// =============================================================================

/// Asynchronous transfer channel bound to one engine
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Allocate channel resources: the merge buffer and the descriptor pool
    pub fn new(
        engine: Arc<Engine>,
        dma: &Arc<dyn DmaAllocator>,
        profile: &ChipProfile,
        executor: Arc<dyn WorkExecutor>,
        config: ChannelConfig,
    ) -> Result<Self> {
        let merge = CommandQueue::normal(dma)?;

        let mut pool = DescriptorPool::new(profile.compact_size);
        let added = pool.prealloc(config.prealloc);
        if added < config.prealloc {
            log::warn!(
                "chan{}: preallocated {}/{} descriptors",
                engine.id(),
                added,
                config.prealloc
            );
        }

        let merge_limit = profile.merge_limit(engine.mode());
        log::debug!(
            "chan{}: ready, pool={}, merge_limit={}",
            engine.id(),
            added,
            merge_limit
        );

        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            quirks: profile.quirks,
            merge_limit,
            config,
            executor,
            lists: Mutex::new(Lists {
                allocated: VecDeque::new(),
                submitted: VecDeque::new(),
                issued: VecDeque::new(),
                running: VecDeque::new(),
                completed: VecDeque::new(),
                merge: Some(merge),
                in_flight: None,
                next_cookie: Cookie::FIRST,
                last_completed: None,
                released: false,
            }),
            pool: Mutex::new(pool),
            work_scheduled: AtomicBool::new(false),
            counters: Counters::default(),
            engine,
        });
        Ok(Self { shared })
    }

    /// Engine this channel dispatches to
    pub fn engine(&self) -> &Arc<Engine> {
        &self.shared.engine
    }

    /// Most descriptors merged into one dispatch
    pub fn merge_limit(&self) -> usize {
        self.shared.merge_limit
    }

    // =========================================================================
    // Descriptor preparation
    // =========================================================================

    /// Take a descriptor from the pool (growing it if empty)
    pub fn allocate(&self) -> Result<DescriptorHandle> {
        if self.shared.lists.lock().released {
            return Err(Error::InvalidUsage);
        }
        let desc = self.shared.pool.lock().get()?;
        let handle = desc.handle;

        let mut lists = self.shared.lists.lock();
        if lists.released {
            drop(lists);
            self.shared.pool.lock().put(desc);
            return Err(Error::InvalidUsage);
        }
        lists.allocated.push_back(desc);
        Ok(handle)
    }

    /// Encode `op` into an allocated descriptor
    ///
    /// On failure the descriptor goes back to the pool and the handle is no
    /// longer valid.
    pub fn populate(&self, handle: DescriptorHandle, op: &Operation) -> Result<()> {
        let mut lists = self.shared.lists.lock();
        let index = lists.find_allocated(handle)?;

        let encoded = encode_into(&mut lists.allocated[index].queue, op, self.shared.quirks);
        match encoded {
            Ok(()) => {
                let desc = &mut lists.allocated[index];
                desc.len = desc.len.saturating_add(op.byte_len());
                Ok(())
            }
            Err(e) => {
                let desc = lists.allocated.remove(index);
                drop(lists);
                log::debug!("chan{}: prep {} failed: {}", self.shared.engine.id(), op.name(), e);
                if let Some(desc) = desc {
                    self.shared.pool.lock().put(desc);
                }
                Err(e)
            }
        }
    }

    /// Allocate and populate in one step
    pub fn prep(&self, op: &Operation) -> Result<DescriptorHandle> {
        let handle = self.allocate()?;
        self.populate(handle, op)?;
        Ok(handle)
    }

    /// Prepare a memory copy
    pub fn prep_memcpy(&self, dst: DmaAddr, src: DmaAddr, len: u32) -> Result<DescriptorHandle> {
        self.prep(&Operation::Copy {
            dst,
            src,
            len,
            flags: hse_cmd::CopyFlags::empty(),
        })
    }

    /// Prepare an XOR of `srcs` into `dst`
    pub fn prep_xor(&self, dst: DmaAddr, srcs: &[DmaAddr], len: u32) -> Result<DescriptorHandle> {
        self.prep(&Operation::xor(dst, srcs, len)?)
    }

    /// Prepare a constant fill
    pub fn prep_fill(&self, dst: DmaAddr, value: u32, len: u32) -> Result<DescriptorHandle> {
        self.prep(&Operation::ConstantFill { dst, value, len })
    }

    /// Set the transfer callback of an allocated descriptor
    pub fn set_callback(
        &self,
        handle: DescriptorHandle,
        callback: impl FnOnce(TxResult, u32) + Send + 'static,
    ) -> Result<()> {
        let mut lists = self.shared.lists.lock();
        let index = lists.find_allocated(handle)?;
        lists.allocated[index].callback = Some(Box::new(callback));
        Ok(())
    }

    /// Set the hook run before the callback to release client mappings
    pub fn set_unmap(
        &self,
        handle: DescriptorHandle,
        unmap: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut lists = self.shared.lists.lock();
        let index = lists.find_allocated(handle)?;
        lists.allocated[index].unmap = Some(Box::new(unmap));
        Ok(())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Queue a populated descriptor; nothing reaches the hardware until
    /// [`Channel::issue_pending`]
    pub fn submit(&self, handle: DescriptorHandle) -> Result<Cookie> {
        let mut lists = self.shared.lists.lock();
        let index = lists.find_allocated(handle)?;
        let Some(mut desc) = lists.allocated.remove(index) else {
            return Err(Error::NotFound);
        };

        let cookie = lists.next_cookie;
        lists.next_cookie = cookie.next();
        desc.cookie = Some(cookie);
        lists.submitted.push_back(desc);
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        log::debug!("chan{}: {:?} submitted, cookie={}", self.shared.engine.id(), handle, cookie);
        Ok(cookie)
    }

    /// Move submitted descriptors to the issued list and start a dispatch if
    /// none is running
    pub fn issue_pending(&self) {
        let kick = {
            let mut lists = self.shared.lists.lock();
            let submitted = core::mem::take(&mut lists.submitted);
            lists.issued.extend(submitted);
            self.shared.start_transfer(&mut lists)
        };
        self.shared.kick(kick);
    }

    /// Completion state of a transaction
    pub fn tx_status(&self, cookie: Cookie) -> TxStatus {
        match self.shared.lists.lock().last_completed {
            Some(done) if cookie <= done => TxStatus::Complete,
            _ => TxStatus::InProgress,
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Abort everything
    ///
    /// Ignored unless [`ChannelConfig::allow_terminate`] is set. Otherwise the
    /// running dispatch is pulled from the engine and every descriptor goes
    /// back to the pool without its callback.
    pub fn terminate_all(&self) -> Result<()> {
        if !self.shared.config.allow_terminate {
            log::debug!("chan{}: terminate_all ignored", self.shared.engine.id());
            return Ok(());
        }

        let doomed = {
            let mut lists = self.shared.lists.lock();
            self.shared.recall(&mut lists);
            lists.take_all()
        };
        log::debug!("chan{}: terminated {} descriptors", self.shared.engine.id(), doomed.len());

        let mut pool = self.shared.pool.lock();
        for desc in doomed {
            pool.put(desc);
        }
        Ok(())
    }

    /// Wait for completion work scheduled before this call; later work is
    /// not waited for
    pub fn synchronize(&self) {
        self.shared.executor.flush();
    }

    /// Free all channel resources
    ///
    /// Waits for completion work, then destroys every descriptor and the
    /// merge buffer. Further allocations fail with `InvalidUsage`.
    pub fn release(&self) {
        self.synchronize();

        let doomed = {
            let mut lists = self.shared.lists.lock();
            lists.released = true;
            self.shared.recall(&mut lists);
            lists.merge = None;
            lists.take_all()
        };

        let mut pool = self.shared.pool.lock();
        let busy = doomed.len();
        for desc in doomed {
            pool.destroy(desc);
        }
        let idle = pool.drain();
        log::debug!(
            "chan{}: released, {} busy and {} idle descriptors freed",
            self.shared.engine.id(),
            busy,
            idle
        );
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Descriptors on any list
    pub fn outstanding(&self) -> usize {
        self.shared.lists.lock().outstanding()
    }

    /// Descriptors idle in the pool
    pub fn pool_available(&self) -> usize {
        self.shared.pool.lock().available()
    }

    /// A merged dispatch is with the engine
    pub fn is_busy(&self) -> bool {
        self.shared.lists.lock().in_flight.is_some()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ChannelStats {
        let c = &self.shared.counters;
        ChannelStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            dispatches: c.dispatches.load(Ordering::Relaxed),
            merged: c.merged.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            pool: self.shared.pool.lock().stats(),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("engine", &self.shared.engine.id())
            .field("merge_limit", &self.shared.merge_limit)
            .field("outstanding", &self.outstanding())
            .field("pool_available", &self.pool_available())
            .finish()
    }
}

// =============================================================================
// DISPATCH AND COMPLETION
// =============================================================================

impl Shared {
    /// Merge issued descriptors into the merge buffer
    ///
    /// Stops at the first descriptor that does not fit or at the merge limit.
    /// A descriptor that does not fit an empty buffer fails on its own.
    fn start_transfer(&self, lists: &mut Lists) -> Kick {
        let mut kick = Kick::default();
        if lists.issued.is_empty() || !lists.running.is_empty() {
            return kick;
        }
        let Some(mut merge) = lists.merge.take() else {
            return kick;
        };
        merge.reset();

        while lists.running.len() < self.merge_limit {
            let Some(desc) = lists.issued.front() else {
                break;
            };
            match merge.append_from(&desc.queue) {
                Ok(()) => {
                    if let Some(desc) = lists.issued.pop_front() {
                        lists.running.push_back(desc);
                    }
                }
                Err(e) if lists.running.is_empty() => {
                    if let Some(mut desc) = lists.issued.pop_front() {
                        log::error!(
                            "chan{}: {:?} ({} bytes) cannot be dispatched: {}",
                            self.engine.id(),
                            desc.handle,
                            desc.queue.len(),
                            e
                        );
                        desc.result = Some(TxResult::Failed(e));
                        lists.completed.push_back(desc);
                        kick.fanout = true;
                    }
                }
                Err(_) => break,
            }
        }

        if lists.running.is_empty() {
            lists.merge = Some(merge);
            return kick;
        }

        let me = self.me.clone();
        merge.set_completion_callback(move |queue, result| {
            if let Some(shared) = me.upgrade() {
                shared.transfer_complete(queue, result);
            }
        });
        lists.in_flight = Some(merge.id());

        let count = lists.running.len() as u64;
        self.counters.dispatches.fetch_add(1, Ordering::Relaxed);
        self.counters.merged.fetch_add(count, Ordering::Relaxed);
        log::debug!(
            "chan{}: dispatch {} descriptors, {} bytes",
            self.engine.id(),
            count,
            merge.len()
        );

        kick.queue = Some(merge);
        kick
    }

    /// Hand a merged queue to the engine and schedule fan-out, with the list
    /// lock released
    fn kick(&self, mut kick: Kick) {
        loop {
            if kick.fanout {
                self.schedule_fanout();
            }
            let Some(queue) = kick.queue.take() else {
                return;
            };
            match self.engine.enqueue(queue) {
                Ok(()) => {
                    self.engine.issue();
                    return;
                }
                Err(rejected) => kick = self.dispatch_rejected(rejected),
            }
        }
    }

    fn dispatch_rejected(&self, rejected: Rejected) -> Kick {
        let Rejected { error, mut queue } = rejected;
        queue.clear_completion_callback();
        log::error!("chan{}: engine refused dispatch: {}", self.engine.id(), error);

        let mut lists = self.lists.lock();
        lists.in_flight = None;
        lists.finish_running(TxResult::Failed(error));
        if !lists.released {
            lists.merge = Some(queue);
        }
        let mut kick = self.start_transfer(&mut lists);
        kick.fanout = true;
        kick
    }

    /// Engine completion of the merged queue (interrupt context)
    fn transfer_complete(&self, queue: CommandQueue, result: Result<()>) {
        let kick = {
            let mut lists = self.lists.lock();
            if lists.in_flight != Some(queue.id()) {
                log::debug!("chan{}: completion of recalled {}", self.engine.id(), queue.id());
            }
            lists.in_flight = None;

            if result.is_err() {
                log::error!(
                    "chan{}: error: status={:?}",
                    self.engine.id(),
                    queue.hardware_status()
                );
            }
            let any = lists.finish_running(TxResult::from(result));
            if !any {
                log::debug!("chan{}: no descriptors", self.engine.id());
            }

            if lists.released {
                return;
            }
            lists.merge = Some(queue);
            let mut kick = self.start_transfer(&mut lists);
            kick.fanout |= any;
            kick
        };
        self.kick(kick);
    }

    /// Pull the merged queue back from the engine, if it is there
    fn recall(&self, lists: &mut Lists) {
        let Some(id) = lists.in_flight else {
            return;
        };
        if let Some(mut queue) = self.engine.remove(id) {
            queue.clear_completion_callback();
            lists.in_flight = None;
            if !lists.released {
                lists.merge = Some(queue);
            }
        }
    }

    fn schedule_fanout(&self) {
        if self.work_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = self.me.clone();
        let scheduled = self.executor.schedule(Box::new(move || {
            if let Some(shared) = me.upgrade() {
                shared.process_completed();
            }
        }));
        if let Err(e) = scheduled {
            // Completed descriptors stay queued for the next fan-out
            log::warn!("chan{}: completion work not scheduled: {}", self.engine.id(), e);
            self.work_scheduled.store(false, Ordering::Release);
        }
    }

    /// Deferred fan-out: unmap, mark the cookie complete, run the callback
    /// and return the descriptor to the pool
    fn process_completed(&self) {
        self.work_scheduled.store(false, Ordering::Release);

        loop {
            let batch = core::mem::take(&mut self.lists.lock().completed);
            if batch.is_empty() {
                return;
            }

            for mut desc in batch {
                let result = desc.result.take().unwrap_or(TxResult::NoError);
                log::debug!(
                    "chan{}: {:?} completed, cookie={:?}, {:?}",
                    self.engine.id(),
                    desc.handle,
                    desc.cookie,
                    result
                );

                if let Some(unmap) = desc.unmap.take() {
                    unmap();
                }
                if let Some(cookie) = desc.cookie {
                    let mut lists = self.lists.lock();
                    if lists.last_completed.map_or(true, |done| cookie > done) {
                        lists.last_completed = Some(cookie);
                    }
                }

                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                if !result.is_ok() {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(callback) = desc.callback.take() {
                    callback(result, desc.residue(result));
                }

                self.pool.lock().put(desc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::ManualExecutor;
    use hse_core::ByteSize;
    use hse_hal::{EngineDesc, HardwareRegisters, IntStatus, SimRegisters, SystemDmaAllocator};

    struct Rig {
        sim: Arc<SimRegisters>,
        engine: Arc<Engine>,
        exec: Arc<ManualExecutor>,
        chan: Channel,
    }

    fn build(
        profile: &ChipProfile,
        config: ChannelConfig,
        exec: Arc<dyn WorkExecutor>,
    ) -> (Arc<SimRegisters>, Arc<Engine>, Channel) {
        let sim = Arc::new(SimRegisters::for_profile(profile));
        let block = HardwareRegisters::new(sim.clone());
        let engine = Arc::new(Engine::new(0, &block, profile.engines()[0]));
        let dma: Arc<dyn DmaAllocator> = Arc::new(SystemDmaAllocator::new());
        let chan = Channel::new(engine.clone(), &dma, profile, exec, config).unwrap();
        (sim, engine, chan)
    }

    fn raise_on(sim: &SimRegisters, engine: &Engine, bits: IntStatus) {
        sim.set(engine.base_offset() + engine.mode().ints_offset(), bits.bits());
        engine.handle_interrupt();
    }

    impl Rig {
        fn new(profile: ChipProfile, config: ChannelConfig) -> Self {
            let exec = Arc::new(ManualExecutor::new());
            let (sim, engine, chan) = build(&profile, config, exec.clone());
            Self { sim, engine, exec, chan }
        }

        fn simple() -> Self {
            Self::new(ChipProfile::default(), ChannelConfig::default())
        }

        fn raise(&self, bits: IntStatus) {
            raise_on(&self.sim, &self.engine, bits);
        }

        fn copy(&self, len: u32) -> DescriptorHandle {
            self.chan
                .prep_memcpy(DmaAddr::new(0x10_0000), DmaAddr::new(0x20_0000), len)
                .unwrap()
        }
    }

    type Log = Arc<Mutex<Vec<(u64, TxResult, u32)>>>;

    fn track(chan: &Channel, handle: DescriptorHandle, tag: u64, log: &Log) {
        let log = log.clone();
        chan.set_callback(handle, move |r, residue| log.lock().push((tag, r, residue)))
            .unwrap();
    }

    #[test]
    fn test_single_transfer() {
        let rig = Rig::simple();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let d = rig.copy(64);
        track(&rig.chan, d, 1, &log);

        let cookie = rig.chan.submit(d).unwrap();
        assert_eq!(cookie, Cookie::FIRST);
        assert!(rig.engine.current().is_none());
        assert_eq!(rig.chan.tx_status(cookie), TxStatus::InProgress);

        rig.chan.issue_pending();
        assert!(rig.chan.is_busy());
        assert!(rig.engine.current().is_some());

        rig.raise(IntStatus::DONE);
        // Fan-out is deferred
        assert!(log.lock().is_empty());
        assert_eq!(rig.exec.pending(), 1);
        assert!(!rig.chan.is_busy());

        rig.exec.run_pending();
        assert_eq!(*log.lock(), [(1, TxResult::NoError, 0)]);
        assert_eq!(rig.chan.tx_status(cookie), TxStatus::Complete);
        assert_eq!(rig.chan.outstanding(), 0);
        assert_eq!(rig.chan.pool_available(), 128);
    }

    #[test]
    fn test_issued_descriptors_merge_into_one_dispatch() {
        let rig = Rig::simple();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let d = rig.copy(64);
            track(&rig.chan, d, tag, &log);
            rig.chan.submit(d).unwrap();
        }
        rig.chan.issue_pending();

        let stats = rig.chan.stats();
        assert_eq!(stats.dispatches, 1);
        assert_eq!(stats.merged, 3);
        assert_eq!(rig.engine.stats().dispatched, 1);

        rig.raise(IntStatus::DONE);
        rig.exec.run_pending();
        let tags: Vec<u64> = log.lock().iter().map(|e| e.0).collect();
        assert_eq!(tags, [0, 1, 2]);
        assert!(log.lock().iter().all(|e| e.1 == TxResult::NoError));
        assert_eq!(rig.chan.stats().completed, 3);
    }

    #[test]
    fn test_merge_limit_splits_dispatches() {
        let profile = ChipProfile::default().with_max_descs_per_dispatch(2);
        let rig = Rig::new(profile, ChannelConfig::default());
        for _ in 0..3 {
            let d = rig.copy(64);
            rig.chan.submit(d).unwrap();
        }
        rig.chan.issue_pending();
        assert_eq!(rig.chan.stats().dispatches, 1);
        assert_eq!(rig.chan.stats().merged, 2);

        // Completion starts the remainder
        rig.raise(IntStatus::DONE);
        assert_eq!(rig.chan.stats().dispatches, 2);
        assert_eq!(rig.chan.stats().merged, 3);
        assert!(rig.chan.is_busy());

        rig.raise(IntStatus::DONE);
        rig.exec.run_pending();
        assert_eq!(rig.chan.stats().completed, 3);
        assert!(!rig.chan.is_busy());
    }

    #[test]
    fn test_issue_while_running_waits() {
        let rig = Rig::simple();
        let d1 = rig.copy(64);
        rig.chan.submit(d1).unwrap();
        rig.chan.issue_pending();

        let d2 = rig.copy(64);
        rig.chan.submit(d2).unwrap();
        rig.chan.issue_pending();
        assert_eq!(rig.chan.stats().dispatches, 1);
        assert_eq!(rig.engine.pending_len(), 0);

        rig.raise(IntStatus::DONE);
        assert_eq!(rig.chan.stats().dispatches, 2);
    }

    #[test]
    fn test_hardware_error_reaches_every_merged_descriptor() {
        let rig = Rig::simple();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..2 {
            let d = rig.copy(128);
            track(&rig.chan, d, tag, &log);
            rig.chan.submit(d).unwrap();
        }
        rig.chan.issue_pending();
        rig.raise(IntStatus::CMD_ERR);
        rig.exec.run_pending();

        let failed = TxResult::Failed(Error::HardwareCommandError);
        assert_eq!(*log.lock(), [(0, failed, 128), (1, failed, 128)]);
        assert_eq!(rig.chan.stats().failed, 2);
    }

    #[test]
    fn test_populate_failure_returns_descriptor() {
        let rig = Rig::simple();
        let before = rig.chan.pool_available();
        // Fill needs a second-generation copy engine
        let err = rig.chan.prep_fill(DmaAddr::new(0x1000), 0, 64).unwrap_err();
        assert_eq!(err, Error::NotSupported);
        assert_eq!(rig.chan.pool_available(), before);
        assert_eq!(rig.chan.outstanding(), 0);
    }

    #[test]
    fn test_fill_and_xor_on_v2() {
        let profile = ChipProfile::default().with_quirks(Quirks::XOR_COPY_V2);
        let rig = Rig::new(profile, ChannelConfig::default());
        let a = DmaAddr::new(0x1000);
        let fill = rig.chan.prep_fill(a, 0x5a5a_5a5a, 256).unwrap();
        let xor = rig.chan.prep_xor(a, &[a + 0x1000, a + 0x2000], 256).unwrap();
        rig.chan.submit(fill).unwrap();
        let last = rig.chan.submit(xor).unwrap();
        rig.chan.issue_pending();
        rig.raise(IntStatus::DONE);
        rig.exec.run_pending();
        assert_eq!(rig.chan.tx_status(last), TxStatus::Complete);
    }

    #[test]
    fn test_descriptor_too_large_fails_alone() {
        let profile = ChipProfile::default().with_compact_size(ByteSize::from_kib(8));
        let rig = Rig::new(profile, ChannelConfig::default());
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        // 300 aligned copies, 4800 bytes: more than the merge buffer holds
        let big = rig.chan.allocate().unwrap();
        let op = Operation::Copy {
            dst: DmaAddr::new(0x1000),
            src: DmaAddr::new(0x2000),
            len: 16,
            flags: hse_cmd::CopyFlags::empty(),
        };
        for _ in 0..300 {
            rig.chan.populate(big, &op).unwrap();
        }
        track(&rig.chan, big, 0, &log);
        let small = rig.copy(64);
        track(&rig.chan, small, 1, &log);

        rig.chan.submit(big).unwrap();
        rig.chan.submit(small).unwrap();
        rig.chan.issue_pending();
        assert_eq!(rig.chan.stats().merged, 1);

        rig.exec.run_pending();
        assert_eq!(*log.lock(), [(0, TxResult::Failed(Error::MergeFailed), 4800)]);

        rig.raise(IntStatus::DONE);
        rig.exec.run_pending();
        assert_eq!(log.lock()[1], (1, TxResult::NoError, 0));
    }

    #[test]
    fn test_inline_engine_takes_one_descriptor() {
        let profile = ChipProfile::new("inline").with_engine(EngineDesc::inline_register(0x200));
        let rig = Rig::new(profile, ChannelConfig::default());
        assert_eq!(rig.chan.merge_limit(), 1);
        for _ in 0..2 {
            let d = rig.copy(64);
            rig.chan.submit(d).unwrap();
        }
        rig.chan.issue_pending();
        assert_eq!(rig.chan.stats().dispatches, 1);
        assert_eq!(rig.sim.value(0x200), 0x1);

        rig.raise(IntStatus::DONE);
        assert_eq!(rig.chan.stats().dispatches, 2);
    }

    #[test]
    fn test_engine_refusal_fails_dispatch() {
        let profile = ChipProfile::new("inline").with_engine(EngineDesc::inline_register(0));
        let rig = Rig::new(profile, ChannelConfig::default());
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        // Three copies, 48 bytes: over the eight inline registers
        let d = rig.chan.allocate().unwrap();
        for _ in 0..3 {
            let op = Operation::Copy {
                dst: DmaAddr::new(0x1000),
                src: DmaAddr::new(0x2000),
                len: 16,
                flags: hse_cmd::CopyFlags::empty(),
            };
            rig.chan.populate(d, &op).unwrap();
        }
        track(&rig.chan, d, 0, &log);
        rig.chan.submit(d).unwrap();
        let ok = rig.copy(32);
        track(&rig.chan, ok, 1, &log);
        rig.chan.submit(ok).unwrap();

        rig.chan.issue_pending();
        // The second descriptor went out once the first was refused
        assert!(rig.chan.is_busy());
        assert_eq!(rig.engine.stats().rejected, 1);

        rig.exec.run_pending();
        assert_eq!(*log.lock(), [(0, TxResult::Failed(Error::InvalidUsage), 48)]);
        rig.raise(IntStatus::DONE);
        rig.exec.run_pending();
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_terminate_ignored_by_default() {
        let rig = Rig::simple();
        let d = rig.copy(64);
        rig.chan.submit(d).unwrap();
        rig.chan.issue_pending();
        rig.chan.terminate_all().unwrap();
        assert!(rig.chan.is_busy());
        assert_eq!(rig.chan.outstanding(), 1);
    }

    #[test]
    fn test_terminate_recalls_dispatch() {
        let config = ChannelConfig { prealloc: 4, allow_terminate: true };
        let rig = Rig::new(ChipProfile::default(), config);
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let d = rig.copy(64);
            track(&rig.chan, d, tag, &log);
            rig.chan.submit(d).unwrap();
        }
        let _unsubmitted = rig.copy(64);
        rig.chan.issue_pending();

        rig.chan.terminate_all().unwrap();
        assert!(!rig.chan.is_busy());
        assert!(rig.engine.current().is_none());
        assert_eq!(rig.chan.outstanding(), 0);
        assert_eq!(rig.chan.pool_available(), 4);

        rig.exec.run_pending();
        assert!(log.lock().is_empty());

        // The channel keeps working
        let d = rig.copy(64);
        let cookie = rig.chan.submit(d).unwrap();
        rig.chan.issue_pending();
        rig.raise(IntStatus::DONE);
        rig.exec.run_pending();
        assert_eq!(rig.chan.tx_status(cookie), TxStatus::Complete);
    }

    #[test]
    fn test_pool_grows_and_conserves() {
        let config = ChannelConfig { prealloc: 1, allow_terminate: false };
        let rig = Rig::new(ChipProfile::default(), config);
        let handles: Vec<_> = (0..3).map(|_| rig.copy(64)).collect();
        assert_eq!(rig.chan.stats().pool.grown, 2);

        for h in handles {
            rig.chan.submit(h).unwrap();
        }
        rig.chan.issue_pending();
        rig.raise(IntStatus::DONE);
        rig.exec.run_pending();

        let live = rig.chan.stats().pool.live() as usize;
        assert_eq!(live, 3);
        assert_eq!(rig.chan.pool_available() + rig.chan.outstanding(), live);
    }

    #[test]
    fn test_release_frees_everything() {
        let rig = Rig::simple();
        let d = rig.copy(64);
        rig.chan.submit(d).unwrap();
        rig.chan.issue_pending();
        let _allocated = rig.copy(64);

        rig.chan.release();
        assert_eq!(rig.chan.stats().pool.live(), 0);
        assert!(rig.engine.current().is_none());
        assert_eq!(rig.chan.allocate(), Err(Error::InvalidUsage));
    }

    #[test]
    fn test_unmap_runs_before_callback() {
        let rig = Rig::simple();
        let order = Arc::new(Mutex::new(Vec::new()));
        let d = rig.copy(64);
        let o = order.clone();
        rig.chan.set_unmap(d, move || o.lock().push("unmap")).unwrap();
        let o = order.clone();
        rig.chan.set_callback(d, move |_, _| o.lock().push("callback")).unwrap();
        rig.chan.submit(d).unwrap();
        rig.chan.issue_pending();
        rig.raise(IntStatus::DONE);
        rig.exec.run_pending();
        assert_eq!(*order.lock(), ["unmap", "callback"]);
    }

    #[test]
    fn test_stale_handles() {
        let rig = Rig::simple();
        let d = rig.copy(64);
        rig.chan.submit(d).unwrap();
        assert_eq!(rig.chan.submit(d), Err(Error::NotFound));
        assert_eq!(rig.chan.set_callback(d, |_, _| {}), Err(Error::NotFound));
        let op = Operation::Copy {
            dst: DmaAddr::new(0),
            src: DmaAddr::new(0),
            len: 16,
            flags: hse_cmd::CopyFlags::empty(),
        };
        assert_eq!(rig.chan.populate(DescriptorHandle::new(9999), &op), Err(Error::NotFound));
    }

    #[test]
    fn test_callback_may_submit_more() {
        let rig = Rig::simple();
        let chan = rig.chan.clone();
        let next = Arc::new(Mutex::new(None));
        let slot = next.clone();

        let d = rig.copy(64);
        rig.chan
            .set_callback(d, move |_, _| {
                let h = chan
                    .prep_memcpy(DmaAddr::new(0x1000), DmaAddr::new(0x2000), 64)
                    .unwrap();
                *slot.lock() = Some(chan.submit(h).unwrap());
                chan.issue_pending();
            })
            .unwrap();
        rig.chan.submit(d).unwrap();
        rig.chan.issue_pending();
        rig.raise(IntStatus::DONE);
        rig.exec.run_pending();

        assert!(next.lock().is_some());
        assert!(rig.chan.is_busy());
        assert_eq!(rig.chan.stats().dispatches, 2);
    }

    #[test]
    fn test_synchronize_runs_only_earlier_fanout() {
        let rig = Rig::simple();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let later = Arc::new(AtomicBool::new(false));

        let d = rig.copy(64);
        let (exec, l, flag) = (rig.exec.clone(), log.clone(), later.clone());
        rig.chan
            .set_callback(d, move |r, residue| {
                l.lock().push((1, r, residue));
                let flag = flag.clone();
                exec.schedule(Box::new(move || flag.store(true, Ordering::SeqCst)))
                    .unwrap();
            })
            .unwrap();
        rig.chan.submit(d).unwrap();
        rig.chan.issue_pending();
        rig.raise(IntStatus::DONE);

        rig.chan.synchronize();
        assert_eq!(*log.lock(), [(1, TxResult::NoError, 0)]);
        // Work scheduled by the callback is left for the executor
        assert!(!later.load(Ordering::SeqCst));
        assert_eq!(rig.exec.pending(), 1);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_synchronize_does_not_wait_for_new_work() {
        use crate::work::ThreadExecutor;
        use std::time::{Duration, Instant};

        let exec = Arc::new(ThreadExecutor::spawn("hse-test-chan").unwrap());
        let profile = ChipProfile::default();
        let (sim, engine, chan) = build(&profile, ChannelConfig::default(), exec.clone());

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let d = chan
            .prep_memcpy(DmaAddr::new(0x10_0000), DmaAddr::new(0x20_0000), 64)
            .unwrap();
        chan.set_callback(d, move |_, _| {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        chan.submit(d).unwrap();
        chan.issue_pending();
        raise_on(&sim, &engine, IntStatus::DONE);

        let e = exec.clone();
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            for _ in 0..10 {
                e.schedule(Box::new(|| std::thread::sleep(Duration::from_millis(50))))
                    .unwrap();
            }
        });

        let start = Instant::now();
        chan.synchronize();
        let waited = start.elapsed();
        assert!(done.load(Ordering::SeqCst));
        assert!(waited < Duration::from_millis(200), "synchronize waited {:?}", waited);
        feeder.join().unwrap();
    }

    /// Manual executor that can be told to refuse work
    #[derive(Default)]
    struct Gate {
        refuse: AtomicBool,
        inner: ManualExecutor,
    }

    impl WorkExecutor for Gate {
        fn schedule(&self, work: crate::work::Work) -> Result<()> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::InvalidUsage);
            }
            self.inner.schedule(work)
        }

        fn flush(&self) {
            self.inner.flush();
        }
    }

    #[test]
    fn test_refused_fanout_is_retried() {
        let gate = Arc::new(Gate::default());
        let profile = ChipProfile::default();
        let (sim, engine, chan) = build(&profile, ChannelConfig::default(), gate.clone());
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        gate.refuse.store(true, Ordering::SeqCst);
        let d1 = chan
            .prep_memcpy(DmaAddr::new(0x10_0000), DmaAddr::new(0x20_0000), 64)
            .unwrap();
        track(&chan, d1, 1, &log);
        chan.submit(d1).unwrap();
        chan.issue_pending();
        raise_on(&sim, &engine, IntStatus::DONE);
        assert_eq!(gate.inner.pending(), 0);

        gate.refuse.store(false, Ordering::SeqCst);
        let d2 = chan
            .prep_memcpy(DmaAddr::new(0x10_0000), DmaAddr::new(0x20_0000), 64)
            .unwrap();
        track(&chan, d2, 2, &log);
        chan.submit(d2).unwrap();
        chan.issue_pending();
        raise_on(&sim, &engine, IntStatus::DONE);
        assert_eq!(gate.inner.pending(), 1);

        gate.inner.run_pending();
        let tags: Vec<u64> = log.lock().iter().map(|(tag, _, _)| *tag).collect();
        assert_eq!(tags, [1, 2]);
        assert_eq!(chan.outstanding(), 0);
    }
}
