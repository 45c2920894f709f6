//! # Device
//!
//! Owns the register block, the chip profile, one engine per hardware unit
//! and, on demand, one transfer channel per engine.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use arrayvec::ArrayVec;
use bitflags::bitflags;
use hse_cmd::Engine;
use hse_core::{Error, Result};
use hse_dma::{Channel, ChannelConfig, WorkExecutor};
use hse_hal::mmio::registers;
use hse_hal::profile::MAX_ENGINES;
use hse_hal::{ChipProfile, DmaAllocator, HardwareRegisters, IrqReturn, Platform, Quirks};
use spin::Mutex;

bitflags! {
    /// Optional capabilities reported to clients
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u64 {
        /// Rotation of 10-bit planes
        const ROTATE_10BIT = 0x1;
    }
}

/// An attached HSE block
pub struct HseDevice {
    /// Register block
    regs: HardwareRegisters,
    /// Coherent memory
    dma: Arc<dyn DmaAllocator>,
    /// Clock for blocking waits
    platform: Arc<dyn Platform>,
    /// Chip description
    profile: ChipProfile,
    /// Runs channel completion work
    executor: Arc<dyn WorkExecutor>,
    /// Engines, indexed by engine id
    engines: ArrayVec<Arc<Engine>, MAX_ENGINES>,
    /// Lazily created channels, one slot per engine
    channels: Mutex<[Option<Channel>; MAX_ENGINES]>,
    /// Configuration of new channels
    channel_config: ChannelConfig,
    /// Set by [`HseDevice::detach`]
    detached: AtomicBool,
}

impl HseDevice {
    /// Bring up the block described by `profile`
    pub fn attach(
        regs: HardwareRegisters,
        dma: Arc<dyn DmaAllocator>,
        platform: Arc<dyn Platform>,
        profile: ChipProfile,
        executor: Arc<dyn WorkExecutor>,
    ) -> Result<Arc<Self>> {
        Self::attach_with_config(regs, dma, platform, profile, executor, ChannelConfig::default())
    }

    /// [`HseDevice::attach`] with a channel configuration
    pub fn attach_with_config(
        regs: HardwareRegisters,
        dma: Arc<dyn DmaAllocator>,
        platform: Arc<dyn Platform>,
        profile: ChipProfile,
        executor: Arc<dyn WorkExecutor>,
        channel_config: ChannelConfig,
    ) -> Result<Arc<Self>> {
        profile.validate()?;

        if profile.has(Quirks::BYPASS_EN_DISABLE) {
            regs.write(registers::BYPASS, 0);
        }

        let mut engines = ArrayVec::new();
        for (id, desc) in profile.engines().iter().enumerate() {
            engines.push(Arc::new(Engine::new(id, &regs, *desc)));
        }

        log::info!(
            "hse: {} attached on {}, {} engines, quirks={:?}",
            profile.name,
            platform.name(),
            engines.len(),
            profile.quirks
        );

        Ok(Arc::new(Self {
            regs,
            dma,
            platform,
            profile,
            executor,
            engines,
            channels: Mutex::new(core::array::from_fn(|_| None)),
            channel_config,
            detached: AtomicBool::new(false),
        }))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Chip description
    pub fn profile(&self) -> &ChipProfile {
        &self.profile
    }

    /// Coherent memory allocator
    pub fn dma(&self) -> &Arc<dyn DmaAllocator> {
        &self.dma
    }

    /// Clock
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Register block
    pub fn regs(&self) -> &HardwareRegisters {
        &self.regs
    }

    /// Number of engines
    pub fn num_engines(&self) -> usize {
        self.engines.len()
    }

    /// Engine by id
    pub fn engine(&self, id: usize) -> Result<&Arc<Engine>> {
        self.engines.get(id).ok_or(Error::NotFound)
    }

    /// Engine by id, falling back to engine 0 for unknown ids
    pub fn engine_or_default(&self, id: usize) -> &Arc<Engine> {
        match self.engines.get(id) {
            Some(engine) => engine,
            None => {
                log::warn!("hse: no engine {}, using engine 0", id);
                &self.engines[0]
            }
        }
    }

    /// Capabilities of this chip
    pub fn features(&self) -> Features {
        let mut features = Features::empty();
        if self.profile.has(Quirks::SUPPORT_ROTATE_10BIT) {
            features |= Features::ROTATE_10BIT;
        }
        features
    }

    // =========================================================================
    // Interrupt
    // =========================================================================

    /// Service the shared interrupt line
    pub fn handle_irq(&self) -> IrqReturn {
        self.engines
            .iter()
            .fold(IrqReturn::None, |ret, engine| ret.merge(engine.handle_interrupt()))
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Transfer channel of engine `id`, created on first use
    pub fn channel(&self, id: usize) -> Result<Channel> {
        if self.detached.load(Ordering::Acquire) {
            return Err(Error::InvalidUsage);
        }
        let engine = self.engine(id)?;

        let mut channels = self.channels.lock();
        if let Some(channel) = &channels[id] {
            return Ok(channel.clone());
        }
        let channel = Channel::new(
            engine.clone(),
            &self.dma,
            &self.profile,
            self.executor.clone(),
            self.channel_config.clone(),
        )?;
        channels[id] = Some(channel.clone());
        Ok(channel)
    }

    /// Release every channel; the device accepts no new channels afterwards
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: ArrayVec<Channel, MAX_ENGINES> = {
            let mut slots = self.channels.lock();
            slots.iter_mut().filter_map(Option::take).collect()
        };
        for channel in &channels {
            channel.release();
        }
        log::info!("hse: {} detached, {} channels released", self.profile.name, channels.len());
    }
}

impl fmt::Debug for HseDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HseDevice")
            .field("profile", &self.profile.name)
            .field("engines", &self.engines.len())
            .field("detached", &self.detached.load(Ordering::Relaxed))
            .finish()
    }
}
