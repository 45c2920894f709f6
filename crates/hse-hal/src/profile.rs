//! # Chip Profiles
//!
//! Per-chip description of the engine table and the behavioural quirks the
//! driver has to honour. A profile is selected once, when the device is
//! identified, and is read-only afterwards.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use hse_core::{ByteSize, Error, Result};

use crate::mmio::registers;

/// Most engines a single register block can host
pub const MAX_ENGINES: usize = 4;

/// Default inline (compact) queue capacity: 64 words
pub const DEFAULT_COMPACT_SIZE: ByteSize = ByteSize::from_bytes(256);

// =============================================================================
// ENGINE DESCRIPTION
// =============================================================================

/// How an engine receives its commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineMode {
    /// Engine fetches a queue from host memory through base/limit/read/write
    /// pointers
    QueuePointer,
    /// Up to eight command words are written into registers
    InlineRegister,
}

impl EngineMode {
    /// Control register offset
    pub const fn ctrl_offset(self) -> u32 {
        match self {
            Self::QueuePointer => registers::queue::CTRL,
            Self::InlineRegister => registers::inline::CTRL,
        }
    }

    /// Raw interrupt status register offset
    pub const fn ints_offset(self) -> u32 {
        match self {
            Self::QueuePointer => registers::queue::INTS,
            Self::InlineRegister => registers::inline::INTS,
        }
    }

    /// Interrupt enable register offset
    pub const fn intc_offset(self) -> u32 {
        match self {
            Self::QueuePointer => registers::queue::INTC,
            Self::InlineRegister => registers::inline::INTC,
        }
    }
}

/// One engine in the register block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineDesc {
    /// Offset of the engine's registers in the block
    pub offset: u32,
    /// Dispatch mode
    pub mode: EngineMode,
}

impl EngineDesc {
    /// Queue-pointer engine at `offset`
    pub const fn queue_pointer(offset: u32) -> Self {
        Self {
            offset,
            mode: EngineMode::QueuePointer,
        }
    }

    /// Inline-register engine at `offset`
    pub const fn inline_register(offset: u32) -> Self {
        Self {
            offset,
            mode: EngineMode::InlineRegister,
        }
    }
}

// =============================================================================
// QUIRKS
// =============================================================================

bitflags! {
    /// Chip capability and errata flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Quirks: u32 {
        /// Bypass must be disabled at attach
        const BYPASS_EN_DISABLE = 1 << 0;
        /// Second-generation copy/XOR engine; misaligned copies need no
        /// splitting and fill/XOR are available
        const XOR_COPY_V2 = 1 << 1;
        /// Addresses above 4 GiB are encoded with an extension word
        const SUPPORT_32GB_RAM = 1 << 2;
        /// Rotate supports 10-bit formats
        const SUPPORT_ROTATE_10BIT = 1 << 3;
    }
}

// =============================================================================
// CHIP PROFILE
// =============================================================================

/// Engine table and quirks of one chip
#[derive(Debug, Clone)]
pub struct ChipProfile {
    /// Human-readable chip name
    pub name: &'static str,
    /// Engines, indexed by engine id
    engines: ArrayVec<EngineDesc, MAX_ENGINES>,
    /// Quirk flags
    pub quirks: Quirks,
    /// Capacity of inline (compact) queues
    pub compact_size: ByteSize,
    /// Most channel descriptors merged into one dispatch on a queue-pointer
    /// engine (inline-register engines always take one)
    pub max_descs_per_dispatch: usize,
}

impl ChipProfile {
    /// Profile with no engines
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            engines: ArrayVec::new(),
            quirks: Quirks::empty(),
            compact_size: DEFAULT_COMPACT_SIZE,
            max_descs_per_dispatch: usize::MAX,
        }
    }

    /// Add an engine; engines beyond [`MAX_ENGINES`] are dropped with an error
    pub fn with_engine(mut self, desc: EngineDesc) -> Self {
        if self.engines.try_push(desc).is_err() {
            log::error!("profile {}: engine table full, dropping {:?}", self.name, desc);
        }
        self
    }

    /// Set quirk flags
    pub fn with_quirks(mut self, quirks: Quirks) -> Self {
        self.quirks = quirks;
        self
    }

    /// Set compact queue capacity
    pub fn with_compact_size(mut self, size: ByteSize) -> Self {
        self.compact_size = size;
        self
    }

    /// Set the merge limit
    pub fn with_max_descs_per_dispatch(mut self, max: usize) -> Self {
        self.max_descs_per_dispatch = max;
        self
    }

    /// Engine table
    pub fn engines(&self) -> &[EngineDesc] {
        &self.engines
    }

    /// Number of engines
    pub fn num_engines(&self) -> usize {
        self.engines.len()
    }

    /// Check a quirk
    #[inline]
    pub fn has(&self, quirk: Quirks) -> bool {
        self.quirks.contains(quirk)
    }

    /// Merge limit for an engine of the given mode
    pub fn merge_limit(&self, mode: EngineMode) -> usize {
        match mode {
            EngineMode::InlineRegister => 1,
            EngineMode::QueuePointer => self.max_descs_per_dispatch.max(1),
        }
    }

    /// Reject profiles the driver cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engines.is_empty() {
            log::error!("profile {}: no engines", self.name);
            return Err(Error::InvalidParameter);
        }
        let size = self.compact_size.as_bytes();
        if size < 32 || size % 16 != 0 {
            log::error!("profile {}: bad compact size {}", self.name, self.compact_size);
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for ChipProfile {
    /// Single queue-pointer engine at offset 0, no quirks
    fn default() -> Self {
        Self::new("generic").with_engine(EngineDesc::queue_pointer(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile() {
        let p = ChipProfile::default();
        assert_eq!(p.num_engines(), 1);
        assert_eq!(p.engines()[0].mode, EngineMode::QueuePointer);
        assert_eq!(p.compact_size.as_bytes(), 256);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_merge_limit_by_mode() {
        let p = ChipProfile::default().with_max_descs_per_dispatch(4);
        assert_eq!(p.merge_limit(EngineMode::QueuePointer), 4);
        assert_eq!(p.merge_limit(EngineMode::InlineRegister), 1);
        let p = p.with_max_descs_per_dispatch(0);
        assert_eq!(p.merge_limit(EngineMode::QueuePointer), 1);
    }

    #[test]
    fn test_engine_table_overflow_is_dropped() {
        let mut p = ChipProfile::new("big");
        for i in 0..(MAX_ENGINES as u32 + 2) {
            p = p.with_engine(EngineDesc::inline_register(i * 0x100));
        }
        assert_eq!(p.num_engines(), MAX_ENGINES);
    }

    #[test]
    fn test_validate_rejects() {
        assert_eq!(
            ChipProfile::new("empty").validate(),
            Err(Error::InvalidParameter)
        );
        let p = ChipProfile::default().with_compact_size(ByteSize::from_bytes(40));
        assert_eq!(p.validate(), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_register_offsets_by_mode() {
        assert_eq!(EngineMode::QueuePointer.ints_offset(), 0x14);
        assert_eq!(EngineMode::InlineRegister.ints_offset(), 0x24);
        assert_eq!(EngineMode::InlineRegister.intc_offset(), 0x28);
    }
}
