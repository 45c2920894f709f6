//! # Register Access
//!
//! 32-bit register I/O for the HSE register block.
//!
//! The block is shared by every engine; each engine sees it through a
//! [`HardwareRegisters`] handle carrying its base offset. Two backends
//! implement [`RegisterIo`]: a volatile [`MmioRegion`] over mapped device
//! memory and [`SimRegisters`], an in-memory register file that records
//! writes for host bring-up and tests.

use alloc::collections::BTreeMap;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

// =============================================================================
// REGISTER OFFSETS
// =============================================================================

/// HSE register offsets
pub mod registers {
    //! Engine register offsets, relative to the engine base

    /// Queue-pointer mode registers
    pub mod queue {
        //! The engine fetches commands from a ring in host memory

        /// Queue base
        pub const QB: u32 = 0x00;
        /// Queue limit
        pub const QL: u32 = 0x04;
        /// Queue read pointer
        pub const QR: u32 = 0x08;
        /// Queue write pointer
        pub const QW: u32 = 0x0C;
        /// Control
        pub const CTRL: u32 = 0x10;
        /// Raw interrupt status
        pub const INTS: u32 = 0x14;
        /// Byte swap control
        pub const SWAP: u32 = 0x18;
        /// Queue counter low
        pub const QCL: u32 = 0x1C;
        /// Queue counter high
        pub const QCH: u32 = 0x20;
        /// Interrupt enable
        pub const INTC: u32 = 0x24;
    }

    /// Inline-register mode registers
    pub mod inline {
        //! Up to eight command words written straight into registers

        /// First command register
        pub const RCMD0: u32 = 0x00;
        /// Number of command registers
        pub const RCMD_COUNT: usize = 8;
        /// Control
        pub const CTRL: u32 = 0x20;
        /// Raw interrupt status
        pub const INTS: u32 = 0x24;
        /// Interrupt enable
        pub const INTC: u32 = 0x28;
    }

    /// Device-global bypass register
    pub const BYPASS: u32 = 0x41C;
    /// Control value that starts execution
    pub const CTRL_START: u32 = 0x1;
}

// =============================================================================
// REGISTER I/O TRAIT
// =============================================================================

/// 32-bit register read/write
///
/// Offsets are byte offsets from the start of the register block.
pub trait RegisterIo: Send + Sync {
    /// Read a register
    fn read32(&self, offset: u32) -> u32;

    /// Write a register
    fn write32(&self, offset: u32, value: u32);
}

// =============================================================================
// HARDWARE REGISTERS HANDLE
// =============================================================================

/// Shared register block seen from one engine's base offset
#[derive(Clone)]
pub struct HardwareRegisters {
    io: Arc<dyn RegisterIo>,
    base: u32,
}

impl HardwareRegisters {
    /// Handle over the whole block (base 0)
    pub fn new(io: Arc<dyn RegisterIo>) -> Self {
        Self { io, base: 0 }
    }

    /// Handle for a sub-block starting at `base`
    pub fn at(&self, base: u32) -> Self {
        Self {
            io: self.io.clone(),
            base: self.base + base,
        }
    }

    /// Base offset of this handle
    #[inline]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Read a register relative to the base
    #[inline]
    pub fn read(&self, offset: u32) -> u32 {
        let value = self.io.read32(self.base + offset);
        log::trace!("r: offset={:03x}, val={:08x}", self.base + offset, value);
        value
    }

    /// Write a register relative to the base
    #[inline]
    pub fn write(&self, offset: u32, value: u32) {
        log::trace!("w: offset={:03x}, val={:08x}", self.base + offset, value);
        self.io.write32(self.base + offset, value);
    }
}

impl fmt::Debug for HardwareRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HardwareRegisters(@{:03x})", self.base)
    }
}

// =============================================================================
// MMIO REGION
// =============================================================================

/// Mapped device register window
#[derive(Debug)]
pub struct MmioRegion {
    /// Virtual address of the mapping
    virt_addr: usize,
    /// Window size in bytes
    size: usize,
}

impl MmioRegion {
    /// Wrap an existing mapping
    ///
    /// # Safety
    /// - `virt_addr` must map `size` bytes of device registers
    /// - The mapping must stay valid for the lifetime of the region
    pub unsafe fn new(virt_addr: usize, size: usize) -> Self {
        Self { virt_addr, size }
    }

    /// Window size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    fn in_bounds(&self, offset: u32) -> bool {
        offset % 4 == 0 && (offset as usize) + 4 <= self.size
    }
}

impl RegisterIo for MmioRegion {
    fn read32(&self, offset: u32) -> u32 {
        if !self.in_bounds(offset) {
            log::error!("mmio: read outside window, offset={:#x}", offset);
            return 0;
        }
        let ptr = (self.virt_addr + offset as usize) as *const u32;
        // SAFETY: offset checked against the window, mapping valid per constructor contract
        let value = unsafe { core::ptr::read_volatile(ptr) };
        fence::mmio_read_barrier();
        value
    }

    fn write32(&self, offset: u32, value: u32) {
        if !self.in_bounds(offset) {
            log::error!("mmio: write outside window, offset={:#x}", offset);
            return;
        }
        fence::mmio_write_barrier();
        let ptr = (self.virt_addr + offset as usize) as *mut u32;
        // SAFETY: offset checked against the window, mapping valid per constructor contract
        unsafe { core::ptr::write_volatile(ptr, value) }
    }
}

// =============================================================================
// SIMULATED REGISTER FILE
// =============================================================================

#[derive(Default)]
struct SimState {
    values: BTreeMap<u32, u32>,
    write_one_to_clear: BTreeSet<u32>,
    log: Vec<(u32, u32)>,
}

/// In-memory register file
///
/// Reads return the last value written (0 if never written). Offsets marked
/// write-one-to-clear behave like interrupt status registers: a write clears
/// the written bits instead of storing them. Every write is logged.
#[derive(Default)]
pub struct SimRegisters {
    state: Mutex<SimState>,
}

impl SimRegisters {
    /// Empty register file
    pub fn new() -> Self {
        Self::default()
    }

    /// Register file with the interrupt status registers of every engine in
    /// `profile` marked write-one-to-clear
    pub fn for_profile(profile: &crate::profile::ChipProfile) -> Self {
        let sim = Self::new();
        for desc in profile.engines() {
            sim.mark_write_one_to_clear(desc.offset + desc.mode.ints_offset());
        }
        sim
    }

    /// Mark a register as write-one-to-clear
    pub fn mark_write_one_to_clear(&self, offset: u32) {
        self.state.lock().write_one_to_clear.insert(offset);
    }

    /// Set a register as the device would (not logged)
    pub fn set(&self, offset: u32, value: u32) {
        self.state.lock().values.insert(offset, value);
    }

    /// Current value
    pub fn value(&self, offset: u32) -> u32 {
        self.state.lock().values.get(&offset).copied().unwrap_or(0)
    }

    /// Every write so far, in order
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.state.lock().log.clone()
    }

    /// Values written to one register, in order
    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Forget the write log
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

impl RegisterIo for SimRegisters {
    fn read32(&self, offset: u32) -> u32 {
        self.value(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut state = self.state.lock();
        state.log.push((offset, value));
        if state.write_one_to_clear.contains(&offset) {
            let current = state.values.get(&offset).copied().unwrap_or(0);
            state.values.insert(offset, current & !value);
        } else {
            state.values.insert(offset, value);
        }
    }
}

impl fmt::Debug for SimRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimRegisters")
            .field("registers", &state.values.len())
            .field("writes", &state.log.len())
            .finish()
    }
}

// =============================================================================
// MEMORY FENCE OPERATIONS
// =============================================================================

/// Memory barriers around MMIO access
pub mod fence {
    //! Memory barrier operations

    /// Compiler fence (prevents reordering)
    #[inline(always)]
    pub fn compiler() {
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    }

    /// Barrier before an MMIO write
    #[inline(always)]
    pub fn mmio_write_barrier() {
        #[cfg(target_arch = "aarch64")]
        {
            // SAFETY: This is a memory barrier instruction
            unsafe {
                core::arch::asm!("dmb st", options(nostack, preserves_flags));
            }
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            compiler();
        }
    }

    /// Barrier after an MMIO read
    #[inline(always)]
    pub fn mmio_read_barrier() {
        #[cfg(target_arch = "aarch64")]
        {
            // SAFETY: This is a memory barrier instruction
            unsafe {
                core::arch::asm!("dmb ld", options(nostack, preserves_flags));
            }
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            compiler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_registers_store_and_log() {
        let sim = SimRegisters::new();
        sim.write32(0x10, 1);
        sim.write32(0x10, 0);
        sim.write32(0x14, 7);
        assert_eq!(sim.read32(0x10), 0);
        assert_eq!(sim.writes_to(0x10), [1, 0]);
        assert_eq!(sim.writes().len(), 3);
    }

    #[test]
    fn test_write_one_to_clear() {
        let sim = SimRegisters::new();
        sim.mark_write_one_to_clear(0x14);
        sim.set(0x14, 0x6);
        sim.write32(0x14, 0x2);
        assert_eq!(sim.read32(0x14), 0x4);
        sim.write32(0x14, 0x6);
        assert_eq!(sim.read32(0x14), 0);
    }

    #[test]
    fn test_hardware_registers_offset() {
        let sim = Arc::new(SimRegisters::new());
        let regs = HardwareRegisters::new(sim.clone()).at(0x100);
        regs.write(registers::queue::CTRL, registers::CTRL_START);
        assert_eq!(sim.value(0x110), 1);
        assert_eq!(regs.read(registers::queue::CTRL), 1);
        assert_eq!(regs.base(), 0x100);
    }

    #[test]
    fn test_mmio_region_bounds() {
        let mut backing = [0u32; 4];
        // SAFETY: backing outlives the region and is 16 bytes long
        let region = unsafe { MmioRegion::new(backing.as_mut_ptr() as usize, 16) };
        region.write32(0x4, 0xdead_beef);
        assert_eq!(region.read32(0x4), 0xdead_beef);
        region.write32(0x10, 1);
        assert_eq!(region.read32(0x10), 0);
        assert_eq!(region.read32(0x2), 0);
    }
}
