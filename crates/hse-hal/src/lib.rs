//! # HSE Hardware Abstraction Layer
//!
//! Everything the engine layer needs from the outside world, behind traits:
//!
//! - [`mmio`]: 32-bit register access, a volatile MMIO region and a
//!   simulated register file for host bring-up and tests
//! - [`irq`]: interrupt status and hardware status bits
//! - [`dma`]: DMA-coherent buffer allocation
//! - [`platform`]: clock and sleep
//! - [`profile`]: per-chip engine table and quirks

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod dma;
pub mod irq;
pub mod mmio;
pub mod platform;
pub mod profile;

pub use dma::{DmaAllocator, DmaBuffer, DmaRegion, SystemDmaAllocator};
pub use irq::{HwStatus, IntStatus, IrqReturn};
pub use mmio::{HardwareRegisters, MmioRegion, RegisterIo, SimRegisters};
pub use platform::{Platform, SimPlatform};
pub use profile::{ChipProfile, EngineDesc, EngineMode, Quirks};

#[cfg(feature = "std")]
pub use platform::StdPlatform;
