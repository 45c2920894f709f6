//! # Interrupt Handling
//!
//! Raw engine interrupt bits and the hardware status recorded on a command
//! queue when it completes.

use bitflags::bitflags;

// =============================================================================
// INTERRUPT STATUS
// =============================================================================

bitflags! {
    /// Raw engine interrupt status (INTS) and enable (INTC) bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IntStatus: u32 {
        /// Queue finished
        const DONE = 0x2;
        /// Engine rejected a command
        const CMD_ERR = 0x4;
    }
}

impl IntStatus {
    /// Interrupts enabled while a queue executes
    pub const ENABLE_MASK: Self = Self::DONE.union(Self::CMD_ERR);

    /// Status to record on the completed queue
    pub fn to_hw_status(self) -> HwStatus {
        let mut status = HwStatus::empty();
        if self.contains(Self::CMD_ERR) {
            status |= HwStatus::CMD_ERR;
        }
        if self.contains(Self::DONE) {
            status |= HwStatus::OK;
        }
        status
    }
}

// =============================================================================
// HARDWARE STATUS
// =============================================================================

bitflags! {
    /// Completion status of a command queue
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HwStatus: u32 {
        /// Engine signalled completion
        const OK = 0x1;
        /// Engine signalled a command error
        const CMD_ERR = 0x2;
    }
}

impl HwStatus {
    /// Success means completion without any error bit
    #[inline]
    pub fn is_success(self) -> bool {
        self == Self::OK
    }
}

// =============================================================================
// IRQ RETURN
// =============================================================================

/// Whether an interrupt handler found work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Nothing pending for this handler
    None,
    /// Interrupt consumed
    Handled,
}

impl IrqReturn {
    /// Combine results of handlers sharing one line
    #[inline]
    pub fn merge(self, other: Self) -> Self {
        if self == Self::Handled || other == Self::Handled {
            Self::Handled
        } else {
            Self::None
        }
    }
}
