//! # HSE Device
//!
//! Device bring-up and the synchronous request front end.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             HseDevice                              │
//! │                                                                    │
//! │   ┌───────────┐  ┌───────────┐        ┌────────────────────────┐   │
//! │   │ Engine 0  │  │ Engine 1  │  ...   │ ChipProfile / Quirks   │   │
//! │   └─────▲─────┘  └─────▲─────┘        └────────────────────────┘   │
//! │         │              │                                           │
//! │   ┌─────┴─────┐  ┌─────┴─────┐        handle_irq() ─▶ every engine │
//! │   │ Channel 0 │  │ Channel 1 │  (lazy, async clients)              │
//! │   └───────────┘  └───────────┘                                     │
//! └─────────▲──────────────────────────────────────────────────────────┘
//!           │ one queue, submit and wait
//!     ┌─────┴─────┐
//!     │  Session  │  buffer registry, prepare-only batching
//!     └───────────┘
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod buffer;
pub mod device;
pub mod session;

// Re-exports
pub use buffer::{Access, BufferInfo, BufferRef, BufferRegistry};
pub use device::{Features, HseDevice};
pub use session::{Session, SessionConfig, SessionFlags, VERSION_MAJOR, VERSION_MINOR};
