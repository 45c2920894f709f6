//! # HSE Core
//!
//! Foundational types shared by every layer of the HSE (hardware sequencing
//! engine) driver stack.
//!
//! ## Contents
//!
//! - [`Error`] / [`Result`]: the single error taxonomy of the stack
//! - [`DmaAddr`], [`ByteSize`], [`Handle`]: strongly typed addresses, sizes
//!   and opaque handles
//! - [`sync::Completion`]: one-shot completion slot used by blocking callers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        hse-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Error     │  │   Types     │  │     Completion      │  │
//! │  │  Handling   │  │ (DmaAddr,   │  │  (one-shot wait     │  │
//! │  │             │  │  Handle)    │  │   with timeout)     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{Error, Result};
pub use types::*;
