//! # HSE Transfer Channels
//!
//! Generic asynchronous transfer service on top of an [`hse_cmd::Engine`].
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                              Channel                                  │
//! │                                                                       │
//! │  pool ─▶ Allocated ─▶ Submitted ─▶ Issued ─▶ Running ─▶ Completed ─┐  │
//! │   ▲      (populate)   (cookie)    (issue_   (merged    (deferred  │  │
//! │   │                               pending)   dispatch)  fan-out)  │  │
//! │   └───────────────────────────────────────────────────────────────┘  │
//! │                                                                       │
//! │  Issued descriptors ──append_from──▶ merge queue ──▶ Engine           │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each descriptor owns a compact command queue. At dispatch time as many
//! issued descriptors as fit (and as the chip profile allows) are copied into
//! one normal queue and handed to the engine as a single hardware dispatch.
//! The engine interrupt moves the batch to the completed list; client
//! callbacks run later from a [`WorkExecutor`], never in interrupt context.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod channel;
pub mod descriptor;
pub mod pool;
pub mod work;

// Re-exports
pub use channel::{Channel, ChannelConfig, ChannelStats, TxStatus};
pub use descriptor::{Cookie, TxCallback, TxResult, UnmapHook};
pub use pool::PoolStats;
pub use work::{InlineExecutor, ManualExecutor, Work, WorkExecutor};

#[cfg(feature = "std")]
pub use work::ThreadExecutor;
