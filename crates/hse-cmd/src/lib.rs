//! # HSE Command System
//!
//! Command queues, command encoding and per-engine dispatch.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Command Submission Pipeline                    │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │  Operation   │    │   Command    │    │     Engine       │     │
//! │  │  (Copy/XOR/  │───▶│    Queue     │───▶│ (pending FIFO,   │     │
//! │  │   Fill/...)  │    │  (encoded)   │    │  one in flight)  │     │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘     │
//! │                                                    │ IRQ          │
//! │                                           ┌────────▼─────────┐    │
//! │                                           │ queue callback   │    │
//! │                                           │ (queue returned) │    │
//! │                                           └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. Caller encodes operations into a [`CommandQueue`]
//! 2. The queue is handed to an [`Engine`] with [`Engine::enqueue`]
//! 3. [`Engine::issue`] programs the hardware if the engine is idle
//! 4. The completion interrupt records the hardware status and hands the
//!    queue back through its completion callback
//! 5. The next pending queue starts

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod encoder;
pub mod engine;
pub mod queue;

// Re-exports
pub use encoder::{encode, encode_into, CommandWords, CopyFlags, Operation, RotateMode, RotatePlane};
pub use engine::{Engine, EngineState, EngineStats, Rejected};
pub use queue::{CommandQueue, CompletionCallback, QueueId, QueueKind};
