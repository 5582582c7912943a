//! # Scoria
//!
//! Command recording, synchronization and event completion for an
//! OpenCL-compatible compute runtime.
//!
//! Scoria is the host-side core that turns API-level enqueue calls into an
//! ordered, dependency-respecting stream of executable work with correct
//! completion signalling, profiling and callback fan-out. It deliberately
//! does not know how work executes: kernels arrive as host-callable units,
//! and drivers plug in through two narrow seams (the timeline
//! [`Semaphore`](sync::Semaphore) contract and queue-supplied command
//! payloads).
//!
//! ## Overview
//!
//! - [`Context`]: parent object every queue, event and command buffer is
//!   created in.
//! - [`Queue`]: in-order executor. Submitting a command yields an [`Event`];
//!   completion is signalled by advancing the queue's timeline counter.
//! - [`Event`]: completion primitive with a monotonically decreasing status,
//!   profiling timestamps and threshold callbacks. Command, combined and
//!   user variants.
//! - [`Command`] / [`CommandBuffer`]: recordable units of work and the
//!   finalizable, replayable batch that groups them per queue.
//! - [`tracking`]: optional debug-build ledger auditing object lifetimes.
//!
//! ## Quick Start
//!
//! ```
//! use scoria::{CommandBuffer, Command, Context, Queue};
//! use scoria::queue::QUEUE_PROFILING_ENABLE;
//!
//! let ctx = Context::new();
//! let queue = Queue::new(&ctx, QUEUE_PROFILING_ENABLE).unwrap();
//!
//! let buffer = CommandBuffer::new(&[queue.clone()], Vec::new()).unwrap();
//! let work = Command::native_kernel(&queue, || {
//!     // ... run a compiled kernel, copy a buffer, ...
//!     Ok(())
//! });
//! buffer.record_command(&work, &[]).unwrap();
//! buffer.finalize().unwrap();
//!
//! let event = buffer.enqueue(&[], &[]).unwrap();
//! event.wait(false);
//! assert!(event.completed());
//! ```
//!
//! ## Threading
//!
//! Every handle is cheap to clone and safe to share across threads. Each
//! event and command buffer carries its own lock; locks are never held
//! across user callbacks or condition-variable waits.

pub mod command;
pub mod context;
pub mod error;
pub mod event;
pub mod object;
pub mod queue;
pub mod sync;
pub mod tracking;

pub use command::{Command, CommandBuffer, CommandBufferState, CommandType, SyncPoint};
pub use context::Context;
pub use error::{Error, Result};
pub use event::{Event, ProfilingInfo, wait_for_events};
pub use queue::Queue;

pub mod prelude {
    pub use crate::command::{Command, CommandBuffer, CommandBufferState, CommandType};
    pub use crate::context::Context;
    pub use crate::error::{Error, Result};
    pub use crate::event::{Event, ProfilingInfo, status, wait_for_events};
    pub use crate::queue::Queue;
    pub use crate::sync::{HostSemaphore, Semaphore};
}
