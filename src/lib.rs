//! A data-parallel task scheduler.
//!
//! `Scheduler::run_parallel` takes an ordered input and a unit of work, splits the
//! input into contiguous spans, runs the unit of work on every span on a bounded
//! pool of workers and hands back the per-span results merged in input order
//! (optionally aggregated and/or sorted) once every span is done.
//!
//! What we want:
//! - A hard bound on the number of spans executing at the same time, across all tasks.
//! - Work that can't start right away waits in a single FIFO queue, no task starves.
//! - The first failing span rejects its task. Nothing is retried.
//! - Hosts without real concurrency still make progress, one span per scheduling quantum.
//! - No implicit global scheduler.

mod core;
mod task;
pub mod diagnostics;
pub mod error;
pub mod handle;
pub mod options;
pub mod partition;

pub use crate::core::context::WorkerContext;
pub use crate::core::job::{JobRef, SlotId, TaskId};
pub use crate::core::pool::{PoolStats, SlotState};
pub use crate::core::scheduler::{Capabilities, Scheduler, SchedulerBuilder, SchedulerId};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::transport::Transport;
pub use crate::core::WorkerHook;
pub use crate::core::sync;
pub use crate::error::{BoxError, Error, TransportError};
pub use crate::handle::OwnedHandle;
pub use crate::options::{Options, Sort, SortKind};
pub use crate::partition::Span;
