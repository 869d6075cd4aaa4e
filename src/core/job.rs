use std::any::Any;
use std::fmt;

use crate::core::context::WorkerContext;
use crate::error::{Error, TransportError};
use crate::partition::Span;
use crate::sync::Arc;

/// Unique, monotonically assigned identifier of a task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(&self) -> u64 { self.0 }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Index of a worker slot in the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) u32);

impl SlotId {
    pub fn index(&self) -> usize { self.0 as usize }
}

/// The result of a span with its type erased, on its way from the worker back to
/// the task.
pub type Payload = Box<dyn Any + Send>;

/// A task as seen by the pool and the pending queue: one parallel operation with
/// its input and output types erased.
///
/// Lock ordering: implementations take their own lock inside `is_resolved` and
/// `mark_dispatched`, which are called with the pool lock held. They must never
/// call back into the pool.
pub(crate) trait TaskJob: Send + Sync {
    fn id(&self) -> TaskId;

    fn num_spans(&self) -> u32;

    fn span(&self, index: u32) -> Span;

    /// Whether the task was fulfilled or rejected. Resolved tasks must not get
    /// any more spans dispatched.
    fn is_resolved(&self) -> bool;

    /// Called with the pool lock held when a span gets bound to a slot.
    fn mark_dispatched(&self, slot: SlotId, span_index: u32);

    /// Runs the unit of work for one span, on a worker.
    fn execute(&self, ctx: &WorkerContext) -> Result<Payload, Error>;

    /// Writes the result of a span into the output and resolves the task if it
    /// was the last one.
    fn merge(&self, slot: SlotId, span_index: u32, payload: Payload);

    /// Rejects the task because one of its spans failed.
    fn fail(&self, slot: SlotId, span_index: u32, error: Error);

    /// Rejects the task for a reason that isn't tied to a span (shutdown).
    fn reject(&self, error: Error);
}

/// Whoever admitted a job gets its slot back through this once the job is done.
pub(crate) trait SlotRelease: Send + Sync {
    fn release(self: Arc<Self>, slot: SlotId);
}

/// A span of a task bound to a worker slot. This is what transports carry.
///
/// Each `JobRef` reports exactly once: either through `run`, through `fail`, or,
/// if the transport loses it, with a transport error when it is dropped.
pub struct JobRef {
    slot: SlotId,
    span_index: u32,
    task: Arc<dyn TaskJob>,
    owner: Arc<dyn SlotRelease>,
    reported: bool,
}

impl JobRef {
    pub(crate) fn new(
        slot: SlotId,
        span_index: u32,
        task: Arc<dyn TaskJob>,
        owner: Arc<dyn SlotRelease>,
    ) -> Self {
        JobRef { slot, span_index, task, owner, reported: false }
    }

    pub fn slot(&self) -> SlotId { self.slot }

    pub fn task_id(&self) -> TaskId { self.task.id() }

    pub fn span_index(&self) -> u32 { self.span_index }

    pub fn span(&self) -> Span { self.task.span(self.span_index) }

    /// Execute the unit of work on the current thread and report its outcome.
    pub fn run(mut self) {
        profiling::scope!("run span");

        let ctx = WorkerContext::new(
            self.slot,
            self.task.id(),
            self.span_index,
            self.task.span(self.span_index),
            self.task.num_spans(),
        );

        let result = self.task.execute(&ctx);
        self.report(result);
    }

    /// Report that the job could not be delivered to or executed by its worker.
    pub fn fail(mut self, error: TransportError) {
        let span = self.span_index;
        self.report(Err(Error::Transport { span, source: error }));
    }

    fn report(&mut self, result: Result<Payload, Error>) {
        debug_assert!(!self.reported);
        self.reported = true;

        // The slot goes back first so that it can pick up pending work while we
        // merge.
        Arc::clone(&self.owner).release(self.slot);

        match result {
            Ok(payload) => self.task.merge(self.slot, self.span_index, payload),
            Err(error) => self.task.fail(self.slot, self.span_index, error),
        }
    }
}

impl Drop for JobRef {
    fn drop(&mut self) {
        if !self.reported {
            let span = self.span_index;
            self.report(Err(Error::Transport {
                span,
                source: TransportError::new("the job was dropped before it ran"),
            }));
        }
    }
}

impl fmt::Debug for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRef")
            .field("task", &self.task.id())
            .field("span", &self.span_index)
            .field("slot", &self.slot)
            .finish()
    }
}
