use super::job::{SlotId, TaskId};
use crate::partition::Span;

/// What a unit of work knows about where it runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerContext {
    slot: SlotId,
    task: TaskId,
    span_index: u32,
    span: Span,
    num_spans: u32,
}

impl WorkerContext {
    pub(crate) fn new(slot: SlotId, task: TaskId, span_index: u32, span: Span, num_spans: u32) -> Self {
        WorkerContext { slot, task, span_index, span, num_spans }
    }

    pub fn slot(&self) -> SlotId { self.slot }

    pub fn task_id(&self) -> TaskId { self.task }

    /// Index of this span among the task's spans, in input order.
    pub fn span_index(&self) -> u32 { self.span_index }

    /// The range of the input this unit of work was given.
    pub fn span(&self) -> Span { self.span }

    pub fn num_spans(&self) -> u32 { self.num_spans }
}
