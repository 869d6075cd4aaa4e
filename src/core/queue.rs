//! The pending queue.
//!
//! Spans that could not be admitted because every slot was busy wait here, strictly
//! in arrival order. There is no priority, no reordering and no deduplication, and no
//! bound on the queue's length: admission control is the only backpressure.

use std::collections::VecDeque;
use std::time::Instant;

use super::job::TaskJob;
use crate::sync::Arc;

/// A span that is waiting for a slot, with everything needed to start it later.
pub(crate) struct PendingItem {
    pub task: Arc<dyn TaskJob>,
    pub span_index: u32,
    pub queued_at: Instant,
}

impl PendingItem {
    pub fn new(task: Arc<dyn TaskJob>, span_index: u32) -> Self {
        PendingItem {
            task,
            span_index,
            queued_at: Instant::now(),
        }
    }
}

pub(crate) struct PendingQueue {
    items: VecDeque<PendingItem>,
}

impl PendingQueue {
    pub fn new() -> Self {
        PendingQueue { items: VecDeque::new() }
    }

    pub fn enqueue(&mut self, item: PendingItem) {
        self.items.push_back(item);
    }

    pub fn dequeue_next(&mut self) -> Option<PendingItem> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize { self.items.len() }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Removes every item, in queue order.
    pub fn take_all(&mut self) -> Vec<PendingItem> {
        self.items.drain(..).collect()
    }
}

#[test]
fn pending_queue_is_fifo() {
    use crate::core::testing::StubTask;

    let a = StubTask::new(1, 2);
    let b = StubTask::new(2, 1);

    let mut queue = PendingQueue::new();
    assert!(queue.dequeue_next().is_none());

    queue.enqueue(PendingItem::new(a.clone(), 0));
    queue.enqueue(PendingItem::new(b.clone(), 0));
    queue.enqueue(PendingItem::new(a.clone(), 1));
    assert_eq!(queue.len(), 3);

    let order: Vec<(u64, u32)> = std::iter::from_fn(|| queue.dequeue_next())
        .map(|item| (item.task.id().get(), item.span_index))
        .collect();
    assert_eq!(order, vec![(1, 0), (2, 0), (1, 1)]);
    assert!(queue.is_empty());

    queue.enqueue(PendingItem::new(b, 0));
    assert_eq!(queue.take_all().len(), 1);
    assert!(queue.is_empty());
}
