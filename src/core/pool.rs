//! Worker slots and admission control.
//!
//! The pool only does bookkeeping: it decides whether a span can run now, on which
//! slot, and what a slot should do once its span is done. Actually running things is
//! the transport's business, and the strategy glues the two together.
//!
//! Admission is global: at most `max_workers` slots are busy at any time, whichever
//! tasks they are working for. A slot that gets released picks up the next pending
//! item before it is allowed to idle or be torn down.

use super::job::{SlotId, TaskId};
use super::queue::{PendingItem, PendingQueue};

/// The state of a slot that has an execution context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Available for reuse (persistent workers only).
    Idle,
    /// Executing one span of one task.
    Busy { task: TaskId, span: u32 },
    /// Released with nothing left to do, its execution context is being torn down.
    Draining,
}

/// A snapshot of the pool's occupancy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_workers: u32,
    pub busy: u32,
    pub idle: u32,
    pub draining: u32,
    pub pending: usize,
    /// Number of pending items dropped because their task resolved while they waited.
    pub discarded: u64,
}

pub(crate) struct Acquired {
    pub slot: SlotId,
    /// The slot had no execution context, the transport must open one.
    pub fresh: bool,
}

pub(crate) enum Release {
    /// The slot was rebound to this pending item and stays busy.
    Redispatch(PendingItem),
    /// The slot returned to the idle set.
    Idle,
    /// The slot is draining and its execution context must be closed, then retired.
    TearDown,
}

pub(crate) struct WorkerPool {
    max_workers: u32,
    persistent: bool,
    // `None` means there is no execution context for this index. Non-persistent
    // pools can temporarily hold more than `max_workers` entries while slots drain.
    slots: Vec<Option<SlotState>>,
    busy: u32,
    pending: PendingQueue,
    discarded: u64,
    closed: bool,
}

impl WorkerPool {
    pub fn new(max_workers: u32, persistent: bool) -> Self {
        let max_workers = max_workers.max(1);
        WorkerPool {
            max_workers,
            persistent,
            slots: Vec::with_capacity(max_workers as usize),
            busy: 0,
            pending: PendingQueue::new(),
            discarded: 0,
            closed: false,
        }
    }

    /// Bind a span to a slot if fewer than `max_workers` slots are busy.
    ///
    /// Persistent pools reuse idle slots first. Otherwise a new slot is created at
    /// the lowest free index.
    pub fn try_acquire(&mut self, task: TaskId, span: u32) -> Option<Acquired> {
        if self.busy >= self.max_workers {
            return None;
        }

        let idle = if self.persistent {
            self.slots.iter().position(|slot| *slot == Some(SlotState::Idle))
        } else {
            None
        };

        let (index, fresh) = match idle {
            Some(index) => (index, false),
            None => match self.slots.iter().position(Option::is_none) {
                Some(index) => (index, true),
                None => {
                    self.slots.push(None);
                    (self.slots.len() - 1, true)
                }
            },
        };

        self.slots[index] = Some(SlotState::Busy { task, span });
        self.busy += 1;

        debug_assert!(self.busy <= self.max_workers);

        Some(Acquired { slot: SlotId(index as u32), fresh })
    }

    pub fn enqueue(&mut self, item: PendingItem) {
        self.pending.enqueue(item);
    }

    /// Hand a busy slot back.
    ///
    /// Queued work always comes first: the slot is rebound to the next pending item
    /// whose task is still unresolved. Only when the queue is empty does the slot
    /// become idle (persistent) or start draining.
    pub fn release(&mut self, slot: SlotId) -> Release {
        debug_assert!(
            matches!(self.slots.get(slot.index()), Some(Some(SlotState::Busy { .. }))),
            "releasing slot {:?} which isn't busy", slot,
        );

        if let Some(item) = self.next_live_item() {
            self.slots[slot.index()] = Some(SlotState::Busy {
                task: item.task.id(),
                span: item.span_index,
            });

            return Release::Redispatch(item);
        }

        self.busy -= 1;

        if self.persistent {
            self.slots[slot.index()] = Some(SlotState::Idle);
            Release::Idle
        } else {
            self.slots[slot.index()] = Some(SlotState::Draining);
            Release::TearDown
        }
    }

    /// Forget a slot whose execution context is gone.
    ///
    /// Draining slots are retired once the transport closed them. Busy slots are
    /// retired when their execution context could not be opened.
    pub fn retire(&mut self, slot: SlotId) {
        match self.slots.get(slot.index()) {
            Some(Some(SlotState::Busy { .. })) => { self.busy -= 1; }
            Some(Some(SlotState::Draining)) => {}
            state => {
                debug_assert!(false, "retiring slot {:?} in state {:?}", slot, state);
                return;
            }
        }

        self.slots[slot.index()] = None;

        while self.slots.last() == Some(&None) {
            self.slots.pop();
        }
    }

    /// Admit the next pending item if there is room, on a new or idle slot.
    ///
    /// Releasing a slot already takes care of the queue. This is only needed when
    /// room appears without a release, which happens when a slot is retired.
    pub fn admit_pending(&mut self) -> Option<(Acquired, PendingItem)> {
        if self.busy >= self.max_workers {
            return None;
        }

        let item = self.next_live_item()?;
        let acquired = self.try_acquire(item.task.id(), item.span_index)?;

        Some((acquired, item))
    }

    /// Move every idle slot to the draining state, for shutdown.
    pub fn drain_idle(&mut self) -> Vec<SlotId> {
        let mut drained = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if *slot == Some(SlotState::Idle) {
                *slot = Some(SlotState::Draining);
                drained.push(SlotId(index as u32));
            }
        }

        drained
    }

    /// Stop admitting work. Returns the pending items, which will never run.
    pub fn close(&mut self) -> Vec<PendingItem> {
        self.closed = true;
        self.pending.take_all()
    }

    pub fn is_closed(&self) -> bool { self.closed }

    #[cfg(test)]
    pub fn slot_state(&self, slot: SlotId) -> Option<SlotState> {
        self.slots.get(slot.index()).copied().flatten()
    }

    #[cfg(test)]
    pub fn busy(&self) -> u32 { self.busy }

    pub fn discarded(&self) -> u64 { self.discarded }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            max_workers: self.max_workers,
            busy: self.busy,
            pending: self.pending.len(),
            discarded: self.discarded,
            ..PoolStats::default()
        };

        for slot in self.slots.iter().flatten() {
            match slot {
                SlotState::Idle => stats.idle += 1,
                SlotState::Draining => stats.draining += 1,
                SlotState::Busy { .. } => {}
            }
        }

        stats
    }

    // Pending items of tasks that were rejected while they waited are dropped here.
    fn next_live_item(&mut self) -> Option<PendingItem> {
        while let Some(item) = self.pending.dequeue_next() {
            if item.task.is_resolved() {
                self.discarded += 1;
                continue;
            }

            return Some(item);
        }

        None
    }
}

#[cfg(test)]
fn task_id(id: u64) -> TaskId { TaskId(id) }

#[test]
fn admission_is_bounded() {
    let mut pool = WorkerPool::new(2, true);

    let a = pool.try_acquire(task_id(1), 0).unwrap();
    let b = pool.try_acquire(task_id(1), 1).unwrap();
    assert!(a.fresh && b.fresh);
    assert_ne!(a.slot, b.slot);
    assert!(pool.try_acquire(task_id(1), 2).is_none());
    assert_eq!(pool.busy(), 2);

    assert!(matches!(pool.release(a.slot), Release::Idle));
    assert_eq!(pool.slot_state(a.slot), Some(SlotState::Idle));

    // The idle slot is reused rather than a new one created.
    let c = pool.try_acquire(task_id(2), 0).unwrap();
    assert_eq!(c.slot, a.slot);
    assert!(!c.fresh);
    assert_eq!(pool.slot_state(c.slot), Some(SlotState::Busy { task: task_id(2), span: 0 }));
    assert!(pool.try_acquire(task_id(2), 1).is_none());
}

#[test]
fn release_prefers_pending_work() {
    use crate::core::testing::StubTask;

    let mut pool = WorkerPool::new(1, false);
    let task = StubTask::new(7, 3);

    let slot = pool.try_acquire(task_id(7), 0).unwrap().slot;
    assert!(pool.try_acquire(task_id(7), 1).is_none());
    pool.enqueue(PendingItem::new(task.clone(), 1));
    pool.enqueue(PendingItem::new(task.clone(), 2));

    match pool.release(slot) {
        Release::Redispatch(item) => assert_eq!(item.span_index, 1),
        _ => panic!("expected the pending item to be redispatched"),
    }
    assert_eq!(pool.busy(), 1);
    assert_eq!(pool.slot_state(slot), Some(SlotState::Busy { task: task_id(7), span: 1 }));

    // Items of a resolved task are skipped.
    task.resolve();
    assert!(matches!(pool.release(slot), Release::TearDown));
    assert_eq!(pool.stats().discarded, 1);
    assert_eq!(pool.slot_state(slot), Some(SlotState::Draining));
    assert_eq!(pool.busy(), 0);

    pool.retire(slot);
    assert_eq!(pool.slot_state(slot), None);
    assert_eq!(pool.stats(), PoolStats { max_workers: 1, discarded: 1, ..PoolStats::default() });
}

#[test]
fn draining_slots_do_not_block_admission() {
    use crate::core::testing::StubTask;

    let mut pool = WorkerPool::new(1, false);
    let first = pool.try_acquire(task_id(1), 0).unwrap().slot;
    assert!(matches!(pool.release(first), Release::TearDown));

    // The first slot is still draining, a fresh one is created next to it.
    let second = pool.try_acquire(task_id(1), 1).unwrap();
    assert!(second.fresh);
    assert_ne!(second.slot, first);
    assert_eq!(pool.stats().draining, 1);

    pool.retire(first);

    // A busy slot whose context could not be opened is retired, making room for
    // pending work.
    let task = StubTask::new(2, 1);
    pool.enqueue(PendingItem::new(task, 0));
    assert!(pool.admit_pending().is_none());
    pool.retire(second.slot);
    let (acquired, item) = pool.admit_pending().unwrap();
    assert_eq!(item.task.id(), task_id(2));
    assert!(acquired.fresh);
    assert_eq!(pool.busy(), 1);
}
