//! How spans get from a task to an execution context.
//!
//! `PoolStrategy` is the normal mode: a bounded set of worker slots fed by a FIFO
//! pending queue, with a transport providing the execution contexts.
//!
//! `SimulatedStrategy` is for hosts that can't run things concurrently. All spans go
//! through the pending queue and a single ticker thread runs one of them per
//! scheduling quantum, so a long task doesn't monopolize the host.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{select, Sender};
use tracing::{trace, warn};

use super::job::{JobRef, SlotId, SlotRelease, TaskJob};
use super::pool::{Acquired, PoolStats, Release, WorkerPool};
use super::queue::{PendingItem, PendingQueue};
use super::transport::{run_job, Transport};
use crate::diagnostics::LogBook;
use crate::error::Error;
use crate::sync::{lock, thread, Arc, AtomicBool, AtomicU64, Mutex, Ordering};

pub(crate) trait Strategy: Send + Sync {
    /// Dispatch the spans of a new task, or queue them.
    fn schedule(&self, task: Arc<dyn TaskJob>);

    fn stats(&self) -> PoolStats;

    /// Stop admitting work and reject whatever is still queued. Does not block.
    fn shut_down(&self);

    /// Block until every execution context has stopped.
    fn wait_shutdown(&self);
}

pub(crate) struct PoolStrategy {
    inner: Arc<PoolInner>,
}

// Lock ordering: the pool lock may be held while taking a task's lock, never the
// other way around.
struct PoolInner {
    pool: Mutex<WorkerPool>,
    transport: Arc<dyn Transport>,
    diagnostics: Arc<LogBook>,
}

impl PoolStrategy {
    pub fn new(
        max_workers: u32,
        persistent: bool,
        transport: Arc<dyn Transport>,
        diagnostics: Arc<LogBook>,
    ) -> Self {
        PoolStrategy {
            inner: Arc::new(PoolInner {
                pool: Mutex::new(WorkerPool::new(max_workers, persistent)),
                transport,
                diagnostics,
            }),
        }
    }
}

impl Strategy for PoolStrategy {
    fn schedule(&self, task: Arc<dyn TaskJob>) {
        profiling::scope!("schedule");

        for span_index in 0..task.num_spans() {
            // A span that failed synchronously (the transport refused it) rejects
            // the task, the rest of it is not worth dispatching.
            if task.is_resolved() {
                trace!(task = %task.id(), span = span_index, "task resolved during dispatch");
                break;
            }

            let acquired = {
                let mut pool = lock(&self.inner.pool);
                if pool.is_closed() {
                    drop(pool);
                    task.reject(Error::ShutDown);
                    return;
                }

                match pool.try_acquire(task.id(), span_index) {
                    Some(acquired) => {
                        task.mark_dispatched(acquired.slot, span_index);
                        Some(acquired)
                    }
                    None => {
                        pool.enqueue(PendingItem::new(Arc::clone(&task), span_index));
                        None
                    }
                }
            };

            match acquired {
                Some(acquired) => PoolInner::start(&self.inner, acquired, Arc::clone(&task), span_index),
                None => trace!(task = %task.id(), span = span_index, "all slots busy, span queued"),
            }
        }
    }

    fn stats(&self) -> PoolStats {
        lock(&self.inner.pool).stats()
    }

    fn shut_down(&self) {
        let (pending, idle) = {
            let mut pool = lock(&self.inner.pool);
            if pool.is_closed() {
                return;
            }

            (pool.close(), pool.drain_idle())
        };

        trace!(pending = pending.len(), idle = idle.len(), "shutting down the worker pool");

        for item in pending {
            item.task.reject(Error::ShutDown);
        }

        self.inner.transport.shut_down();

        let mut pool = lock(&self.inner.pool);
        for slot in idle {
            pool.retire(slot);
        }
    }

    fn wait_shutdown(&self) {
        self.inner.transport.wait_shutdown();
    }
}

impl PoolInner {
    /// Hand a freshly acquired slot its span, opening the slot's execution context
    /// first if it has none.
    ///
    /// When the context can't be opened the slot is retired and the span fails.
    /// Retiring makes room for pending work, which is then started the same way.
    fn start(this: &Arc<Self>, acquired: Acquired, task: Arc<dyn TaskJob>, span_index: u32) {
        let mut next = VecDeque::new();
        next.push_back((acquired, task, span_index));

        while let Some((acquired, task, span_index)) = next.pop_front() {
            if acquired.fresh {
                if let Err(error) = this.transport.open(acquired.slot) {
                    warn!(slot = acquired.slot.index(), %error, "could not open a worker slot");

                    let (discarded, closed) = {
                        let mut pool = lock(&this.pool);
                        let discarded = pool.discarded();
                        pool.retire(acquired.slot);
                        while let Some((acquired, item)) = pool.admit_pending() {
                            item.task.mark_dispatched(acquired.slot, item.span_index);
                            next.push_back((acquired, item.task, item.span_index));
                        }

                        (pool.discarded() - discarded, pool.is_closed())
                    };

                    this.report_discarded(discarded);

                    // Shutting down while the slot was being opened is not a transport failure.
                    let error = if closed {
                        Error::ShutDown
                    } else {
                        Error::Transport { span: span_index, source: error }
                    };
                    task.fail(acquired.slot, span_index, error);
                    continue;
                }
            }

            let owner: Arc<dyn SlotRelease> = this.clone();
            this.transport.submit(JobRef::new(acquired.slot, span_index, task, owner));
        }
    }

    fn report_discarded(&self, count: u64) {
        if count > 0 {
            self.diagnostics.warning(format!(
                "discarded {} pending span(s) of tasks that resolved while they waited",
                count,
            ));
        }
    }
}

impl SlotRelease for PoolInner {
    fn release(self: Arc<Self>, slot: SlotId) {
        profiling::scope!("release slot");

        let (outcome, discarded) = {
            let mut pool = lock(&self.pool);
            let discarded = pool.discarded();
            let outcome = pool.release(slot);
            if let Release::Redispatch(item) = &outcome {
                item.task.mark_dispatched(slot, item.span_index);
            }

            (outcome, pool.discarded() - discarded)
        };

        self.report_discarded(discarded);

        match outcome {
            Release::Redispatch(item) => {
                trace!(
                    slot = slot.index(),
                    task = %item.task.id(),
                    span = item.span_index,
                    waited_us = item.queued_at.elapsed().as_micros() as u64,
                    "slot picked up a pending span",
                );

                let owner: Arc<dyn SlotRelease> = self.clone();
                self.transport.submit(JobRef::new(slot, item.span_index, item.task, owner));
            }
            Release::Idle => {}
            Release::TearDown => {
                trace!(slot = slot.index(), "tearing down slot");
                self.transport.close(slot);
                lock(&self.pool).retire(slot);
            }
        }
    }
}

/// The only slot in simulated mode.
pub(crate) const SIMULATED_SLOT: SlotId = SlotId(0);

pub(crate) struct SimulatedStrategy {
    inner: Arc<SimulatedInner>,
    stop: Sender<()>,
    ticker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct SimulatedInner {
    queue: Mutex<PendingQueue>,
    diagnostics: Arc<LogBook>,
    // Only changed with the queue lock held.
    closed: AtomicBool,
    busy: AtomicBool,
    discarded: AtomicU64,
}

impl SimulatedStrategy {
    pub fn new(quantum: Duration, diagnostics: Arc<LogBook>) -> Result<Self, Error> {
        let inner = Arc::new(SimulatedInner {
            queue: Mutex::new(PendingQueue::new()),
            diagnostics,
            closed: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
        });

        let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
        let ticks = crossbeam_channel::tick(quantum);
        let worker = Arc::clone(&inner);

        let ticker = thread::Builder::new()
            .name("Simulated worker".to_string())
            .spawn(move || {
                profiling::register_thread!("Simulated worker");

                loop {
                    select! {
                        recv(stopped) -> _ => break,
                        recv(ticks) -> _ => SimulatedInner::tick(&worker),
                    }
                }
            })
            .map_err(Error::Spawn)?;

        Ok(SimulatedStrategy {
            inner,
            stop,
            ticker: Mutex::new(Some(ticker)),
        })
    }
}

impl Strategy for SimulatedStrategy {
    fn schedule(&self, task: Arc<dyn TaskJob>) {
        let mut queue = lock(&self.inner.queue);
        if self.inner.closed.load(Ordering::SeqCst) {
            drop(queue);
            task.reject(Error::ShutDown);
            return;
        }

        for span_index in 0..task.num_spans() {
            queue.enqueue(PendingItem::new(Arc::clone(&task), span_index));
        }

        trace!(task = %task.id(), spans = task.num_spans(), "spans queued for simulated execution");
    }

    fn stats(&self) -> PoolStats {
        let pending = lock(&self.inner.queue).len();
        let busy = self.inner.busy.load(Ordering::SeqCst) as u32;

        PoolStats {
            max_workers: 1,
            busy,
            idle: 1 - busy,
            draining: 0,
            pending,
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }

    fn shut_down(&self) {
        let pending = {
            let mut queue = lock(&self.inner.queue);
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }

            queue.take_all()
        };

        for item in pending {
            item.task.reject(Error::ShutDown);
        }

        let _ = self.stop.try_send(());
    }

    fn wait_shutdown(&self) {
        let ticker = lock(&self.ticker).take();
        if let Some(ticker) = ticker {
            if ticker.join().is_err() {
                warn!("the simulated worker panicked");
            }
        }
    }
}

impl SimulatedInner {
    /// Run at most one span.
    fn tick(this: &Arc<Self>) {
        let mut discarded = 0;
        let item = {
            let mut queue = lock(&this.queue);
            loop {
                match queue.dequeue_next() {
                    Some(item) if item.task.is_resolved() => discarded += 1,
                    Some(item) => break Some(item),
                    None => break None,
                }
            }
        };

        if discarded > 0 {
            this.discarded.fetch_add(discarded, Ordering::Relaxed);
            this.diagnostics.warning(format!(
                "discarded {} pending span(s) of tasks that resolved while they waited",
                discarded,
            ));
        }

        let item = match item {
            Some(item) => item,
            None => return,
        };

        item.task.mark_dispatched(SIMULATED_SLOT, item.span_index);
        this.busy.store(true, Ordering::SeqCst);

        trace!(
            task = %item.task.id(),
            span = item.span_index,
            waited_us = item.queued_at.elapsed().as_micros() as u64,
            "running a simulated span",
        );

        let owner: Arc<dyn SlotRelease> = this.clone();
        run_job(SIMULATED_SLOT, JobRef::new(SIMULATED_SLOT, item.span_index, item.task, owner));
    }
}

impl SlotRelease for SimulatedInner {
    fn release(self: Arc<Self>, _slot: SlotId) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
use crate::core::testing::ManualTransport;

#[cfg(test)]
fn manual_scheduler(max_workers: u32, persistent: bool) -> (crate::Scheduler, Arc<ManualTransport>) {
    let transport = ManualTransport::new();
    let scheduler = crate::Scheduler::builder()
        .with_max_workers(max_workers)
        .with_persistent_workers(persistent)
        .with_transport(transport.clone())
        .build()
        .unwrap();

    (scheduler, transport)
}

#[cfg(test)]
fn identity(_ctx: &crate::WorkerContext, items: &[u32]) -> Result<Vec<u32>, String> {
    Ok(items.to_vec())
}

#[test]
fn merge_in_span_order_whatever_the_completion_order() {
    use crate::Options;

    let (scheduler, transport) = manual_scheduler(4, true);
    let input: Vec<u32> = (0..10).collect();

    let handle = scheduler.run_parallel(input.clone(), identity, Options::new().with_threads(4));
    let task = handle.task_id().get();
    assert_eq!(transport.submitted().len(), 4);

    for span in (0..4).rev() {
        assert!(!handle.poll());
        transport.take(task, span).run();
    }

    assert_eq!(handle.wait().unwrap(), input);
    assert_eq!(scheduler.live_tasks(), 0);
}

#[test]
fn pending_work_runs_in_arrival_order() {
    use crate::Options;

    let (scheduler, transport) = manual_scheduler(1, true);

    let a = scheduler.run_parallel(vec![1u32, 2], identity, Options::new().with_threads(2));
    let b = scheduler.run_parallel(vec![3u32], identity, Options::new());
    let c = scheduler.run_parallel(vec![4u32], identity, Options::new());

    let (ta, tb, tc) = (a.task_id().get(), b.task_id().get(), c.task_id().get());
    assert_eq!(transport.submitted(), vec![(ta, 0, SlotId(0))]);
    assert_eq!(scheduler.stats().pending, 3);

    let mut order = Vec::new();
    while let Some(&(task, span, slot)) = transport.submitted().first() {
        assert_eq!(slot, SlotId(0));
        order.push((task, span));
        assert!(transport.run_next());
    }

    assert_eq!(order, vec![(ta, 0), (ta, 1), (tb, 0), (tc, 0)]);
    assert_eq!(a.wait().unwrap(), vec![1, 2]);
    assert_eq!(b.wait().unwrap(), vec![3]);
    assert_eq!(c.wait().unwrap(), vec![4]);
    assert_eq!(transport.opened(), vec![SlotId(0)]);
}

#[test]
fn saturated_pool_drains() {
    use crate::Options;

    let (scheduler, transport) = manual_scheduler(2, false);
    let input: Vec<u32> = (0..5).collect();

    let handle = scheduler.run_parallel(input.clone(), identity, Options::new().with_threads(5));

    let stats = scheduler.stats();
    assert_eq!(stats.busy, 2);
    assert_eq!(stats.pending, 3);
    assert_eq!(transport.submitted().len(), 2);

    transport.run_all();

    assert_eq!(handle.wait().unwrap(), input);

    // Non-persistent slots are torn down once the queue is empty.
    let stats = scheduler.stats();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.draining, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(transport.closed().len(), 2);
}

#[test]
fn persistent_slots_are_reused() {
    use crate::Options;

    let (scheduler, transport) = manual_scheduler(2, true);

    let first = scheduler.run_parallel(vec![1u32, 2], identity, Options::new().with_threads(2));
    transport.run_all();
    assert_eq!(first.wait().unwrap(), vec![1, 2]);
    assert_eq!(scheduler.stats().idle, 2);

    let second = scheduler.run_parallel(vec![3u32, 4], identity, Options::new().with_threads(2));
    transport.run_all();
    assert_eq!(second.wait().unwrap(), vec![3, 4]);

    assert_eq!(transport.opened(), vec![SlotId(0), SlotId(1)]);
    assert!(transport.closed().is_empty());
}

#[test]
fn failure_rejects_and_ignores_late_results() {
    use crate::diagnostics::Level;
    use crate::Options;

    let (scheduler, transport) = manual_scheduler(3, true);

    let handle = scheduler.run_parallel(
        vec![1u32, 2, 3],
        |ctx: &crate::WorkerContext, items: &[u32]| -> Result<Vec<u32>, String> {
            if ctx.span_index() == 1 {
                return Err("boom".to_string());
            }
            Ok(items.to_vec())
        },
        Options::new().with_threads(3),
    );
    let task = handle.task_id().get();

    transport.take(task, 1).run();
    assert!(handle.poll());

    // The other spans still complete, their results are not merged.
    transport.take(task, 0).run();
    transport.take(task, 2).run();

    match handle.wait() {
        Err(Error::WorkerExecution { span, source }) => {
            assert_eq!(span, 1);
            assert_eq!(source.to_string(), "boom");
        }
        other => panic!("unexpected result {:?}", other),
    }

    let late = scheduler.diagnostics().search("already resolved", Some(Level::Warning));
    assert_eq!(late.total, 2);
    assert_eq!(scheduler.stats().busy, 0);
    assert_eq!(scheduler.live_tasks(), 0);
}

#[test]
fn pending_spans_of_rejected_task_are_discarded() {
    use crate::Options;

    let (scheduler, transport) = manual_scheduler(1, true);

    let failing = scheduler.run_parallel(
        vec![1u32, 2, 3],
        |_ctx: &crate::WorkerContext, _items: &[u32]| -> Result<Vec<u32>, String> { Err("nope".into()) },
        Options::new().with_threads(3),
    );
    let other = scheduler.run_parallel(vec![4u32], identity, Options::new());

    // The slot is handed back before the failure is reported, so it already picked
    // up the next span of the failing task.
    let task = failing.task_id().get();
    assert!(transport.run_next());
    assert!(failing.poll());
    assert_eq!(transport.submitted(), vec![(task, 1, SlotId(0))]);

    // The last span of the rejected task is skipped.
    assert!(transport.run_next());
    assert!(failing.wait().is_err());
    assert_eq!(transport.submitted(), vec![(other.task_id().get(), 0, SlotId(0))]);
    assert_eq!(scheduler.stats().discarded, 1);

    transport.run_all();
    assert_eq!(other.wait().unwrap(), vec![4]);
}

#[test]
fn open_failure_rejects_the_task() {
    use crate::Options;

    let (scheduler, transport) = manual_scheduler(2, false);
    transport.refuse_open(true);

    let handle = scheduler.run_parallel(vec![1u32, 2, 3, 4], identity, Options::new().with_threads(4));

    match handle.wait() {
        Err(Error::Transport { span, .. }) => assert_eq!(span, 0),
        other => panic!("unexpected result {:?}", other),
    }

    assert!(transport.submitted().is_empty());
    assert_eq!(scheduler.stats(), PoolStats { max_workers: 2, ..PoolStats::default() });

    // The pool recovers once slots can be opened again.
    transport.refuse_open(false);
    let handle = scheduler.run_parallel(vec![5u32, 6], identity, Options::new().with_threads(2));
    transport.run_all();
    assert_eq!(handle.wait().unwrap(), vec![5, 6]);
}

#[test]
fn shutdown_rejects_pending_work() {
    use crate::Options;

    let (scheduler, transport) = manual_scheduler(1, true);

    let running = scheduler.run_parallel(vec![1u32], identity, Options::new());
    let queued = scheduler.run_parallel(vec![2u32], identity, Options::new());

    let shutdown = scheduler.shut_down();
    assert!(matches!(queued.wait(), Err(Error::ShutDown)));

    // Work that was already running completes.
    transport.run_all();
    assert_eq!(running.wait().unwrap(), vec![1]);

    let late = scheduler.run_parallel(vec![3u32], identity, Options::new());
    assert!(matches!(late.wait(), Err(Error::ShutDown)));

    shutdown.wait();
}

#[test]
fn shutdown_during_open_rejects_with_shutdown() {
    use crate::Options;

    let (scheduler, transport) = manual_scheduler(2, true);
    transport.refuse_open(true);
    let closing = scheduler.clone();
    transport.on_open(move || {
        let _ = closing.shut_down();
    });

    let handle = scheduler.run_parallel(vec![1u32, 2], identity, Options::new().with_threads(2));

    assert!(matches!(handle.wait(), Err(Error::ShutDown)));
    assert!(transport.submitted().is_empty());
    assert_eq!(scheduler.stats().busy, 0);
}

#[test]
fn simulated_mode_survives_a_panicking_sort() {
    use crate::{Options, Sort};

    let scheduler = crate::Scheduler::builder()
        .with_concurrency(false)
        .with_scheduling_quantum(Duration::from_millis(1))
        .build()
        .unwrap();

    let handle = scheduler.run_parallel(
        vec![3u32, 2, 1],
        identity,
        Options::new().with_sort(Sort::ascending_by_key(|x: &u32| {
            if *x == 2 {
                panic!("no twos");
            }
            *x
        })),
    );
    assert!(matches!(handle.wait(), Err(Error::Panicked { .. })));

    // The ticker is still running.
    let handle = scheduler.run_parallel(vec![4u32, 5], identity, Options::new().with_threads(2));
    assert_eq!(handle.wait().unwrap(), vec![4, 5]);
    assert_eq!(scheduler.live_tasks(), 0);

    scheduler.shut_down().wait();
}

#[test]
fn simulated_mode_runs_one_span_per_tick() {
    use crate::Options;

    let scheduler = crate::Scheduler::builder()
        .with_concurrency(false)
        .with_scheduling_quantum(Duration::from_millis(1))
        .build()
        .unwrap();

    let input: Vec<u32> = (0..20).collect();
    let handle = scheduler.run_parallel(
        input.clone(),
        |ctx: &crate::WorkerContext, items: &[u32]| -> Result<Vec<u32>, String> {
            assert_eq!(ctx.slot(), SIMULATED_SLOT);
            Ok(items.iter().map(|x| x * 2).collect())
        },
        Options::new().with_threads(4),
    );

    let expected: Vec<u32> = input.iter().map(|x| x * 2).collect();
    assert_eq!(handle.wait().unwrap(), expected);
    assert_eq!(scheduler.stats().max_workers, 1);

    scheduler.shut_down().wait();
}
