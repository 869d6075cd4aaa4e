//! Test doubles for the scheduler's seams.

use std::collections::VecDeque;

use super::context::WorkerContext;
use super::job::{JobRef, Payload, SlotId, TaskId, TaskJob};
use super::transport::Transport;
use crate::error::{Error, TransportError};
use crate::partition::Span;
use crate::sync::{lock, Arc, AtomicBool, Mutex, Ordering};

/// A task that does nothing but remember whether it was resolved.
pub(crate) struct StubTask {
    id: TaskId,
    num_spans: u32,
    resolved: AtomicBool,
    panic_on_merge: AtomicBool,
}

impl StubTask {
    pub fn new(id: u64, num_spans: u32) -> Arc<Self> {
        Arc::new(StubTask {
            id: TaskId(id),
            num_spans,
            resolved: AtomicBool::new(false),
            panic_on_merge: AtomicBool::new(false),
        })
    }

    pub fn panic_on_merge(&self) {
        self.panic_on_merge.store(true, Ordering::SeqCst);
    }

    pub fn resolve(&self) {
        self.resolved.store(true, Ordering::SeqCst);
    }
}

impl TaskJob for StubTask {
    fn id(&self) -> TaskId { self.id }
    fn num_spans(&self) -> u32 { self.num_spans }
    fn span(&self, index: u32) -> Span { Span::new(index as usize, index as usize + 1) }
    fn is_resolved(&self) -> bool { self.resolved.load(Ordering::SeqCst) }
    fn mark_dispatched(&self, _slot: SlotId, _span_index: u32) {}
    fn execute(&self, _ctx: &WorkerContext) -> Result<Payload, Error> { Ok(Box::new(())) }
    fn merge(&self, _slot: SlotId, span_index: u32, _payload: Payload) {
        if self.panic_on_merge.load(Ordering::SeqCst) {
            panic!("{} can't merge span #{}", self.id, span_index);
        }
    }
    fn fail(&self, _slot: SlotId, _span_index: u32, _error: Error) { self.resolve(); }
    fn reject(&self, _error: Error) { self.resolve(); }
}

/// A transport that holds on to submitted jobs until the test runs them, so that
/// completion order is fully under the test's control.
pub(crate) struct ManualTransport {
    jobs: Mutex<VecDeque<JobRef>>,
    opened: Mutex<Vec<SlotId>>,
    closed: Mutex<Vec<SlotId>>,
    refuse_open: AtomicBool,
    on_open: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualTransport {
            jobs: Mutex::new(VecDeque::new()),
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            refuse_open: AtomicBool::new(false),
            on_open: Mutex::new(None),
        })
    }

    /// Called at the start of every `open`, before it decides to refuse.
    pub fn on_open(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.on_open) = Some(Arc::new(hook));
    }

    pub fn refuse_open(&self, refuse: bool) {
        self.refuse_open.store(refuse, Ordering::SeqCst);
    }

    /// `(task, span, slot)` of the submitted jobs, in submission order.
    pub fn submitted(&self) -> Vec<(u64, u32, SlotId)> {
        lock(&self.jobs)
            .iter()
            .map(|job| (job.task_id().get(), job.span_index(), job.slot()))
            .collect()
    }

    /// Removes a submitted job. The lock is released before the caller runs it,
    /// since running a job can submit another one.
    pub fn take(&self, task: u64, span: u32) -> JobRef {
        let mut jobs = lock(&self.jobs);
        let index = jobs
            .iter()
            .position(|job| job.task_id().get() == task && job.span_index() == span)
            .unwrap_or_else(|| panic!("no job submitted for task#{} span #{}", task, span));

        jobs.remove(index).unwrap()
    }

    /// Runs the oldest submitted job. Returns false if there was none.
    pub fn run_next(&self) -> bool {
        let job = lock(&self.jobs).pop_front();
        match job {
            Some(job) => {
                job.run();
                true
            }
            None => false,
        }
    }

    pub fn run_all(&self) {
        while self.run_next() {}
    }

    pub fn opened(&self) -> Vec<SlotId> { lock(&self.opened).clone() }

    pub fn closed(&self) -> Vec<SlotId> { lock(&self.closed).clone() }
}

impl Transport for ManualTransport {
    fn open(&self, slot: SlotId) -> Result<(), TransportError> {
        let hook = lock(&self.on_open).clone();
        if let Some(hook) = hook {
            hook();
        }

        if self.refuse_open.load(Ordering::SeqCst) {
            return Err(TransportError::new("refused"));
        }

        lock(&self.opened).push(slot);

        Ok(())
    }

    fn submit(&self, job: JobRef) {
        lock(&self.jobs).push_back(job);
    }

    fn close(&self, slot: SlotId) {
        lock(&self.closed).push(slot);
    }
}
