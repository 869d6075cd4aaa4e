//! One call to `run_parallel`: its input, its spans, and the output being merged.
//!
//! Workers report into the task in any order. Each result lands at its span's place
//! in the merge buffer and the task resolves once every span was dispatched and none
//! is still in flight. A failure rejects the task right away; whatever arrives after
//! that is dropped and recorded as a warning.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::context::WorkerContext;
use crate::core::job::{Payload, SlotId, TaskId, TaskJob};
use crate::core::Registry;
use crate::diagnostics::LogBook;
use crate::error::{BoxError, Error, TransportError};
use crate::handle::{Completion, OwnedHandle};
use crate::options::{Options, Sort};
use crate::partition::{partition, Span};
use crate::sync::{lock, Arc, Mutex};

enum MergeBuffer<O> {
    /// Pre-sized output, one entry per input item.
    Elements(Vec<Option<O>>),
    /// One entry per span, concatenated in span order at the end.
    Aggregated(Vec<Option<Vec<O>>>),
}

impl<O> MergeBuffer<O> {
    fn write(&mut self, span_index: u32, span: Span, items: Vec<O>) {
        match self {
            MergeBuffer::Elements(elements) => {
                for (slot, item) in elements[span.range()].iter_mut().zip(items) {
                    debug_assert!(slot.is_none());
                    *slot = Some(item);
                }
            }
            MergeBuffer::Aggregated(spans) => {
                debug_assert!(spans[span_index as usize].is_none());
                spans[span_index as usize] = Some(items);
            }
        }
    }

    fn into_output(self) -> Vec<O> {
        match self {
            MergeBuffer::Elements(elements) => elements.into_iter().flatten().collect(),
            MergeBuffer::Aggregated(spans) => spans.into_iter().flatten().flatten().collect(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Resolution {
    Pending,
    Fulfilled,
    Rejected,
}

struct TaskState<O> {
    dispatched: u32,
    completed: u32,
    // Spans bound to a slot whose result hasn't been reported yet.
    active: Vec<(SlotId, u32)>,
    output: Option<MergeBuffer<O>>,
    resolution: Resolution,
    created_at: Instant,
    completed_at: Option<Instant>,
}

impl<O> TaskState<O> {
    fn deactivate(&mut self, slot: SlotId, span_index: u32) {
        if let Some(idx) = self.active.iter().position(|entry| *entry == (slot, span_index)) {
            self.active.swap_remove(idx);
        }
    }

    /// Stamp the resolution and return the task's latency.
    fn settle(&mut self, resolution: Resolution) -> Duration {
        let now = Instant::now();
        self.resolution = resolution;
        self.completed_at = Some(now);

        self.latency()
    }

    fn latency(&self) -> Duration {
        self.completed_at.map_or(Duration::ZERO, |at| at - self.created_at)
    }
}

pub(crate) struct ParallelTask<T, O, E, F> {
    id: TaskId,
    input: Arc<[T]>,
    spans: Vec<Span>,
    function: F,
    aggregate: bool,
    sort: Sort<O>,
    state: Mutex<TaskState<O>>,
    completion: Arc<Completion<Vec<O>>>,
    registry: Arc<Registry>,
    diagnostics: Arc<LogBook>,
    _error: PhantomData<fn() -> E>,
}

impl<T, O, E, F> ParallelTask<T, O, E, F>
where
    T: Send + Sync + 'static,
    O: Send + 'static,
    E: Into<BoxError> + 'static,
    F: Fn(&WorkerContext, &[T]) -> Result<Vec<O>, E> + Send + Sync + 'static,
{
    pub fn new(
        id: TaskId,
        input: Arc<[T]>,
        function: F,
        options: Options<O>,
        registry: Arc<Registry>,
        diagnostics: Arc<LogBook>,
    ) -> Arc<Self> {
        let spans = partition(input.len(), options.threads());
        let output = if options.aggregate() {
            MergeBuffer::Aggregated((0..spans.len()).map(|_| None).collect())
        } else {
            MergeBuffer::Elements((0..input.len()).map(|_| None).collect())
        };

        Arc::new(ParallelTask {
            id,
            input,
            spans,
            function,
            aggregate: options.aggregate(),
            sort: options.sort().clone(),
            state: Mutex::new(TaskState {
                dispatched: 0,
                completed: 0,
                active: Vec::new(),
                output: Some(output),
                resolution: Resolution::Pending,
                created_at: Instant::now(),
                completed_at: None,
            }),
            completion: Arc::new(Completion::new()),
            registry,
            diagnostics,
            _error: PhantomData,
        })
    }

    pub fn handle(&self) -> OwnedHandle<Vec<O>> {
        OwnedHandle::new(self.id, Arc::clone(&self.completion))
    }

    fn resolve(&self, result: Result<Vec<O>, Error>) {
        self.registry.unregister(self.id);
        self.completion.resolve(result);
    }

    fn reject_with(&self, error: Error) {
        let latency = {
            let mut state = lock(&self.state);
            if state.resolution != Resolution::Pending {
                return;
            }

            state.output = None;

            state.settle(Resolution::Rejected)
        };

        debug!(task = %self.id, latency_us = latency.as_micros() as u64, "task rejected");
        self.diagnostics.error(format!("{} rejected: {}", self.id, error));
        self.resolve(Err(error));
    }
}

impl<T, O, E, F> TaskJob for ParallelTask<T, O, E, F>
where
    T: Send + Sync + 'static,
    O: Send + 'static,
    E: Into<BoxError> + 'static,
    F: Fn(&WorkerContext, &[T]) -> Result<Vec<O>, E> + Send + Sync + 'static,
{
    fn id(&self) -> TaskId { self.id }

    fn num_spans(&self) -> u32 { self.spans.len() as u32 }

    fn span(&self, index: u32) -> Span { self.spans[index as usize] }

    fn is_resolved(&self) -> bool {
        lock(&self.state).resolution != Resolution::Pending
    }

    fn mark_dispatched(&self, slot: SlotId, span_index: u32) {
        let mut state = lock(&self.state);
        state.dispatched += 1;
        state.active.push((slot, span_index));

        debug_assert!(state.dispatched <= self.spans.len() as u32);
    }

    fn execute(&self, ctx: &WorkerContext) -> Result<Payload, Error> {
        profiling::scope!("unit of work");

        let span_index = ctx.span_index();
        let span = ctx.span();
        let items = &self.input[span.range()];

        let output = match panic::catch_unwind(AssertUnwindSafe(|| (self.function)(ctx, items))) {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                return Err(Error::WorkerExecution { span: span_index, source: error.into() });
            }
            Err(panic) => {
                return Err(Error::Panicked { span: span_index, message: panic_message(&*panic) });
            }
        };

        if !self.aggregate && output.len() != span.len() {
            return Err(Error::OutputMismatch {
                span: span_index,
                expected: span.len(),
                actual: output.len(),
            });
        }

        Ok(Box::new(output))
    }

    fn merge(&self, slot: SlotId, span_index: u32, payload: Payload) {
        profiling::scope!("merge");

        let items = match payload.downcast::<Vec<O>>() {
            Ok(items) => *items,
            Err(_) => {
                let error = TransportError::new("the worker reported an output of the wrong type");
                self.fail(slot, span_index, Error::Transport { span: span_index, source: error });
                return;
            }
        };

        let (output, latency) = {
            let mut state = lock(&self.state);
            state.deactivate(slot, span_index);

            if state.resolution != Resolution::Pending {
                drop(state);
                self.diagnostics.warning(format!(
                    "{} already resolved, discarding the result of span #{}",
                    self.id, span_index,
                ));
                return;
            }

            let span = self.spans[span_index as usize];
            if let Some(buffer) = &mut state.output {
                buffer.write(span_index, span, items);
            }
            state.completed += 1;

            let total = self.spans.len() as u32;
            if state.dispatched < total || !state.active.is_empty() {
                return;
            }

            debug_assert_eq!(state.completed, total);

            let latency = state.settle(Resolution::Fulfilled);

            (state.output.take(), latency)
        };

        // Sort keys and comparisons are user code too.
        let output = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut output = output.map(MergeBuffer::into_output).unwrap_or_default();
            self.sort.apply(&mut output);
            output
        }));

        let output = match output {
            Ok(output) => output,
            Err(panic) => {
                lock(&self.state).resolution = Resolution::Rejected;

                let error = Error::Panicked {
                    span: span_index,
                    message: format!("while sorting the output: {}", panic_message(&*panic)),
                };
                self.diagnostics.error(format!("{} rejected: {}", self.id, error));
                self.resolve(Err(error));
                return;
            }
        };

        debug!(
            task = %self.id,
            spans = self.spans.len(),
            items = output.len(),
            latency_us = latency.as_micros() as u64,
            "task fulfilled",
        );

        self.resolve(Ok(output));
    }

    fn fail(&self, slot: SlotId, span_index: u32, error: Error) {
        let already_resolved = {
            let mut state = lock(&self.state);
            state.deactivate(slot, span_index);
            state.resolution != Resolution::Pending
        };

        if already_resolved {
            self.diagnostics.warning(format!(
                "{} already resolved, discarding the failure of span #{}: {}",
                self.id, span_index, error,
            ));
            return;
        }

        self.reject_with(error);
    }

    fn reject(&self, error: Error) {
        self.reject_with(error);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }

    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }

    "unknown panic payload".to_string()
}

#[cfg(test)]
fn test_task<F>(input: Vec<u32>, function: F, options: Options<u32>) -> Arc<ParallelTask<u32, u32, String, F>>
where
    F: Fn(&WorkerContext, &[u32]) -> Result<Vec<u32>, String> + Send + Sync + 'static,
{
    let registry = Arc::new(Registry::new());
    let id = registry.next_id();
    registry.register(id);

    ParallelTask::new(id, input.into(), function, options, registry, Arc::new(LogBook::default()))
}

#[cfg(test)]
fn run_span<T: TaskJob>(task: &T, span_index: u32) {
    let slot = SlotId(span_index);
    task.mark_dispatched(slot, span_index);

    let ctx = WorkerContext::new(slot, task.id(), span_index, task.span(span_index), task.num_spans());
    match task.execute(&ctx) {
        Ok(payload) => task.merge(slot, span_index, payload),
        Err(error) => task.fail(slot, span_index, error),
    }
}

#[test]
fn aggregate_and_sort() {
    let sum = |_ctx: &WorkerContext, items: &[u32]| -> Result<Vec<u32>, String> {
        Ok(vec![items.iter().sum()])
    };

    let task = test_task(
        (1..=10).collect(),
        sum,
        Options::new().with_threads(3).with_aggregate(true).with_sort(Sort::descending()),
    );
    let handle = task.handle();

    assert_eq!(task.num_spans(), 3);
    for span in [2, 0, 1] {
        run_span(&*task, span);
    }

    // Spans are [1..=4], [5..=7], [8..=10].
    assert_eq!(handle.wait().unwrap(), vec![27, 18, 10]);
    assert_eq!(task.registry.len(), 0);
}

#[test]
fn output_length_is_checked() {
    let task = test_task(
        vec![1, 2, 3, 4],
        |_ctx: &WorkerContext, items: &[u32]| -> Result<Vec<u32>, String> { Ok(items[1..].to_vec()) },
        Options::new().with_threads(2),
    );
    let handle = task.handle();

    run_span(&*task, 0);
    match handle.wait() {
        Err(Error::OutputMismatch { span, expected, actual }) => {
            assert_eq!((span, expected, actual), (0, 2, 1));
        }
        other => panic!("unexpected result {:?}", other),
    }

    // The second span arrives late and is dropped.
    run_span(&*task, 1);
    assert_eq!(task.diagnostics.search("already resolved", None).total, 1);
    assert_eq!(task.diagnostics.search("rejected", None).total, 1);
}

#[test]
fn panics_are_reported() {
    let task = test_task(
        vec![1, 2, 3],
        |_ctx: &WorkerContext, items: &[u32]| -> Result<Vec<u32>, String> {
            if items.contains(&2) {
                panic!("two is not allowed");
            }
            Ok(items.to_vec())
        },
        Options::new().with_threads(3),
    );
    let handle = task.handle();

    for span in 0..3 {
        run_span(&*task, span);
    }

    match handle.wait() {
        Err(Error::Panicked { span, message }) => {
            assert_eq!(span, 1);
            assert_eq!(message, "two is not allowed");
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn sort_panics_reject_the_task() {
    let task = test_task(
        vec![3, 2, 1],
        |_ctx: &WorkerContext, items: &[u32]| -> Result<Vec<u32>, String> { Ok(items.to_vec()) },
        Options::new().with_sort(Sort::ascending_by_key(|x: &u32| {
            if *x == 2 {
                panic!("no twos");
            }
            *x
        })),
    );
    let handle = task.handle();

    run_span(&*task, 0);

    match handle.wait() {
        Err(Error::Panicked { span, message }) => {
            assert_eq!(span, 0);
            assert!(message.contains("no twos"));
        }
        other => panic!("unexpected result {:?}", other),
    }

    assert!(task.is_resolved());
    assert_eq!(task.registry.len(), 0);
    assert!(lock(&task.state).completed_at.is_some());
}

#[test]
fn empty_input_resolves_to_empty_output() {
    let task = test_task(
        Vec::new(),
        |_ctx: &WorkerContext, items: &[u32]| -> Result<Vec<u32>, String> { Ok(items.to_vec()) },
        Options::new().with_threads(8),
    );
    let handle = task.handle();

    assert_eq!(task.num_spans(), 1);
    run_span(&*task, 0);
    assert_eq!(handle.wait().unwrap(), Vec::<u32>::new());
}
