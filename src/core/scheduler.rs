use std::time::Duration;

use super::context::WorkerContext;
use super::job::TaskId;
use super::pool::PoolStats;
use super::shutdown::ShutdownHandle;
use super::sync::Arc;
use super::transport::{Transport, WorkerHooks};
use super::Shared;
use crate::diagnostics::LogBook;
use crate::error::BoxError;
use crate::handle::OwnedHandle;
use crate::options::Options;
use crate::task::ParallelTask;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SchedulerId(pub(crate) u32);

/// What the host can do, decided once when the scheduler is built.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Upper bound on the number of spans executing at the same time.
    pub max_workers: u32,
    /// Whether worker slots are kept around for reuse once they run out of work.
    pub persistent_workers: bool,
    /// Without concurrency, spans are executed one at a time on a ticker thread.
    pub supports_concurrency: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);

        Capabilities {
            max_workers,
            persistent_workers: true,
            supports_concurrency: true,
        }
    }
}

/// A reference to a scheduler.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder {
            capabilities: Capabilities::default(),
            quantum: Duration::from_millis(4),
            hooks: WorkerHooks::default(),
            transport: None,
            log_capacity: LogBook::DEFAULT_CAPACITY,
        }
    }

    /// Split `input` into `options.threads()` contiguous spans, run `function` on each
    /// of them in parallel and merge the results back in input order.
    ///
    /// The returned handle resolves once every span completed, or as soon as one of
    /// them fails. Spans that can't start right away because every worker is busy
    /// wait in a FIFO queue shared by all tasks.
    pub fn run_parallel<T, O, E, F>(
        &self,
        input: impl Into<Arc<[T]>>,
        function: F,
        options: Options<O>,
    ) -> OwnedHandle<Vec<O>>
    where
        T: Send + Sync + 'static,
        O: Send + 'static,
        E: Into<BoxError> + 'static,
        F: Fn(&WorkerContext, &[T]) -> Result<Vec<O>, E> + Send + Sync + 'static,
    {
        profiling::scope!("run_parallel");

        let shared = &self.shared;
        let id = shared.registry.next_id();

        if options.threads() == 0 {
            shared.diagnostics.warning(format!("{} requested zero threads, running a single span", id));
        }

        let task = ParallelTask::new(
            id,
            input.into(),
            function,
            options,
            Arc::clone(&shared.registry),
            Arc::clone(&shared.diagnostics),
        );
        let handle = task.handle();

        shared.registry.register(id);
        shared.strategy.schedule(task);

        handle
    }

    pub fn shut_down(&self) -> ShutdownHandle {
        self.shared.strategy.shut_down();

        ShutdownHandle { shared: Arc::clone(&self.shared) }
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.strategy.stats()
    }

    /// Number of tasks that were scheduled and haven't resolved yet.
    pub fn live_tasks(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_live(&self, task: TaskId) -> bool {
        self.shared.registry.contains(task)
    }

    pub fn diagnostics(&self) -> &LogBook {
        &self.shared.diagnostics
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shared.capabilities
    }

    pub fn id(&self) -> SchedulerId {
        self.shared.id
    }
}

pub struct SchedulerBuilder {
    pub(crate) capabilities: Capabilities,
    pub(crate) quantum: Duration,
    pub(crate) hooks: WorkerHooks,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) log_capacity: usize,
}

impl SchedulerBuilder {
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;

        self
    }

    pub fn with_max_workers(mut self, max_workers: u32) -> Self {
        self.capabilities.max_workers = max_workers.max(1);

        self
    }

    pub fn with_persistent_workers(mut self, persistent: bool) -> Self {
        self.capabilities.persistent_workers = persistent;

        self
    }

    pub fn with_concurrency(mut self, supported: bool) -> Self {
        self.capabilities.supports_concurrency = supported;

        self
    }

    /// How often the simulated worker runs a span when concurrency isn't supported.
    pub fn with_scheduling_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum;

        self
    }

    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.hooks.start = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.hooks.exit = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + Send + Sync + 'static
    {
        self.hooks.name = Box::new(handler);

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.hooks.stack_size = Some(size);

        self
    }

    /// Run spans somewhere other than on the default one-thread-per-slot transport.
    ///
    /// Thread names, stack size and start/exit handlers only apply to the default
    /// transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);

        self
    }

    /// Maximum number of entries kept by the diagnostics log book.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;

        self
    }

    pub fn build(self) -> Result<Scheduler, crate::Error> {
        crate::core::init(self)
    }
}

#[cfg(test)]
fn threaded_scheduler(max_workers: u32) -> Scheduler {
    Scheduler::builder()
        .with_max_workers(max_workers)
        .with_thread_names(|idx| format!("Test worker #{}", idx))
        .build()
        .unwrap()
}

#[test]
fn concurrency_is_bounded() {
    use std::sync::atomic::{AtomicU32, Ordering};

    for persistent in [true, false] {
        let scheduler = Scheduler::builder()
            .with_max_workers(3)
            .with_persistent_workers(persistent)
            .build()
            .unwrap();

        let running = std::sync::Arc::new(AtomicU32::new(0));
        let peak = std::sync::Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(scheduler.run_parallel(
                (0..64u32).collect::<Vec<_>>(),
                move |_ctx, items: &[u32]| -> Result<Vec<u32>, String> {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));
                    running.fetch_sub(1, Ordering::SeqCst);

                    Ok(items.iter().map(|x| x + 1).collect())
                },
                Options::new().with_threads(8),
            ));
        }

        let expected: Vec<u32> = (1..65).collect();
        for handle in handles {
            assert_eq!(handle.wait().unwrap(), expected);
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(scheduler.stats().busy, 0);
        assert_eq!(scheduler.stats().pending, 0);
        assert_eq!(scheduler.live_tasks(), 0);

        scheduler.shut_down().wait();
    }
}

#[test]
fn worker_context() {
    let scheduler = threaded_scheduler(2);

    let handle = scheduler.run_parallel(
        vec![10u64, 20, 30, 40, 50],
        |ctx: &WorkerContext, items: &[u64]| -> Result<Vec<(u32, u64)>, String> {
            assert!(std::thread::current().name().unwrap().starts_with("Test worker #"));
            assert_eq!(ctx.span().len(), items.len());
            assert_eq!(ctx.num_spans(), 2);
            Ok(items.iter().map(|x| (ctx.span_index(), *x)).collect())
        },
        Options::new().with_threads(2),
    );

    assert_eq!(
        handle.wait().unwrap(),
        vec![(0, 10), (0, 20), (0, 30), (1, 40), (1, 50)],
    );
}

#[test]
fn sort_by_key() {
    use crate::options::Sort;

    let scheduler = threaded_scheduler(4);

    let words: Vec<String> = ["pear", "fig", "banana", "kiwi", "apple"]
        .iter()
        .map(|w| w.to_string())
        .collect();

    let handle = scheduler.run_parallel(
        words,
        |_ctx: &WorkerContext, items: &[String]| -> Result<Vec<String>, String> {
            Ok(items.iter().map(|w| w.to_uppercase()).collect())
        },
        Options::new()
            .with_threads(3)
            .with_sort(Sort::ascending_by_key(|w: &String| w.len())),
    );

    let sorted = handle.wait().unwrap();
    let lengths: Vec<usize> = sorted.iter().map(|w| w.len()).collect();
    assert_eq!(lengths, vec![3, 4, 4, 5, 6]);
    assert_eq!(sorted[0], "FIG");
}

#[test]
fn panicking_sort_key_rejects_and_frees_the_worker() {
    use crate::options::Sort;
    use crate::Error;

    let scheduler = Scheduler::builder()
        .with_max_workers(1)
        .with_persistent_workers(true)
        .build()
        .unwrap();

    let handle = scheduler.run_parallel(
        vec![3u32, 2, 1],
        |_ctx: &WorkerContext, items: &[u32]| -> Result<Vec<u32>, String> { Ok(items.to_vec()) },
        Options::new().with_sort(Sort::ascending_by_key(|x: &u32| {
            if *x == 2 {
                panic!("no twos");
            }
            *x
        })),
    );

    match handle.wait() {
        Err(Error::Panicked { message, .. }) => assert!(message.contains("no twos")),
        other => panic!("unexpected result {:?}", other),
    }

    // The only worker is still there to run the next task.
    let handle = scheduler.run_parallel(
        vec![1u32, 2, 3],
        |_ctx: &WorkerContext, items: &[u32]| -> Result<Vec<u32>, String> {
            Ok(items.iter().map(|x| x * 10).collect())
        },
        Options::new().with_threads(3),
    );
    assert_eq!(handle.wait().unwrap(), vec![10, 20, 30]);
    assert_eq!(scheduler.live_tasks(), 0);
    assert_eq!(scheduler.stats().busy, 0);

    scheduler.shut_down().wait();
}

#[test]
fn failures_reach_the_handle() {
    use crate::Error;

    let scheduler = threaded_scheduler(2);

    let handle = scheduler.run_parallel(
        (0..10u32).collect::<Vec<_>>(),
        |_ctx: &WorkerContext, items: &[u32]| -> Result<Vec<u32>, std::io::Error> {
            if items.contains(&7) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "seven"));
            }
            Ok(items.to_vec())
        },
        Options::new().with_threads(5),
    );

    let error = handle.wait().unwrap_err();
    assert_eq!(error.span(), Some(3));
    assert!(matches!(error, Error::WorkerExecution { .. }));
    assert!(!scheduler.diagnostics().search("rejected", Some(crate::diagnostics::Level::Error)).results.is_empty());
}

#[test]
fn zero_threads_runs_a_single_span() {
    let scheduler = threaded_scheduler(2);

    let handle = scheduler.run_parallel(
        vec![1u8, 2, 3],
        |ctx: &WorkerContext, items: &[u8]| -> Result<Vec<u8>, String> {
            assert_eq!(ctx.num_spans(), 1);
            Ok(items.to_vec())
        },
        Options::new().with_threads(0),
    );

    assert_eq!(handle.wait().unwrap(), vec![1, 2, 3]);
    assert_eq!(scheduler.diagnostics().search("zero threads", None).total, 1);
}

#[test]
fn await_the_handle() {
    let scheduler = threaded_scheduler(2);

    let handle = scheduler.run_parallel(
        vec![1.5f64, 2.5, 3.5, 4.5],
        |_ctx: &WorkerContext, items: &[f64]| -> Result<Vec<f64>, String> {
            Ok(vec![items.iter().sum()])
        },
        Options::new().with_threads(2).with_aggregate(true),
    );

    let sums = futures::executor::block_on(handle).unwrap();
    assert_eq!(sums, vec![4.0, 8.0]);
}
