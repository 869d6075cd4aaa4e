/// Shutdown
///
/// Shutting down stops admission first: pending spans are dropped and their tasks
/// rejected. Spans that are already running finish normally. Then every worker gets
/// a stop message behind whatever it still has to run, and we have a simple
/// mutex/condvar pair tracking the number of live worker threads that we can wait on.

use crate::sync::{lock, wait, Ordering, AtomicBool, Mutex, Condvar, Arc};

use crate::core::Shared;

pub(crate) struct Shutdown {
    is_shutting_down: AtomicBool,
    live_workers: Mutex<u32>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
            live_workers: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn begin(&self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn worker_started(&self) {
        *lock(&self.live_workers) += 1;
    }

    pub fn worker_has_shut_down(&self) {
        let mut live_workers = lock(&self.live_workers);
        debug_assert!(*live_workers > 0);
        *live_workers -= 1;
        if *live_workers == 0 {
            self.cond.notify_all();
        }
    }

    #[cfg(test)]
    pub fn live_workers(&self) -> u32 {
        *lock(&self.live_workers)
    }

    pub fn wait_shutdown(&self) {
        let mut live_workers = lock(&self.live_workers);
        while *live_workers > 0 {
            live_workers = wait(&self.cond, live_workers);
        }
    }
}

pub struct ShutdownHandle {
    pub(crate) shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Block until every worker thread has exited.
    pub fn wait(self) {
        self.shared.strategy.wait_shutdown();
    }
}

#[test]
fn test_shutdown() {
    use std::sync::Barrier;
    use std::sync::atomic::AtomicU32;
    use crate::{Options, Scheduler};

    for _ in 0..10 {
        for num_workers in 1..9 {
            let started = Arc::new(AtomicU32::new(0));
            let exited = Arc::new(AtomicU32::new(0));

            let s = started.clone();
            let e = exited.clone();
            let scheduler = Scheduler::builder()
                .with_max_workers(num_workers)
                .with_persistent_workers(true)
                .with_start_handler(move |_id| { s.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(move |_id| { e.fetch_add(1, Ordering::SeqCst); })
                .build()
                .unwrap();

            // Every span waits for all the others, so each one needs its own worker.
            let barrier = Arc::new(Barrier::new(num_workers as usize));
            let input: Vec<u32> = (0..num_workers).collect();
            let handle = scheduler.run_parallel(
                input,
                move |_ctx, items: &[u32]| -> Result<Vec<u32>, String> {
                    barrier.wait();
                    Ok(items.to_vec())
                },
                Options::new().with_threads(num_workers as usize),
            );
            assert_eq!(handle.wait().unwrap().len(), num_workers as usize);

            scheduler.shut_down().wait();

            assert_eq!(started.load(Ordering::SeqCst), num_workers);
            assert_eq!(exited.load(Ordering::SeqCst), num_workers);
        }
    }
}
