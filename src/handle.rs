//! Handles are references to ongoing work.
//!
//! A task resolves its `Completion` exactly once, from whichever worker finishes or
//! fails it. The caller holds an `OwnedHandle` on the same completion and can poll
//! it, block on it, or `.await` it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crossbeam_utils::Backoff;

use crate::core::job::TaskId;
use crate::error::Error;
use crate::sync::{lock, wait, Arc, AtomicBool, Condvar, Mutex, Ordering};

struct CompletionState<T> {
    result: Option<Result<T, Error>>,
    waker: Option<Waker>,
}

/// A write-once cell for the outcome of a task.
pub(crate) struct Completion<T> {
    // Set after the result is stored, so that readers can skip the lock while the
    // work is still going on.
    ready: AtomicBool,
    state: Mutex<CompletionState<T>>,
    cond: Condvar,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Completion {
            ready: AtomicBool::new(false),
            state: Mutex::new(CompletionState { result: None, waker: None }),
            cond: Condvar::new(),
        }
    }

    /// Store the outcome and wake up whoever is waiting.
    ///
    /// Returns false without touching the stored outcome if the completion was
    /// already resolved.
    pub fn resolve(&self, result: Result<T, Error>) -> bool {
        let waker = {
            let mut state = lock(&self.state);
            if self.ready.load(Ordering::Acquire) {
                return false;
            }

            state.result = Some(result);
            self.ready.store(true, Ordering::Release);
            self.cond.notify_all();

            state.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }

        true
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn wait(&self) {
        profiling::scope!("wait");

        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.is_ready() {
                return;
            }

            backoff.snooze();

            #[cfg(loom)]
            loom::thread::yield_now();
        }

        // Slower path: using the condition variable.
        profiling::scope!("wait(condvar)");
        let mut state = lock(&self.state);
        while !self.ready.load(Ordering::Acquire) {
            state = wait(&self.cond, state);
        }
    }

    fn take(&self) -> Option<Result<T, Error>> {
        lock(&self.state).result.take()
    }
}

/// A non-clonable handle which owns the result of a task.
pub struct OwnedHandle<Output> {
    task: TaskId,
    completion: Arc<Completion<Output>>,
}

impl<Output> OwnedHandle<Output> {
    pub(crate) fn new(task: TaskId, completion: Arc<Completion<Output>>) -> Self {
        OwnedHandle { task, completion }
    }

    pub fn task_id(&self) -> TaskId { self.task }

    /// Whether the task was fulfilled or rejected.
    pub fn poll(&self) -> bool {
        self.completion.is_ready()
    }

    /// Block the current thread until the task resolves.
    pub fn wait(self) -> Result<Output, Error> {
        self.completion.wait();
        self.take_result()
    }

    /// Get the outcome if the task already resolved, or the handle back.
    pub fn try_resolve(self) -> Result<Result<Output, Error>, Self> {
        if !self.poll() {
            return Err(self);
        }

        Ok(self.take_result())
    }

    fn take_result(&self) -> Result<Output, Error> {
        match self.completion.take() {
            Some(result) => result,
            None => panic!("the outcome of {} was already taken", self.task),
        }
    }
}

impl<Output> Future for OwnedHandle<Output> {
    type Output = Result<Output, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.completion.state);
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }

        assert!(
            !self.completion.is_ready(),
            "{} polled after completion", self.task,
        );

        state.waker = Some(cx.waker().clone());

        Poll::Pending
    }
}

impl<Output> std::fmt::Debug for OwnedHandle<Output> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("task", &self.task)
            .field("ready", &self.poll())
            .finish()
    }
}

#[test]
fn completion_resolves_once() {
    let completion: Arc<Completion<u32>> = Arc::new(Completion::new());
    let handle = OwnedHandle::new(TaskId(1), completion.clone());
    assert!(!handle.poll());

    let handle = match handle.try_resolve() {
        Err(handle) => handle,
        Ok(_) => panic!("resolved too early"),
    };

    assert!(completion.resolve(Ok(7)));
    assert!(!completion.resolve(Err(Error::ShutDown)));
    assert!(handle.poll());
    assert_eq!(handle.wait().unwrap(), 7);
}

#[test]
fn wait_across_threads() {
    let completion: Arc<Completion<String>> = Arc::new(Completion::new());
    let handle = OwnedHandle::new(TaskId(2), completion.clone());

    let resolver = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        completion.resolve(Ok("done".to_string()));
    });

    assert_eq!(handle.wait().unwrap(), "done");
    resolver.join().unwrap();
}

#[test]
fn handle_is_a_future() {
    let completion: Arc<Completion<u32>> = Arc::new(Completion::new());
    let handle = OwnedHandle::new(TaskId(3), completion.clone());

    let resolver = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(10));
        completion.resolve(Err(Error::ShutDown));
    });

    let result = futures::executor::block_on(handle);
    assert!(matches!(result, Err(Error::ShutDown)));
    resolver.join().unwrap();
}
