//! Execution contexts.
//!
//! A transport turns slot bookkeeping into actual execution: opening a slot gives it
//! an execution context, submitting a job delivers it there, closing a slot tears the
//! context down. The pool never talks to threads directly.

use std::panic::{self, AssertUnwindSafe};

use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::sync::{Parker, Unparker};
use tracing::error;

use super::job::{JobRef, SlotId};
use super::shutdown::Shutdown;
use super::WorkerHook;
use crate::error::TransportError;
use crate::sync::{lock, thread, Arc, Mutex};

/// Delivers jobs to the execution context of their slot.
///
/// Every submitted `JobRef` must eventually be run, failed or dropped. Dropping it
/// reports a transport error to its task.
pub trait Transport: Send + Sync {
    /// Create the execution context of a slot.
    fn open(&self, slot: SlotId) -> Result<(), TransportError>;

    /// Deliver a job to the execution context of `job.slot()`.
    fn submit(&self, job: JobRef);

    /// Tear the execution context of a slot down once it has nothing left to run.
    fn close(&self, slot: SlotId);

    /// Ask every execution context to stop after the jobs it already received.
    fn shut_down(&self) {}

    /// Block until every execution context has stopped.
    fn wait_shutdown(&self) {}
}

pub(crate) struct WorkerHooks {
    pub start: Option<Box<dyn WorkerHook>>,
    pub exit: Option<Box<dyn WorkerHook>>,
    pub name: Box<dyn Fn(u32) -> String + Send + Sync>,
    pub stack_size: Option<usize>,
}

impl Default for WorkerHooks {
    fn default() -> Self {
        WorkerHooks {
            start: None,
            exit: None,
            name: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }
}

enum Message {
    Run(JobRef),
    Stop,
}

struct Mailbox {
    messages: Injector<Message>,
    unparker: Unparker,
}

impl Mailbox {
    fn post(&self, message: Message) {
        self.messages.push(message);
        self.unparker.unpark();
    }
}

/// One dedicated thread per open slot.
pub(crate) struct ThreadTransport {
    // Indexed by slot. Mailboxes are never dropped while this lock is held: dropping
    // the last reference to one drops the jobs it still holds, which report back
    // into the pool and may call `submit` or `close`.
    mailboxes: Mutex<Vec<Option<Arc<Mailbox>>>>,
    hooks: Arc<WorkerHooks>,
    shutdown: Arc<Shutdown>,
}

impl ThreadTransport {
    pub(crate) fn new(hooks: WorkerHooks) -> Self {
        ThreadTransport {
            mailboxes: Mutex::new(Vec::new()),
            hooks: Arc::new(hooks),
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    /// Number of worker threads that have not exited yet.
    #[cfg(test)]
    pub fn live_workers(&self) -> u32 {
        self.shutdown.live_workers()
    }
}

impl Transport for ThreadTransport {
    fn open(&self, slot: SlotId) -> Result<(), TransportError> {
        let parker = Parker::new();
        let mailbox = Arc::new(Mailbox {
            messages: Injector::new(),
            unparker: parker.unparker().clone(),
        });

        let worker = Worker {
            slot,
            mailbox: Arc::clone(&mailbox),
            parker,
            hooks: Arc::clone(&self.hooks),
            shutdown: Arc::clone(&self.shutdown),
        };

        let mut builder = thread::Builder::new().name((self.hooks.name)(slot.0));
        if let Some(stack_size) = self.hooks.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let previous = {
            let mut mailboxes = lock(&self.mailboxes);
            // Checked under the lock so that a slot can't be opened behind the back
            // of `shut_down`.
            if self.shutdown.is_shutting_down() {
                return Err(TransportError::new("the transport is shut down"));
            }

            self.shutdown.worker_started();
            if let Err(error) = builder.spawn(move || {
                profiling::register_thread!("Worker");

                worker.run();
            }) {
                self.shutdown.worker_has_shut_down();
                return Err(TransportError::new(format!("failed to spawn a worker thread: {}", error)));
            }

            if mailboxes.len() <= slot.index() {
                mailboxes.resize_with(slot.index() + 1, || None);
            }

            mailboxes[slot.index()].replace(mailbox)
        };

        if let Some(previous) = previous {
            debug_assert!(false, "slot {:?} was opened twice", slot);
            previous.post(Message::Stop);
        }

        Ok(())
    }

    fn submit(&self, job: JobRef) {
        let mailbox = lock(&self.mailboxes).get(job.slot().index()).cloned().flatten();

        match mailbox {
            Some(mailbox) => mailbox.post(Message::Run(job)),
            None => {
                let error = TransportError::new(format!("slot {} has no worker", job.slot().index()));
                job.fail(error);
            }
        }
    }

    fn close(&self, slot: SlotId) {
        let mailbox = lock(&self.mailboxes).get_mut(slot.index()).and_then(Option::take);

        if let Some(mailbox) = mailbox {
            mailbox.post(Message::Stop);
        }
    }

    fn shut_down(&self) {
        let mailboxes: Vec<Arc<Mailbox>> = {
            let mut mailboxes = lock(&self.mailboxes);
            self.shutdown.begin();
            mailboxes.drain(..).flatten().collect()
        };

        for mailbox in &mailboxes {
            mailbox.post(Message::Stop);
        }
    }

    fn wait_shutdown(&self) {
        self.shutdown.wait_shutdown();
    }
}

struct Worker {
    slot: SlotId,
    mailbox: Arc<Mailbox>,
    parker: Parker,
    hooks: Arc<WorkerHooks>,
    shutdown: Arc<Shutdown>,
}

impl Worker {
    fn run(self) {
        let Worker { slot, mailbox, parker, hooks, shutdown } = self;
        // Counts the worker out even if a hook unwinds the thread.
        let _live = LiveWorker(shutdown);

        if let Some(handler) = &hooks.start {
            handler.run(slot.0);
        }

        loop {
            match mailbox.messages.steal() {
                Steal::Success(Message::Run(job)) => run_job(slot, job),
                Steal::Success(Message::Stop) => break,
                Steal::Retry => continue,
                // Nothing to do until the next post.
                Steal::Empty => parker.park(),
            }
        }

        if let Some(handler) = &hooks.exit {
            handler.run(slot.0);
        }

        // Jobs posted after the stop message report a transport error as they drop.
        drop(mailbox);
    }
}

/// Run a job, keeping the worker alive if reporting its result unwinds.
///
/// The unit of work itself never unwinds out of `JobRef::run`, and the slot is
/// already released by the time the task merges.
pub(crate) fn run_job(slot: SlotId, job: JobRef) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || job.run())) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        error!(slot = slot.index(), %message, "a job panicked while reporting its result");
    }
}

struct LiveWorker(Arc<Shutdown>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.worker_has_shut_down();
    }
}

#[test]
fn thread_transport_runs_and_stops() {
    use crate::core::job::{SlotRelease, TaskJob};
    use crate::core::testing::StubTask;
    use crate::sync::{AtomicU32, Ordering};
    use std::sync::mpsc;

    struct Releases(AtomicU32, Mutex<mpsc::Sender<SlotId>>);
    impl SlotRelease for Releases {
        fn release(self: Arc<Self>, slot: SlotId) {
            self.0.fetch_add(1, Ordering::SeqCst);
            let _ = lock(&self.1).send(slot);
        }
    }

    let started = Arc::new(AtomicU32::new(0));
    let s = started.clone();
    let transport = ThreadTransport::new(WorkerHooks {
        start: Some(Box::new(move |_id: u32| { s.fetch_add(1, Ordering::SeqCst); })),
        ..WorkerHooks::default()
    });

    let (tx, rx) = mpsc::channel();
    let owner = Arc::new(Releases(AtomicU32::new(0), Mutex::new(tx)));
    let task = StubTask::new(1, 2);

    transport.open(SlotId(0)).unwrap();
    transport.open(SlotId(1)).unwrap();
    transport.submit(JobRef::new(SlotId(0), 0, task.clone(), owner.clone()));
    transport.submit(JobRef::new(SlotId(1), 1, task.clone(), owner.clone()));

    let mut released = vec![rx.recv().unwrap(), rx.recv().unwrap()];
    released.sort();
    assert_eq!(released, vec![SlotId(0), SlotId(1)]);

    // A job for a slot without a worker still reports back.
    transport.close(SlotId(1));
    transport.submit(JobRef::new(SlotId(1), 1, task.clone(), owner.clone()));
    assert_eq!(rx.recv().unwrap(), SlotId(1));
    assert!(task.is_resolved());

    // A job that unwinds while reporting doesn't take its worker down.
    let unruly = StubTask::new(2, 2);
    unruly.panic_on_merge();
    transport.submit(JobRef::new(SlotId(0), 0, unruly.clone(), owner.clone()));
    assert_eq!(rx.recv().unwrap(), SlotId(0));
    transport.submit(JobRef::new(SlotId(0), 1, task.clone(), owner.clone()));
    assert_eq!(rx.recv().unwrap(), SlotId(0));

    transport.shut_down();
    transport.wait_shutdown();

    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(transport.live_workers(), 0);
    assert_eq!(owner.0.load(Ordering::SeqCst), 5);
    assert!(transport.open(SlotId(0)).is_err());
}
