pub mod job;
pub mod context;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod shutdown;
pub mod strategy;
pub mod transport;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashSet;

use sync::{lock, Arc, AtomicU64, Mutex, Ordering};
use job::TaskId;
use scheduler::{Capabilities, Scheduler, SchedulerBuilder, SchedulerId};
use strategy::{PoolStrategy, SimulatedStrategy, Strategy};
use transport::{Transport, ThreadTransport};
use crate::diagnostics::LogBook;
use crate::error::Error;

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_SCHEDULER_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

/// Data accessible by every handle to the scheduler.
pub(crate) struct Shared {
    /// A unique ID per scheduler, for debugging.
    pub id: SchedulerId,
    pub capabilities: Capabilities,
    /// Worker pool or simulated execution, depending on the capabilities.
    pub strategy: Box<dyn Strategy>,
    /// Tasks that have been scheduled and haven't resolved yet.
    pub registry: Arc<Registry>,
    pub diagnostics: Arc<LogBook>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.strategy.shut_down();
    }
}

pub(crate) fn init(params: SchedulerBuilder) -> Result<Scheduler, Error> {
    let capabilities = params.capabilities;
    let diagnostics = Arc::new(LogBook::with_capacity(params.log_capacity));

    let strategy: Box<dyn Strategy> = if capabilities.supports_concurrency {
        let transport: Arc<dyn Transport> = match params.transport {
            Some(transport) => transport,
            None => Arc::new(ThreadTransport::new(params.hooks)),
        };

        Box::new(PoolStrategy::new(
            capabilities.max_workers,
            capabilities.persistent_workers,
            transport,
            Arc::clone(&diagnostics),
        ))
    } else {
        Box::new(SimulatedStrategy::new(params.quantum, Arc::clone(&diagnostics))?)
    };

    let id = SchedulerId(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed));

    if capabilities.supports_concurrency {
        diagnostics.info(format!(
            "scheduler #{} initialized using up to {} workers",
            id.0, capabilities.max_workers.max(1),
        ));
    } else {
        diagnostics.info(format!(
            "scheduler #{} initialized without concurrency, running one span every {:?}",
            id.0, params.quantum,
        ));
    }

    Ok(Scheduler {
        shared: Arc::new(Shared {
            id,
            capabilities,
            strategy,
            registry: Arc::new(Registry::new()),
            diagnostics,
        }),
    })
}

/// The live tasks. A task is registered when it is scheduled and removed as soon as
/// it resolves.
pub(crate) struct Registry {
    live: Mutex<HashSet<TaskId>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            live: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, id: TaskId) {
        let inserted = lock(&self.live).insert(id);
        debug_assert!(inserted, "{} registered twice", id);
    }

    /// Returns false if the task wasn't registered (already resolved).
    pub fn unregister(&self, id: TaskId) -> bool {
        lock(&self.live).remove(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        lock(&self.live).contains(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}

#[test]
fn registry_tracks_live_tasks() {
    let registry = Registry::new();
    let a = registry.next_id();
    let b = registry.next_id();
    assert!(a < b);

    registry.register(a);
    registry.register(b);
    assert_eq!(registry.len(), 2);

    assert!(registry.unregister(a));
    assert!(!registry.unregister(a));
    assert!(!registry.contains(a));
    assert!(registry.contains(b));
    assert_eq!(registry.len(), 1);
}
