pub use std::sync::atomic::Ordering;

#[cfg(not(loom))] pub use std::{
    sync::{
        Arc, Mutex, MutexGuard, Condvar,
        atomic::{AtomicU32, AtomicU64, AtomicBool},
    },
    thread,
};


#[cfg(loom)] pub use loom::{
    sync::{
        Arc, Mutex, MutexGuard, Condvar,
        atomic::{AtomicU32, AtomicU64, AtomicBool},
    },
    thread
};

/// Lock a mutex, ignoring poisoning.
///
/// Unit-of-work panics are caught before they reach scheduler code, so a poisoned
/// lock can only come from a panic inside the scheduler itself, and the state behind
/// it is still consistent at every point where we take a lock.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Block on a condition variable, ignoring poisoning (see `lock`).
#[inline]
pub fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner())
}
