///
/// Kernel wait object cache
///
/// Much of the cost of a short-lived mutex is creating and destroying
/// its kernel wait object.
/// This module keeps a process-wide free list of reusable wait objects:
/// a mutex fetches one at construction and returns it at drop, so the
/// kernel object survives across many mutex lifetimes.
///
/// The free list is guarded by a [`SpinLock`] rather than the
/// general-purpose [`Mutex`](crate::Mutex), which would be a circular
/// dependency.
///
use std::cell::UnsafeCell;
use std::sync::{Condvar, Mutex as StdMutex, OnceLock};

use crate::atomic::SpinLock;

/// A counting semaphore backed by an OS-level wait primitive. `post`
/// releases one blocked `acquire`; permits accumulate when nothing is
/// waiting.
#[derive(Debug)]
pub(crate) struct WaitObject {
    permits: StdMutex<u32>,
    cond: Condvar,
}

impl WaitObject {
    fn new() -> Box<WaitObject> {
        Box::new(WaitObject {
            permits: StdMutex::new(0),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn post(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        drop(permits);
        self.cond.notify_one();
    }

    pub(crate) fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    #[cfg(test)]
    fn permits(&self) -> u32 {
        *self.permits.lock().unwrap()
    }

    /// Discards any accumulated permits so a recycled object starts clean.
    fn drain(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits = 0;
    }
}

pub(crate) struct WaitObjectCache {
    lock: SpinLock,
    entries: UnsafeCell<Vec<Box<WaitObject>>>,
}

// Safety: `entries` is only touched while `lock` is held.
unsafe impl Sync for WaitObjectCache {}
unsafe impl Send for WaitObjectCache {}

impl WaitObjectCache {
    fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            entries: UnsafeCell::new(Vec::new()),
        }
    }

    /// Fetches a cached wait object, creating a fresh one when the free
    /// list is empty.
    pub(crate) fn fetch(&self) -> Box<WaitObject> {
        self.lock.lock();
        let entry = unsafe { (*self.entries.get()).pop() };
        self.lock.unlock();
        entry.unwrap_or_else(WaitObject::new)
    }

    /// Returns a wait object to the free list.
    pub(crate) fn recycle(&self, wo: Box<WaitObject>) {
        wo.drain();
        self.lock.lock();
        unsafe { (*self.entries.get()).push(wo) };
        self.lock.unlock();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock.lock();
        let n = unsafe { (*self.entries.get()).len() };
        self.lock.unlock();
        n
    }
}

static CACHE: OnceLock<WaitObjectCache> = OnceLock::new();

pub(crate) fn wait_object_cache() -> &'static WaitObjectCache {
    CACHE.get_or_init(WaitObjectCache::new)
}
