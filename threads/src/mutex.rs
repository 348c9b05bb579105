///
/// Recursive adaptive mutex
///
/// Combines a lock-free fast path, a bounded spin phase and a kernel
/// blocking fallback:
///
/// - `lock_count` starts at -1. The fast path atomically increments it;
///   a result of zero means nothing owned the mutex and the caller now
///   does, without any kernel involvement.
/// - A thread that already owns the mutex just bumps its recursion
///   depth. Recursive acquisition never blocks.
/// - Contending threads spin up to `spin_count` iterations trying to
///   claim the wake flag, then sleep on a kernel wait object borrowed
///   from the process-wide cache. On uniprocessor machines the spin
///   phase yields the time slice instead of busy-waiting.
/// - Each unlock wakes at most one waiter: the wake flag is set once
///   and the wait object posted once, and only a single thread can win
///   the flag swap.
///
/// Unlocking a mutex the calling thread does not own is fatal in debug
/// builds and a logged no-op in release builds.
///
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::atomic::AtomicCounter;
use crate::cache::{WaitObject, wait_object_cache};
use crate::thread::current_id;

pub const DEFAULT_SPIN_COUNT: u32 = 4000;

fn system_processors() -> usize {
    static PROCESSORS: OnceLock<usize> = OnceLock::new();
    *PROCESSORS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

pub struct Mutex {
    lock_count: AtomicCounter,
    wake_flag: AtomicCounter,
    owner: AtomicU64,
    recursion: UnsafeCell<u32>,
    spin_count: AtomicU32,
    wait_object: Option<Box<WaitObject>>,
}

// Safety: `recursion` is only written by the thread that holds the
// mutex, between its winning increment of `lock_count` and the matching
// release.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self::with_spin_count(DEFAULT_SPIN_COUNT)
    }

    pub fn with_spin_count(spin_count: u32) -> Self {
        Self {
            lock_count: AtomicCounter::new(-1),
            wake_flag: AtomicCounter::new(0),
            owner: AtomicU64::new(0),
            recursion: UnsafeCell::new(0),
            spin_count: AtomicU32::new(spin_count),
            wait_object: Some(wait_object_cache().fetch()),
        }
    }

    pub fn spin_count(&self) -> u32 {
        self.spin_count.load(Ordering::SeqCst)
    }

    pub fn set_spin_count(&self, count: u32) {
        self.spin_count.store(count, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count.get() >= 0
    }

    fn wait_object(&self) -> &WaitObject {
        // Only `drop` takes the wait object out.
        self.wait_object.as_deref().expect("mutex used after drop")
    }

    pub fn lock(&self) {
        let my = current_id();
        if self.lock_count.increment() == 0 {
            // Nothing owned me.
            self.claim(my);
        } else if self.owner.load(Ordering::SeqCst) == my {
            unsafe { *self.recursion.get() += 1 };
        } else {
            self.lock_contended();
            self.claim(my);
        }
    }

    #[cold]
    fn lock_contended(&self) {
        let uniprocessor = system_processors() == 1;
        loop {
            if self.wake_flag.swap(0) == 1 {
                return;
            }
            let mut claimed = false;
            for _ in 0..self.spin_count.load(Ordering::SeqCst) {
                if uniprocessor {
                    // Give up the remaining time slice; busy-waiting
                    // cannot make progress with one processor.
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
                if self.wake_flag.swap(0) == 1 {
                    claimed = true;
                    break;
                }
            }
            if claimed {
                return;
            }
            self.wait_object().acquire();
        }
    }

    fn claim(&self, my: u64) {
        debug_assert_eq!(self.owner.load(Ordering::SeqCst), 0);
        self.owner.store(my, Ordering::SeqCst);
        unsafe { *self.recursion.get() = 1 };
    }

    pub fn try_lock(&self) -> bool {
        let my = current_id();
        if self.lock_count.increment() == 0 {
            self.claim(my);
            true
        } else if self.owner.load(Ordering::SeqCst) == my {
            unsafe { *self.recursion.get() += 1 };
            true
        } else {
            self.lock_count.decrement();
            false
        }
    }

    pub fn unlock(&self) {
        let my = current_id();
        let owner = self.owner.load(Ordering::SeqCst);
        if owner != my {
            debug_assert!(
                false,
                "Mutex::unlock() performed by thread which did not own mutex"
            );
            tracing::error!(
                owner,
                caller = my,
                "Mutex::unlock() performed by thread which did not own mutex"
            );
            return;
        }
        let recursion = unsafe { &mut *self.recursion.get() };
        *recursion -= 1;
        if *recursion > 0 {
            self.lock_count.decrement();
        } else {
            self.owner.store(0, Ordering::SeqCst);
            if self.lock_count.decrement() >= 0 {
                // Others waiting: wake either a spinner or one sleeper.
                self.wake_flag.set(1);
                self.wait_object().post();
            }
        }
    }

    /// True when the calling thread holds this mutex more than once.
    pub(crate) fn held_recursively(&self) -> bool {
        self.owner.load(Ordering::SeqCst) == current_id() && unsafe { *self.recursion.get() } > 1
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        if let Some(wo) = self.wait_object.take() {
            wait_object_cache().recycle(wo);
        }
    }
}

/// RAII lock holder, released at end of scope.
pub struct MutexHold<'a> {
    mutex: &'a Mutex,
}

impl<'a> MutexHold<'a> {
    pub fn new(mutex: &'a Mutex) -> Self {
        mutex.lock();
        Self { mutex }
    }
}

impl Drop for MutexHold<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Data guarded by the crate [`Mutex`], with RAII access.
///
/// Internal building block for the other primitives. The guard hands
/// out `&mut T`, so the mutex beneath it must never be taken
/// recursively while a guard is alive; `lock` asserts this in debug
/// builds.
pub(crate) struct Protected<T> {
    mutex: Mutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Protected<T> {}
unsafe impl<T: Send> Sync for Protected<T> {}

impl<T> Protected<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            mutex: Mutex::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub(crate) fn lock(&self) -> ProtectedGuard<'_, T> {
        self.mutex.lock();
        debug_assert!(!self.mutex.held_recursively());
        ProtectedGuard { protected: self }
    }
}

pub(crate) struct ProtectedGuard<'a, T> {
    protected: &'a Protected<T>,
}

impl<T> Deref for ProtectedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.protected.data.get() }
    }
}

impl<T> DerefMut for ProtectedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.protected.data.get() }
    }
}

impl<T> Drop for ProtectedGuard<'_, T> {
    fn drop(&mut self) {
        self.protected.mutex.unlock();
    }
}
