///
/// Atomic counter for larch
///
/// A 32-bit integer with atomic read-modify-write operations. All
/// operations use SeqCst ordering for safety and simplicity; no relaxed
/// variants are exposed. The mutex fast path relies on the sign of the
/// value returned by `increment`/`decrement` to detect the
/// unlocked-to-locked transition without a second load.
///
use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicI32,
}

impl AtomicCounter {
    pub const fn new(value: i32) -> Self {
        Self {
            value: AtomicI32::new(value),
        }
    }

    pub fn get(&self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Stores `value`, returning the previous value.
    pub fn set(&self, value: i32) -> i32 {
        self.value.swap(value, Ordering::SeqCst)
    }

    /// Adds one, returning the value after the increment.
    pub fn increment(&self) -> i32 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Adds one, returning the value before the increment.
    pub fn fetch_increment(&self) -> i32 {
        self.value.fetch_add(1, Ordering::SeqCst)
    }

    /// Subtracts one, returning the value after the decrement.
    pub fn decrement(&self) -> i32 {
        self.value.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Subtracts one, returning the value before the decrement.
    pub fn fetch_decrement(&self) -> i32 {
        self.value.fetch_sub(1, Ordering::SeqCst)
    }

    pub fn add(&self, n: i32) -> i32 {
        self.value.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn subtract(&self, n: i32) -> i32 {
        self.value.fetch_sub(n, Ordering::SeqCst) - n
    }

    pub fn swap(&self, value: i32) -> i32 {
        self.value.swap(value, Ordering::SeqCst)
    }

    /// Compare-and-swap. Returns the value read; the exchange took place
    /// iff the returned value equals `expected`.
    pub fn compare_exchange(&self, expected: i32, new: i32) -> i32 {
        match self
            .value
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(old) => old,
            Err(old) => old,
        }
    }
}

/// Test-and-set spin lock built directly on [`AtomicCounter`].
///
/// Used by the kernel wait object cache, which the general-purpose
/// [`Mutex`](crate::Mutex) depends on and therefore cannot use itself.
/// Critical sections guarded by this lock must be a handful of pointer
/// operations at most.
#[derive(Debug, Default)]
pub struct SpinLock {
    lockvar: AtomicCounter,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            lockvar: AtomicCounter::new(0),
        }
    }

    pub fn lock(&self) {
        let mut spins = 0u32;
        while self.lockvar.swap(1) != 0 {
            std::hint::spin_loop();
            spins += 1;
            if spins % 64 == 0 {
                std::thread::yield_now();
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.lockvar.swap(1) == 0
    }

    pub fn unlock(&self) {
        self.lockvar.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_basic() {
        let a = AtomicCounter::new(42);
        assert_eq!(a.get(), 42);

        assert_eq!(a.set(100), 42);
        assert_eq!(a.get(), 100);

        assert_eq!(a.increment(), 101);
        assert_eq!(a.fetch_increment(), 101);
        assert_eq!(a.get(), 102);

        assert_eq!(a.decrement(), 101);
        assert_eq!(a.fetch_decrement(), 101);
        assert_eq!(a.get(), 100);

        assert_eq!(a.add(10), 110);
        assert_eq!(a.subtract(5), 105);
        assert_eq!(a.swap(7), 105);
        assert_eq!(a.get(), 7);
    }

    #[test]
    fn test_counter_signs() {
        // The mutex fast path only inspects the sign of the result.
        let a = AtomicCounter::new(-1);
        assert_eq!(a.increment(), 0);
        assert_eq!(a.increment(), 1);
        assert_eq!(a.decrement(), 0);
        assert!(a.decrement() < 0);
    }

    #[test]
    fn test_counter_compare_exchange() {
        let a = AtomicCounter::new(42);

        assert_eq!(a.compare_exchange(42, 100), 42);
        assert_eq!(a.get(), 100);

        assert_eq!(a.compare_exchange(42, 200), 100);
        assert_eq!(a.get(), 100);
    }

    #[test]
    fn test_counter_concurrent() {
        let a = Arc::new(AtomicCounter::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let a = Arc::clone(&a);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        a.increment();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(a.get(), 10_000);
    }

    #[test]
    fn test_spinlock_excludes() {
        struct Shared {
            lock: SpinLock,
            counter: std::cell::UnsafeCell<i64>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            counter: std::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        shared.lock.lock();
                        unsafe { *shared.counter.get() += 1 };
                        shared.lock.unlock();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, 8000);
    }
}
