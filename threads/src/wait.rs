///
/// Wait condition
///
/// A signal/wake primitive with auto-reset or manual-reset semantics,
/// used standalone and as the building block for the reader-writer lock
/// and the thread pool.
///
/// - Auto-reset: a successful `wait` consumes the signalled state.
///   `wake_one` releases exactly one waiter; with no waiters it leaves
///   the flag set for the next single `wait`. `wake_all` releases every
///   current waiter and resets.
/// - Manual-reset: once signalled, all current and future waits succeed
///   immediately until `reset`.
///
/// Waiters are released by wake tokens and a broadcast generation
/// counter rather than by bare condvar notifies, so a spurious OS
/// wakeup never releases a waiter and `wake_one` releases at most one.
///
/// Waiting is cancellable: the wait runs in short slices and returns
/// `false` early when the calling thread has a pending termination
/// request that is not disabled. Callers observe the termination flag
/// to tell cancellation from timeout.
///
use std::sync::{Condvar, Mutex as StdMutex};
use std::time::{Duration, Instant};

use crate::INFINITE;
use crate::mutex::Protected;
use crate::thread;

/// Granularity of termination polling inside a blocked wait.
const CANCEL_SLICE: Duration = Duration::from_millis(20);

struct CondState {
    signalled: bool,
    waiter_count: u32,
}

#[derive(Default)]
struct OsState {
    tokens: u32,
    generation: u64,
}

pub struct WaitCondition {
    auto_reset: bool,
    state: Protected<CondState>,
    os: StdMutex<OsState>,
    cond: Condvar,
}

impl Default for WaitCondition {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl WaitCondition {
    pub fn new(auto_reset: bool, initially_signalled: bool) -> Self {
        Self {
            auto_reset,
            state: Protected::new(CondState {
                signalled: initially_signalled,
                waiter_count: 0,
            }),
            os: StdMutex::new(OsState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn is_auto_reset(&self) -> bool {
        self.auto_reset
    }

    /// Blocks until woken or `timeout_ms` elapses. Returns false on
    /// timeout or cancellation.
    pub fn wait(&self, timeout_ms: u32) -> bool {
        let mut state = self.state.lock();
        if state.signalled {
            if self.auto_reset {
                state.signalled = false;
            }
            return true;
        }
        state.waiter_count += 1;

        // Taking the OS lock before releasing the bookkeeping guard
        // closes the window in which a wake could slip past us.
        let mut os = self.os.lock().unwrap();
        let entry_generation = os.generation;
        drop(state);

        let deadline = if timeout_ms == INFINITE {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
        };

        let mut woken = false;
        loop {
            if os.tokens > 0 {
                os.tokens -= 1;
                woken = true;
                break;
            }
            if os.generation != entry_generation {
                woken = true;
                break;
            }
            if thread::wait_cancelled() {
                break;
            }
            let mut slice = CANCEL_SLICE;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                slice = slice.min(deadline - now);
            }
            let (guard, _) = self.cond.wait_timeout(os, slice).unwrap();
            os = guard;
        }
        drop(os);

        let mut state = self.state.lock();
        state.waiter_count -= 1;
        if self.auto_reset {
            state.signalled = false;
        }
        woken
    }

    /// Releases exactly one waiter, or leaves the condition signalled
    /// for the next `wait` when nothing is waiting.
    pub fn wake_one(&self) {
        let mut state = self.state.lock();
        if state.waiter_count > 0 {
            let mut os = self.os.lock().unwrap();
            os.tokens += 1;
            drop(os);
            self.cond.notify_one();
        } else {
            state.signalled = true;
        }
    }

    /// Releases every current waiter. Manual-reset conditions stay
    /// signalled afterwards; so does any condition with no waiters.
    pub fn wake_all(&self) {
        let mut state = self.state.lock();
        if state.waiter_count > 0 {
            let mut os = self.os.lock().unwrap();
            os.generation += 1;
            drop(os);
            self.cond.notify_all();
        }
        if state.waiter_count == 0 || !self.auto_reset {
            state.signalled = true;
        }
    }

    /// Unsignals the condition. Wake tokens that were granted but never
    /// consumed (their waiter timed out) are discarded too.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.signalled = false;
        self.os.lock().unwrap().tokens = 0;
    }
}
