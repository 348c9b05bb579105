///
/// Thread pool and time keeper
///
/// A pool dispatches closures onto a set of worker threads. Each worker
/// owns a one-task hand-off slot and an auto-reset wait condition;
/// dispatch claims a free worker directly, grows the pool when allowed,
/// and queues the task otherwise. Dynamic pools grow on demand up to
/// `maximum` and shed surplus idle workers back down to `total`.
///
/// Delayed dispatches go to a single process-wide time keeper thread
/// holding a deadline-sorted list; when an entry falls due the work is
/// handed to its owning pool as if freshly dispatched, keeping its
/// token. Pending work can be cancelled, rescheduled and waited for by
/// token.
///
/// Dropping a pool cancels its queued and scheduled work and waits for
/// the workers to finish what they are running.
///
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::INFINITE;
use crate::atomic::AtomicCounter;
use crate::error::ThreadsError;
use crate::mutex::Protected;
use crate::thread::{self, Thread, current_id};
use crate::wait::WaitCondition;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Handle to a dispatched piece of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

/// Outcome of [`ThreadPool::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelledState {
    /// The work had not begun and will never run.
    Cancelled,
    /// The work was already running; it runs to completion.
    WasRunning,
    /// No pending work carries this token.
    NotFound,
}

struct Task {
    token: u64,
    work: Box<dyn FnOnce() + Send>,
}

struct Worker {
    free: AtomicBool,
    wc: WaitCondition,
    /// One-task hand-off slot filled by dispatch, drained by the worker.
    slot: Protected<Option<Task>>,
    /// Token of the task being run right now, zero when none.
    current: AtomicU64,
}

struct WorkerHandle {
    worker: Arc<Worker>,
    thread: Thread,
}

struct PoolState {
    total: usize,
    maximum: usize,
    workers: Vec<WorkerHandle>,
    /// Threads that retired themselves, awaiting a join.
    retired: Vec<Thread>,
    waiting: VecDeque<Task>,
    /// Completion wait conditions, keyed by token.
    waiting_wcs: HashMap<u64, Arc<WaitCondition>>,
}

struct PoolShared {
    state: Protected<PoolState>,
    free: AtomicCounter,
    dynamic: bool,
}

impl PoolShared {
    /// Hands a task to a free worker, grows the pool, or queues it.
    fn enqueue(self: &Arc<Self>, task: Task) {
        let mut state = self.state.lock();
        for handle in &state.workers {
            if handle.worker.free.swap(false, Ordering::SeqCst) {
                self.free.decrement();
                *handle.worker.slot.lock() = Some(task);
                handle.worker.wc.wake_one();
                return;
            }
        }
        let cap = if self.dynamic {
            state.maximum
        } else {
            state.total
        };
        if state.workers.len() < cap {
            let index = state.workers.len();
            match spawn_worker(self, task, index) {
                Ok(handle) => state.workers.push(handle),
                Err((err, task)) => {
                    tracing::error!(%err, "failed to start pool worker, queueing task");
                    state.waiting.push_back(task);
                }
            }
        } else {
            state.waiting.push_back(task);
        }
    }

    /// Post-task bookkeeping: wake anyone waiting on the token and keep
    /// the worker busy when the queue holds more work.
    fn job_finished(&self, token: u64, worker: &Arc<Worker>) {
        let mut state = self.state.lock();
        if let Some(wc) = state.waiting_wcs.remove(&token) {
            wc.wake_all();
        }
        if let Some(next) = state.waiting.pop_front() {
            *worker.slot.lock() = Some(next);
            worker.wc.wake_one();
        }
    }

    fn pending_locked(&self, state: &PoolState, token: u64) -> bool {
        if state.waiting.iter().any(|t| t.token == token) {
            return true;
        }
        for handle in &state.workers {
            let slot = handle.worker.slot.lock();
            if slot.as_ref().is_some_and(|t| t.token == token) {
                return true;
            }
            drop(slot);
            // The worker publishes `current` before releasing its slot,
            // so the token is visible in one place or the other.
            if handle.worker.current.load(Ordering::SeqCst) == token {
                return true;
            }
        }
        false
    }

    fn pending(&self, key: usize, token: u64) -> bool {
        if self.pending_locked(&self.state.lock(), token) {
            return true;
        }
        TIME_KEEPER
            .get()
            .is_some_and(|keeper| keeper.contains(key, token))
    }
}

fn spawn_worker(
    shared: &Arc<PoolShared>,
    task: Task,
    index: usize,
) -> Result<WorkerHandle, (ThreadsError, Task)> {
    let worker = Arc::new(Worker {
        free: AtomicBool::new(false),
        wc: WaitCondition::new(true, false),
        slot: Protected::new(Some(task)),
        current: AtomicU64::new(0),
    });
    let weak = Arc::downgrade(shared);
    let body_worker = Arc::clone(&worker);
    let thread = Thread::new(&format!("pool worker {index}"), move || {
        worker_loop(weak, body_worker)
    });
    if let Err(err) = thread.start(false) {
        let task = worker.slot.lock().take().expect("slot filled above");
        return Err((err, task));
    }
    Ok(WorkerHandle { worker, thread })
}

fn worker_loop(shared: Weak<PoolShared>, worker: Arc<Worker>) {
    loop {
        thread::check_for_terminate();
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let task = {
            let mut slot = worker.slot.lock();
            let task = slot.take();
            if let Some(task) = &task {
                worker.current.store(task.token, Ordering::SeqCst);
            }
            task
        };

        match task {
            Some(task) => {
                let token = task.token;
                tracing::trace!(token, "running dispatched work");
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task.work)) {
                    if thread::is_terminate_payload(&payload) {
                        panic::resume_unwind(payload);
                    }
                    tracing::warn!(token, "dispatched work panicked");
                }
                worker.current.store(0, Ordering::SeqCst);
                shared.job_finished(token, &worker);
            }
            None => {
                let retire = {
                    let mut state = shared.state.lock();
                    // An empty slot does not mean an empty pool: a
                    // cancelled claim can leave queued work behind with
                    // nobody else to drain it.
                    if let Some(next) = state.waiting.pop_front() {
                        *worker.slot.lock() = Some(next);
                        continue;
                    }
                    // Going idle; dynamic pools shed surplus workers here.
                    if shared.dynamic
                        && state.workers.len() > state.total
                        && let Some(pos) = state
                            .workers
                            .iter()
                            .position(|h| Arc::ptr_eq(&h.worker, &worker))
                    {
                        let handle = state.workers.remove(pos);
                        state.retired.push(handle.thread);
                        true
                    } else {
                        false
                    }
                };
                if retire {
                    tracing::debug!("surplus pool worker retiring");
                    return;
                }
                if !worker.free.swap(true, Ordering::SeqCst) {
                    shared.free.increment();
                }
                drop(shared);
                worker.wc.wait(INFINITE);
            }
        }
    }
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// A pool of up to `total` workers. A dynamic pool additionally
    /// grows to `maximum` under load and shrinks back when idle.
    pub fn new(total: usize, dynamic: bool, maximum: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Protected::new(PoolState {
                    total,
                    maximum: maximum.max(total),
                    workers: Vec::new(),
                    retired: Vec::new(),
                    waiting: VecDeque::new(),
                    waiting_wcs: HashMap::new(),
                }),
                free: AtomicCounter::new(0),
                dynamic,
            }),
        }
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    pub fn total(&self) -> usize {
        self.shared.state.lock().total
    }

    pub fn maximum(&self) -> usize {
        self.shared.state.lock().maximum
    }

    /// Number of idle workers.
    pub fn free(&self) -> usize {
        self.shared.free.get().max(0) as usize
    }

    pub fn set_total(&self, total: usize) {
        let mut state = self.shared.state.lock();
        state.total = total;
        state.maximum = state.maximum.max(total);
    }

    pub fn set_maximum(&self, maximum: usize) {
        let mut state = self.shared.state.lock();
        state.maximum = maximum.max(state.total);
    }

    /// Schedules `work` to run on some worker, after `delay_ms` when
    /// non-zero. The returned token identifies the work for `cancel`,
    /// `reset` and `wait`.
    pub fn dispatch<F>(&self, work: F, delay_ms: u32) -> Token
    where
        F: FnOnce() + Send + 'static,
    {
        self.reap_retired();
        let token = Token(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        let task = Task {
            token: token.0,
            work: Box::new(work),
        };
        if delay_ms > 0 {
            tracing::trace!(token = token.0, delay_ms, "scheduling delayed work");
            time_keeper().add(TimedEntry {
                token: token.0,
                pool_key: self.key(),
                deadline: Instant::now() + Duration::from_millis(u64::from(delay_ms)),
                pool: Arc::downgrade(&self.shared),
                work: task.work,
            });
        } else {
            self.shared.enqueue(task);
        }
        token
    }

    /// Cancels pending work. Work already running is left to finish;
    /// with `wait` the call blocks until it has (illegal from the
    /// worker running that very job).
    pub fn cancel(&self, token: Token, wait: bool) -> CancelledState {
        {
            let mut state = self.shared.state.lock();
            if let Some(pos) = state.waiting.iter().position(|t| t.token == token.0) {
                state.waiting.remove(pos);
                if let Some(wc) = state.waiting_wcs.remove(&token.0) {
                    wc.wake_all();
                }
                return CancelledState::Cancelled;
            }
            let mut cleared_slot = false;
            for handle in &state.workers {
                let mut slot = handle.worker.slot.lock();
                if slot.as_ref().is_some_and(|t| t.token == token.0) {
                    // Claimed by a worker that has not started it yet.
                    *slot = None;
                    cleared_slot = true;
                    break;
                }
            }
            if cleared_slot {
                if let Some(wc) = state.waiting_wcs.remove(&token.0) {
                    wc.wake_all();
                }
                return CancelledState::Cancelled;
            }
            let running = state
                .workers
                .iter()
                .find(|h| h.worker.current.load(Ordering::SeqCst) == token.0)
                .map(|h| (Arc::clone(&h.worker), h.thread.id()));
            if let Some((worker, worker_thread)) = running {
                if !wait {
                    return CancelledState::WasRunning;
                }
                if worker_thread == current_id() {
                    debug_assert!(
                        false,
                        "ThreadPool::cancel(wait) called from the job being cancelled"
                    );
                    tracing::error!(
                        token = token.0,
                        "ThreadPool::cancel(wait) called from the job being cancelled"
                    );
                    return CancelledState::WasRunning;
                }
                // Await the completion condition that job_finished wakes.
                let wc = Arc::clone(
                    state
                        .waiting_wcs
                        .entry(token.0)
                        .or_insert_with(|| Arc::new(WaitCondition::new(true, false))),
                );
                drop(state);
                while worker.current.load(Ordering::SeqCst) == token.0 {
                    wc.wait(50);
                }
                return CancelledState::WasRunning;
            }
        }
        if let Some(keeper) = TIME_KEEPER.get()
            && keeper.cancel(self.key(), token.0)
        {
            let mut state = self.shared.state.lock();
            if let Some(wc) = state.waiting_wcs.remove(&token.0) {
                wc.wake_all();
            }
            return CancelledState::Cancelled;
        }
        CancelledState::NotFound
    }

    /// Reschedules not-yet-due delayed work to fire `delay_ms` from
    /// now. Returns false when the token is not scheduled.
    pub fn reset(&self, token: Token, delay_ms: u32) -> bool {
        TIME_KEEPER
            .get()
            .is_some_and(|keeper| keeper.reset(self.key(), token.0, delay_ms))
    }

    /// Blocks until the work identified by `token` has completed or
    /// been cancelled. Returns false on timeout.
    pub fn wait(&self, token: Token, timeout_ms: u32) -> bool {
        let key = self.key();
        let wc = {
            let mut state = self.shared.state.lock();
            if !self.shared.pending_locked(&state, token.0) {
                drop(state);
                if !self.shared.pending(key, token.0) {
                    return true;
                }
                state = self.shared.state.lock();
            }
            Arc::clone(
                state
                    .waiting_wcs
                    .entry(token.0)
                    .or_insert_with(|| Arc::new(WaitCondition::new(true, false))),
            )
        };

        let deadline = if timeout_ms == INFINITE {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
        };
        loop {
            if !self.shared.pending(key, token.0) {
                return true;
            }
            let mut slice = 50u32;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                slice = slice.min((deadline - now).as_millis() as u32);
            }
            wc.wait(slice.max(1));
        }
    }

    fn reap_retired(&self) {
        let mut state = self.shared.state.lock();
        state.retired.retain(|t| {
            if t.is_finished() {
                t.wait(0);
                false
            } else {
                true
            }
        });
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Some(keeper) = TIME_KEEPER.get() {
            keeper.forget_pool(self.key());
        }
        let (workers, retired) = {
            let mut state = self.shared.state.lock();
            state.waiting.clear();
            for wc in state.waiting_wcs.values() {
                wc.wake_all();
            }
            state.waiting_wcs.clear();
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.retired),
            )
        };
        for handle in &workers {
            handle.thread.request_termination();
            handle.worker.wc.wake_all();
        }
        for handle in workers {
            handle.thread.wait(INFINITE);
        }
        for thread in retired {
            thread.wait(INFINITE);
        }
    }
}

struct TimedEntry {
    token: u64,
    pool_key: usize,
    deadline: Instant,
    pool: Weak<PoolShared>,
    work: Box<dyn FnOnce() + Send>,
}

struct KeeperState {
    /// Sorted by deadline, soonest first.
    entries: Vec<TimedEntry>,
    /// Due entries currently being handed to their pools. Tracked so a
    /// token is never momentarily in neither the keeper nor the pool.
    firing: Vec<(usize, u64)>,
}

struct TimeKeeperShared {
    state: Protected<KeeperState>,
    wc: WaitCondition,
}

/// The process-wide timer thread. Started on first delayed dispatch
/// and lives for the rest of the process.
struct TimeKeeper {
    shared: Arc<TimeKeeperShared>,
    _thread: Thread,
}

static TIME_KEEPER: OnceLock<TimeKeeper> = OnceLock::new();

fn time_keeper() -> &'static TimeKeeper {
    TIME_KEEPER.get_or_init(|| {
        let shared = Arc::new(TimeKeeperShared {
            state: Protected::new(KeeperState {
                entries: Vec::new(),
                firing: Vec::new(),
            }),
            wc: WaitCondition::new(true, false),
        });
        let body_shared = Arc::clone(&shared);
        let thread = Thread::new("time keeper", move || keeper_loop(&body_shared));
        if let Err(err) = thread.start(false) {
            tracing::error!(%err, "failed to start time keeper thread");
        }
        TimeKeeper {
            shared,
            _thread: thread,
        }
    })
}

impl TimeKeeper {
    fn add(&self, entry: TimedEntry) {
        let mut state = self.shared.state.lock();
        let pos = state
            .entries
            .partition_point(|e| e.deadline <= entry.deadline);
        state.entries.insert(pos, entry);
        drop(state);
        self.shared.wc.wake_one();
    }

    fn cancel(&self, pool_key: usize, token: u64) -> bool {
        let mut state = self.shared.state.lock();
        if let Some(pos) = state
            .entries
            .iter()
            .position(|e| e.pool_key == pool_key && e.token == token)
        {
            state.entries.remove(pos);
            true
        } else {
            false
        }
    }

    fn reset(&self, pool_key: usize, token: u64, delay_ms: u32) -> bool {
        let mut state = self.shared.state.lock();
        let Some(pos) = state
            .entries
            .iter()
            .position(|e| e.pool_key == pool_key && e.token == token)
        else {
            return false;
        };
        let mut entry = state.entries.remove(pos);
        entry.deadline = Instant::now() + Duration::from_millis(u64::from(delay_ms));
        let pos = state
            .entries
            .partition_point(|e| e.deadline <= entry.deadline);
        state.entries.insert(pos, entry);
        drop(state);
        self.shared.wc.wake_one();
        true
    }

    fn contains(&self, pool_key: usize, token: u64) -> bool {
        let state = self.shared.state.lock();
        state
            .entries
            .iter()
            .any(|e| e.pool_key == pool_key && e.token == token)
            || state.firing.contains(&(pool_key, token))
    }

    fn forget_pool(&self, pool_key: usize) {
        self.shared
            .state
            .lock()
            .entries
            .retain(|e| e.pool_key != pool_key);
    }
}

fn keeper_loop(shared: &TimeKeeperShared) {
    loop {
        thread::check_for_terminate();
        let mut due = Vec::new();
        let timeout = {
            let mut state = shared.state.lock();
            let now = Instant::now();
            while state.entries.first().is_some_and(|e| e.deadline <= now) {
                let entry = state.entries.remove(0);
                state.firing.push((entry.pool_key, entry.token));
                due.push(entry);
            }
            match state.entries.first() {
                Some(next) => {
                    let ms = next.deadline.saturating_duration_since(now).as_millis();
                    ms.min(u128::from(INFINITE - 1)).max(1) as u32
                }
                None => INFINITE,
            }
        };
        for entry in due {
            let key = (entry.pool_key, entry.token);
            // The owning pool may be gone; its work dies with it.
            if let Some(pool) = entry.pool.upgrade() {
                tracing::trace!(token = entry.token, "delayed work due");
                pool.enqueue(Task {
                    token: entry.token,
                    work: entry.work,
                });
            }
            let mut state = shared.state.lock();
            state.firing.retain(|k| *k != key);
        }
        shared.wc.wait(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicUsize};

    #[test]
    fn test_runs_everything_with_bounded_concurrency() {
        let pool = ThreadPool::new(4, false, 4);
        let done = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicI32::new(0));
        let peak = Arc::new(AtomicI32::new(0));

        let tokens: Vec<_> = (0..20)
            .map(|_| {
                let done = Arc::clone(&done);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                pool.dispatch(
                    move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        active.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                    },
                    0,
                )
            })
            .collect();

        for token in tokens {
            assert!(pool.wait(token, 10_000));
        }
        assert_eq!(done.load(Ordering::SeqCst), 20);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 4, "peak concurrency {peak}");
    }

    #[test]
    fn test_delayed_dispatch_fires_after_delay() {
        let pool = ThreadPool::new(1, false, 1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let begun = Instant::now();

        let token = pool.dispatch(
            move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            80,
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(pool.wait(token, 10_000));
        assert!(begun.elapsed() >= Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_delayed_work() {
        let pool = ThreadPool::new(1, false, 1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);

        let token = pool.dispatch(
            move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            200,
        );
        assert_eq!(pool.cancel(token, false), CancelledState::Cancelled);
        assert_eq!(pool.cancel(token, false), CancelledState::NotFound);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_queued_work() {
        let pool = ThreadPool::new(1, false, 1);
        let blocker = pool.dispatch(|| std::thread::sleep(Duration::from_millis(150)), 0);
        // Let the single worker pick up the blocker.
        std::thread::sleep(Duration::from_millis(30));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let queued = pool.dispatch(
            move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );
        assert_eq!(pool.cancel(queued, false), CancelledState::Cancelled);
        assert!(pool.wait(blocker, 10_000));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_running_work_waits_for_it() {
        let pool = ThreadPool::new(1, false, 1);
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        let token = pool.dispatch(
            move || {
                std::thread::sleep(Duration::from_millis(100));
                done2.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(pool.cancel(token, true), CancelledState::WasRunning);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_postpones_delayed_work() {
        let pool = ThreadPool::new(1, false, 1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let token = pool.dispatch(
            move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            50,
        );
        assert!(pool.reset(token, 250));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(pool.wait(token, 10_000));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!pool.reset(token, 50));
    }

    #[test]
    fn test_wait_times_out_on_long_work() {
        let pool = ThreadPool::new(1, false, 1);
        let token = pool.dispatch(|| std::thread::sleep(Duration::from_millis(200)), 0);
        assert!(!pool.wait(token, 30));
        assert!(pool.wait(token, 10_000));
    }

    #[test]
    fn test_dynamic_pool_grows_under_load() {
        let pool = ThreadPool::new(1, true, 3);
        let active = Arc::new(AtomicI32::new(0));
        let peak = Arc::new(AtomicI32::new(0));

        let tokens: Vec<_> = (0..3)
            .map(|_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                pool.dispatch(
                    move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(150));
                        active.fetch_sub(1, Ordering::SeqCst);
                    },
                    0,
                )
            })
            .collect();
        for token in tokens {
            assert!(pool.wait(token, 10_000));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancelled_claim_does_not_strand_queued_work() {
        let pool = ThreadPool::new(1, false, 1);
        let warm = pool.dispatch(|| {}, 0);
        assert!(pool.wait(warm, 10_000));

        // Back-to-back dispatches put the first in the idle worker's
        // slot and the second in the queue; cancelling the first while
        // it is claimed but unstarted must still let the second run.
        for _ in 0..25 {
            let ran = Arc::new(AtomicUsize::new(0));
            let ran2 = Arc::clone(&ran);
            let first = pool.dispatch(
                move || {
                    ran2.fetch_add(1, Ordering::SeqCst);
                },
                0,
            );
            let ran3 = Arc::clone(&ran);
            let second = pool.dispatch(
                move || {
                    ran3.fetch_add(1, Ordering::SeqCst);
                },
                0,
            );
            pool.cancel(first, false);
            assert!(pool.wait(second, 2000));
        }
    }

    #[test]
    fn test_dynamic_pool_shrinks_when_idle() {
        let pool = ThreadPool::new(1, true, 3);
        let tokens: Vec<_> = (0..3)
            .map(|_| pool.dispatch(|| std::thread::sleep(Duration::from_millis(100)), 0))
            .collect();
        for token in tokens {
            assert!(pool.wait(token, 10_000));
        }

        // Surplus workers retire as they come up idle; exactly one
        // stays behind as the pool's floor.
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.free() != 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.free(), 1);

        // The shrunk pool still takes work.
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        let again = pool.dispatch(
            move || {
                done2.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );
        assert!(pool.wait(again, 10_000));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_work_does_not_kill_the_pool() {
        let pool = ThreadPool::new(1, false, 1);
        let bad = pool.dispatch(|| panic!("dispatched failure"), 0);
        assert!(pool.wait(bad, 10_000));

        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        let ok = pool.dispatch(
            move || {
                done2.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );
        assert!(pool.wait(ok, 10_000));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_waits_for_running_work() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2, false, 2);
            let done2 = Arc::clone(&done);
            pool.dispatch(
                move || {
                    std::thread::sleep(Duration::from_millis(80));
                    done2.fetch_add(1, Ordering::SeqCst);
                },
                0,
            );
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
