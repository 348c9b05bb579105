///
/// Thread abstraction with cooperative termination
///
/// Wraps a native thread with the lifecycle Created -> Running ->
/// Cleaning-up -> Finished. The cleanup routine runs exactly once no
/// matter how the body exits: normal return, a panic caught by the
/// runner, or a cancellation unwind raised by `check_for_terminate`.
///
/// Termination is advisory and purely cooperative: `request_termination`
/// sets a flag which blocking waits on the crate primitives poll, and
/// which the body should check at safe points. Sections bracketed by
/// `disable_termination` / `enable_termination` (nestable) are never
/// interrupted.
///
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ThreadsError;
use crate::mutex::Protected;
use crate::wait::WaitCondition;

/// How long `start(true)` waits for the new thread to enter its body.
const START_TIMEOUT_MS: u32 = 10_000;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
    static CURRENT: RefCell<Option<Arc<ThreadInner>>> = const { RefCell::new(None) };
}

/// Identifier of the calling thread, assigned on first use. Never zero
/// and never reused within a process.
pub fn current_id() -> u64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// Whether a new thread competes process-wide or system-wide for
/// scheduling (where the platform distinguishes the two).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerScope {
    #[default]
    Auto,
    Process,
    System,
}

/// Payload used to unwind a cancelled thread body into its cleanup path.
struct TerminateUnwind;

struct CleanupCall {
    code: Box<dyn FnOnce() + Send>,
    in_thread: bool,
}

struct ThreadState {
    stack_size: usize,
    scope: SchedulerScope,
    priority: i8,
    body: Option<Box<dyn FnOnce() + Send>>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
    cleanup_calls: Vec<CleanupCall>,
    join: Option<std::thread::JoinHandle<()>>,
}

pub(crate) struct ThreadInner {
    name: String,
    id: AtomicU64,
    is_running: AtomicBool,
    is_finished: AtomicBool,
    in_cleanup: AtomicBool,
    terminate_requested: AtomicBool,
    term_disable: AtomicI32,
    started: WaitCondition,
    stopped: WaitCondition,
    state: Protected<ThreadState>,
}

pub struct Thread {
    inner: Arc<ThreadInner>,
}

impl Thread {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(ThreadInner {
                name: name.to_owned(),
                id: AtomicU64::new(0),
                is_running: AtomicBool::new(false),
                is_finished: AtomicBool::new(false),
                in_cleanup: AtomicBool::new(false),
                terminate_requested: AtomicBool::new(false),
                term_disable: AtomicI32::new(0),
                started: WaitCondition::new(false, false),
                stopped: WaitCondition::new(false, false),
                state: Protected::new(ThreadState {
                    stack_size: 0,
                    scope: SchedulerScope::Auto,
                    priority: 0,
                    body: Some(Box::new(body)),
                    cleanup: None,
                    cleanup_calls: Vec::new(),
                    join: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identifier of the running thread, zero before start and after
    /// cleanup.
    pub fn id(&self) -> u64 {
        self.inner.id.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished.load(Ordering::SeqCst)
    }

    pub fn in_cleanup(&self) -> bool {
        self.inner.in_cleanup.load(Ordering::SeqCst)
    }

    /// Routine guaranteed to run exactly once when the body exits, on
    /// the thread itself.
    pub fn set_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.state.lock().cleanup = Some(Box::new(cleanup));
    }

    /// Registers an extra cleanup callback. Callbacks run in
    /// last-registered-first-run order; `in_thread` ones on the thread
    /// right after its body, the rest when this handle is dropped.
    pub fn add_cleanup_call<F>(&self, code: F, in_thread: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.state.lock().cleanup_calls.push(CleanupCall {
            code: Box::new(code),
            in_thread,
        });
    }

    pub fn stack_size(&self) -> usize {
        self.inner.state.lock().stack_size
    }

    /// Stack size in bytes for the native thread; zero keeps the
    /// platform default. Takes effect at `start`.
    pub fn set_stack_size(&self, bytes: usize) {
        self.inner.state.lock().stack_size = bytes;
    }

    pub fn scheduler(&self) -> SchedulerScope {
        self.inner.state.lock().scope
    }

    pub fn set_scheduler(&self, scope: SchedulerScope) {
        self.inner.state.lock().scope = scope;
    }

    pub fn priority(&self) -> i8 {
        self.inner.state.lock().priority
    }

    /// Scheduling priority normalized to -127..=127, applied at `start`
    /// on platforms that allow it (best effort elsewhere).
    pub fn set_priority(&self, priority: i8) {
        self.inner.state.lock().priority = priority;
    }

    pub fn termination_requested(&self) -> bool {
        self.inner.terminate_requested.load(Ordering::SeqCst)
    }

    /// Asks the thread to terminate. The thread unwinds through its
    /// cleanup path at its next termination check or cancellable wait.
    pub fn request_termination(&self) {
        if self.is_running() {
            self.inner.terminate_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Launches the body on a new native thread. With
    /// `wait_until_started` the call blocks until the body is entered,
    /// bounded by a timeout.
    pub fn start(&self, wait_until_started: bool) -> Result<(), ThreadsError> {
        {
            let mut state = self.inner.state.lock();
            if self.inner.is_running.load(Ordering::SeqCst) {
                return Err(ThreadsError::AlreadyStarted);
            }
            let body = state.body.take().ok_or(ThreadsError::AlreadyStarted)?;

            self.inner.started.reset();
            self.inner.is_finished.store(false, Ordering::SeqCst);
            self.inner.terminate_requested.store(false, Ordering::SeqCst);

            let mut builder = std::thread::Builder::new().name(self.inner.name.clone());
            if state.stack_size > 0 {
                builder = builder.stack_size(state.stack_size);
            }
            let inner = Arc::clone(&self.inner);
            let handle = builder
                .spawn(move || runner(inner, body))
                .map_err(ThreadsError::Spawn)?;
            #[cfg(unix)]
            apply_priority(&handle, state.priority);
            state.join = Some(handle);
        }

        if wait_until_started && !self.inner.started.wait(START_TIMEOUT_MS) {
            return Err(ThreadsError::StartTimeout(START_TIMEOUT_MS));
        }
        Ok(())
    }

    /// Joins the thread. Returns false if `timeout_ms` elapses first.
    /// A thread that was never started counts as already finished.
    pub fn wait(&self, timeout_ms: u32) -> bool {
        if !self.is_finished() {
            if self.inner.state.lock().join.is_none() {
                return true;
            }
            if !self.inner.stopped.wait(timeout_ms) {
                return false;
            }
        }
        // Reap the native handle so its resources are released.
        let join = self.inner.state.lock().join.take();
        if let Some(join) = join {
            let _ = join.join();
        }
        true
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::error!(thread = %self.inner.name, "thread handle dropped while running");
            return;
        }
        // Run the awaiter-side cleanup callbacks, newest first.
        let mut calls = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.cleanup_calls)
        };
        while let Some(call) = calls.pop() {
            (call.code)();
        }
    }
}

fn runner(inner: Arc<ThreadInner>, body: Box<dyn FnOnce() + Send>) {
    inner.id.store(current_id(), Ordering::SeqCst);
    CURRENT.with(|current| *current.borrow_mut() = Some(Arc::clone(&inner)));
    inner.is_running.store(true, Ordering::SeqCst);
    tracing::debug!(thread = %inner.name, id = current_id(), "thread started");
    inner.started.wake_all();

    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(()) => {}
        Err(payload) => {
            if payload.downcast_ref::<TerminateUnwind>().is_some() {
                tracing::debug!(thread = %inner.name, "thread cancelled");
            } else {
                tracing::warn!(
                    thread = %inner.name,
                    reason = panic_message(&payload),
                    "thread body failed"
                );
            }
        }
    }

    cleanup(&inner);
}

/// Runs the cleanup routine and the in-thread cleanup callbacks, then
/// marks the thread finished. Sole caller is `runner`, so this happens
/// exactly once per run.
fn cleanup(inner: &Arc<ThreadInner>) {
    inner.in_cleanup.store(true, Ordering::SeqCst);
    inner.term_disable.fetch_add(1, Ordering::SeqCst);

    let (cleanup_fn, in_thread_calls) = {
        let mut state = inner.state.lock();
        let cleanup_fn = state.cleanup.take();
        let mut kept = Vec::new();
        let mut in_thread = Vec::new();
        for call in state.cleanup_calls.drain(..) {
            if call.in_thread {
                in_thread.push(call.code);
            } else {
                kept.push(call);
            }
        }
        state.cleanup_calls = kept;
        (cleanup_fn, in_thread)
    };

    if let Some(cleanup_fn) = cleanup_fn
        && panic::catch_unwind(AssertUnwindSafe(cleanup_fn)).is_err()
    {
        tracing::error!(thread = %inner.name, "panic during thread cleanup");
    }
    for code in in_thread_calls.into_iter().rev() {
        if panic::catch_unwind(AssertUnwindSafe(code)).is_err() {
            tracing::error!(thread = %inner.name, "panic during thread cleanup call");
        }
    }

    tracing::debug!(thread = %inner.name, "thread cleanup complete");
    inner.id.store(0, Ordering::SeqCst);
    inner.term_disable.fetch_sub(1, Ordering::SeqCst);
    inner.in_cleanup.store(false, Ordering::SeqCst);
    inner.is_running.store(false, Ordering::SeqCst);
    inner.is_finished.store(true, Ordering::SeqCst);
    CURRENT.with(|current| *current.borrow_mut() = None);
    inner.stopped.wake_all();
}

/// Maps a -127..=127 priority onto the policy's native range and
/// applies it. Best effort: many systems refuse priority changes for
/// unprivileged processes.
#[cfg(unix)]
fn apply_priority(handle: &std::thread::JoinHandle<()>, priority: i8) {
    use std::os::unix::thread::JoinHandleExt;

    if priority == 0 {
        return;
    }
    unsafe {
        let tid = handle.as_pthread_t();
        let mut policy: libc::c_int = 0;
        let mut param: libc::sched_param = std::mem::zeroed();
        if libc::pthread_getschedparam(tid, &mut policy, &mut param) != 0 {
            tracing::warn!("pthread_getschedparam failed, leaving priority alone");
            return;
        }
        let min = libc::sched_get_priority_min(policy);
        let max = libc::sched_get_priority_max(policy);
        if min < 0 || max <= min {
            return;
        }
        param.sched_priority = (i32::from(priority) + 127) * (max - min) / 255 + min;
        let rc = libc::pthread_setschedparam(tid, policy, &param);
        if rc != 0 {
            tracing::debug!(rc, priority, "thread priority change rejected");
        }
    }
}

/// True when `payload` is the cancellation unwind raised by
/// `check_for_terminate`, which must be resumed rather than swallowed.
pub(crate) fn is_terminate_payload(payload: &Box<dyn std::any::Any + Send>) -> bool {
    payload.downcast_ref::<TerminateUnwind>().is_some()
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

fn with_current<R>(f: impl FnOnce(&Arc<ThreadInner>) -> R) -> Option<R> {
    CURRENT.with(|current| current.borrow().as_ref().map(f))
}

/// Enters a section that must not be interrupted by a termination
/// request. Nestable; a no-op outside a managed thread.
pub fn disable_termination() {
    with_current(|inner| {
        inner.term_disable.fetch_add(1, Ordering::SeqCst);
    });
}

pub fn enable_termination() {
    with_current(|inner| {
        if inner.term_disable.fetch_sub(1, Ordering::SeqCst) <= 0 {
            inner.term_disable.store(0, Ordering::SeqCst);
        }
    });
}

/// Safe-point check. Unwinds into the cleanup path when a non-disabled
/// termination request is pending; otherwise reports whether one is
/// pending at all.
pub fn check_for_terminate() -> bool {
    let pending = with_current(|inner| {
        let requested = inner.terminate_requested.load(Ordering::SeqCst);
        if requested && inner.term_disable.load(Ordering::SeqCst) == 0 {
            panic::panic_any(TerminateUnwind);
        }
        requested
    });
    pending.unwrap_or(false)
}

/// True when a blocking wait on the calling thread should abort early.
pub(crate) fn wait_cancelled() -> bool {
    with_current(|inner| {
        inner.terminate_requested.load(Ordering::SeqCst)
            && inner.term_disable.load(Ordering::SeqCst) == 0
    })
    .unwrap_or(false)
}

/// Cancellable sleep: returns early when termination is requested.
pub fn sleep_ms(ms: u32) {
    let deadline = std::time::Instant::now() + Duration::from_millis(u64::from(ms));
    loop {
        if wait_cancelled() {
            return;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}

pub fn yield_now() {
    std::thread::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INFINITE;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ids_are_distinct() {
        let mine = current_id();
        assert_ne!(mine, 0);
        assert_eq!(mine, current_id());
        let other = std::thread::spawn(current_id).join().unwrap();
        assert_ne!(mine, other);
    }

    #[test]
    fn test_cleanup_after_normal_return() {
        let ran = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));

        let ran2 = Arc::clone(&ran);
        let t = Thread::new("worker", move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        let cleaned2 = Arc::clone(&cleaned);
        t.set_cleanup(move || {
            cleaned2.fetch_add(1, Ordering::SeqCst);
        });

        t.start(true).unwrap();
        assert!(t.wait(INFINITE));
        assert!(t.is_finished());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_after_panicking_body() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let t = Thread::new("panicky", || panic!("deliberate failure"));
        let cleaned2 = Arc::clone(&cleaned);
        t.set_cleanup(move || {
            cleaned2.fetch_add(1, Ordering::SeqCst);
        });

        t.start(false).unwrap();
        assert!(t.wait(INFINITE));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_after_cancellation() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let t = Thread::new("cancellable", || {
            loop {
                check_for_terminate();
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        let cleaned2 = Arc::clone(&cleaned);
        t.set_cleanup(move || {
            cleaned2.fetch_add(1, Ordering::SeqCst);
        });

        t.start(true).unwrap();
        t.request_termination();
        assert!(t.wait(5000));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disable_termination_brackets() {
        let progress = Arc::new(AtomicUsize::new(0));
        let progress2 = Arc::clone(&progress);
        let t = Thread::new("guarded", move || {
            disable_termination();
            for _ in 0..5 {
                // Requests arriving here must not interrupt us.
                check_for_terminate();
                progress2.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
            }
            enable_termination();
            loop {
                check_for_terminate();
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        t.start(true).unwrap();
        t.request_termination();
        assert!(t.wait(5000));
        assert_eq!(progress.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_cleanup_call_order() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let t = Thread::new("ordered", || {});
        for i in 0..3 {
            let order = Arc::clone(&order);
            t.add_cleanup_call(
                move || {
                    order.lock().unwrap().push(i);
                },
                true,
            );
        }
        t.start(false).unwrap();
        assert!(t.wait(INFINITE));
        // Last registered runs first.
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_awaiter_cleanup_call_runs_on_drop() {
        let ran = Arc::new(AtomicUsize::new(0));
        let t = Thread::new("deferred", || {});
        let ran2 = Arc::clone(&ran);
        t.add_cleanup_call(
            move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        t.start(false).unwrap();
        assert!(t.wait(INFINITE));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        drop(t);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_twice_fails() {
        let t = Thread::new("once", || std::thread::sleep(Duration::from_millis(50)));
        t.start(true).unwrap();
        assert!(matches!(t.start(false), Err(ThreadsError::AlreadyStarted)));
        assert!(t.wait(INFINITE));
    }

    #[test]
    fn test_wait_timeout_on_running_thread() {
        let t = Thread::new("slow", || std::thread::sleep(Duration::from_millis(200)));
        t.start(true).unwrap();
        assert!(!t.wait(20));
        assert!(t.wait(INFINITE));
    }
}
