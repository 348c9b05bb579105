//!
//! ## Concurrency primitives for the larch toolkit
//!
//! Threading support built for latency-sensitive desktop use: a
//! recursive mutex that spins before it sleeps, wait conditions with
//! auto- and manual-reset semantics, a writer-preferring reader-writer
//! lock with read-to-write upgrade, threads with guaranteed-once
//! cleanup and cooperative cancellation, and a thread pool with
//! delayed dispatch.
//!
//! Blocking operations take timeouts in milliseconds; [`INFINITE`]
//! waits forever.
//!

mod atomic;
mod cache;
mod error;
mod mutex;
mod pool;
mod rwlock;
pub mod thread;
mod tls;
mod wait;

/// Timeout value meaning "wait forever".
pub const INFINITE: u32 = u32::MAX;

pub use atomic::{AtomicCounter, SpinLock};
pub use error::ThreadsError;
pub use mutex::{DEFAULT_SPIN_COUNT, Mutex, MutexHold};
pub use pool::{CancelledState, ThreadPool, Token};
pub use rwlock::{ReadHold, ReadWriteLock, WriteHold};
pub use thread::{SchedulerScope, Thread};
pub use tls::ThreadLocalSlot;
pub use wait::WaitCondition;
