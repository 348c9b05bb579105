///
/// Reader-writer lock with writer preference and read-to-write upgrade
///
/// Any number of readers may hold the lock at once; a writer holds it
/// alone (apart from its own nested reads). A writer declares intent
/// before draining readers, and fresh readers defer to pending writers,
/// so a stream of readers cannot starve a writer.
///
/// A thread already holding a read lock may lock for write. Its own
/// read holds are parked while the remaining readers drain, then
/// restored once it owns the write lock. The upgrade is not atomic:
/// when another writer got in between, `lock(true)` returns true so the
/// caller knows state read under the read lock may be stale.
///
/// Read and write acquisition are independently recursive. Blocked
/// acquisitions are bracketed against termination requests, so a
/// thread is never cancelled part-way through taking the lock.
///
use crate::INFINITE;
use crate::mutex::Protected;
use crate::thread::{self, current_id};
use crate::tls::ThreadLocalSlot;
use crate::wait::WaitCondition;

/// Re-poll interval for acquisition waits. A wake can fire in the
/// window between releasing the state guard and blocking on the wait
/// condition; the bound turns a missed wake into a short stall.
const ACQUIRE_POLL_MS: u32 = 100;

struct RwState {
    /// Active read holds, including a writer's own nested reads.
    read_count: u32,
    /// Writers that have declared intent and not yet fully released.
    prewrite_count: u32,
    /// Read holds parked by threads currently upgrading to write.
    parked_reads: u32,
    /// Recursion depth of the active writer.
    write_count: u32,
    write_owner: u64,
    /// Set when a writer ran while some thread's read lock was parked.
    read_lock_lost: bool,
}

pub struct ReadWriteLock {
    state: Protected<RwState>,
    /// Woken when `write_count` reaches zero.
    writers_idle: WaitCondition,
    /// Woken when `read_count` reaches zero.
    readers_drained: WaitCondition,
    /// Woken when `prewrite_count` reaches zero.
    no_pending_writers: WaitCondition,
    /// The calling thread's own read hold depth.
    thread_read_count: ThreadLocalSlot,
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadWriteLock {
    pub fn new() -> Self {
        Self {
            state: Protected::new(RwState {
                read_count: 0,
                prewrite_count: 0,
                parked_reads: 0,
                write_count: 0,
                write_owner: 0,
                read_lock_lost: false,
            }),
            writers_idle: WaitCondition::new(true, false),
            readers_drained: WaitCondition::new(true, false),
            no_pending_writers: WaitCondition::new(true, false),
            thread_read_count: ThreadLocalSlot::new(),
        }
    }

    /// Acquires the lock. For a write acquisition that upgraded from a
    /// read lock, the return value is true when another writer ran in
    /// between and read atomicity was lost; otherwise false.
    pub fn lock(&self, for_write: bool) -> bool {
        thread::disable_termination();
        let lost = if for_write {
            self.lock_write()
        } else {
            self.lock_read();
            false
        };
        thread::enable_termination();
        lost
    }

    fn lock_read(&self) {
        let my = current_id();
        let mut state = self.state.lock();
        // Nested reads, and reads inside our own write lock, never wait.
        if state.write_owner != my && self.thread_read_count.get() == 0 {
            while state.write_count > 0 || state.prewrite_count > 0 {
                drop(state);
                self.no_pending_writers.wait(ACQUIRE_POLL_MS);
                state = self.state.lock();
            }
        }
        state.read_count += 1;
        self.thread_read_count.set(self.thread_read_count.get() + 1);
    }

    fn lock_write(&self) -> bool {
        let my = current_id();
        let mut state = self.state.lock();
        if state.write_owner == my {
            state.write_count += 1;
            return false;
        }
        state.prewrite_count += 1;

        // Park our own read holds so the drain below can complete.
        let own_reads = self.thread_read_count.get() as u32;
        if own_reads > 0 {
            state.read_count -= own_reads;
            state.parked_reads += own_reads;
            if state.read_count == 0 {
                self.readers_drained.wake_all();
            }
        }

        while state.write_count > 0 || state.read_count > 0 {
            let wc = if state.write_count > 0 {
                &self.writers_idle
            } else {
                &self.readers_drained
            };
            drop(state);
            wc.wait(ACQUIRE_POLL_MS);
            state = self.state.lock();
        }

        if own_reads > 0 {
            state.parked_reads -= own_reads;
            state.read_count += own_reads;
        }
        let other_upgraders = state.parked_reads != 0;
        state.write_owner = my;
        state.write_count = 1;

        let lost = if own_reads > 0 {
            let lost = state.read_lock_lost;
            state.read_lock_lost = false;
            lost
        } else {
            false
        };
        // Threads whose reads are still parked will see us having
        // written under them.
        if other_upgraders {
            state.read_lock_lost = true;
        }
        lost
    }

    /// Acquires the lock only when that cannot block. A write attempt
    /// while other threads hold reads fails rather than drains.
    pub fn try_lock(&self, for_write: bool) -> bool {
        let my = current_id();
        let mut state = self.state.lock();
        if for_write {
            if state.write_owner == my {
                state.write_count += 1;
                return true;
            }
            let own_reads = self.thread_read_count.get() as u32;
            if state.write_count > 0
                || state.prewrite_count > 0
                || state.read_count != own_reads
            {
                return false;
            }
            state.prewrite_count += 1;
            state.write_owner = my;
            state.write_count = 1;
            true
        } else {
            if state.write_owner != my
                && self.thread_read_count.get() == 0
                && (state.write_count > 0 || state.prewrite_count > 0)
            {
                return false;
            }
            state.read_count += 1;
            self.thread_read_count.set(self.thread_read_count.get() + 1);
            true
        }
    }

    pub fn unlock(&self, for_write: bool) {
        if for_write {
            self.unlock_write();
        } else {
            self.unlock_read();
        }
    }

    fn unlock_write(&self) {
        let my = current_id();
        let mut state = self.state.lock();
        if state.write_owner != my {
            debug_assert!(
                false,
                "ReadWriteLock::unlock(true) performed by thread which did not own write lock"
            );
            tracing::error!(
                owner = state.write_owner,
                caller = my,
                "ReadWriteLock::unlock(true) performed by thread which did not own write lock"
            );
            return;
        }
        state.write_count -= 1;
        if state.write_count > 0 {
            return;
        }
        state.write_owner = 0;
        self.writers_idle.wake_all();
        if state.read_count == 0 {
            self.readers_drained.wake_all();
        }
        state.prewrite_count -= 1;
        if state.prewrite_count == 0 {
            self.no_pending_writers.wake_all();
        }
    }

    fn unlock_read(&self) {
        let own_reads = self.thread_read_count.get();
        let mut state = self.state.lock();
        if own_reads == 0 {
            debug_assert!(
                false,
                "ReadWriteLock::unlock(false) performed by thread which held no read lock"
            );
            tracing::error!(
                caller = current_id(),
                "ReadWriteLock::unlock(false) performed by thread which held no read lock"
            );
            return;
        }
        self.thread_read_count.set(own_reads - 1);
        state.read_count -= 1;
        if state.read_count == 0 {
            self.readers_drained.wake_all();
        }
    }
}

/// RAII read hold.
pub struct ReadHold<'a> {
    lock: &'a ReadWriteLock,
}

impl<'a> ReadHold<'a> {
    pub fn new(lock: &'a ReadWriteLock) -> Self {
        lock.lock(false);
        Self { lock }
    }
}

impl Drop for ReadHold<'_> {
    fn drop(&mut self) {
        self.lock.unlock(false);
    }
}

/// RAII write hold. `lock_lost` reports whether an upgrade from an
/// already-held read lock lost atomicity.
pub struct WriteHold<'a> {
    lock: &'a ReadWriteLock,
    lock_lost: bool,
}

impl<'a> WriteHold<'a> {
    pub fn new(lock: &'a ReadWriteLock) -> Self {
        let lock_lost = lock.lock(true);
        Self { lock, lock_lost }
    }

    pub fn lock_lost(&self) -> bool {
        self.lock_lost
    }
}

impl Drop for WriteHold<'_> {
    fn drop(&mut self) {
        self.lock.unlock(true);
    }
}
