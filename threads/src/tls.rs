///
/// Thread-local slot
///
/// One pointer-sized value per thread per slot, default zero. Slot keys
/// are drawn from a process-wide counter and never reused; a thread's
/// values die with the thread, so a slot owns no cross-thread state and
/// release is just retiring the key.
///
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SLOT_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SLOT_VALUES: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

#[derive(Debug)]
pub struct ThreadLocalSlot {
    key: u64,
}

impl Default for ThreadLocalSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadLocalSlot {
    pub fn new() -> Self {
        Self {
            key: NEXT_SLOT_KEY.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn get(&self) -> usize {
        SLOT_VALUES.with(|values| values.borrow().get(&self.key).copied().unwrap_or(0))
    }

    pub fn set(&self, value: usize) {
        SLOT_VALUES.with(|values| {
            let mut values = values.borrow_mut();
            if value == 0 {
                values.remove(&self.key);
            } else {
                values.insert(self.key, value);
            }
        });
    }
}

impl Drop for ThreadLocalSlot {
    fn drop(&mut self) {
        // This thread's entry is all we can reach; other threads'
        // entries disappear when those threads exit. try_with: the slot
        // may be dropped during thread teardown.
        let _ = SLOT_VALUES.try_with(|values| {
            values.borrow_mut().remove(&self.key);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_defaults_to_zero() {
        let slot = ThreadLocalSlot::new();
        assert_eq!(slot.get(), 0);
        slot.set(7);
        assert_eq!(slot.get(), 7);
        slot.set(0);
        assert_eq!(slot.get(), 0);
    }

    #[test]
    fn test_per_thread_isolation() {
        let slot = Arc::new(ThreadLocalSlot::new());
        slot.set(1);

        let handles: Vec<_> = (1..=4u32)
            .map(|i| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || {
                    assert_eq!(slot.get(), 0);
                    slot.set(i as usize * 10);
                    assert_eq!(slot.get(), i as usize * 10);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(slot.get(), 1);
    }

    #[test]
    fn test_slots_independent() {
        let a = ThreadLocalSlot::new();
        let b = ThreadLocalSlot::new();
        a.set(5);
        assert_eq!(b.get(), 0);
        b.set(9);
        assert_eq!(a.get(), 5);
    }
}
