// Copyright (c) 2025 CyberCache Contributors
//
// Per-record mutex, the most compact implementation the thread model
// allows: one 64-bit word per record. Bit 63 is the "locked" flag, bits
// 0..62 form the mask of threads waiting on the record (by dense thread
// index). Contended threads park on their own futex event; the unlocker
// restores the remaining mask and wakes the lowest-indexed waiter, so
// service threads take precedence over the worker pool.
//
// State word layout:
// - Bit 63: locked flag
// - Bits 0..62: waiting-thread mask

use super::registry::{self, audit, MAX_NUM_THREADS};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

const LOCKED: u64 = 0x8000_0000_0000_0000;

/// The bare lock word; embed through `Lockable<T>` unless the guarded
/// data lives elsewhere.
pub struct LockWord {
    state: AtomicU64,
}

impl LockWord {
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Locks the word; parks on the calling thread's event while another
    /// thread holds it.
    pub fn lock(&self) {
        audit::enter_record_lock();
        let thread_mask = 1u64 << registry::current_thread_id();
        let locking_mask = thread_mask | LOCKED;
        while self.state.fetch_or(locking_mask, Ordering::AcqRel) & LOCKED != 0 {
            registry::wait_for_event();
        }
        // Remove this thread from the wait list. Relaxed is enough: the
        // unlock path modifies the mask once more, and only this thread
        // needs to see the cleared bit before then. Clearing here also
        // means try_lock() never has to touch the mask at all.
        self.state.fetch_and(!thread_mask, Ordering::Relaxed);
    }

    /// Single attempt; never sets a wait bit.
    pub fn try_lock(&self) -> bool {
        if self.state.fetch_or(LOCKED, Ordering::AcqRel) & LOCKED == 0 {
            audit::enter_record_lock();
            true
        } else {
            false
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & LOCKED != 0
    }

    /// Unlocks; the caller must be the thread that locked the word.
    pub fn unlock(&self) {
        // Clear the flag AND fetch the wait mask in one atomic motion.
        // Another thread may lock (and even unlock) the word before we
        // proceed; that is fine, because it cannot see the mask we just
        // took, so it can only wake threads that parked after this point.
        let mask = self.state.swap(0, Ordering::AcqRel) & !LOCKED;
        if mask != 0 {
            for id in 0..MAX_NUM_THREADS {
                let bit = 1u64 << id;
                if mask & bit != 0 {
                    // restore the remaining waiters before waking one
                    self.state.fetch_or(mask & !bit, Ordering::AcqRel);
                    registry::trigger_event(id);
                    break;
                }
            }
        }
        audit::exit_record_lock();
    }

    /// Current wait mask; zero whenever the lock is free and quiescent.
    pub fn wait_mask(&self) -> u64 {
        self.state.load(Ordering::Acquire) & !LOCKED
    }
}

/// A value guarded by a `LockWord`; the guard is the only access path.
pub struct Lockable<T> {
    word: LockWord,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Lockable<T> {}
unsafe impl<T: Send> Sync for Lockable<T> {}

impl<T> Lockable<T> {
    pub const fn new(data: T) -> Self {
        Self {
            word: LockWord::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> LockableGuard<'_, T> {
        self.word.lock();
        LockableGuard { lockable: self }
    }

    pub fn try_lock(&self) -> Option<LockableGuard<'_, T>> {
        if self.word.try_lock() {
            Some(LockableGuard { lockable: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.is_locked()
    }

    pub fn word(&self) -> &LockWord {
        &self.word
    }

    /// Direct access when the caller has exclusive ownership.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct LockableGuard<'a, T> {
    lockable: &'a Lockable<T>,
}

impl<T> Deref for LockableGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lockable.data.get() }
    }
}

impl<T> DerefMut for LockableGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lockable.data.get() }
    }
}

impl<T> Drop for LockableGuard<'_, T> {
    fn drop(&mut self) {
        self.lockable.word.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::registry::register_worker_thread;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_exclusive_access() {
        let lockable = Arc::new(Lockable::new(0u64));
        let mut handles = vec![];
        for _ in 0..8 {
            let lockable = Arc::clone(&lockable);
            handles.push(thread::spawn(move || {
                let _registration = register_worker_thread().unwrap();
                for _ in 0..1000 {
                    let mut guard = lockable.lock();
                    *guard += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let _registration = register_worker_thread().unwrap();
        assert_eq!(*lockable.lock(), 8000);
        // nobody is waiting once everything is released
        assert_eq!(lockable.word().wait_mask(), 0);
        assert!(!lockable.is_locked());
    }

    #[test]
    fn test_try_lock_contention() {
        let lockable = Arc::new(Lockable::new(()));
        let registration = register_worker_thread().unwrap();
        let guard = lockable.lock();
        let other = Arc::clone(&lockable);
        let handle = thread::spawn(move || {
            let _registration = register_worker_thread().unwrap();
            other.try_lock().is_some()
        });
        assert!(!handle.join().unwrap());
        drop(guard);
        assert!(lockable.try_lock().is_some());
        drop(registration);
    }

    #[test]
    fn test_waiter_mask_reaches_zero() {
        let lockable = Arc::new(Lockable::new(0u32));
        let mut handles = vec![];
        for _ in 0..4 {
            let lockable = Arc::clone(&lockable);
            handles.push(thread::spawn(move || {
                let _registration = register_worker_thread().unwrap();
                for _ in 0..200 {
                    *lockable.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lockable.word().wait_mask(), 0);
    }
}
