// Copyright (c) 2025 CyberCache Contributors
//
// Dense thread-id registry. The record-lock wait mask has 63 usable
// bits, so thread ids come from a fixed pool rather than from the OS:
// 13 named service slots followed by the worker pool. Service threads
// therefore occupy the lowest indices, which is what gives them wakeup
// preference in the lockable-object unlock path.

use super::event::QuickEvent;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const TI_MAIN: usize = 0;
pub const TI_SIGNAL_HANDLER: usize = 1;
pub const TI_LISTENER: usize = 2;
pub const TI_LOGGER: usize = 3;
pub const TI_SESSION_BINLOG: usize = 4;
pub const TI_FPC_BINLOG: usize = 5;
pub const TI_BINLOG_LOADER: usize = 6;
pub const TI_BINLOG_SAVER: usize = 7;
pub const TI_SESSION_REPLICATOR: usize = 8;
pub const TI_FPC_REPLICATOR: usize = 9;
pub const TI_SESSION_OPTIMIZER: usize = 10;
pub const TI_FPC_OPTIMIZER: usize = 11;
pub const TI_TAG_MANAGER: usize = 12;
pub const TI_FIRST_CONNECTION_THREAD: usize = 13;

pub const MAX_NUM_CONNECTION_THREADS: usize = 50;

/// Total slots; must stay below 64 so every thread fits the wait mask
pub const MAX_NUM_THREADS: usize = TI_FIRST_CONNECTION_THREAD + MAX_NUM_CONNECTION_THREADS;

const _: () = assert!(MAX_NUM_THREADS < 64, "thread ids must fit a 63-bit mask");

struct ThreadSlot {
    event: QuickEvent,
    timed_event: QuickEvent,
    active: AtomicBool,
    quit: AtomicBool,
}

impl ThreadSlot {
    const fn new() -> Self {
        Self {
            event: QuickEvent::new(),
            timed_event: QuickEvent::new(),
            active: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        }
    }
}

static SLOTS: [ThreadSlot; MAX_NUM_THREADS] = {
    const SLOT: ThreadSlot = ThreadSlot::new();
    [SLOT; MAX_NUM_THREADS]
};

const NO_THREAD: usize = usize::MAX;

thread_local! {
    static CURRENT_ID: Cell<usize> = const { Cell::new(NO_THREAD) };
}

/// Releases the slot (and clears the thread-local id) on drop.
pub struct ThreadRegistration {
    id: usize,
}

impl ThreadRegistration {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        SLOTS[self.id].quit.store(false, Ordering::Relaxed);
        SLOTS[self.id].active.store(false, Ordering::Release);
        CURRENT_ID.with(|current| current.set(NO_THREAD));
    }
}

/// Claims a specific (service) slot for the calling thread.
pub fn register_thread(id: usize) -> ThreadRegistration {
    assert!(id < MAX_NUM_THREADS);
    let was_active = SLOTS[id].active.swap(true, Ordering::AcqRel);
    assert!(!was_active, "thread slot {id} is already taken");
    CURRENT_ID.with(|current| current.set(id));
    ThreadRegistration { id }
}

/// Claims the first free worker slot, if any.
pub fn register_worker_thread() -> Option<ThreadRegistration> {
    for id in TI_FIRST_CONNECTION_THREAD..MAX_NUM_THREADS {
        if !SLOTS[id].active.swap(true, Ordering::AcqRel) {
            CURRENT_ID.with(|current| current.set(id));
            return Some(ThreadRegistration { id });
        }
    }
    None
}

/// Dense index of the calling thread; the thread must be registered.
pub fn current_thread_id() -> usize {
    let id = CURRENT_ID.with(|current| current.get());
    assert!(id != NO_THREAD, "calling thread is not registered");
    id
}

pub fn is_registered() -> bool {
    CURRENT_ID.with(|current| current.get()) != NO_THREAD
}

pub fn wait_for_event() {
    SLOTS[current_thread_id()].event.wait();
}

pub fn trigger_event(id: usize) {
    SLOTS[id].event.trigger();
}

/// Returns `true` when triggered, `false` on timeout.
pub fn wait_for_timed_event(milliseconds: u32) -> bool {
    SLOTS[current_thread_id()]
        .timed_event
        .wait_timeout(Duration::from_millis(milliseconds as u64))
}

pub fn trigger_timed_event(id: usize) {
    SLOTS[id].timed_event.trigger();
}

pub fn quit_requested() -> bool {
    SLOTS[current_thread_id()].quit.load(Ordering::Relaxed)
}

pub fn request_quit(id: usize) {
    SLOTS[id].quit.store(true, Ordering::Relaxed);
    SLOTS[id].event.trigger();
    SLOTS[id].timed_event.trigger();
}

pub fn request_quit_all() {
    for id in 0..MAX_NUM_THREADS {
        if SLOTS[id].active.load(Ordering::Acquire) {
            request_quit(id);
        }
    }
}

///////////////////////////////////////////////////////////////////////////
// LOCK-ORDERING AUDIT (debug builds)
///////////////////////////////////////////////////////////////////////////

// A thread may hold at most one record mutex, one shared mutex, and one
// queue operation, acquired in the order queue -> shared -> record.
// Violations indicate a deadlock-capable code path.
#[cfg(any(debug_assertions, feature = "lock-audit"))]
pub mod audit {
    use std::cell::Cell;

    thread_local! {
        static QUEUE_OPS: Cell<u32> = const { Cell::new(0) };
        static SHARED_LOCKS: Cell<u32> = const { Cell::new(0) };
        static RECORD_LOCKS: Cell<u32> = const { Cell::new(0) };
    }

    pub fn enter_queue_op() {
        QUEUE_OPS.with(|c| {
            assert_eq!(c.get(), 0, "nested message-queue operations");
            assert_eq!(
                SHARED_LOCKS.with(Cell::get),
                0,
                "queue operation while holding a shared mutex"
            );
            assert_eq!(
                RECORD_LOCKS.with(Cell::get),
                0,
                "queue operation while holding a record mutex"
            );
            c.set(1);
        });
    }

    pub fn exit_queue_op() {
        QUEUE_OPS.with(|c| c.set(c.get() - 1));
    }

    pub fn enter_shared_lock() {
        SHARED_LOCKS.with(|c| {
            assert_eq!(c.get(), 0, "nested shared-mutex acquisition");
            assert_eq!(
                RECORD_LOCKS.with(Cell::get),
                0,
                "shared mutex acquired while holding a record mutex"
            );
            c.set(1);
        });
    }

    pub fn exit_shared_lock() {
        SHARED_LOCKS.with(|c| c.set(c.get() - 1));
    }

    pub fn enter_record_lock() {
        RECORD_LOCKS.with(|c| {
            assert_eq!(c.get(), 0, "a thread may lock only one record at a time");
            c.set(1);
        });
    }

    pub fn exit_record_lock() {
        RECORD_LOCKS.with(|c| c.set(c.get() - 1));
    }
}

#[cfg(not(any(debug_assertions, feature = "lock-audit")))]
pub mod audit {
    #[inline(always)]
    pub fn enter_queue_op() {}
    #[inline(always)]
    pub fn exit_queue_op() {}
    #[inline(always)]
    pub fn enter_shared_lock() {}
    #[inline(always)]
    pub fn exit_shared_lock() {}
    #[inline(always)]
    pub fn enter_record_lock() {}
    #[inline(always)]
    pub fn exit_record_lock() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_worker_slots_are_dense_and_reusable() {
        let first = register_worker_thread().unwrap();
        let first_id = first.id();
        assert!(first_id >= TI_FIRST_CONNECTION_THREAD);
        assert_eq!(current_thread_id(), first_id);
        drop(first);
        assert!(!is_registered());
        let again = register_worker_thread().unwrap();
        assert!(again.id() >= TI_FIRST_CONNECTION_THREAD);
    }

    #[test]
    fn test_quit_request_delivery() {
        let handle = thread::spawn(|| {
            let registration = register_worker_thread().unwrap();
            let id = registration.id();
            while !quit_requested() {
                wait_for_event();
            }
            id
        });
        thread::sleep(std::time::Duration::from_millis(20));
        // waking every worker slot is fine for the test
        for id in TI_FIRST_CONNECTION_THREAD..MAX_NUM_THREADS {
            request_quit(id);
        }
        handle.join().unwrap();
        for id in TI_FIRST_CONNECTION_THREAD..MAX_NUM_THREADS {
            SLOTS[id].quit.store(false, Ordering::Relaxed);
        }
    }
}
