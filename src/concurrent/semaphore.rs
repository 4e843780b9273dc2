// Copyright (c) 2025 CyberCache Contributors
//
// Reader-count semaphore attached to every payload record. Readers pin
// the record's payload while response writers stream it out; a writer
// that needs to replace or dispose the buffer publishes its thread index
// and parks until the last reader leaves.
//
// State word layout (32 bits):
// - Bits 0..23: reader count (16M+ readers)
// - Bits 24..31: waiting writer's thread index PLUS ONE (zero = none);
//   keeping index+1 makes the scheme work for the main thread (index 0)
//
// Caller contract, which is what makes one byte enough for the writer
// side: `register_reader()` and `wait_until_no_readers()` are only
// called under the record's mutex, so no new reader can slip in while a
// writer waits, and at most one writer can be waiting at a time.
// `has_readers()` and `unregister_reader()` may be called at any time.

use super::registry;
use std::sync::atomic::{AtomicU32, Ordering};

const READERS_COUNT_MASK: u32 = 0x00FF_FFFF;
const WRITER_THREAD_INDEX_MASK: u32 = 0xFF00_0000;
const WRITER_THREAD_INDEX_SHIFT: u32 = 24;

pub struct QuickSemaphore {
    state: AtomicU32,
}

impl QuickSemaphore {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    pub fn has_readers(&self) -> bool {
        self.state.load(Ordering::Acquire) & READERS_COUNT_MASK != 0
    }

    pub fn reader_count(&self) -> u32 {
        self.state.load(Ordering::Acquire) & READERS_COUNT_MASK
    }

    /// Record lock must be held; no writer may be waiting.
    pub fn register_reader(&self) {
        let state = self.state.fetch_add(1, Ordering::AcqRel);
        debug_assert!(state & READERS_COUNT_MASK != READERS_COUNT_MASK);
        debug_assert!(state & WRITER_THREAD_INDEX_MASK == 0);
    }

    pub fn unregister_reader(&self) {
        let state = self.state.fetch_sub(1, Ordering::AcqRel);
        let num_readers = state & READERS_COUNT_MASK;
        debug_assert!(num_readers != 0);
        if num_readers == 1 && state & WRITER_THREAD_INDEX_MASK != 0 {
            let writer_index = (state >> WRITER_THREAD_INDEX_SHIFT) as usize - 1;
            registry::trigger_event(writer_index);
        }
    }

    /// Record lock must be held. Publishes the calling thread's index,
    /// parks until the reader count drains to zero, then clears the word.
    pub fn wait_until_no_readers(&self) {
        let thread_id = registry::current_thread_id();
        let waiting_mask = ((thread_id as u32) + 1) << WRITER_THREAD_INDEX_SHIFT;
        let state = self.state.fetch_or(waiting_mask, Ordering::AcqRel);
        debug_assert!(state & WRITER_THREAD_INDEX_MASK == 0);
        // the loop absorbs spurious wakeups of the shared thread event
        while self.state.load(Ordering::Acquire) & READERS_COUNT_MASK != 0 {
            registry::wait_for_event();
        }
        self.state.store(0, Ordering::Release);
    }
}

impl Default for QuickSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::registry::register_worker_thread;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reader_counting() {
        let semaphore = QuickSemaphore::new();
        assert!(!semaphore.has_readers());
        semaphore.register_reader();
        semaphore.register_reader();
        assert_eq!(semaphore.reader_count(), 2);
        semaphore.unregister_reader();
        assert!(semaphore.has_readers());
        semaphore.unregister_reader();
        assert!(!semaphore.has_readers());
    }

    #[test]
    fn test_writer_waits_for_last_reader() {
        let semaphore = Arc::new(QuickSemaphore::new());
        semaphore.register_reader();
        semaphore.register_reader();

        let writer_side = Arc::clone(&semaphore);
        let handle = thread::spawn(move || {
            let _registration = register_worker_thread().unwrap();
            writer_side.wait_until_no_readers();
            // postcondition: count is zero and the writer slot is clear
            assert_eq!(writer_side.state.load(Ordering::Acquire), 0);
        });

        // give the writer time to park
        thread::sleep(Duration::from_millis(20));
        semaphore.unregister_reader();
        thread::sleep(Duration::from_millis(20));
        semaphore.unregister_reader();
        handle.join().unwrap();
    }

    #[test]
    fn test_writer_does_not_wait_without_readers() {
        let _registration = register_worker_thread().unwrap();
        let semaphore = QuickSemaphore::new();
        semaphore.wait_until_no_readers(); // returns immediately
        assert!(!semaphore.has_readers());
    }
}
