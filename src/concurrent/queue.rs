// Copyright (c) 2025 CyberCache Contributors
//
// Bounded message queue carrying work between threads. Capacity starts
// small and doubles on demand up to a hard ceiling; producers never
// block (a full queue at its ceiling is a hard error surfaced to the
// caller), consumers block with a timeout so they can poll their quit
// flag between units of work.

use crate::concurrent::registry::audit;
use crate::error::{CacheError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

pub struct MessageQueue<T> {
    state: Mutex<QueueState<T>>,
    receivable: Condvar,
    max_capacity: usize,
}

impl<T> MessageQueue<T> {
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        let initial = initial_capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(initial),
                capacity: initial,
                closed: false,
            }),
            receivable: Condvar::new(),
            max_capacity: max_capacity.max(initial),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Enqueues an item, growing the queue when the current capacity is
    /// exhausted. Fails when the queue is closed or at its ceiling.
    pub fn put(&self, item: T) -> Result<()> {
        audit::enter_queue_op();
        let result = {
            let mut state = self.state.lock();
            if state.closed {
                Err(CacheError::Queue("queue is shut down".to_string()))
            } else if state.items.len() == state.capacity && !self.grow(&mut state) {
                Err(CacheError::Queue(format!(
                    "queue is full at maximum capacity {}",
                    self.max_capacity
                )))
            } else {
                state.items.push_back(item);
                self.receivable.notify_one();
                Ok(())
            }
        };
        audit::exit_queue_op();
        result
    }

    fn grow(&self, state: &mut QueueState<T>) -> bool {
        if state.capacity >= self.max_capacity {
            return false;
        }
        state.capacity = (state.capacity * 2).min(self.max_capacity);
        state.items.reserve(state.capacity - state.items.len());
        true
    }

    /// Blocks until an item arrives, the timeout expires, or the queue
    /// is closed and drained.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        audit::enter_queue_op();
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        let item = loop {
            if let Some(item) = state.items.pop_front() {
                break Some(item);
            }
            if state.closed {
                break None;
            }
            if self.receivable.wait_until(&mut state, deadline).timed_out() {
                break state.items.pop_front();
            }
        };
        drop(state);
        audit::exit_queue_op();
        item
    }

    pub fn try_get(&self) -> Option<T> {
        audit::enter_queue_op();
        let item = self.state.lock().items.pop_front();
        audit::exit_queue_op();
        item
    }

    /// Wakes all consumers; subsequent `put` calls fail, `get` drains
    /// whatever is left and then returns `None`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.receivable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new(2, 16);
        queue.put(1).unwrap();
        queue.put(2).unwrap();
        queue.put(3).unwrap(); // forces a grow
        assert_eq!(queue.try_get(), Some(1));
        assert_eq!(queue.try_get(), Some(2));
        assert_eq!(queue.try_get(), Some(3));
        assert_eq!(queue.try_get(), None);
    }

    #[test]
    fn test_capacity_ceiling() {
        let queue = MessageQueue::new(1, 2);
        queue.put(1).unwrap();
        queue.put(2).unwrap();
        assert!(queue.put(3).is_err());
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn test_blocking_get_with_producer() {
        let queue = Arc::new(MessageQueue::new(4, 64));
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.put(42u32).unwrap();
        });
        let item = queue.get_timeout(Duration::from_secs(5));
        assert_eq!(item, Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_get_timeout_expires() {
        let queue: MessageQueue<u32> = MessageQueue::new(4, 64);
        let start = std::time::Instant::now();
        assert_eq!(queue.get_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_close_wakes_consumers() {
        let queue: Arc<MessageQueue<u32>> = Arc::new(MessageQueue::new(4, 64));
        let consumer = Arc::clone(&queue);
        let handle = thread::spawn(move || consumer.get_timeout(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(handle.join().unwrap(), None);
        assert!(queue.put(1).is_err());
    }
}
