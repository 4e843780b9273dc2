// Copyright (c) 2025 CyberCache Contributors
//
// Per-thread wait/wake primitive. On Linux this is a bare futex word:
// events cannot be associated with records (there would be millions of
// kernel objects), so each thread owns one event and record locks park
// on the owner thread's event. Other platforms fall back to a mutex and
// condvar pair with the same semantics.

#[cfg(target_os = "linux")]
mod imp {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    pub struct QuickEvent {
        state: AtomicU32,
    }

    impl QuickEvent {
        pub const fn new() -> Self {
            Self {
                state: AtomicU32::new(0),
            }
        }

        /// Blocks until another thread triggers this event. A trigger
        /// delivered before the wait makes it return immediately.
        pub fn wait(&self) {
            loop {
                if self.state.swap(0, Ordering::Acquire) != 0 {
                    return;
                }
                self.futex_wait(None);
            }
        }

        /// Returns `true` when triggered, `false` when the timeout ran
        /// out first.
        pub fn wait_timeout(&self, timeout: Duration) -> bool {
            let deadline = std::time::Instant::now() + timeout;
            loop {
                if self.state.swap(0, Ordering::Acquire) != 0 {
                    return true;
                }
                let now = std::time::Instant::now();
                if now >= deadline {
                    return self.state.swap(0, Ordering::Acquire) != 0;
                }
                self.futex_wait(Some(deadline - now));
            }
        }

        pub fn trigger(&self) {
            self.state.store(1, Ordering::Release);
            self.futex_wake();
        }

        #[cold]
        fn futex_wait(&self, timeout: Option<Duration>) {
            let ts = timeout.map(|t| libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: t.subsec_nanos() as libc::c_long,
            });
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicU32,
                    libc::FUTEX_WAIT,
                    0u32,
                    ts.as_ref()
                        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec),
                );
            }
        }

        #[cold]
        fn futex_wake(&self) {
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicU32,
                    libc::FUTEX_WAKE,
                    1i32,
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use parking_lot::{Condvar, Mutex};
    use std::time::Duration;

    pub struct QuickEvent {
        triggered: Mutex<bool>,
        condvar: Condvar,
    }

    impl QuickEvent {
        pub const fn new() -> Self {
            Self {
                triggered: Mutex::new(false),
                condvar: Condvar::new(),
            }
        }

        pub fn wait(&self) {
            let mut triggered = self.triggered.lock();
            while !*triggered {
                self.condvar.wait(&mut triggered);
            }
            *triggered = false;
        }

        pub fn wait_timeout(&self, timeout: Duration) -> bool {
            let deadline = std::time::Instant::now() + timeout;
            let mut triggered = self.triggered.lock();
            while !*triggered {
                if self.condvar.wait_until(&mut triggered, deadline).timed_out() {
                    break;
                }
            }
            let result = *triggered;
            *triggered = false;
            result
        }

        pub fn trigger(&self) {
            let mut triggered = self.triggered.lock();
            *triggered = true;
            self.condvar.notify_one();
        }
    }
}

pub use imp::QuickEvent;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_trigger_before_wait() {
        let event = QuickEvent::new();
        event.trigger();
        event.wait(); // must not block
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let event = Arc::new(QuickEvent::new());
        let waker = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.trigger();
        });
        event.wait();
        handle.join().unwrap();
    }

    #[test]
    fn test_timeout_expires() {
        let event = QuickEvent::new();
        let start = std::time::Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_timeout_wakes_early() {
        let event = Arc::new(QuickEvent::new());
        let waker = event.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            waker.trigger();
        });
        assert!(event.wait_timeout(Duration::from_secs(10)));
    }
}
