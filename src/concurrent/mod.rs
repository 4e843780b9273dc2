// Copyright (c) 2025 CyberCache Contributors
//
// Concurrency substrate: per-record mutexes packed into a single 64-bit
// word, the reader-count semaphore that pins record payloads, futex-backed
// per-thread events, the dense thread-id registry, and the bounded
// message queues that carry work between service and worker threads.

pub mod event;
pub mod lockable;
pub mod queue;
pub mod registry;
pub mod semaphore;

pub use event::QuickEvent;
pub use lockable::{Lockable, LockableGuard};
pub use queue::MessageQueue;
pub use semaphore::QuickSemaphore;
