// Data structures stored in the cache hash tables.
//
// Three record kinds share the flags layout: session records
// (PAYLOAD), page records (FPC|PAYLOAD), and tag records (FPC, held in
// the tag index). A record's type bits never change after creation.
//
// Deletion is two-phase: BEING_DELETED freezes the record (no new
// reader pins, lookups treat it as absent) while readers registered
// earlier keep streaming the payload; DELETED means the record sits in
// a shard's reclamation queue and cannot be revived.

use crate::compression::Compressor;
use crate::concurrent::lockable::{Lockable, LockableGuard};
use crate::concurrent::registry;
use crate::concurrent::semaphore::QuickSemaphore;
use crate::memory::{Domain, Memory};
use crate::protocol::buffers::PayloadHost;
use crate::protocol::UserAgent;
use crate::store::tags::TagRefArray;
use crate::store::{timestamp, NEVER_EXPIRES};
use bytes::Bytes;
use std::sync::atomic::{AtomicU8, Ordering};

pub const HOF_FPC: u8 = 0x01; // belongs to the FPC domain
pub const HOF_PAYLOAD: u8 = 0x02; // record carries a payload
pub const HOF_LINKED_BY_OPTIMIZER: u8 = 0x04; // in an optimizer list
pub const HOF_LINKED_BY_TM: u8 = 0x08; // in tag-manager lists
pub const HOF_BEING_OPTIMIZED: u8 = 0x10; // optimizer is re-compressing
pub const HOF_OPTIMIZED: u8 = 0x20; // current compressor is the optimum
pub const HOF_BEING_DELETED: u8 = 0x40; // frozen; new readers refused
pub const HOF_DELETED: u8 = 0x80; // queued for reclamation

/// Record flags byte. Plain (relaxed) atomics are enough: writers hold
/// the record lock, and lock-free readers re-check after locking.
pub struct RecordFlags(AtomicU8);

impl RecordFlags {
    pub fn new(flags: u8) -> Self {
        Self(AtomicU8::new(flags))
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn are_set(&self, flags: u8) -> bool {
        self.get() & flags == flags
    }

    pub fn are_clear(&self, flags: u8) -> bool {
        self.get() & flags == 0
    }

    pub fn set(&self, flags: u8) {
        self.0.fetch_or(flags, Ordering::Relaxed);
    }

    pub fn clear(&self, flags: u8) {
        self.0.fetch_and(!flags, Ordering::Relaxed);
    }
}

/// Payload attached to a session or page record. `Zero` keeps a written
/// empty value distinguishable from "nothing was ever stored".
pub enum StoredPayload {
    None,
    Zero,
    Data {
        data: Bytes,
        usize: u32,
        compressor: Compressor,
    },
}

impl StoredPayload {
    pub fn is_present(&self) -> bool {
        !matches!(self, StoredPayload::None)
    }

    pub fn size(&self) -> u32 {
        match self {
            StoredPayload::Data { data, .. } => data.len() as u32,
            _ => 0,
        }
    }

    pub fn usize(&self) -> u32 {
        match self {
            StoredPayload::Data { usize, .. } => *usize,
            _ => 0,
        }
    }

    pub fn compressor(&self) -> Compressor {
        match self {
            StoredPayload::Data { compressor, .. } => *compressor,
            _ => Compressor::None,
        }
    }

    /// Replaces the buffer, releasing the old one's accounting. The
    /// caller must hold the record lock with no readers registered.
    pub fn replace(&mut self, new: StoredPayload, memory: &Memory) {
        if let StoredPayload::Data { data, .. } = self {
            memory.register_deallocation(data.len() as u64);
        }
        *self = new;
    }
}

///////////////////////////////////////////////////////////////////////////
// SessionRecord
///////////////////////////////////////////////////////////////////////////

/// Possible results of a session-lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLockResult {
    /// Lock acquired (or locking was a no-op)
    Success,
    /// The previous holder timed out and its lock was broken
    BrokeLock,
    /// The record went into deletion while waiting
    Deleted,
}

pub struct SessionBody {
    pub payload: StoredPayload,
    pub mod_time: u32,
    pub exp_time: u32,
    pub user_agent: UserAgent,
    pub num_writes: u16,
    /// mask of threads waiting for the session lock
    sl_threads: u64,
    /// request currently holding the session lock; 0 = unlocked
    sl_request_id: u32,
}

pub struct SessionRecord {
    hash: u64,
    name: Box<[u8]>,
    pub flags: RecordFlags,
    pub semaphore: QuickSemaphore,
    body: Lockable<SessionBody>,
}

impl SessionRecord {
    pub fn new(hash: u64, name: &[u8]) -> Self {
        debug_assert!(!name.is_empty() && name.len() <= u16::MAX as usize);
        let record = Self {
            hash,
            name: name.into(),
            flags: RecordFlags::new(HOF_PAYLOAD),
            semaphore: QuickSemaphore::new(),
            body: Lockable::new(SessionBody {
                payload: StoredPayload::None,
                mod_time: timestamp(),
                exp_time: NEVER_EXPIRES,
                user_agent: UserAgent::Unknown,
                num_writes: 0,
                sl_threads: 0,
                sl_request_id: 0,
            }),
        };
        record
            .memory()
            .register_allocation((std::mem::size_of::<Self>() + name.len()) as u64);
        crate::store::SESSION_OBJECTS_CREATED.increment();
        record
    }

    pub fn hash_code(&self) -> u64 {
        self.hash
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn memory(&self) -> &'static Memory {
        Domain::Session.memory()
    }

    pub fn lock_body(&self) -> LockableGuard<'_, SessionBody> {
        self.body.lock()
    }

    pub fn has_readers(&self) -> bool {
        self.semaphore.has_readers()
    }

    /// Locks the session for `request_id`. Called with the record body
    /// locked; the body lock is dropped and reacquired while waiting,
    /// and the returned guard is the one held on exit.
    ///
    /// The session lock is advisory and request-scoped: it only means
    /// anything when both the request id and the configured wait time
    /// are nonzero.
    pub fn lock_session<'a>(
        &'a self,
        mut guard: LockableGuard<'a, SessionBody>,
        request_id: u32,
        lock_wait_time: u32,
    ) -> (LockableGuard<'a, SessionBody>, SessionLockResult) {
        if request_id == 0 || lock_wait_time == 0 {
            return (guard, SessionLockResult::Success);
        }
        let mut locking_request_id = guard.sl_request_id;
        if locking_request_id == 0 || locking_request_id == request_id {
            guard.sl_request_id = request_id;
            return (guard, SessionLockResult::Success);
        }
        // Some other request holds the session. Publish this thread in
        // the waiter mask and wait with the record UNLOCKED; on wake the
        // record is relocked and the holder re-examined. It is possible
        // that a third request took the session while we slept; in that
        // case we must not break the newcomer's lock, so we wait again.
        let mask = 1u64 << registry::current_thread_id();
        guard.sl_threads |= mask;
        loop {
            crate::store::SESSION_LOCK_WAITS.increment();
            drop(guard);
            registry::wait_for_timed_event(lock_wait_time);
            guard = self.body.lock();
            if guard.sl_request_id != 0 && guard.sl_request_id != locking_request_id {
                // ownership changed hands while we slept; keep waiting
                locking_request_id = guard.sl_request_id;
            } else {
                guard.sl_threads &= !mask;
                // Checking the request id is more reliable than the
                // timed-event result: the holder may have released the
                // session at the very moment the timeout expired.
                let broke_the_lock = guard.sl_request_id != 0;
                if broke_the_lock {
                    crate::store::SESSION_BROKEN_LOCKS.increment();
                }
                if self.flags.are_set(HOF_BEING_DELETED) {
                    // record fields are still safe to touch, but the
                    // payload is off limits
                    crate::store::SESSION_ABORTED_LOCKS.increment();
                    guard.sl_request_id = 0;
                    return (guard, SessionLockResult::Deleted);
                }
                guard.sl_request_id = request_id;
                if broke_the_lock {
                    return (guard, SessionLockResult::BrokeLock);
                }
                return (guard, SessionLockResult::Success);
            }
        }
    }

    /// Releases the session lock held by `request_id` and wakes the
    /// lowest-indexed waiter. The waiter's mask bit is cleared by the
    /// waiter itself when it resumes.
    pub fn unlock_session(&self, guard: &mut LockableGuard<'_, SessionBody>, request_id: u32) {
        if request_id != 0 && guard.sl_request_id == request_id {
            if guard.sl_threads != 0 {
                for id in 0..registry::MAX_NUM_THREADS {
                    if guard.sl_threads & (1u64 << id) != 0 {
                        registry::trigger_timed_event(id);
                        break;
                    }
                }
            }
            guard.sl_request_id = 0;
        }
    }

    /// Wakes every session-lock waiter; used when the record is being
    /// deleted so they can observe the flag and give up.
    pub fn abort_session_waiters(&self, guard: &mut LockableGuard<'_, SessionBody>) {
        for id in 0..registry::MAX_NUM_THREADS {
            if guard.sl_threads & (1u64 << id) != 0 {
                registry::trigger_timed_event(id);
            }
        }
        guard.sl_request_id = 0;
    }
}

impl Drop for SessionRecord {
    fn drop(&mut self) {
        let memory = self.memory();
        if let StoredPayload::Data { data, .. } = &self.body.get_mut().payload {
            memory.register_deallocation(data.len() as u64);
        }
        memory.register_deallocation((std::mem::size_of::<Self>() + self.name.len()) as u64);
    }
}

impl PayloadHost for SessionRecord {
    fn unregister_reader(&self) {
        self.semaphore.unregister_reader();
    }
}

///////////////////////////////////////////////////////////////////////////
// PageRecord
///////////////////////////////////////////////////////////////////////////

pub struct PageBody {
    pub payload: StoredPayload,
    pub mod_time: u32,
    pub exp_time: u32,
    pub user_agent: UserAgent,
    pub tag_refs: TagRefArray,
}

pub struct PageRecord {
    hash: u64,
    name: Box<[u8]>,
    pub flags: RecordFlags,
    pub semaphore: QuickSemaphore,
    body: Lockable<PageBody>,
}

impl PageRecord {
    pub fn new(hash: u64, name: &[u8]) -> Self {
        debug_assert!(!name.is_empty() && name.len() <= u16::MAX as usize);
        let record = Self {
            hash,
            name: name.into(),
            flags: RecordFlags::new(HOF_PAYLOAD | HOF_FPC),
            semaphore: QuickSemaphore::new(),
            body: Lockable::new(PageBody {
                payload: StoredPayload::None,
                mod_time: timestamp(),
                exp_time: NEVER_EXPIRES,
                user_agent: UserAgent::Unknown,
                tag_refs: TagRefArray::new(),
            }),
        };
        record
            .memory()
            .register_allocation((std::mem::size_of::<Self>() + name.len()) as u64);
        crate::store::FPC_OBJECTS_CREATED.increment();
        record
    }

    pub fn hash_code(&self) -> u64 {
        self.hash
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn memory(&self) -> &'static Memory {
        Domain::Fpc.memory()
    }

    pub fn lock_body(&self) -> LockableGuard<'_, PageBody> {
        self.body.lock()
    }

    pub fn has_readers(&self) -> bool {
        self.semaphore.has_readers()
    }
}

impl Drop for PageRecord {
    fn drop(&mut self) {
        let memory = self.memory();
        if let StoredPayload::Data { data, .. } = &self.body.get_mut().payload {
            memory.register_deallocation(data.len() as u64);
        }
        memory.register_deallocation((std::mem::size_of::<Self>() + self.name.len()) as u64);
    }
}

impl PayloadHost for PageRecord {
    fn unregister_reader(&self) {
        self.semaphore.unregister_reader();
    }
}


impl crate::store::table::TableRecord for SessionRecord {
    fn hash_code(&self) -> u64 {
        self.hash
    }

    fn name(&self) -> &[u8] {
        &self.name
    }

    fn is_being_deleted(&self) -> bool {
        self.flags.are_set(HOF_BEING_DELETED)
    }

    fn mark_deleted(&self) {
        self.flags.set(HOF_BEING_DELETED | HOF_DELETED);
    }

    fn has_readers(&self) -> bool {
        self.semaphore.has_readers()
    }
}

impl crate::store::table::TableRecord for PageRecord {
    fn hash_code(&self) -> u64 {
        self.hash
    }

    fn name(&self) -> &[u8] {
        &self.name
    }

    fn is_being_deleted(&self) -> bool {
        self.flags.are_set(HOF_BEING_DELETED)
    }

    fn mark_deleted(&self) {
        self.flags.set(HOF_BEING_DELETED | HOF_DELETED);
    }

    fn has_readers(&self) -> bool {
        self.semaphore.has_readers()
    }
}
