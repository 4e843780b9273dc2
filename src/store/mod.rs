// # Store Layer
//
// Session, page and tag records, the sharded hash tables they live in,
// and the tag-manager linkage that threads FPC pages into per-tag
// membership lists.

pub mod objects;
pub mod page_store;
pub mod session_store;
pub mod table;
pub mod tags;

pub use objects::{
    PageRecord, RecordFlags, SessionLockResult, SessionRecord, StoredPayload, HOF_BEING_DELETED,
    HOF_BEING_OPTIMIZED, HOF_DELETED, HOF_FPC, HOF_LINKED_BY_OPTIMIZER, HOF_LINKED_BY_TM,
    HOF_OPTIMIZED, HOF_PAYLOAD,
};
pub use page_store::PageStore;
pub use session_store::SessionStore;
pub use table::HashTable;
pub use tags::TagIndex;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp meaning "never expires"
pub const NEVER_EXPIRES: u32 = u32::MAX;

/// Current time as epoch seconds.
pub fn timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64 - 1) as u32)
        .unwrap_or(0)
}

/// Process-wide performance counters surfaced by `STATS`.
pub struct PerfCounter {
    value: AtomicU64,
    pub name: &'static str,
}

impl PerfCounter {
    const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

pub static SESSION_LOCK_WAITS: PerfCounter = PerfCounter::new("session_lock_waits");
pub static SESSION_BROKEN_LOCKS: PerfCounter = PerfCounter::new("session_broken_locks");
pub static SESSION_ABORTED_LOCKS: PerfCounter = PerfCounter::new("session_aborted_locks");
pub static SESSION_OBJECTS_CREATED: PerfCounter = PerfCounter::new("session_objects_created");
pub static FPC_OBJECTS_CREATED: PerfCounter = PerfCounter::new("fpc_objects_created");
pub static TAG_OBJECTS_CREATED: PerfCounter = PerfCounter::new("tag_objects_created");
pub static STORE_COMMANDS_EXECUTED: PerfCounter = PerfCounter::new("store_commands_executed");
pub static RECORDS_EVICTED: PerfCounter = PerfCounter::new("records_evicted");

pub fn all_counters() -> [&'static PerfCounter; 8] {
    [
        &SESSION_LOCK_WAITS,
        &SESSION_BROKEN_LOCKS,
        &SESSION_ABORTED_LOCKS,
        &SESSION_OBJECTS_CREATED,
        &FPC_OBJECTS_CREATED,
        &TAG_OBJECTS_CREATED,
        &STORE_COMMANDS_EXECUTED,
        &RECORDS_EVICTED,
    ]
}
