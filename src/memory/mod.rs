// # Memory Domains
//
// Quota-tracked allocation accounting for the three cache domains
// (global / session / fpc). The accounting is deliberately decoupled from
// the allocator itself: buffers are ordinary heap allocations, and every
// subsystem that creates or drops one registers the byte delta with the
// domain it belongs to. A block may be registered with one domain and
// later re-parented to another with `transfer_used_size()` without the
// data moving.
//
// Counters use relaxed ordering throughout: exact cross-thread precision
// is not required for quota enforcement, and relaxed operations are
// significantly cheaper on the hot path.

use crate::error::{CacheError, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub const fn kilobytes(n: u64) -> u64 {
    n * 1024
}

pub const fn megabytes(n: u64) -> u64 {
    kilobytes(n) * 1024
}

pub const fn gigabytes(n: u64) -> u64 {
    megabytes(n) * 1024
}

pub const fn terabytes(n: u64) -> u64 {
    gigabytes(n) * 1024
}

/// Smallest quota that can be configured for any domain
pub const MIN_QUOTA: u64 = megabytes(8);

/// Largest configurable quota; the `enterprise` feature lifts the cap
#[cfg(not(feature = "enterprise"))]
pub const MAX_QUOTA: u64 = gigabytes(32);
#[cfg(feature = "enterprise")]
pub const MAX_QUOTA: u64 = terabytes(128);

/// Quota value meaning "use the edition default"
pub const DEFAULT_QUOTA: u64 = 0;

const DEFAULT_GLOBAL_QUOTA: u64 = gigabytes(1);
const DEFAULT_STORE_QUOTA: u64 = gigabytes(4);

/// Accounting region to which an allocation belongs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Domain {
    Global = 0,
    Session = 1,
    Fpc = 2,
}

pub const NUM_DOMAINS: usize = 3;

impl Domain {
    pub fn name(self) -> &'static str {
        match self {
            Domain::Global => "global",
            Domain::Session => "session",
            Domain::Fpc => "fpc",
        }
    }

    pub fn memory(self) -> &'static Memory {
        match self {
            Domain::Global => &GLOBAL_MEMORY,
            Domain::Session => &SESSION_MEMORY,
            Domain::Fpc => &FPC_MEMORY,
        }
    }
}

/// Host hooks invoked when a domain runs out of quota. The host is
/// expected to free memory elsewhere (evict records) between the two
/// calls; if it cannot, the allocation aborts the process.
pub trait MemoryInterface: Send + Sync {
    /// A thread ran out of quota and needs at least `size` bytes freed.
    fn begin_memory_deallocation(&self, size: u64) -> bool;

    /// A memory block had been freed; waiting threads may retry.
    fn end_memory_deallocation(&self);
}

static HOST_INTERFACE: RwLock<Option<&'static dyn MemoryInterface>> = RwLock::new(None);

/// Per-domain byte accounting with quota enforcement.
pub struct Memory {
    max_size: AtomicU64,
    used_size: AtomicU64,
    domain: Domain,
}

impl Memory {
    const fn new(domain: Domain, default_quota: u64) -> Self {
        Self {
            max_size: AtomicU64::new(default_quota),
            used_size: AtomicU64::new(0),
            domain,
        }
    }

    /// Installs the host eviction hooks; called once at server startup.
    pub fn configure(host: &'static dyn MemoryInterface) {
        *HOST_INTERFACE.write() = Some(host);
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn get_quota(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Sets the quota; zero restores the edition default, any other value
    /// is clamped into the `[MIN_QUOTA, MAX_QUOTA]` range.
    pub fn set_quota(&self, quota: u64) {
        let value = if quota == DEFAULT_QUOTA {
            match self.domain {
                Domain::Global => DEFAULT_GLOBAL_QUOTA,
                Domain::Session | Domain::Fpc => DEFAULT_STORE_QUOTA,
            }
        } else {
            quota.clamp(MIN_QUOTA, MAX_QUOTA)
        };
        self.max_size.store(value, Ordering::Relaxed);
    }

    pub fn get_used_size(&self) -> u64 {
        self.used_size.load(Ordering::Relaxed)
    }

    /// Registers `size` freshly allocated bytes with this domain. When
    /// the domain is over quota the host is asked to free memory first;
    /// if that fails the process aborts (quota exhaustion is
    /// unrecoverable by design).
    pub fn register_allocation(&self, size: u64) {
        let used = self.used_size.fetch_add(size, Ordering::Relaxed) + size;
        let quota = self.max_size.load(Ordering::Relaxed);
        if used > quota {
            if !self.request_host_deallocation(used - quota) {
                log::error!(
                    "domain '{}' exceeded quota ({} of {} bytes) and the host could not free memory",
                    self.domain.name(),
                    used,
                    quota
                );
                std::process::abort();
            }
        }
    }

    /// Fallible flavor used by paths that can degrade gracefully (e.g.
    /// refusing a single oversized payload instead of dying).
    pub fn try_register_allocation(&self, size: u64) -> Result<()> {
        let used = self.used_size.fetch_add(size, Ordering::Relaxed) + size;
        let quota = self.max_size.load(Ordering::Relaxed);
        if used > quota && !self.request_host_deallocation(used - quota) {
            self.used_size.fetch_sub(size, Ordering::Relaxed);
            return Err(CacheError::Quota(format!(
                "domain '{}': {} used + {} requested exceeds quota {}",
                self.domain.name(),
                used - size,
                size,
                quota
            )));
        }
        Ok(())
    }

    /// Re-accounts a reallocation as a delta.
    pub fn register_reallocation(&self, old_size: u64, new_size: u64) {
        if new_size > old_size {
            self.register_allocation(new_size - old_size);
        } else {
            self.register_deallocation(old_size - new_size);
        }
    }

    /// The caller must pass the size originally registered; there are no
    /// per-block headers to recover it from.
    pub fn register_deallocation(&self, size: u64) {
        let prev = self.used_size.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(prev >= size, "deallocation underflow in domain '{}'", self.domain.name());
    }

    /// Moves `size` bytes of accounting from `src` into this domain
    /// without touching any memory; used when a buffer allocated in the
    /// global domain is re-parented to a store record.
    pub fn transfer_used_size(&self, src: &Memory, size: u64) {
        if std::ptr::eq(self, src) {
            return;
        }
        src.register_deallocation(size);
        self.used_size.fetch_add(size, Ordering::Relaxed);
    }

    fn request_host_deallocation(&self, needed: u64) -> bool {
        let guard = HOST_INTERFACE.read();
        match *guard {
            Some(host) => {
                if host.begin_memory_deallocation(needed) {
                    host.end_memory_deallocation();
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

pub static GLOBAL_MEMORY: Lazy<Memory> =
    Lazy::new(|| Memory::new(Domain::Global, DEFAULT_GLOBAL_QUOTA));
pub static SESSION_MEMORY: Lazy<Memory> =
    Lazy::new(|| Memory::new(Domain::Session, DEFAULT_STORE_QUOTA));
pub static FPC_MEMORY: Lazy<Memory> =
    Lazy::new(|| Memory::new(Domain::Fpc, DEFAULT_STORE_QUOTA));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_clamping() {
        let memory = Memory::new(Domain::Global, DEFAULT_GLOBAL_QUOTA);
        memory.set_quota(1); // below minimum
        assert_eq!(memory.get_quota(), MIN_QUOTA);
        memory.set_quota(u64::MAX); // above maximum
        assert_eq!(memory.get_quota(), MAX_QUOTA);
        memory.set_quota(DEFAULT_QUOTA);
        assert_eq!(memory.get_quota(), DEFAULT_GLOBAL_QUOTA);
    }

    #[test]
    fn test_allocation_accounting() {
        let memory = Memory::new(Domain::Session, DEFAULT_STORE_QUOTA);
        memory.register_allocation(1000);
        assert_eq!(memory.get_used_size(), 1000);
        memory.register_reallocation(1000, 1500);
        assert_eq!(memory.get_used_size(), 1500);
        memory.register_reallocation(1500, 200);
        assert_eq!(memory.get_used_size(), 200);
        memory.register_deallocation(200);
        assert_eq!(memory.get_used_size(), 0);
    }

    #[test]
    fn test_transfer_between_domains() {
        let global = Memory::new(Domain::Global, DEFAULT_GLOBAL_QUOTA);
        let fpc = Memory::new(Domain::Fpc, DEFAULT_STORE_QUOTA);
        global.register_allocation(4096);
        fpc.transfer_used_size(&global, 4096);
        assert_eq!(global.get_used_size(), 0);
        assert_eq!(fpc.get_used_size(), 4096);
        fpc.register_deallocation(4096);
    }

    #[test]
    fn test_try_register_over_quota_fails() {
        let memory = Memory::new(Domain::Fpc, DEFAULT_STORE_QUOTA);
        memory.set_quota(MIN_QUOTA);
        assert!(memory.try_register_allocation(MIN_QUOTA / 2).is_ok());
        let result = memory.try_register_allocation(MIN_QUOTA);
        assert!(result.is_err());
        // failed registration must not leak accounting
        assert_eq!(memory.get_used_size(), MIN_QUOTA / 2);
    }
}
