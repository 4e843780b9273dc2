// Session store: exclusive-lock-per-session records keyed by session id.

use crate::config::SharedConfig;
use crate::hashing::table_hasher;
use crate::memory::Domain;
use crate::protocol::buffers::{BorrowedPayload, PayloadHost, ReaderPin};
use crate::protocol::UserAgent;
use crate::store::objects::{
    SessionLockResult, SessionRecord, StoredPayload, HOF_BEING_DELETED,
};
use crate::store::table::HashTable;
use crate::store::{timestamp, NEVER_EXPIRES};
use bytes::Bytes;
use crate::compression::Compressor;
use std::sync::Arc;

pub enum SessionReadOutcome {
    /// No record, expired, or deleted while waiting for the session lock
    Missing,
    Found(BorrowedPayload),
}

pub struct SessionStore {
    table: HashTable<SessionRecord>,
    config: SharedConfig,
}

impl SessionStore {
    pub fn new(config: SharedConfig) -> Self {
        let (shards, buckets) = {
            let cfg = config.read();
            (cfg.table_shards, cfg.table_buckets_per_shard)
        };
        Self {
            table: HashTable::new(shards, buckets),
            config,
        }
    }

    fn hash(&self, id: &[u8]) -> u64 {
        table_hasher().hash(id)
    }

    fn resolve_expiration(&self, lifetime: i64, user_agent: UserAgent) -> u32 {
        if lifetime < 0 {
            return NEVER_EXPIRES;
        }
        let lifetime = if lifetime == 0 {
            self.config
                .read()
                .default_lifetime(Domain::Session, user_agent) as i64
        } else {
            lifetime
        };
        timestamp().saturating_add(lifetime.min(u32::MAX as i64) as u32)
    }

    /// Fetches session data, honoring the session lock when a request id
    /// is supplied. The session lock is kept for the request (the
    /// matching `WRITE` releases it).
    pub fn read(&self, id: &[u8], user_agent: UserAgent, request_id: u32) -> SessionReadOutcome {
        let record = match self.table.find(self.hash(id), id) {
            Some(record) => record,
            None => return SessionReadOutcome::Missing,
        };
        let lock_wait_time = self.config.read().session_lock_wait_time;
        let guard = record.lock_body();
        if record.flags.are_set(HOF_BEING_DELETED) {
            return SessionReadOutcome::Missing;
        }
        let (mut guard, result) = record.lock_session(guard, request_id, lock_wait_time);
        if result == SessionLockResult::Deleted {
            return SessionReadOutcome::Missing;
        }
        guard.user_agent = guard.user_agent.max(user_agent);
        match &guard.payload {
            StoredPayload::None => SessionReadOutcome::Missing,
            StoredPayload::Zero => SessionReadOutcome::Found(BorrowedPayload::new(
                Bytes::new(),
                0,
                Compressor::None,
                None,
            )),
            StoredPayload::Data {
                data,
                usize,
                compressor,
            } => {
                record.semaphore.register_reader();
                let pin = ReaderPin::new(Arc::clone(&record) as Arc<dyn PayloadHost>);
                SessionReadOutcome::Found(BorrowedPayload::new(
                    data.clone(),
                    *usize,
                    *compressor,
                    Some(pin),
                ))
            }
        }
    }

    /// Stores session data. `data` must already be accounted in the
    /// session domain (see `SharedBuffers::take_payload`); `None` stores
    /// the distinct zero-length value.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        id: &[u8],
        data: Option<Bytes>,
        usize: u32,
        compressor: Compressor,
        lifetime: i64,
        user_agent: UserAgent,
        request_id: u32,
    ) {
        let hash = self.hash(id);
        let record = self
            .table
            .find_or_insert(hash, id, || SessionRecord::new(hash, id));
        let lock_wait_time = self.config.read().session_lock_wait_time;
        let guard = record.lock_body();
        let (mut guard, result) = record.lock_session(guard, request_id, lock_wait_time);
        if result == SessionLockResult::Deleted {
            // the record went away while we waited; drop the write
            if let Some(data) = data {
                record.memory().register_deallocation(data.len() as u64);
            }
            return;
        }
        if record.semaphore.has_readers() {
            record.semaphore.wait_until_no_readers();
        }
        let new_payload = match data {
            Some(data) if !data.is_empty() => StoredPayload::Data {
                data,
                usize,
                compressor,
            },
            _ => StoredPayload::Zero,
        };
        guard.payload.replace(new_payload, record.memory());
        guard.mod_time = timestamp();
        guard.exp_time = self.resolve_expiration(lifetime, user_agent);
        guard.user_agent = user_agent;
        guard.num_writes = guard.num_writes.saturating_add(1);
        record.unlock_session(&mut guard, request_id);
    }

    pub fn destroy(&self, id: &[u8]) -> bool {
        let hash = self.hash(id);
        let record = match self.table.find(hash, id) {
            Some(record) => record,
            None => return false,
        };
        {
            let mut guard = record.lock_body();
            record.flags.set(HOF_BEING_DELETED);
            record.abort_session_waiters(&mut guard);
        }
        self.table.remove(hash, id).is_some()
    }

    /// Removes sessions that expired, or that have not been modified for
    /// `max_age` seconds (0 = expiration only).
    pub fn gc(&self, max_age: u32) -> u32 {
        let now = timestamp();
        let mut removed = 0;
        for record in self.table.snapshot() {
            let stale = {
                let guard = record.lock_body();
                guard.exp_time <= now
                    || (max_age > 0 && guard.mod_time.saturating_add(max_age) <= now)
            };
            if stale && self.destroy(record.name()) {
                crate::store::RECORDS_EVICTED.increment();
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Live records for database dumps (`STORE`).
    pub fn snapshot(&self) -> Vec<Arc<SessionRecord>> {
        self.table.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::registry::register_worker_thread;
    use crate::config;

    fn store() -> SessionStore {
        SessionStore::new(config::shared(Default::default()))
    }

    fn accounted(data: &[u8]) -> Bytes {
        Domain::Session
            .memory()
            .register_allocation(data.len() as u64);
        Bytes::copy_from_slice(data)
    }

    #[test]
    fn test_write_then_read() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        store.write(
            b"sid-1",
            Some(accounted(b"hello")),
            5,
            Compressor::None,
            60,
            UserAgent::User,
            0,
        );
        match store.read(b"sid-1", UserAgent::User, 0) {
            SessionReadOutcome::Found(payload) => {
                assert_eq!(&payload.data[..], b"hello");
                assert_eq!(payload.usize, 5);
            }
            _ => panic!("expected session data"),
        }
        assert!(matches!(
            store.read(b"other", UserAgent::User, 0),
            SessionReadOutcome::Missing
        ));
    }

    #[test]
    fn test_empty_value_is_not_missing() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        store.write(b"sid-e", None, 0, Compressor::None, 60, UserAgent::User, 0);
        match store.read(b"sid-e", UserAgent::User, 0) {
            SessionReadOutcome::Found(payload) => assert!(payload.data.is_empty()),
            _ => panic!("a written empty value must read back as empty, not missing"),
        }
    }

    #[test]
    fn test_destroy() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        store.write(
            b"sid-d",
            Some(accounted(b"x")),
            1,
            Compressor::None,
            60,
            UserAgent::User,
            0,
        );
        assert!(store.destroy(b"sid-d"));
        assert!(!store.destroy(b"sid-d"));
        assert!(matches!(
            store.read(b"sid-d", UserAgent::User, 0),
            SessionReadOutcome::Missing
        ));
    }

    #[test]
    fn test_gc_removes_stale_sessions() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        // lifetime of 1 second, already stale relative to max_age 0 only
        // after expiry; use negative lifetime for a keeper
        store.write(
            b"keeper",
            Some(accounted(b"k")),
            1,
            Compressor::None,
            -1,
            UserAgent::User,
            0,
        );
        store.write(
            b"stale",
            Some(accounted(b"s")),
            1,
            Compressor::None,
            1,
            UserAgent::User,
            0,
        );
        // forge staleness by aging the record directly
        {
            let record = store.table.find(store.hash(b"stale"), b"stale").unwrap();
            let mut guard = record.lock_body();
            guard.exp_time = 1;
        }
        assert_eq!(store.gc(0), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_write_while_reader_pinned() {
        let _registration = register_worker_thread().unwrap();
        let store = Arc::new(store());
        store.write(
            b"sid-p",
            Some(accounted(b"first")),
            5,
            Compressor::None,
            60,
            UserAgent::User,
            0,
        );
        let payload = match store.read(b"sid-p", UserAgent::User, 0) {
            SessionReadOutcome::Found(payload) => payload,
            _ => panic!("expected data"),
        };

        let writer_store = Arc::clone(&store);
        let handle = std::thread::spawn(move || {
            let _registration = register_worker_thread().unwrap();
            writer_store.write(
                b"sid-p",
                Some(accounted(b"second")),
                6,
                Compressor::None,
                60,
                UserAgent::User,
                0,
            );
        });

        // the writer parks on the reader count; the pinned bytes stay
        // intact until the pin drops
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(&payload.data[..], b"first");
        drop(payload);
        handle.join().unwrap();
        match store.read(b"sid-p", UserAgent::User, 0) {
            SessionReadOutcome::Found(payload) => assert_eq!(&payload.data[..], b"second"),
            _ => panic!("expected data"),
        }
    }
}
