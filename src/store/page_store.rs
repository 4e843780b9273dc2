// FPC (full page cache) store: tagged, evictable page records.

use crate::compression::{Allocator, CompressionLevel, Compressor, DataHint, DomainAllocator};
use crate::config::SharedConfig;
use crate::hashing::table_hasher;
use crate::memory::Domain;
use crate::protocol::buffers::{BorrowedPayload, PayloadHost, ReaderPin};
use crate::protocol::{CleanMode, UserAgent};
use crate::store::objects::{
    PageRecord, StoredPayload, HOF_BEING_DELETED, HOF_BEING_OPTIMIZED, HOF_OPTIMIZED,
};
use crate::store::table::HashTable;
use crate::store::tags::{TagIndex, TagMatch};
use crate::store::{timestamp, NEVER_EXPIRES};
use bytes::Bytes;
use std::sync::Arc;

pub struct PageMetadata {
    pub expire: u32,
    pub mtime: u32,
    pub tags: Vec<Vec<u8>>,
}

pub struct PageStore {
    table: HashTable<PageRecord>,
    tags: TagIndex,
    config: SharedConfig,
}

impl PageStore {
    pub fn new(config: SharedConfig) -> Self {
        let (shards, buckets) = {
            let cfg = config.read();
            (cfg.table_shards, cfg.table_buckets_per_shard)
        };
        Self {
            table: HashTable::new(shards, buckets),
            tags: TagIndex::new(),
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
            self.config.read().default_lifetime(Domain::Fpc, user_agent) as i64
        } else {
            lifetime
        };
        timestamp().saturating_add(lifetime.min(u32::MAX as i64) as u32)
    }

    /// Fetches page data; expired pages read as missing (they are
    /// reclaimed by `CLEAN old`, not on the read path).
    pub fn load(&self, id: &[u8], user_agent: UserAgent) -> Option<BorrowedPayload> {
        let record = self.table.find(self.hash(id), id)?;
        let mut guard = record.lock_body();
        if record.flags.are_set(HOF_BEING_DELETED) || guard.exp_time <= timestamp() {
            return None;
        }
        guard.user_agent = guard.user_agent.max(user_agent);
        match &guard.payload {
            StoredPayload::None => None,
            StoredPayload::Zero => Some(BorrowedPayload::new(
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
                Some(BorrowedPayload::new(
                    data.clone(),
                    *usize,
                    *compressor,
                    Some(pin),
                ))
            }
        }
    }

    /// `TEST`: last modification time of a live page.
    pub fn test(&self, id: &[u8]) -> Option<u32> {
        let record = self.table.find(self.hash(id), id)?;
        let guard = record.lock_body();
        if record.flags.are_set(HOF_BEING_DELETED) || guard.exp_time <= timestamp() {
            None
        } else {
            Some(guard.mod_time)
        }
    }

    /// Stores page data and re-threads the page under `tag_names`.
    /// `data` must already be accounted in the FPC domain.
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        id: &[u8],
        data: Option<Bytes>,
        usize: u32,
        compressor: Compressor,
        lifetime: i64,
        user_agent: UserAgent,
        tag_names: &[Vec<u8>],
    ) {
        let hash = self.hash(id);
        let record = self
            .table
            .find_or_insert(hash, id, || PageRecord::new(hash, id));
        {
            let mut guard = record.lock_body();
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
            // fresh content invalidates any earlier optimization
            record.flags.clear(HOF_OPTIMIZED | HOF_BEING_OPTIMIZED);
        }
        // tag linkage runs outside the record lock (the tag mutex is the
        // outer tier)
        self.tags.retag(&record, tag_names);
    }

    fn drop_record(&self, record: &Arc<PageRecord>) -> bool {
        {
            let _guard = record.lock_body();
            if record.flags.are_set(HOF_BEING_DELETED) {
                return false;
            }
            record.flags.set(HOF_BEING_DELETED);
        }
        self.tags.unlink_page(record);
        self.table.remove(record.hash_code(), record.name()).is_some()
    }

    pub fn remove(&self, id: &[u8]) -> bool {
        match self.table.find(self.hash(id), id) {
            Some(record) => self.drop_record(&record),
            None => false,
        }
    }

    /// `CLEAN`: bulk removal by mode. Returns the number of pages
    /// removed.
    pub fn clean(&self, mode: CleanMode, tag_names: &[Vec<u8>]) -> u32 {
        let victims = match mode {
            CleanMode::All => self.table.snapshot(),
            CleanMode::Old => self.tags.expired_pages(),
            CleanMode::MatchingAllTags => self.tags.select_pages(TagMatch::All, tag_names),
            CleanMode::NotMatchingAnyTag => self.tags.select_pages(TagMatch::NotAny, tag_names),
            CleanMode::MatchingAnyTag => self.tags.select_pages(TagMatch::Any, tag_names),
        };
        let mut removed = 0;
        for record in victims {
            if self.drop_record(&record) {
                crate::store::RECORDS_EVICTED.increment();
                removed += 1;
            }
        }
        removed
    }

    pub fn ids(&self) -> Vec<Vec<u8>> {
        self.table
            .snapshot()
            .iter()
            .map(|record| record.name().to_vec())
            .collect()
    }

    pub fn tag_names(&self) -> Vec<Vec<u8>> {
        self.tags.tag_names()
    }

    pub fn ids_matching(&self, mode: TagMatch, tag_names: &[Vec<u8>]) -> Vec<Vec<u8>> {
        self.tags
            .select_pages(mode, tag_names)
            .iter()
            .map(|record| record.name().to_vec())
            .collect()
    }

    /// Percentage of the FPC memory quota currently in use, 0..100.
    pub fn filling_percentage(&self) -> u8 {
        let memory = Domain::Fpc.memory();
        let quota = memory.get_quota().max(1);
        ((memory.get_used_size().saturating_mul(100)) / quota).min(100) as u8
    }

    pub fn metadata(&self, id: &[u8]) -> Option<PageMetadata> {
        let record = self.table.find(self.hash(id), id)?;
        let (expire, mtime) = {
            let guard = record.lock_body();
            if record.flags.are_set(HOF_BEING_DELETED) {
                return None;
            }
            (guard.exp_time, guard.mod_time)
        };
        Some(PageMetadata {
            expire,
            mtime,
            tags: self.tags.page_tag_names(&record),
        })
    }

    /// Extends a live page's lifetime by `extra` seconds.
    pub fn touch(&self, id: &[u8], extra: i64) -> bool {
        let record = match self.table.find(self.hash(id), id) {
            Some(record) => record,
            None => return false,
        };
        let mut guard = record.lock_body();
        if record.flags.are_set(HOF_BEING_DELETED) || guard.exp_time <= timestamp() {
            return false;
        }
        if guard.exp_time != NEVER_EXPIRES {
            let extended = guard.exp_time as i64 + extra;
            guard.exp_time = extended.clamp(0, NEVER_EXPIRES as i64) as u32;
        }
        guard.mod_time = timestamp();
        true
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<PageRecord>> {
        self.table.snapshot()
    }

    /// Background recompression: re-packs page payloads with the
    /// configured compressor at a stronger level and keeps the result
    /// when it is strictly smaller than what the record stores. Returns
    /// the number of records upgraded.
    pub fn optimize_pass(&self, level: CompressionLevel) -> u32 {
        let compressor = self.config.read().compressor_for(Domain::Fpc);
        if !crate::compression::is_supported(compressor) {
            return 0;
        }
        let memory = Domain::Fpc.memory();
        let mut upgraded = 0;
        for record in self.table.snapshot() {
            if record
                .flags
                .are_set(HOF_BEING_DELETED)
            {
                continue;
            }
            let mut guard = record.lock_body();
            if !record.flags.are_clear(HOF_OPTIMIZED | HOF_BEING_OPTIMIZED | HOF_BEING_DELETED) {
                continue;
            }
            let (data, usize, current) = match &guard.payload {
                StoredPayload::Data {
                    data,
                    usize,
                    compressor,
                } => (data.clone(), *usize, *compressor),
                _ => continue,
            };
            record.flags.set(HOF_BEING_OPTIMIZED);

            let mut allocator = DomainAllocator::new(memory);
            let raw = if current == Compressor::None {
                Some(data.to_vec())
            } else {
                crate::compression::unpack(current, &data, usize as usize, &mut allocator).ok()
            };
            let repacked = raw.as_ref().and_then(|raw| {
                crate::compression::pack(
                    compressor,
                    raw,
                    &mut allocator,
                    level,
                    DataHint::Generic,
                )
                .ok()
                .flatten()
            });
            if current != Compressor::None {
                if let Some(raw) = raw {
                    memory.register_deallocation(raw.len() as u64);
                }
            }
            match repacked {
                Some(packed) if packed.len() < data.len() => {
                    if record.semaphore.has_readers() {
                        record.semaphore.wait_until_no_readers();
                    }
                    guard.payload.replace(
                        StoredPayload::Data {
                            data: Bytes::from(packed),
                            usize,
                            compressor,
                        },
                        memory,
                    );
                    upgraded += 1;
                }
                Some(packed) => allocator.free(packed),
                None => {}
            }
            record.flags.clear(HOF_BEING_OPTIMIZED);
            record.flags.set(HOF_OPTIMIZED);
        }
        upgraded
    }

    /// Tag names a page carries; used when dumping the store.
    pub fn tags_of(&self, record: &Arc<PageRecord>) -> Vec<Vec<u8>> {
        self.tags.page_tag_names(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::registry::register_worker_thread;
    use crate::config;

    fn store() -> PageStore {
        PageStore::new(config::shared(Default::default()))
    }

    fn accounted(data: &[u8]) -> Bytes {
        Domain::Fpc.memory().register_allocation(data.len() as u64);
        Bytes::copy_from_slice(data)
    }

    fn tags(list: &[&str]) -> Vec<Vec<u8>> {
        list.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    fn save_simple(store: &PageStore, id: &[u8], tag_list: &[&str]) {
        store.save(
            id,
            Some(accounted(b"page content")),
            12,
            Compressor::None,
            3600,
            UserAgent::User,
            &tags(tag_list),
        );
    }

    #[test]
    fn test_save_load_remove() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        save_simple(&store, b"p1", &["t1", "t2"]);
        let payload = store.load(b"p1", UserAgent::User).unwrap();
        assert_eq!(&payload.data[..], b"page content");
        assert!(store.test(b"p1").is_some());
        assert!(store.remove(b"p1"));
        assert!(store.load(b"p1", UserAgent::User).is_none());
        assert!(store.test(b"p1").is_none());
        // removing the only tagged page disposes its tags
        assert!(store.tag_names().is_empty());
    }

    #[test]
    fn test_ids_matching_tags() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        save_simple(&store, b"p1", &["t1", "t2"]);
        save_simple(&store, b"p2", &["t2"]);
        save_simple(&store, b"p3", &[]);

        let matching = store.ids_matching(TagMatch::All, &tags(&["t2"]));
        assert_eq!(matching.len(), 2);
        let matching = store.ids_matching(TagMatch::All, &tags(&["t1", "t2"]));
        assert_eq!(matching, vec![b"p1".to_vec()]);
        let not_matching = store.ids_matching(TagMatch::NotAny, &tags(&["t1"]));
        assert_eq!(not_matching.len(), 2);
    }

    #[test]
    fn test_clean_modes() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        save_simple(&store, b"p1", &["a"]);
        save_simple(&store, b"p2", &["b"]);
        save_simple(&store, b"p3", &[]);

        // empty tag set: "not matching any" removes nothing
        assert_eq!(store.clean(CleanMode::NotMatchingAnyTag, &[]), 0);
        assert_eq!(store.len(), 3);

        assert_eq!(store.clean(CleanMode::MatchingAllTags, &tags(&["a"])), 1);
        assert_eq!(store.len(), 2);

        assert_eq!(store.clean(CleanMode::All, &[]), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_touch_and_metadata() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        save_simple(&store, b"p", &["t"]);
        let before = store.metadata(b"p").unwrap();
        assert_eq!(before.tags, tags(&["t"]));
        assert!(store.touch(b"p", 1000));
        let after = store.metadata(b"p").unwrap();
        assert_eq!(after.expire, before.expire + 1000);
        assert!(!store.touch(b"missing", 10));
    }

    #[test]
    fn test_optimize_pass_recompresses_raw_payloads() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        // highly compressible body stored raw
        let body: Vec<u8> = b"abcdefgh".iter().cycle().take(16384).copied().collect();
        store.save(
            b"opt-page",
            Some(accounted(&body)),
            body.len() as u32,
            Compressor::None,
            3600,
            UserAgent::User,
            &[],
        );
        let upgraded = store.optimize_pass(CompressionLevel::Best);
        assert_eq!(upgraded, 1);

        let payload = store.load(b"opt-page", UserAgent::User).unwrap();
        assert!(payload.data.len() < body.len());
        assert_eq!(payload.usize as usize, body.len());
        let mut allocator = DomainAllocator::new(Domain::Fpc.memory());
        let restored = crate::compression::unpack(
            payload.compressor,
            &payload.data,
            payload.usize as usize,
            &mut allocator,
        )
        .unwrap();
        assert_eq!(restored, body);
        Domain::Fpc
            .memory()
            .register_deallocation(restored.len() as u64);

        // a second pass finds nothing left to do
        drop(payload);
        assert_eq!(store.optimize_pass(CompressionLevel::Best), 0);
    }

    #[test]
    fn test_expired_page_is_invisible() {
        let _registration = register_worker_thread().unwrap();
        let store = store();
        save_simple(&store, b"p", &["t"]);
        {
            let record = store.table.find(store.hash(b"p"), b"p").unwrap();
            record.lock_body().exp_time = 1;
        }
        assert!(store.load(b"p", UserAgent::User).is_none());
        assert!(store.test(b"p").is_none());
        // CLEAN old reclaims it
        assert_eq!(store.clean(CleanMode::Old, &[]), 1);
        assert!(store.is_empty());
    }
}
