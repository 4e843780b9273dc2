// Sharded hash table for cache records.
//
// A power-of-two number of shards, each holding a power-of-two number of
// buckets behind one shared mutex; lookups take the shard lock shared,
// insertion and chain surgery take it exclusive. Records removed from a
// bucket are parked in the shard's reclamation queue until no reader
// pins remain; the queue is drained right after the exclusive lock is
// released.

use crate::concurrent::registry::audit;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// What the table needs to know about a record it stores.
pub trait TableRecord: Send + Sync + 'static {
    fn hash_code(&self) -> u64;
    fn name(&self) -> &[u8];
    fn is_being_deleted(&self) -> bool;
    fn mark_deleted(&self);
    fn has_readers(&self) -> bool;
}

struct ShardData<R> {
    buckets: Vec<Vec<Arc<R>>>,
    count: usize,
}

struct Shard<R> {
    data: RwLock<ShardData<R>>,
    deleted: Mutex<Vec<Arc<R>>>,
}

pub struct HashTable<R: TableRecord> {
    shards: Vec<Shard<R>>,
    shard_mask: u64,
    bucket_mask: u64,
}

impl<R: TableRecord> HashTable<R> {
    pub fn new(num_shards: usize, buckets_per_shard: usize) -> Self {
        assert!(num_shards.is_power_of_two() && buckets_per_shard.is_power_of_two());
        let shards = (0..num_shards)
            .map(|_| Shard {
                data: RwLock::new(ShardData {
                    buckets: (0..buckets_per_shard).map(|_| Vec::new()).collect(),
                    count: 0,
                }),
                deleted: Mutex::new(Vec::new()),
            })
            .collect();
        Self {
            shards,
            shard_mask: (num_shards - 1) as u64,
            bucket_mask: (buckets_per_shard - 1) as u64,
        }
    }

    fn shard(&self, hash: u64) -> &Shard<R> {
        // the bucket index uses the low bits, so shard selection takes
        // its bits from the opposite end of the hash
        &self.shards[((hash >> 48) & self.shard_mask) as usize]
    }

    fn bucket_index(&self, hash: u64) -> usize {
        (hash & self.bucket_mask) as usize
    }

    /// Looks a record up; records in deletion are invisible.
    pub fn find(&self, hash: u64, name: &[u8]) -> Option<Arc<R>> {
        audit::enter_shared_lock();
        let shard = self.shard(hash);
        let data = shard.data.read();
        let found = data.buckets[self.bucket_index(hash)]
            .iter()
            .find(|record| {
                record.hash_code() == hash
                    && record.name() == name
                    && !record.is_being_deleted()
            })
            .cloned();
        drop(data);
        audit::exit_shared_lock();
        found
    }

    /// Returns the existing record for (hash, name) or inserts the one
    /// `create` builds; the decision is made under the exclusive shard
    /// lock so concurrent writers cannot double-insert.
    pub fn find_or_insert(&self, hash: u64, name: &[u8], create: impl FnOnce() -> R) -> Arc<R> {
        audit::enter_shared_lock();
        let shard = self.shard(hash);
        let mut data = shard.data.write();
        let bucket = self.bucket_index(hash);
        let existing = data.buckets[bucket]
            .iter()
            .find(|record| {
                record.hash_code() == hash
                    && record.name() == name
                    && !record.is_being_deleted()
            })
            .cloned();
        let result = match existing {
            Some(record) => record,
            None => {
                let record = Arc::new(create());
                data.buckets[bucket].push(Arc::clone(&record));
                data.count += 1;
                record
            }
        };
        drop(data);
        audit::exit_shared_lock();
        self.drain_deleted(hash);
        result
    }

    /// Marks the record deleted and moves it from its bucket chain to
    /// the shard's reclamation queue. Returns the record when it was
    /// still linked.
    pub fn remove(&self, hash: u64, name: &[u8]) -> Option<Arc<R>> {
        audit::enter_shared_lock();
        let shard = self.shard(hash);
        let mut data = shard.data.write();
        let bucket = &mut data.buckets[self.bucket_index(hash)];
        let position = bucket
            .iter()
            .position(|record| record.hash_code() == hash && record.name() == name);
        let removed = position.map(|index| {
            let record = bucket.swap_remove(index);
            record.mark_deleted();
            record
        });
        if removed.is_some() {
            data.count -= 1;
        }
        if let Some(record) = &removed {
            shard.deleted.lock().push(Arc::clone(record));
        }
        drop(data);
        audit::exit_shared_lock();
        self.drain_deleted(hash);
        removed
    }

    /// Disposes queued records whose reader count reached zero; records
    /// still pinned stay queued for the next drain.
    fn drain_deleted(&self, hash: u64) {
        let shard = self.shard(hash);
        let mut deleted = shard.deleted.lock();
        deleted.retain(|record| record.has_readers());
    }

    pub fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            audit::enter_shared_lock();
            total += shard.data.read().count;
            audit::exit_shared_lock();
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live records; taken shard by shard so no lock is
    /// held across the whole table at once.
    pub fn snapshot(&self) -> Vec<Arc<R>> {
        let mut records = Vec::new();
        for shard in &self.shards {
            audit::enter_shared_lock();
            let data = shard.data.read();
            for bucket in &data.buckets {
                for record in bucket {
                    if !record.is_being_deleted() {
                        records.push(Arc::clone(record));
                    }
                }
            }
            drop(data);
            audit::exit_shared_lock();
        }
        records
    }

    /// Number of records still waiting for reclamation (diagnostics).
    pub fn deleted_queue_len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.deleted.lock().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::registry::register_worker_thread;
    use crate::hashing::table_hasher;
    use crate::store::objects::SessionRecord;
    use std::thread;

    fn make_table() -> HashTable<SessionRecord> {
        HashTable::new(4, 64)
    }

    #[test]
    fn test_insert_find_remove() {
        let table = make_table();
        let hash = table_hasher().hash(b"key-1");
        let record = table.find_or_insert(hash, b"key-1", || SessionRecord::new(hash, b"key-1"));
        assert_eq!(record.name(), b"key-1");
        assert_eq!(table.len(), 1);
        assert!(table.find(hash, b"key-1").is_some());
        assert!(table.find(hash, b"key-2").is_none());

        let removed = table.remove(hash, b"key-1").unwrap();
        assert!(removed.is_being_deleted());
        assert!(table.find(hash, b"key-1").is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_find_or_insert_returns_existing() {
        let table = make_table();
        let hash = table_hasher().hash(b"key");
        let first = table.find_or_insert(hash, b"key", || SessionRecord::new(hash, b"key"));
        let second = table.find_or_insert(hash, b"key", || panic!("must not create twice"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_pinned_record_stays_queued() {
        let table = make_table();
        let hash = table_hasher().hash(b"pinned");
        let record = table.find_or_insert(hash, b"pinned", || SessionRecord::new(hash, b"pinned"));
        record.semaphore.register_reader();
        table.remove(hash, b"pinned");
        assert_eq!(table.deleted_queue_len(), 1);
        record.semaphore.unregister_reader();
        // next surgery on the shard drains the queue
        table.find_or_insert(hash, b"other", || SessionRecord::new(hash, b"other"));
        assert_eq!(table.deleted_queue_len(), 0);
    }

    #[test]
    fn test_concurrent_upsert() {
        let table = Arc::new(make_table());
        let mut handles = vec![];
        for t in 0..4 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let _registration = register_worker_thread().unwrap();
                for i in 0..100 {
                    let name = format!("key-{}", i);
                    let hash = table_hasher().hash(name.as_bytes());
                    let record = table.find_or_insert(hash, name.as_bytes(), || {
                        SessionRecord::new(hash, name.as_bytes())
                    });
                    let mut guard = record.lock_body();
                    guard.num_writes = guard.num_writes.wrapping_add(1);
                    let _ = t;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 100);
        let sum: u32 = table
            .snapshot()
            .iter()
            .map(|r| r.lock_body().num_writes as u32)
            .sum();
        assert_eq!(sum, 400);
    }
}
