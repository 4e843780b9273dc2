// Concurrency properties of the locking substrate and the stores,
// exercised with real threads.

use cybercache::compression::Compressor;
use cybercache::concurrent::lockable::Lockable;
use cybercache::concurrent::registry;
use cybercache::concurrent::semaphore::QuickSemaphore;
use cybercache::config;
use cybercache::memory::Domain;
use cybercache::protocol::UserAgent;
use cybercache::store::session_store::{SessionReadOutcome, SessionStore};
use cybercache::store::PageStore;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn accounted(domain: Domain, data: &[u8]) -> Bytes {
    domain.memory().register_allocation(data.len() as u64);
    Bytes::copy_from_slice(data)
}

#[test]
fn test_lockable_mutual_exclusion() {
    // no two threads observe the critical section at once, and the wait
    // mask drains to zero when the dust settles
    let lockable = Arc::new(Lockable::new(()));
    let inside = Arc::new(AtomicU32::new(0));
    let mut handles = vec![];
    for _ in 0..12 {
        let lockable = Arc::clone(&lockable);
        let inside = Arc::clone(&inside);
        handles.push(thread::spawn(move || {
            let _registration = registry::register_worker_thread().unwrap();
            for _ in 0..500 {
                let guard = lockable.lock();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                inside.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!lockable.is_locked());
    assert_eq!(lockable.word().wait_mask(), 0);
}

#[test]
fn test_semaphore_writer_blocks_until_drained() {
    let semaphore = Arc::new(QuickSemaphore::new());
    for _ in 0..5 {
        semaphore.register_reader();
    }

    let writer_done = Arc::new(AtomicU32::new(0));
    let writer_semaphore = Arc::clone(&semaphore);
    let writer_flag = Arc::clone(&writer_done);
    let writer = thread::spawn(move || {
        let _registration = registry::register_worker_thread().unwrap();
        writer_semaphore.wait_until_no_readers();
        writer_flag.store(1, Ordering::SeqCst);
    });

    // drain readers slowly; the writer must not finish early
    for i in (1..=5).rev() {
        thread::sleep(Duration::from_millis(10));
        assert_eq!(writer_done.load(Ordering::SeqCst), 0, "writer ran with {i} readers");
        semaphore.unregister_reader();
    }
    writer.join().unwrap();
    assert_eq!(writer_done.load(Ordering::SeqCst), 1);
    assert!(!semaphore.has_readers());
}

#[test]
fn test_session_store_concurrent_writers() {
    let store = Arc::new(SessionStore::new(config::shared(Default::default())));
    let mut handles = vec![];
    for t in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let _registration = registry::register_worker_thread().unwrap();
            for i in 0..50 {
                let id = format!("concurrent-{i}");
                let value = format!("value-{t}-{i}");
                store.write(
                    id.as_bytes(),
                    Some(accounted(Domain::Session, value.as_bytes())),
                    value.len() as u32,
                    Compressor::None,
                    600,
                    UserAgent::User,
                    0,
                );
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.len(), 50);
    let _registration = registry::register_worker_thread().unwrap();
    for i in 0..50 {
        let id = format!("concurrent-{i}");
        match store.read(id.as_bytes(), UserAgent::User, 0) {
            SessionReadOutcome::Found(payload) => {
                // one of the four writers won; the value is coherent
                let text = String::from_utf8(payload.data.to_vec()).unwrap();
                assert!(text.starts_with("value-") && text.ends_with(&format!("-{i}")));
            }
            SessionReadOutcome::Missing => panic!("record {id} lost"),
        }
    }
}

#[test]
fn test_reader_pin_outlives_destroy() {
    // a payload pinned by a reader survives record deletion until the
    // pin is dropped
    let _registration = registry::register_worker_thread().unwrap();
    let store = SessionStore::new(config::shared(Default::default()));
    store.write(
        b"doomed",
        Some(accounted(Domain::Session, b"still readable")),
        14,
        Compressor::None,
        600,
        UserAgent::User,
        0,
    );
    let payload = match store.read(b"doomed", UserAgent::User, 0) {
        SessionReadOutcome::Found(payload) => payload,
        SessionReadOutcome::Missing => panic!("expected data"),
    };
    assert!(store.destroy(b"doomed"));
    assert!(matches!(
        store.read(b"doomed", UserAgent::User, 0),
        SessionReadOutcome::Missing
    ));
    // the deleted record's bytes are still valid under the pin
    assert_eq!(&payload.data[..], b"still readable");
    drop(payload);
}

#[test]
fn test_tag_count_matches_reachable_nodes() {
    // after an arbitrary link/unlink workout the per-tag counts agree
    // with the lists
    let _registration = registry::register_worker_thread().unwrap();
    let store = PageStore::new(config::shared(Default::default()));
    let tag_sets: [&[&str]; 5] = [
        &["a"],
        &["a", "b"],
        &["b", "c", "d"],
        &[],
        &["a", "d"],
    ];
    for (i, tags) in tag_sets.iter().enumerate() {
        let id = format!("page-{i}");
        let tags: Vec<Vec<u8>> = tags.iter().map(|t| t.as_bytes().to_vec()).collect();
        store.save(
            id.as_bytes(),
            Some(accounted(Domain::Fpc, b"body")),
            4,
            Compressor::None,
            3600,
            UserAgent::User,
            &tags,
        );
    }
    // churn: retag and remove a few
    store.save(
        b"page-1",
        Some(accounted(Domain::Fpc, b"body")),
        4,
        Compressor::None,
        3600,
        UserAgent::User,
        &[b"c".to_vec()],
    );
    store.remove(b"page-2");

    // the store's index is private; verify through observable queries:
    // every id reported for a tag really carries that tag
    for tag in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()] {
        for id in store.ids_matching(cybercache::store::tags::TagMatch::Any, &[tag.clone()]) {
            let metadata = store.metadata(&id).unwrap();
            assert!(metadata.tags.contains(&tag), "{id:?} listed under wrong tag");
        }
    }
}
