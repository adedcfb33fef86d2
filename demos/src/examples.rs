#![cfg(test)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

use fairlock::{Error, FairRwLock, NamedRwLock, join_all};

#[test]
fn lock_exclusive() {
    let lock = FairRwLock::new();

    let writer = lock.acquire_write().wait();

    assert!(lock.try_write().is_none());
    assert!(lock.try_read().is_none());

    writer.release();
    assert!(lock.is_idle(Relaxed));
}

#[test]
fn readers_wait_for_writer() {
    let lock = FairRwLock::new();

    let writer = lock.acquire_write().wait();
    let readers = join_all((0..4).map(|_| lock.acquire_read()));
    let next_writer = lock.acquire_write();
    assert!(!readers.is_done());

    writer.release();
    let tokens = readers.wait();
    assert!(!next_writer.is_done());

    drop(tokens);
    assert!(next_writer.is_done());
}

#[tokio::test]
async fn named_async() {
    let named: NamedRwLock<String> = NamedRwLock::new();
    let visits = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let named = named.clone();
        let visits = visits.clone();
        tasks.push(tokio::spawn(async move {
            let token = named.acquire_write(format!("file-{}", i % 2)).await;
            visits.fetch_add(1, Relaxed);
            token.release()
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    assert_eq!(visits.load(Relaxed), 8);
    assert!(named.is_empty());
}

#[test]
fn named_key_modification() {
    #[derive(Clone)]
    struct Key(Arc<AtomicUsize>);

    impl PartialEq for Key {
        fn eq(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.0, &other.0)
        }
    }

    impl Eq for Key {}

    impl std::hash::Hash for Key {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            self.0.load(Relaxed).hash(state);
        }
    }

    let named: NamedRwLock<Key> = NamedRwLock::new();
    let key = Key(Arc::new(AtomicUsize::new(0)));

    let token = named.acquire_read(key.clone()).wait();
    key.0.store(1, Relaxed);
    assert_eq!(token.release(), Err(Error::ConcurrentKeyModification));
}
