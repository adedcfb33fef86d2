use std::fmt::{self, Write};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Metadata, Subscriber};

use crate::{Deferred, FairRwLock, ReadLockToken, join_all};

/// Collects the fields of every event as text.
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<String>>>);

struct FieldText(String);

impl Visit for FieldText {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let _ = write!(self.0, "{}={value:?} ", field.name());
    }
}

impl Subscriber for EventLog {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _: &Id, _: &Record<'_>) {}

    fn record_follows_from(&self, _: &Id, _: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut text = FieldText(String::new());
        event.record(&mut text);
        self.0.lock().unwrap().push(text.0);
    }

    fn enter(&self, _: &Id) {}

    fn exit(&self, _: &Id) {}
}

#[test]
fn fairness() {
    let lock = FairRwLock::new();

    let write1 = lock.acquire_write();
    assert!(write1.is_done());

    // Under the write lock.
    let read1 = lock.acquire_read();
    let read2 = lock.acquire_read();
    let read3 = lock.acquire_read();
    assert!(!read1.is_done());
    assert!(!read2.is_done());
    assert!(!read3.is_done());

    let write2 = lock.acquire_write();
    assert!(!write2.is_done());

    let read4 = lock.acquire_read();
    let read5 = lock.acquire_read();
    let read6 = lock.acquire_read();
    assert!(!read4.is_done());
    assert!(!read5.is_done());
    assert!(!read6.is_done());

    let write3 = lock.acquire_write();
    assert!(!write3.is_done());

    write1.wait().release();
    assert!(read1.is_done());
    assert!(read2.is_done());
    assert!(read3.is_done());
    assert!(!write2.is_done());
    assert!(!read4.is_done());
    assert!(!read5.is_done());
    assert!(!read6.is_done());
    assert!(!write3.is_done());

    read1.wait().release();
    read2.wait().release();
    assert!(read3.is_done());
    assert!(!write2.is_done());
    assert!(!read4.is_done());
    assert!(!write3.is_done());

    // Under the read lock of `read3`.
    let read7 = lock.acquire_read();
    let write4 = lock.acquire_write();
    assert!(!read7.is_done());
    assert!(!write4.is_done());

    read3.wait().release();
    assert!(write2.is_done());
    assert!(!read4.is_done());
    assert!(!read5.is_done());
    assert!(!read6.is_done());
    assert!(!write3.is_done());
    assert!(!read7.is_done());
    assert!(!write4.is_done());

    write2.wait().release();
    assert!(read4.is_done());
    assert!(read5.is_done());
    assert!(read6.is_done());
    assert!(!write3.is_done());
    assert!(!read7.is_done());
    assert!(!write4.is_done());

    join_all([read4, read5, read6])
        .wait()
        .into_iter()
        .for_each(ReadLockToken::release);
    assert!(write3.is_done());
    assert!(!read7.is_done());
    assert!(!write4.is_done());

    write3.wait().release();
    assert!(read7.is_done());
    assert!(!write4.is_done());

    read7.wait().release();
    assert!(write4.is_done());

    write4.wait().release();
    assert!(lock.is_idle(Relaxed));
}

#[test]
fn no_barging() {
    let lock = FairRwLock::new();

    let reader = lock.try_read().unwrap();
    let writer = lock.acquire_write();
    assert!(!writer.is_done());
    assert!(lock.has_waiters(Relaxed));

    // A waiting writer is not overtaken by new readers.
    assert!(lock.try_read().is_none());
    let late_reader = lock.acquire_read();
    assert!(!late_reader.is_done());

    reader.release();
    assert!(writer.is_done());
    assert!(!late_reader.is_done());
    assert!(lock.try_write().is_none());

    writer.wait().release();
    assert!(late_reader.is_done());
    assert!(!lock.has_waiters(Relaxed));

    // Readers share the lock while nobody waits.
    let shared = lock.try_read().unwrap();
    assert!(lock.acquire_read().is_done());
    shared.release();
    late_reader.wait().release();
    assert!(lock.is_idle(Relaxed));
}

#[test]
fn abandoned_request() {
    let lock = FairRwLock::new();
    let writer = lock.acquire_write().wait();

    let abandoned_reader = lock.acquire_read();
    let abandoned_writer = lock.acquire_write();
    let reader = lock.acquire_read();
    drop(abandoned_reader);
    drop(abandoned_writer);

    // The abandoned requests are granted and immediately released in turn.
    writer.release();
    assert!(reader.is_done());
    assert!(lock.is_shared(Relaxed));
    assert!(!lock.has_waiters(Relaxed));

    // A granted token that was never taken is released with the `Deferred`.
    drop(reader);
    assert!(lock.is_idle(Relaxed));
}

#[test]
fn reentrant_continuation() {
    let lock = FairRwLock::new();
    let writer = lock.acquire_write().wait();
    let granted = Arc::new(AtomicUsize::new(0));

    let (lock_clone, granted_clone) = (lock.clone(), granted.clone());
    lock.acquire_read().on_complete(move |token| {
        granted_clone.fetch_add(1, Relaxed);
        token.release();

        // The lock is free again, so the continuation can acquire it synchronously.
        let writer = lock_clone.try_write().unwrap();
        let counter = granted_clone.clone();
        lock_clone.acquire_read().on_complete(move |token| {
            counter.fetch_add(1, Relaxed);
            token.release();
        });
        writer.release();
    });
    assert_eq!(granted.load(Relaxed), 0);

    writer.release();
    assert_eq!(granted.load(Relaxed), 2);
    assert!(lock.is_idle(Relaxed));
}

#[test]
fn abandoned_requests_drain_iteratively() {
    let num_requests = if cfg!(miri) { 64 } else { 131_072 };

    let thread = thread::Builder::new()
        .stack_size(2 * 1024 * 1024)
        .spawn(move || {
            let lock = FairRwLock::new();
            let writer = lock.acquire_write().wait();
            for _ in 0..num_requests {
                drop(lock.acquire_write());
            }
            let reader = lock.acquire_read();

            writer.release();
            assert!(reader.is_done());
            assert!(!lock.has_waiters(Relaxed));
            drop(reader);
            assert!(lock.is_idle(Relaxed));
        })
        .unwrap();
    thread.join().unwrap();
}

#[test]
fn continuations_drain_iteratively() {
    let num_requests = if cfg!(miri) { 64 } else { 131_072 };

    let thread = thread::Builder::new()
        .stack_size(2 * 1024 * 1024)
        .spawn(move || {
            let lock = FairRwLock::new();
            let released = Arc::new(AtomicUsize::new(0));
            let writer = lock.acquire_write().wait();
            for _ in 0..num_requests {
                let released = released.clone();
                lock.acquire_write().on_complete(move |token| {
                    token.release();
                    released.fetch_add(1, Relaxed);
                });
            }

            writer.release();
            assert_eq!(released.load(Relaxed), num_requests);
            assert!(lock.is_idle(Relaxed));
        })
        .unwrap();
    thread.join().unwrap();
}

#[test]
fn grant_events() {
    let log = EventLog::default();
    tracing::subscriber::with_default(log.clone(), || {
        let lock = FairRwLock::new();
        let writer = lock.acquire_write().wait();
        let readers = join_all([lock.acquire_read(), lock.acquire_read()]);
        let next_writer = lock.acquire_write();

        writer.release();
        drop(readers);
        drop(next_writer);
        assert!(lock.is_idle(Relaxed));
    });

    let events = log.0.lock().unwrap();
    let grants: Vec<&String> = events
        .iter()
        .filter(|e| e.contains("wait queue processed"))
        .collect();
    assert_eq!(grants.len(), 2);
    assert!(grants[0].contains("mode=Some(Shared)"));
    assert!(grants[0].contains("granted=2"));
    assert!(grants[1].contains("mode=Some(Exclusive)"));
    assert!(grants[1].contains("granted=1"));
}

#[test]
fn deferred_combinators() {
    assert!(join_all(Vec::<Deferred<usize>>::new()).wait().is_empty());

    let lock = FairRwLock::new();
    let writer = lock.acquire_write().wait();
    let readers = join_all((0..4).map(|_| lock.acquire_read()));
    let mapped = lock.acquire_write().map(|token| token.lock().is_locked(Relaxed));
    assert!(!readers.is_done());
    assert!(!mapped.is_done());

    writer.release();
    let tokens = readers.wait();
    assert_eq!(tokens.len(), 4);
    assert!(tokens.iter().all(|t| t.lock().ptr_eq(&lock)));
    assert!(!mapped.is_done());

    drop(tokens);
    assert!(mapped.wait());
    assert!(lock.is_idle(Relaxed));

    let mut ready = Deferred::ready(1).map(|v| v * 2);
    assert_eq!(ready.try_take(), Some(2));
    assert!(!ready.is_done());
}

#[test]
fn debug_output() {
    let lock = FairRwLock::new();
    let token = lock.acquire_write().wait();
    let reader = lock.acquire_read();
    let debug = format!("{lock:?}");
    assert!(debug.contains("locked: true"));
    assert!(debug.contains("has_waiters: true"));
    assert!(format!("{reader:?}").contains("done: false"));
    assert!(format!("{token:?}").contains("armed: true"));
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test(flavor = "multi_thread", worker_threads = 16)]
async fn lock_async() {
    let num_tasks = 64;

    let lock = FairRwLock::new();
    let check = Arc::new(AtomicUsize::new(0));

    let writer = lock.acquire_write().await;
    check.fetch_add(usize::MAX, Relaxed);

    let mut tasks = Vec::new();
    for i in 0..num_tasks {
        let lock = lock.clone();
        let check = check.clone();
        tasks.push(tokio::spawn(async move {
            let token = if i % 8 == 0 {
                lock.acquire_read().wait()
            } else {
                lock.acquire_read().await
            };
            assert_ne!(check.fetch_add(1, Relaxed), usize::MAX);
            check.fetch_sub(1, Relaxed);
            token.release();
            lock.acquire_read().await.release();
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    check.fetch_sub(usize::MAX, Relaxed);
    writer.release();

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(check.load(Relaxed), 0);

    lock.acquire_write().await.release();
    assert!(lock.is_idle(Relaxed));
}

#[test]
fn lock_sync() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 256 };

    let lock = FairRwLock::new();
    let check = Arc::new(AtomicUsize::new(0));

    let writer = lock.acquire_write().wait();
    check.fetch_add(usize::MAX, Relaxed);

    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let lock = lock.clone();
        let check = check.clone();
        threads.push(thread::spawn(move || {
            for j in 0..num_iters {
                if j % 11 == 0 {
                    let token = lock.acquire_write().wait();
                    assert_eq!(check.fetch_add(usize::MAX, Relaxed), 0);
                    thread::sleep(Duration::from_micros(1));
                    check.fetch_sub(usize::MAX, Relaxed);
                    token.release();
                } else {
                    let token = lock.acquire_read().wait();
                    assert!(check.fetch_add(1, Relaxed) < num_threads);
                    thread::sleep(Duration::from_micros(1));
                    check.fetch_sub(1, Relaxed);
                    token.release();
                }
            }
        }));
    }

    thread::sleep(Duration::from_micros(1));
    check.fetch_sub(usize::MAX, Relaxed);
    writer.release();

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(check.load(Relaxed), 0);
    assert!(lock.is_idle(Relaxed));
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test(flavor = "multi_thread", worker_threads = 16)]
async fn lock_chaos() {
    let num_tasks = 32;
    let num_iters = 1024;

    let lock = FairRwLock::new();
    let check = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..num_tasks {
        let lock = lock.clone();
        let check = check.clone();
        if i % 2 == 0 {
            tasks.push(tokio::spawn(async move {
                for j in 0..num_iters {
                    if j % 11 == 0 {
                        let token = lock.acquire_write().await;
                        assert_eq!(check.fetch_add(usize::MAX, Relaxed), 0);
                        check.fetch_sub(usize::MAX, Relaxed);
                        token.release();
                    } else {
                        let token = lock.acquire_read().await;
                        assert!(check.fetch_add(1, Relaxed) < num_tasks);
                        check.fetch_sub(1, Relaxed);
                        token.release();
                    }
                }
            }));
        } else {
            threads.push(thread::spawn(move || {
                for j in 0..num_iters {
                    if j % 7 == 3 {
                        drop(lock.acquire_write());
                    } else if let Some(token) = lock.try_write() {
                        assert_eq!(check.fetch_add(usize::MAX, Relaxed), 0);
                        check.fetch_sub(usize::MAX, Relaxed);
                        token.release();
                    } else {
                        let token = lock.acquire_read().wait();
                        assert!(check.fetch_add(1, Relaxed) < num_tasks);
                        check.fetch_sub(1, Relaxed);
                        token.release();
                    }
                }
            }));
        }
    }

    for thread in threads {
        thread.join().unwrap();
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(check.load(Relaxed), 0);
    assert!(lock.is_idle(Relaxed));
}
