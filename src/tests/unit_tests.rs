use std::future::Future;
use std::num::ParseIntError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use futures::task::noop_waker_ref;
use static_assertions::assert_impl_all;
use tokio_util::sync::CancellationToken;

use crate::entry::Entry;
use crate::{Config, Error, Guard, KeyedLock};

assert_impl_all!(KeyedLock<String>: Clone, Send, Sync);
assert_impl_all!(Guard<String>: Send, Sync);

#[derive(Debug, Default)]
struct NoSpin;

impl Config for NoSpin {
    fn spin_count() -> usize {
        0
    }
}

#[test]
fn entry_lock_release() {
    let entry = Entry::reserved();
    assert_eq!(entry.ref_count(Relaxed), 1);
    assert!(entry.try_lock());
    assert!(!entry.try_lock());
    assert!(entry.is_locked(Relaxed));

    assert!(entry.try_reserve());
    assert_eq!(entry.ref_count(Relaxed), 2);
    assert!(!entry.release());
    assert!(!entry.is_locked(Relaxed));

    assert!(entry.try_lock());
    assert!(entry.release());
    assert_eq!(entry.ref_count(Relaxed), 0);
}

#[test]
fn entry_tombstone() {
    let entry = Entry::reserved();
    assert!(!entry.try_remove());
    assert!(entry.unreserve());
    assert!(entry.try_remove());
    assert!(entry.is_removed(Relaxed));
    assert!(!entry.try_reserve());
    assert!(!entry.try_remove());
    assert_eq!(entry.ref_count(Relaxed), 0);
}

#[test]
fn entry_locked_is_not_removable() {
    let entry = Entry::reserved();
    assert!(entry.try_lock());
    assert!(entry.try_reserve());
    assert!(!entry.unreserve());
    assert!(!entry.try_remove());
    assert!(entry.release());
    assert!(entry.try_remove());
}

#[test]
#[should_panic(expected = "not held")]
fn entry_release_unlocked() {
    let entry = Entry::reserved();
    entry.release();
}

#[test]
#[should_panic(expected = "below zero")]
fn entry_unreserve_twice() {
    let entry = Entry::reserved();
    assert!(entry.unreserve());
    entry.unreserve();
}

#[test]
fn entry_signal_handover() {
    let mut cx = Context::from_waker(noop_waker_ref());
    let entry = Entry::reserved();
    assert!(entry.try_lock());

    assert!(entry.try_reserve());
    let mut first = entry.lock_async();
    assert!(Pin::new(&mut first).poll(&mut cx).is_pending());

    assert!(entry.try_reserve());
    let mut second = entry.lock_async();
    assert!(Pin::new(&mut second).poll(&mut cx).is_pending());
    assert_eq!(entry.waiters(), 2);

    // The first waiter is signaled, but goes away without taking the lock.
    assert!(!entry.release());
    assert_eq!(entry.waiters(), 1);
    drop(first);
    assert!(!entry.unreserve());
    assert_eq!(entry.waiters(), 0);

    assert_eq!(Pin::new(&mut second).poll(&mut cx), Poll::Ready(()));
    assert!(entry.is_locked(Relaxed));
    assert!(entry.release());
}

#[test]
fn entry_drop_unsignaled_waiter() {
    let mut cx = Context::from_waker(noop_waker_ref());
    let entry = Entry::reserved();
    assert!(entry.try_lock());

    assert!(entry.try_reserve());
    let mut waiter = entry.lock_async();
    assert!(Pin::new(&mut waiter).poll(&mut cx).is_pending());
    drop(waiter);
    assert!(!entry.unreserve());

    assert_eq!(entry.waiters(), 0);
    assert!(entry.is_locked(Relaxed));
    assert!(entry.release());
}

#[test]
fn entry_lock_sync() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 256 };

    let entry = Arc::new(Entry::reserved());
    let check = Arc::new(AtomicUsize::new(0));
    entry.lock_sync::<NoSpin>();

    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let entry = entry.clone();
        let check = check.clone();
        threads.push(thread::spawn(move || {
            for _ in 0..num_iters {
                assert!(entry.try_reserve());
                entry.lock_sync::<NoSpin>();
                assert_eq!(check.fetch_add(1, Relaxed), 0);
                check.fetch_sub(1, Relaxed);
                entry.release();
            }
        }));
    }

    thread::sleep(Duration::from_millis(1));
    entry.release();

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(entry.ref_count(Relaxed), 0);
    assert!(!entry.is_locked(Relaxed));
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test(flavor = "multi_thread", worker_threads = 16)]
async fn lock_async() {
    let num_tasks = 64;
    let num_iters = 256;
    let num_keys = 4;

    let lock: KeyedLock<usize> = KeyedLock::new();
    let checks: Arc<Vec<AtomicUsize>> =
        Arc::new((0..num_keys).map(|_| AtomicUsize::new(0)).collect());

    let mut tasks = Vec::new();
    for i in 0..num_tasks {
        let lock = lock.clone();
        let checks = checks.clone();
        tasks.push(tokio::spawn(async move {
            for j in 0..num_iters {
                let key = (i + j) % num_keys;
                let guard = if j % 8 == 0 {
                    match lock.try_lock(key) {
                        Some(guard) => guard,
                        None => lock.lock_async(key).await,
                    }
                } else {
                    lock.lock_async(key).await
                };
                assert_eq!(checks[key].fetch_add(1, Relaxed), 0);
                if j % 3 == 0 {
                    tokio::task::yield_now().await;
                }
                checks[key].fetch_sub(1, Relaxed);
                drop(guard);
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert!(lock.is_empty());
}

#[test]
fn lock_sync() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 256 };
    let num_keys = 3;

    let lock: KeyedLock<usize, NoSpin> = KeyedLock::new();
    let checks: Arc<Vec<AtomicUsize>> =
        Arc::new((0..num_keys).map(|_| AtomicUsize::new(0)).collect());

    let mut threads = Vec::new();
    for i in 0..num_threads {
        let lock = lock.clone();
        let checks = checks.clone();
        threads.push(thread::spawn(move || {
            for j in 0..num_iters {
                let key = (i + j) % num_keys;
                let guard = if j % 5 == 0 {
                    let Some(guard) = lock.try_lock(key) else {
                        continue;
                    };
                    guard
                } else {
                    lock.lock_sync(key)
                };
                assert_eq!(checks[key].fetch_add(1, Relaxed), 0);
                thread::sleep(Duration::from_micros(1));
                checks[key].fetch_sub(1, Relaxed);
                assert!(guard.release());
            }
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert!(lock.is_empty());
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_waits_for_release() {
    let lock: KeyedLock<&'static str> = KeyedLock::new();
    let released = Arc::new(AtomicBool::new(false));

    let start = Instant::now();
    let holder = lock.lock_async("X").await;

    let task = {
        let lock = lock.clone();
        let released = released.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _guard = lock.lock_async("X").await;
            assert!(released.load(Acquire));
            start.elapsed()
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    released.store(true, Release);
    drop(holder);

    assert!(task.await.unwrap() >= Duration::from_millis(50));
    assert!(lock.is_empty());
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_keys_are_independent() {
    let lock: KeyedLock<&'static str> = KeyedLock::new();

    let x = lock.lock_async("X").await;
    let y = tokio::time::timeout(Duration::from_secs(1), lock.lock_async("Y"))
        .await
        .unwrap();

    assert!(lock.is_locked("X"));
    assert!(lock.is_locked("Y"));
    assert_eq!(lock.len(), 2);

    drop(x);
    assert!(!lock.contains_key("X"));
    drop(y);
    assert!(lock.is_empty());
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test(flavor = "multi_thread", worker_threads = 16)]
async fn idle_key_is_reclaimed() {
    let num_tasks = 1000;

    let lock: KeyedLock<&'static str> = KeyedLock::new();

    let mut tasks = Vec::new();
    for _ in 0..num_tasks {
        let lock = lock.clone();
        tasks.push(tokio::spawn(async move {
            let guard = lock.lock_async("Z").await;
            drop(guard);
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert!(!lock.contains_key("Z"));
    assert_eq!(lock.len(), 0);
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_pending() {
    let lock: KeyedLock<&'static str> = KeyedLock::new();
    let holder = lock.lock_async("W").await;

    let token = CancellationToken::new();
    let cancelled = {
        let lock = lock.clone();
        let token = token.clone();
        tokio::spawn(async move { lock.lock_async_with_cancel("W", &token).await.map(drop) })
    };

    while lock.ref_count("W") != 2 {
        tokio::task::yield_now().await;
    }
    token.cancel();
    assert_eq!(cancelled.await.unwrap(), Err(Error::Cancelled));
    assert_eq!(lock.ref_count("W"), 1);
    assert!(lock.is_locked("W"));

    let next = {
        let lock = lock.clone();
        tokio::spawn(async move {
            let _guard = lock.lock_async("W").await;
        })
    };
    while lock.ref_count("W") != 2 {
        tokio::task::yield_now().await;
    }
    drop(holder);
    next.await.unwrap();
    assert!(lock.is_empty());
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drop_pending_future() {
    let lock: KeyedLock<u32> = KeyedLock::new();
    let holder = lock.lock_async(1).await;

    let timed_out = tokio::time::timeout(Duration::from_millis(20), lock.lock_async(1)).await;
    assert!(timed_out.is_err());
    assert_eq!(lock.ref_count(&1), 1);

    drop(holder);
    assert!(lock.is_empty());

    let pending = lock.lock_async(2);
    drop(pending);
    assert!(lock.is_empty());
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test]
async fn cancelled_token() {
    let lock: KeyedLock<u32> = KeyedLock::new();
    let token = CancellationToken::new();
    token.cancel();

    assert_eq!(
        lock.lock_async_with_cancel(1, &token).await.err(),
        Some(Error::Cancelled)
    );
    assert!(lock.is_empty());
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test]
async fn cancel_after_acquisition() {
    let lock: KeyedLock<u32> = KeyedLock::new();
    let token = CancellationToken::new();

    let guard = lock.lock_async_with_cancel(1, &token).await.unwrap();
    token.cancel();
    assert!(lock.is_locked(&1));
    assert!(lock.try_lock(1).is_none());

    drop(guard);
    assert!(lock.is_empty());
}

#[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panic_in_critical_section() {
    let lock: KeyedLock<&'static str> = KeyedLock::new();

    let task = {
        let lock = lock.clone();
        tokio::spawn(async move {
            let _guard = lock.lock_async("V").await;
            panic!("critical section failed");
        })
    };
    assert!(task.await.unwrap_err().is_panic());
    assert!(lock.is_empty());

    let guard = tokio::time::timeout(Duration::from_secs(1), lock.lock_async("V"))
        .await
        .unwrap();
    drop(guard);
    assert!(lock.is_empty());
}

#[test]
fn error_in_critical_section() {
    fn critical_section(lock: &KeyedLock<u32>, input: &str) -> Result<u32, ParseIntError> {
        let _guard = lock.lock_sync(5);
        let value = input.parse::<u32>()?;
        Ok(value)
    }

    let lock: KeyedLock<u32> = KeyedLock::new();
    assert!(critical_section(&lock, "five").is_err());
    assert!(lock.is_empty());
    assert_eq!(critical_section(&lock, "5"), Ok(5));
    assert!(lock.is_empty());

    let result = catch_unwind(AssertUnwindSafe(|| {
        let _guard = lock.lock_sync(5);
        panic!("critical section failed");
    }));
    assert!(result.is_err());
    assert!(lock.is_empty());
    assert!(lock.try_lock(5).is_some());
}

#[test]
fn release_once() {
    let lock: KeyedLock<u32> = KeyedLock::new();

    let guard = lock.lock_sync(1);
    let waiter = lock.clone();
    let thread = thread::spawn(move || {
        let guard = waiter.lock_sync(1);
        assert!(guard.release());
    });

    while lock.ref_count(&1) != 2 {
        thread::yield_now();
    }
    assert!(guard.release());
    assert!(!guard.release());
    thread.join().unwrap();

    assert!(!guard.release());
    drop(guard);
    assert!(lock.is_empty());
}

#[test]
fn guard_outlives_handle() {
    let lock: KeyedLock<String> = KeyedLock::new();
    let guard = lock.lock_sync("order".to_string());
    assert_eq!(guard.key(), "order");
    drop(lock);
    assert!(guard.release());
}

#[test]
fn tombstoned_entry_is_replaced() {
    let lock: KeyedLock<u32> = KeyedLock::new();
    let tombstone = Arc::new(Entry::reserved());
    assert!(tombstone.unreserve());
    assert!(tombstone.try_remove());

    lock.map_entry(3, tombstone.clone());
    let guard = lock.try_lock(3).unwrap();
    let entry = lock.mapped_entry(&3).unwrap();
    assert!(!Arc::ptr_eq(&entry, &tombstone));
    assert!(entry.is_locked(Relaxed));
    assert_eq!(entry.ref_count(Relaxed), 1);
    drop(guard);
    assert!(entry.is_removed(Relaxed));
    assert!(lock.is_empty());

    lock.map_entry(3, tombstone.clone());
    let guard = lock.lock_sync(3);
    assert!(!Arc::ptr_eq(&lock.mapped_entry(&3).unwrap(), &tombstone));
    assert!(lock.is_locked(&3));
    drop(guard);
    assert!(lock.is_empty());

    assert!(tombstone.is_removed(Relaxed));
    assert_eq!(tombstone.ref_count(Relaxed), 0);
}

#[test]
fn reuse_after_reclaim() {
    let lock: KeyedLock<u32> = KeyedLock::new();
    for _ in 0..16 {
        let guard = lock.try_lock(9).unwrap();
        assert_eq!(lock.ref_count(&9), 1);
        assert!(lock.try_lock(9).is_none());
        assert_eq!(lock.ref_count(&9), 1);
        drop(guard);
        assert!(!lock.contains_key(&9));
    }
}
