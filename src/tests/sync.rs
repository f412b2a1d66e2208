//! Sleeping locks and condition waits.

use alloc::sync::Arc;
use alloc::vec::Vec;
use portable_atomic::{AtomicBool, Ordering};

use super::helpers::sim_scheduler;
use crate::errors::WaitError;
use crate::sched::WaitQueue;
use crate::sync::{Mutex, Semaphore};
use crate::time::{Duration, Instant};

#[test]
fn test_mutex_excludes_across_yields() {
    let (sched, _platform) = sim_scheduler();
    let counter = Arc::new(Mutex::new(0u64));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let counter = counter.clone();
            sched
                .spawn(move |s| {
                    for _ in 0..10 {
                        let mut guard = counter.lock(s);
                        let seen = *guard;
                        s.yield_now();
                        *guard = seen + 1;
                    }
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*counter.lock(&sched), 30);
    assert_eq!(counter.owner(), None);
}

#[test]
fn test_mutex_try_lock_while_held() {
    let (sched, _platform) = sim_scheduler();
    let mutex = Arc::new(Mutex::new(()));
    let contended = Arc::new(AtomicBool::new(false));

    let guard = mutex.lock(&sched);
    assert_eq!(mutex.owner(), Some(sched.current()));
    let handle = {
        let (mutex, contended) = (mutex.clone(), contended.clone());
        sched
            .spawn(move |s| {
                contended.store(mutex.try_lock(s).is_none(), Ordering::SeqCst);
                drop(mutex.lock(s));
            })
            .unwrap()
    };
    sched.yield_now();
    assert!(contended.load(Ordering::SeqCst));
    drop(guard);
    handle.join().unwrap();
    assert!(mutex.try_lock(&sched).is_some());
}

#[test]
#[should_panic(expected = "locked twice")]
fn test_mutex_relock_panics() {
    let (sched, _platform) = sim_scheduler();
    let mutex = Mutex::new(0);
    let _first = mutex.lock(&sched);
    let _second = mutex.lock(&sched);
}

#[test]
fn test_semaphore_timeout_then_up() {
    let (sched, _platform) = sim_scheduler();
    let sem = Arc::new(Semaphore::new(0));

    let waiter = {
        let sem = sem.clone();
        sched
            .spawn(move |s| assert_eq!(sem.down_timeout(s, Duration::from_millis(3)), Err(WaitError::TimedOut)))
            .unwrap()
    };
    waiter.join().unwrap();
    assert_eq!(sched.now(), Instant::from_nanos(3_000_000));

    sem.up(&sched);
    assert_eq!(sem.available(), 1);
    let taker = {
        let sem = sem.clone();
        sched.spawn(move |s| sem.down(s)).unwrap()
    };
    taker.join().unwrap();
    assert_eq!(sem.available(), 0);
    assert!(!sem.try_down());
}

#[test]
fn test_semaphore_up_wakes_blocked_boot() {
    let (sched, _platform) = sim_scheduler();
    let sem = Arc::new(Semaphore::new(0));
    let handle = {
        let sem = sem.clone();
        sched
            .spawn(move |s| {
                s.sleep(Duration::from_millis(1));
                sem.up(s);
            })
            .unwrap()
    };
    sem.down(&sched);
    assert_eq!(sched.now(), Instant::from_nanos(1_000_000));
    handle.join().unwrap();
}

#[test]
fn test_wait_event_sees_condition() {
    let (sched, _platform) = sim_scheduler();
    let queue = Arc::new(WaitQueue::new());
    let ready = Arc::new(AtomicBool::new(false));

    let handle = {
        let (queue, ready) = (queue.clone(), ready.clone());
        sched
            .spawn(move |s| {
                // A spurious wake must not end the wait.
                assert_eq!(queue.wake_all(s), 1);
                s.yield_now();
                ready.store(true, Ordering::SeqCst);
                assert_eq!(queue.wake_all(s), 1);
            })
            .unwrap()
    };
    queue.wait_event(&sched, || ready.load(Ordering::SeqCst));
    assert!(ready.load(Ordering::SeqCst));
    handle.join().unwrap();

    let deadline = sched.now() + Duration::from_millis(4);
    assert_eq!(
        queue.wait_event_until(&sched, deadline, || false),
        Err(WaitError::TimedOut)
    );
    assert_eq!(sched.now(), deadline);
    assert!(queue.is_empty(&sched));
}
