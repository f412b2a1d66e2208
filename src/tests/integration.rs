//! End-to-end scheduling scenarios.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::helpers::{
    sim_scheduler, CountingAllocator, FailingAllocator, SchedRef, SimPlatform, TEST_CONFIG,
};
use crate::arch::{Arch, DefaultArch};
use crate::errors::{JoinError, SpawnError};
use crate::mem::GlobalAllocator;
use crate::sched::{Scheduler, WaitQueue};
use crate::thread::{ThreadBuilder, ThreadKind, ThreadState, WakeReason};
use crate::time::{Duration, Instant};

#[test]
fn test_round_robin_fifo_order() {
    let (sched, _platform) = sim_scheduler();
    let trace = Arc::new(spin::Mutex::new(String::new()));

    let handles: Vec<_> = ['A', 'B', 'C']
        .into_iter()
        .map(|letter| {
            let trace = trace.clone();
            sched
                .spawn(move |s| {
                    for _ in 0..5 {
                        trace.lock().push(letter);
                        s.yield_now();
                    }
                })
                .unwrap()
        })
        .collect();

    let reason = sched.sleep_until(Instant::ZERO + Duration::from_secs(1));
    assert_eq!(reason, WakeReason::TimedOut);
    assert_eq!(trace.lock().as_str(), "ABCABCABCABCABC");
    assert_eq!(sched.stats().idle_dispatches, 1);
    assert_eq!(sched.now(), Instant::from_nanos(1_000_000_000));

    for handle in handles {
        assert!(handle.is_finished());
        handle.join().unwrap();
    }
    assert_eq!(sched.threads().len(), 2);
    sched.check_consistency().unwrap();
}

#[test]
fn test_yield_alone_returns_immediately() {
    let (sched, _platform) = sim_scheduler();
    sched.yield_now();
    sched.yield_now();
    assert_eq!(sched.stats().context_switches, 0);
    assert_eq!(sched.current_name().as_deref(), Some("boot"));
}

#[test]
fn test_sleep_wakes_at_deadline() {
    let (sched, _platform) = sim_scheduler();
    let woke_at = Arc::new(AtomicU64::new(0));

    let handle = {
        let woke_at = woke_at.clone();
        sched
            .spawn(move |s| {
                s.sleep(Duration::from_millis(1));
                woke_at.store(s.now().as_nanos(), Ordering::SeqCst);
            })
            .unwrap()
    };
    handle.join().unwrap();

    assert!(woke_at.load(Ordering::SeqCst) >= 1_000_000);
    assert_eq!(sched.stats().timeouts_fired, 1);
}

#[test]
fn test_explicit_wake_beats_timeout() {
    let (sched, _platform) = sim_scheduler();
    let queue = Arc::new(WaitQueue::new());
    let outcome = Arc::new(spin::Mutex::new(None));

    let handle = {
        let (queue, outcome) = (queue.clone(), outcome.clone());
        sched
            .spawn(move |s| {
                let reason = s.block_timeout(&queue, s.now() + Duration::from_millis(10));
                *outcome.lock() = Some((reason, s.now()));
            })
            .unwrap()
    };
    let worker = handle.thread_id();

    sched.sleep(Duration::from_millis(2));
    assert_eq!(sched.thread_state(worker), Some(ThreadState::Sleeping));
    assert_eq!(
        sched.thread_info(worker).unwrap().deadline,
        Some(Instant::from_nanos(10_000_000))
    );
    assert_eq!(queue.wake_one(&sched), Some(worker));
    handle.join().unwrap();

    assert_eq!(
        *outcome.lock(),
        Some((WakeReason::Woken, Instant::from_nanos(2_000_000)))
    );
    assert_eq!(sched.next_deadline(), None);
    let stats = sched.stats();
    assert_eq!((stats.timeouts_fired, stats.wakeups), (1, 2));
}

#[test]
fn test_timeout_fires_without_wake() {
    let (sched, _platform) = sim_scheduler();
    let queue = Arc::new(WaitQueue::new());
    let outcome = Arc::new(spin::Mutex::new(None));

    let handle = {
        let (queue, outcome) = (queue.clone(), outcome.clone());
        sched
            .spawn(move |s| {
                let reason = s.block_timeout(&queue, Instant::from_nanos(5_000_000));
                *outcome.lock() = Some((reason, s.now()));
            })
            .unwrap()
    };
    handle.join().unwrap();

    assert_eq!(
        *outcome.lock(),
        Some((WakeReason::TimedOut, Instant::from_nanos(5_000_000)))
    );
    assert!(queue.is_empty(&sched));
}

#[test]
fn test_past_deadline_does_not_block() {
    let (sched, platform) = sim_scheduler();
    platform.advance(Duration::from_millis(3));
    let queue = WaitQueue::new();
    assert_eq!(
        sched.block_timeout(&queue, Instant::from_nanos(1_000_000)),
        WakeReason::TimedOut
    );
    assert_eq!(sched.sleep_until(sched.now()), WakeReason::TimedOut);
    assert_eq!(sched.stats().context_switches, 0);
}

#[test]
fn test_equal_deadlines_wake_in_arrival_order() {
    let (sched, _platform) = sim_scheduler();
    let order = Arc::new(spin::Mutex::new(Vec::new()));
    let deadline = Instant::from_nanos(5_000_000);

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let order = order.clone();
            sched
                .spawn(move |s| {
                    s.sleep_until(deadline);
                    order.lock().push(i);
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock(), [0, 1, 2]);
}

#[test]
fn test_destructor_runs_exactly_once() {
    let (sched, _platform) = sim_scheduler();
    let runs = Arc::new(AtomicUsize::new(0));
    let after_exit = Arc::new(AtomicBool::new(false));

    let returning = {
        let runs = runs.clone();
        ThreadBuilder::new()
            .on_exit(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(&sched, |s| s.yield_now())
            .unwrap()
    };
    let exiting = {
        let (runs, after_exit) = (runs.clone(), after_exit.clone());
        ThreadBuilder::new()
            .on_exit(move |_| {
                runs.fetch_add(10, Ordering::SeqCst);
            })
            .spawn(&sched, move |s| {
                if !after_exit.load(Ordering::SeqCst) {
                    s.exit_now();
                }
                after_exit.store(true, Ordering::SeqCst);
            })
            .unwrap()
    };

    returning.join().unwrap();
    exiting.join().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 11);
    assert!(!after_exit.load(Ordering::SeqCst));
}

#[test]
fn test_destructor_sees_own_id() {
    let (sched, _platform) = sim_scheduler();
    let seen = Arc::new(spin::Mutex::new(None));
    let handle = {
        let seen = seen.clone();
        ThreadBuilder::new()
            .on_exit(move |id| *seen.lock() = Some(id))
            .spawn(&sched, |_| {})
            .unwrap()
    };
    let id = handle.thread_id();
    handle.join().unwrap();
    assert_eq!(*seen.lock(), Some(id));
    assert_eq!(sched.thread_state(id), None);
}

#[test]
fn test_idle_halts_until_interrupt() {
    let (sched, platform) = sim_scheduler();
    let boot = sched.current();
    let queue = WaitQueue::new();

    let target = SchedRef::new(&sched);
    platform.raise_irq(move || {
        assert!(!DefaultArch::irqs_enabled());
        assert!(target.get().wake(boot));
    });

    assert_eq!(sched.block(&queue), WakeReason::Woken);
    assert_eq!(platform.halts(), 1);
    let stats = sched.stats();
    assert_eq!((stats.idle_dispatches, stats.context_switches), (1, 2));
    assert!(queue.is_empty(&sched));
    assert!(DefaultArch::irqs_enabled());
}

#[test]
fn test_wake_is_noop_unless_sleeping() {
    let (sched, _platform) = sim_scheduler();
    let handle = sched.spawn(|_| {}).unwrap();
    let id = handle.thread_id();

    assert!(!sched.wake(id));
    assert!(!sched.wake(sched.current()));
    assert_eq!(sched.runnable_count(), 1);
    handle.join().unwrap();
    assert!(!sched.wake(id));
    // Only the joiner was woken, by the thread's exit.
    assert_eq!(sched.stats().wakeups, 1);
}

#[test]
fn test_spawn_rejects_bad_options() {
    let (sched, _platform) = sim_scheduler();
    let too_small = ThreadBuilder::new().stack_size(16).spawn(&sched, |_| {});
    assert_eq!(too_small.unwrap_err(), SpawnError::InvalidStackSize(16));

    let unnamed = ThreadBuilder::new().name("").spawn(&sched, |_| {});
    assert_eq!(unnamed.unwrap_err(), SpawnError::InvalidName(String::new()));

    assert_eq!(sched.threads().len(), 2);
    assert_eq!(sched.stats().threads_created, 1);
}

#[test]
fn test_out_of_memory() {
    let no_memory = Scheduler::<DefaultArch>::with_config(TEST_CONFIG, SimPlatform::new(), FailingAllocator::new(0));
    assert_eq!(no_memory.err(), Some(SpawnError::OutOfMemory));

    let sched =
        Scheduler::<DefaultArch>::with_config(TEST_CONFIG, SimPlatform::new(), FailingAllocator::new(1)).unwrap();
    assert_eq!(sched.spawn(|_| {}).err(), Some(SpawnError::OutOfMemory));
    assert_eq!(sched.threads().len(), 2);
    assert_eq!(sched.runnable_count(), 0);
    sched.check_consistency().unwrap();
}

#[test]
fn test_every_stack_is_freed() {
    let allocator = CountingAllocator::default();
    {
        let sched = Scheduler::<DefaultArch>::with_config(TEST_CONFIG, SimPlatform::new(), allocator.clone()).unwrap();
        let joined: Vec<_> = (0..2).map(|_| sched.spawn(|s| s.yield_now()).unwrap()).collect();
        sched.spawn(|_| {}).unwrap().detach();
        for handle in joined {
            handle.join().unwrap();
        }
        assert_eq!(sched.stats().threads_reaped, 3);
        // Never dispatched; torn down with the scheduler.
        let pending = sched.spawn(|_| {}).unwrap();
        let pending_id = pending.thread_id();
        drop(pending);
        assert_eq!(sched.thread_state(pending_id), Some(ThreadState::Runnable));
    }
    assert_eq!(allocator.allocs(), 5);
    assert_eq!(allocator.frees(), allocator.allocs());
}

#[test]
fn test_allocator_serves_only_stacks() {
    let allocator = CountingAllocator::default();
    let sched = Scheduler::<DefaultArch>::with_config(TEST_CONFIG, SimPlatform::new(), allocator.clone()).unwrap();
    assert_eq!(allocator.allocs(), 1);
    let handles: Vec<_> = (0..3).map(|_| sched.spawn(|_| {}).unwrap()).collect();
    let stacks = sched.threads().iter().filter(|t| t.stack_size > 0).count();
    assert_eq!(allocator.allocs(), stacks);
    assert_eq!(stacks, 4);
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(allocator.frees(), 3);
}

#[test]
#[should_panic(expected = "stack canary overwritten")]
fn test_overwritten_canary_is_fatal() {
    let (sched, _platform) = sim_scheduler();
    let handle = sched.spawn(|_| {}).unwrap();
    let info = sched.thread_info(handle.thread_id()).unwrap();
    assert_ne!(info.stack_base, 0);
    // Clobber the lowest word, as a runaway stack would.
    unsafe { (info.stack_base as *mut u64).write_volatile(0) };
    sched.yield_now();
}

#[test]
fn test_threads_run_inside_their_stacks() {
    let (sched, _platform) = sim_scheduler();
    let inside = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let inside = inside.clone();
            sched
                .spawn(move |s| {
                    let info = s.thread_info(s.current()).unwrap();
                    let local = 0u64;
                    let addr = &local as *const u64 as usize;
                    if (info.stack_base..info.stack_base + info.stack_size).contains(&addr) {
                        inside.fetch_add(1, Ordering::SeqCst);
                    }
                    s.yield_now();
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(inside.load(Ordering::SeqCst), 2);
    assert_eq!(sched.thread_info(sched.current()).unwrap().stack_base, 0);
}

#[test]
fn test_tls_follows_thread() {
    // Safety: only this test's OS thread sees the simulated register.
    unsafe { DefaultArch::tls_set(0x42) };
    let (sched, _platform) = sim_scheduler();
    let seen = Arc::new(spin::Mutex::new(Vec::new()));

    let handles: Vec<_> = [0x1000usize, 0x2000]
        .into_iter()
        .map(|tls| {
            let seen = seen.clone();
            ThreadBuilder::new()
                .tls(tls)
                .spawn(&sched, move |s| {
                    for _ in 0..3 {
                        seen.lock().push(DefaultArch::tls_get());
                        s.yield_now();
                    }
                })
                .unwrap()
        })
        .collect();
    sched.yield_now();
    assert_eq!(DefaultArch::tls_get(), 0x42);
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(DefaultArch::tls_get(), 0x42);
    assert_eq!(*seen.lock(), [0x1000, 0x2000, 0x1000, 0x2000, 0x1000, 0x2000]);
}

#[test]
fn test_registers_survive_switches() {
    let (sched, _platform) = sim_scheduler();
    let results = Arc::new(spin::Mutex::new(Vec::new()));

    let handles: Vec<_> = (1..=3u64)
        .map(|seed| {
            let results = results.clone();
            sched
                .spawn(move |s| {
                    let mut acc = seed;
                    let mut f = seed as f64;
                    for i in 0..20u64 {
                        acc = acc.wrapping_mul(31).wrapping_add(i);
                        f = f * 1.5 + 0.25;
                        s.yield_now();
                    }
                    results.lock().push((seed, acc, f));
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for &(seed, acc, f) in results.lock().iter() {
        let mut want = seed;
        let mut want_f = seed as f64;
        for i in 0..20u64 {
            want = want.wrapping_mul(31).wrapping_add(i);
            want_f = want_f * 1.5 + 0.25;
        }
        assert_eq!(acc, want);
        assert_eq!(f.to_bits(), want_f.to_bits());
    }
    assert_eq!(results.lock().len(), 3);
}

#[test]
fn test_join_errors_and_detach() {
    let (sched, _platform) = sim_scheduler();
    assert_eq!(sched.join(sched.current()), Err(JoinError::WouldDeadlock));

    let detached = ThreadBuilder::new().detached().spawn(&sched, |_| {}).unwrap();
    let detached_id = detached.thread_id();
    assert_eq!(detached.join(), Err(JoinError::Detached));

    let dropped = sched.spawn(|s| s.yield_now()).unwrap();
    let dropped_id = dropped.thread_id();
    dropped.detach();

    sched.yield_now();
    sched.yield_now();
    assert_eq!(sched.thread_state(detached_id), None);
    assert_eq!(sched.thread_state(dropped_id), None);
    assert_eq!(sched.stats().threads_reaped, 2);
    sched.check_consistency().unwrap();
}

#[test]
fn test_ids_are_not_reused() {
    let (sched, _platform) = sim_scheduler();
    let first = sched.spawn(|_| {}).unwrap();
    let first_id = first.thread_id();
    first.join().unwrap();

    let second = sched.spawn(|_| {}).unwrap();
    assert_ne!(second.thread_id(), first_id);
    assert_eq!(sched.thread_info(first_id), None);
    second.join().unwrap();
}

#[test]
fn test_thread_enumeration() {
    let (sched, _platform) = sim_scheduler();
    let name_seen = Arc::new(spin::Mutex::new(None));
    let handle = {
        let name_seen = name_seen.clone();
        ThreadBuilder::new()
            .name("worker")
            .stack_size(128 * 1024)
            .spawn(&sched, move |s| *name_seen.lock() = s.current_name())
            .unwrap()
    };

    let threads = sched.threads();
    let names: Vec<_> = threads.iter().map(|t| t.name.clone().unwrap_or_default()).collect();
    assert_eq!(names, ["boot", "idle", "worker"]);
    let kinds: Vec<_> = threads.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, [ThreadKind::Boot, ThreadKind::Idle, ThreadKind::Worker]);
    assert_eq!(threads[0].stack_size, 0);
    assert_eq!(threads[1].stack_size, TEST_CONFIG.idle_stack_size);
    assert_eq!(threads[2].stack_size, 128 * 1024);

    handle.join().unwrap();
    assert_eq!(name_seen.lock().as_deref(), Some("worker"));
    assert_eq!(sched.current_name().as_deref(), Some("boot"));
    assert_eq!(sched.current().to_string(), "0.1");
}

#[test]
fn test_std_platform_sleep() {
    use crate::platform::std_shim::StdPlatform;

    let sched = Scheduler::<DefaultArch>::with_config(TEST_CONFIG, StdPlatform::new(), GlobalAllocator).unwrap();
    let start = sched.now();
    sched.sleep(Duration::from_millis(2));
    assert!(sched.now() - start >= Duration::from_millis(2));
}

#[test]
fn test_global_kernel() {
    use crate::kernel;

    let sched = kernel::init_with_config(TEST_CONFIG, SimPlatform::new(), GlobalAllocator).unwrap();
    assert!(matches!(
        kernel::init(SimPlatform::new(), GlobalAllocator),
        Err(crate::errors::InitError::AlreadyInitialized)
    ));
    assert_eq!(kernel::current(), Some(sched.current()));

    let ran = Arc::new(AtomicBool::new(false));
    let handle = {
        let ran = ran.clone();
        kernel::spawn(move || {
            crate::yield_now();
            ran.store(true, Ordering::SeqCst);
        })
        .unwrap()
    };
    kernel::yield_now();
    kernel::sleep(Duration::from_millis(1));
    handle.join().unwrap();
    assert!(ran.load(Ordering::SeqCst));

    // Another CPU has no scheduler of its own.
    let elsewhere = std::thread::spawn(|| (kernel::get().is_none(), kernel::current())).join().unwrap();
    assert_eq!(elsewhere, (true, None));
}

#[test]
fn test_foreign_cpu_cannot_switch() {
    let (sched, _platform) = sim_scheduler();
    let worker_cpu = Arc::new(AtomicUsize::new(usize::MAX));
    let handle = {
        let worker_cpu = worker_cpu.clone();
        sched
            .spawn(move |_| worker_cpu.store(DefaultArch::cpu_id(), Ordering::SeqCst))
            .unwrap()
    };

    let target = SchedRef::new(&sched);
    let outcome = std::thread::spawn(move || target.get().yield_now()).join();
    let message = match outcome {
        Ok(()) => panic!("a foreign CPU switched threads"),
        Err(payload) => payload.downcast_ref::<String>().cloned().unwrap_or_default(),
    };
    assert!(message.contains("foreign CPU"), "unexpected panic: {message}");

    // Nothing was dispatched and the owner keeps working.
    assert_eq!(worker_cpu.load(Ordering::SeqCst), usize::MAX);
    assert_eq!(sched.current_name().as_deref(), Some("boot"));
    sched.check_consistency().unwrap();
    handle.join().unwrap();
    assert_eq!(worker_cpu.load(Ordering::SeqCst), sched.cpu());
    assert_eq!(sched.cpu(), DefaultArch::cpu_id());
}
