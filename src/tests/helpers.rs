//! Simulated platform, instrumented allocators and a small RNG.

use core::alloc::Layout;
use core::pin::Pin;
use core::ptr::NonNull;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::arch::DefaultArch;
use crate::mem::{Allocator, GlobalAllocator};
use crate::platform::Platform;
use crate::sched::{SchedConfig, Scheduler};
use crate::time::{Duration, Instant};

type Irq = Box<dyn FnOnce() + Send>;

struct SimInner {
    clock: AtomicU64,
    halts: AtomicUsize,
    irqs: spin::Mutex<VecDeque<Irq>>,
}

/// Virtual clock that only moves when the idle thread halts.
///
/// A halt first delivers the oldest raised interrupt, if any. Otherwise the
/// clock jumps straight to the deadline.
#[derive(Clone)]
pub(crate) struct SimPlatform(Arc<SimInner>);

impl SimPlatform {
    pub(crate) fn new() -> Self {
        Self(Arc::new(SimInner {
            clock: AtomicU64::new(0),
            halts: AtomicUsize::new(0),
            irqs: spin::Mutex::new(VecDeque::new()),
        }))
    }

    /// Queue a handler to run at the next halt.
    pub(crate) fn raise_irq(&self, handler: impl FnOnce() + Send + 'static) {
        self.0.irqs.lock().push_back(Box::new(handler));
    }

    pub(crate) fn advance(&self, d: Duration) {
        self.0.clock.fetch_add(d.as_nanos(), Ordering::SeqCst);
    }

    pub(crate) fn halts(&self) -> usize {
        self.0.halts.load(Ordering::SeqCst)
    }
}

impl Platform for SimPlatform {
    fn now_ns(&self) -> u64 {
        self.0.clock.load(Ordering::SeqCst)
    }

    fn halt_until(&self, deadline: Option<Instant>) {
        self.0.halts.fetch_add(1, Ordering::SeqCst);
        let irq = self.0.irqs.lock().pop_front();
        match (irq, deadline) {
            (Some(handler), _) => handler(),
            (None, Some(deadline)) => {
                self.0.clock.fetch_max(deadline.as_nanos(), Ordering::SeqCst);
            }
            (None, None) => panic!("halted with no deadline and no interrupt pending"),
        }
    }
}

/// Counts every allocation and free.
#[derive(Clone, Default)]
pub(crate) struct CountingAllocator(Arc<Counts>);

#[derive(Default)]
pub(crate) struct Counts {
    pub(crate) allocs: AtomicUsize,
    pub(crate) frees: AtomicUsize,
}

impl CountingAllocator {
    pub(crate) fn allocs(&self) -> usize {
        self.0.allocs.load(Ordering::SeqCst)
    }

    pub(crate) fn frees(&self) -> usize {
        self.0.frees.load(Ordering::SeqCst)
    }
}

impl Allocator for CountingAllocator {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = GlobalAllocator.alloc(layout)?;
        self.0.allocs.fetch_add(1, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.0.frees.fetch_add(1, Ordering::SeqCst);
        unsafe { GlobalAllocator.free(ptr, layout) }
    }
}

/// Succeeds for the first `budget` allocations, then reports exhaustion.
pub(crate) struct FailingAllocator {
    budget: AtomicUsize,
}

impl FailingAllocator {
    pub(crate) fn new(budget: usize) -> Self {
        Self {
            budget: AtomicUsize::new(budget),
        }
    }
}

impl Allocator for FailingAllocator {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .ok()?;
        GlobalAllocator.alloc(layout)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { GlobalAllocator.free(ptr, layout) }
    }
}

/// Roomy stacks: unoptimized test code is stack hungry.
pub(crate) const TEST_CONFIG: SchedConfig = SchedConfig {
    idle_stack_size: 64 * 1024,
    default_stack_size: 256 * 1024,
};

pub(crate) fn sim_scheduler() -> (Pin<Box<Scheduler<DefaultArch>>>, SimPlatform) {
    let platform = SimPlatform::new();
    let sched = Scheduler::with_config(TEST_CONFIG, platform.clone(), GlobalAllocator)
        .expect("scheduler construction");
    (sched, platform)
}

/// Lets an interrupt handler closure, or another OS thread, reach a
/// scheduler owned by the test.
#[derive(Clone, Copy)]
pub(crate) struct SchedRef(*const Scheduler<DefaultArch>);

// Safety: the scheduler is `Sync` and the test keeps it alive for as long as
// any copy is used.
unsafe impl Send for SchedRef {}

impl SchedRef {
    pub(crate) fn new(sched: &Scheduler<DefaultArch>) -> Self {
        Self(sched)
    }

    pub(crate) fn get(&self) -> &Scheduler<DefaultArch> {
        // Safety: see the Send impl.
        unsafe { &*self.0 }
    }
}

/// Simple linear congruential generator for property testing.
pub(crate) struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub(crate) fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state >> 33
    }

    pub(crate) fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        min + (self.next_u64() % (max - min))
    }
}
