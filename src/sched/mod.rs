//! Cooperative scheduler core.
//!
//! One [`Scheduler`] drives one logical CPU. All of its state sits behind an
//! [`IrqLock`], so every queue manipulation happens with interrupts masked;
//! an interrupt handler may call [`Scheduler::wake`] but never observes a
//! half-updated queue.
//!
//! Control only leaves a thread through the internal `reschedule`, which
//! drops the state lock before the register switch. The caller's
//! [`IrqGuard`] stays on the suspended stack and is restored when the thread
//! is resumed.

use core::marker::PhantomPinned;
use core::pin::Pin;

extern crate alloc;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::{Arch, DefaultArch};
use crate::errors::{InvariantViolation, JoinError, SpawnError};
use crate::mem::{Allocator, Stack};
use crate::platform::Platform;
use crate::sync::{IrqGuard, IrqLock};
use crate::thread::builder::ThreadOptions;
use crate::thread::{
    Entry, JoinHandle, QueueRef, Slot, Tcb, ThreadBuilder, ThreadId, ThreadInfo, ThreadKind,
    ThreadState, ThreadTable,
};
use crate::time::Instant;

pub(crate) mod list;
mod timeout;
pub mod wait;

use list::{ThreadList, TimerList};
pub use wait::WaitQueue;

/// Stack size for spawned threads when the builder does not set one.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Stack size of the idle thread.
pub const IDLE_STACK_SIZE: usize = 32 * 1024;

/// Scheduler construction options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    pub idle_stack_size: usize,
    pub default_stack_size: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            idle_stack_size: IDLE_STACK_SIZE,
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Scheduler-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Register switches performed; the same-thread fast path is not counted.
    pub context_switches: u64,
    /// Switches that selected the idle thread.
    pub idle_dispatches: u64,
    /// Sleepers made runnable by their deadline.
    pub timeouts_fired: u64,
    /// Sleepers made runnable by an explicit wake.
    pub wakeups: u64,
    pub threads_created: u64,
    pub threads_reaped: u64,
}

pub(crate) struct SchedState<A: Arch> {
    pub(crate) threads: ThreadTable<A>,
    pub(crate) run_queue: ThreadList,
    pub(crate) timers: TimerList,
    pub(crate) current: Slot,
    pub(crate) idle: Option<Slot>,
    pub(crate) boot: Slot,
    /// A detached thread that exited; reaped by whoever runs next.
    pub(crate) pending_reap: Option<Slot>,
    pub(crate) stats: SchedStats,
    pub(crate) slice_start: Instant,
}

#[cold]
#[track_caller]
pub(crate) fn fatal(what: &'static str, thread: ThreadId) -> ! {
    panic!("{}", InvariantViolation::new(what, thread))
}

#[cold]
#[track_caller]
pub(crate) fn fatal_global(what: &'static str) -> ! {
    panic!("{}", InvariantViolation::global(what))
}

impl<A: Arch> SchedState<A> {
    pub(crate) fn is_idle(&self, slot: Slot) -> bool {
        self.idle == Some(slot)
    }

    pub(crate) fn current_id(&self) -> ThreadId {
        self.threads.tcb(self.current).id
    }

    /// Mark runnable and append to the run queue tail.
    pub(crate) fn make_runnable(&mut self, slot: Slot) {
        let tcb = self.threads.tcb_mut(slot);
        tcb.state = ThreadState::Runnable;
        tcb.queue = QueueRef::Run;
        self.run_queue.push_back(&mut self.threads, slot);
    }

    /// Verify queue membership for every thread.
    pub(crate) fn check(&self) -> Result<(), InvariantViolation> {
        let current = self.threads.tcb(self.current);
        if current.state != ThreadState::Runnable || current.queue != QueueRef::None {
            return Err(InvariantViolation::new("current thread is not running", current.id));
        }
        if !self.run_queue.is_well_formed(&self.threads) {
            return Err(InvariantViolation::global("run queue links corrupted"));
        }
        if !self.timers.is_well_formed(&self.threads) {
            return Err(InvariantViolation::global("timer list links corrupted"));
        }

        let mut queued = 0;
        let mut timed = 0;
        for tcb in self.threads.iter() {
            let slot = tcb.id.slot();
            if self.is_idle(slot) && (tcb.state != ThreadState::Runnable || tcb.queue != QueueRef::None) {
                return Err(InvariantViolation::new("idle thread left the runnable set", tcb.id));
            }
            match (tcb.state, tcb.queue) {
                (ThreadState::Runnable, QueueRef::Run) => queued += 1,
                (ThreadState::Runnable, QueueRef::None) if slot == self.current || self.is_idle(slot) => {}
                (ThreadState::Sleeping, QueueRef::Wait(list)) => {
                    // Safety: a sleeping thread's wait queue is borrowed by
                    // that thread, so it is alive.
                    let list = unsafe { list.as_ref() };
                    if !list.is_well_formed(&self.threads) || !list.contains(&self.threads, slot) {
                        return Err(InvariantViolation::new(
                            "sleeping thread missing from its wait queue",
                            tcb.id,
                        ));
                    }
                }
                (ThreadState::Exited, QueueRef::None) => {}
                _ => {
                    return Err(InvariantViolation::new(
                        "thread state and queue membership disagree",
                        tcb.id,
                    ))
                }
            }
            if tcb.deadline.is_some() {
                if tcb.state != ThreadState::Sleeping {
                    return Err(InvariantViolation::new("deadline set on a thread that is not sleeping", tcb.id));
                }
                timed += 1;
            }
        }
        if queued != self.run_queue.len() || self.run_queue.iter(&self.threads).any(|s| self.threads.tcb(s).queue != QueueRef::Run) {
            return Err(InvariantViolation::global("run queue does not match runnable threads"));
        }
        if timed != self.timers.len() {
            return Err(InvariantViolation::global("timer list does not match sleeping threads"));
        }
        let mut last = Instant::ZERO;
        for slot in self.timers.iter(&self.threads) {
            match self.threads.tcb(slot).deadline {
                Some(deadline) if deadline >= last => last = deadline,
                _ => return Err(InvariantViolation::global("timer list out of deadline order")),
            }
        }
        Ok(())
    }
}

/// Cooperative scheduler for one logical CPU.
///
/// Created pinned: fresh thread contexts and wait queues refer back to it by
/// address. The thread that calls [`Scheduler::new`] is adopted as the boot
/// thread and must be the one that eventually drops it.
///
/// The scheduler is bound to the CPU it was created on. Other CPUs may read
/// its state and wake its threads, but switching threads from anywhere else
/// is fatal.
pub struct Scheduler<A: Arch = DefaultArch> {
    state: IrqLock<SchedState<A>>,
    cpu: usize,
    sleepers: WaitQueue,
    joiners: WaitQueue,
    platform: Box<dyn Platform>,
    allocator: Box<dyn Allocator>,
    config: SchedConfig,
    _pin: PhantomPinned,
}

/// First code a fresh context runs.
unsafe extern "C" fn thread_start<A: Arch>(sched: usize, slot: usize) -> ! {
    // Safety: `sched` is the pinned scheduler that built this context and
    // it outlives all of its threads.
    let sched = unsafe { &*(sched as *const Scheduler<A>) };
    sched.finish_switch();
    A::irq_enable();
    match sched.take_entry(slot) {
        Entry::Idle => sched.idle_loop(),
        Entry::Thread(main) => {
            main(sched);
            sched.exit_now()
        }
    }
}

impl<A: Arch> Scheduler<A> {
    /// Create a scheduler with the default configuration.
    pub fn new(
        platform: impl Platform + 'static,
        allocator: impl Allocator + 'static,
    ) -> Result<Pin<Box<Self>>, SpawnError> {
        Self::with_config(SchedConfig::default(), platform, allocator)
    }

    /// Create a scheduler, adopting the caller as the boot thread and
    /// creating the idle thread.
    pub fn with_config(
        config: SchedConfig,
        platform: impl Platform + 'static,
        allocator: impl Allocator + 'static,
    ) -> Result<Pin<Box<Self>>, SpawnError> {
        let mut threads = ThreadTable::new();
        let mut boot = Tcb::new(ThreadKind::Boot, Some(String::from("boot")));
        boot.tls = A::tls_get();
        let boot = threads.try_insert(boot).map_err(|(e, _)| e)?.slot();
        let now = platform.now();

        let sched = Box::pin(Self {
            state: IrqLock::new(SchedState {
                threads,
                run_queue: ThreadList::new(),
                timers: TimerList::new(),
                current: boot,
                idle: None,
                boot,
                pending_reap: None,
                stats: SchedStats::default(),
                slice_start: now,
            }),
            cpu: A::cpu_id(),
            sleepers: WaitQueue::new(),
            joiners: WaitQueue::new(),
            platform: Box::new(platform),
            allocator: Box::new(allocator),
            config,
            _pin: PhantomPinned,
        });

        let idle = sched.create_thread(
            ThreadKind::Idle,
            ThreadOptions {
                name: Some(String::from("idle")),
                stack_size: Some(config.idle_stack_size),
                ..ThreadOptions::default()
            },
            Entry::Idle,
        )?;
        log::info!(
            "scheduler ready on {}: boot thread {}, idle thread {}",
            A::NAME,
            sched.current(),
            idle
        );
        Ok(sched)
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// The CPU this scheduler runs on.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Stop a foreign CPU before it touches the current thread's context.
    #[track_caller]
    pub(crate) fn assert_owner_cpu(&self) {
        if A::cpu_id() != self.cpu {
            fatal_global("scheduler driven from a foreign CPU");
        }
    }

    /// Current reading of the platform clock.
    pub fn now(&self) -> Instant {
        self.platform.now()
    }

    /// Run `f` on the state with interrupts masked and the lock held.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SchedState<A>) -> R) -> R {
        let irq = IrqGuard::<A>::new();
        let mut guard = self.state.lock(&irq);
        f(&mut *guard)
    }

    /// Spawn a thread with default options.
    pub fn spawn<F>(&self, f: F) -> Result<JoinHandle<'_, A>, SpawnError>
    where
        F: FnOnce(&Scheduler<A>) + Send + 'static,
    {
        ThreadBuilder::new().spawn(self, f)
    }

    pub fn builder(&self) -> ThreadBuilder {
        ThreadBuilder::new()
    }

    /// Allocate, register and (for workers) enqueue a new thread.
    ///
    /// On failure nothing is left behind: the stack goes back to the
    /// allocator and no slot stays occupied.
    pub(crate) fn create_thread(
        &self,
        kind: ThreadKind,
        opts: ThreadOptions,
        entry: Entry<A>,
    ) -> Result<ThreadId, SpawnError> {
        if let Some(name) = opts.name.as_deref().filter(|n| n.is_empty()) {
            return Err(SpawnError::InvalidName(String::from(name)));
        }
        let stack_size = opts.stack_size.unwrap_or(self.config.default_stack_size);
        if stack_size < A::MIN_STACK_SIZE {
            return Err(SpawnError::InvalidStackSize(stack_size));
        }
        let stack = Stack::allocate(&*self.allocator, stack_size).ok_or(SpawnError::OutOfMemory)?;
        let (base, len) = (stack.base(), stack.size());

        let mut tcb = Tcb::new(kind, opts.name);
        tcb.stack = Some(stack);
        tcb.tls = opts.tls;
        tcb.detached = opts.detached;
        tcb.destructor = opts.destructor;
        tcb.entry = Some(entry);

        let this = self as *const Self as usize;
        let irq = IrqGuard::<A>::new();
        let mut guard = self.state.lock(&irq);
        let st = &mut *guard;
        let id = match st.threads.try_insert(tcb) {
            Ok(id) => id,
            Err((e, tcb)) => {
                drop(guard);
                self.release(tcb);
                return Err(e);
            }
        };
        let slot = id.slot();
        match A::init_context(base, len, thread_start::<A>, this, slot.index()) {
            Ok(ctx) => st.threads.tcb_mut(slot).context = ctx,
            Err(e) => {
                let tcb = st.threads.remove(slot);
                drop(guard);
                if let Some(tcb) = tcb {
                    self.release(tcb);
                }
                return Err(e.into());
            }
        }
        match kind {
            ThreadKind::Idle => st.idle = Some(slot),
            _ => st.make_runnable(slot),
        }
        st.stats.threads_created += 1;
        drop(guard);
        drop(irq);

        log::debug!("spawned thread {} ({:?}) with a {} byte stack", id, kind, len);
        Ok(id)
    }

    /// Return what a removed control block owns. Called without the lock.
    fn release(&self, mut tcb: Tcb<A>) {
        if let Some(stack) = tcb.stack.take() {
            if !stack.check_canary() {
                fatal("stack canary overwritten", tcb.id);
            }
            // Safety: the stack came from this allocator and the thread is
            // gone from the table, so nothing runs on it.
            unsafe { stack.free(&*self.allocator) };
        }
    }

    fn take_entry(&self, slot: usize) -> Entry<A> {
        self.with_state(|st| {
            let cur = st.current;
            if cur.index() != slot {
                fatal("fresh context started for another thread", st.current_id());
            }
            let tcb = st.threads.tcb_mut(cur);
            match tcb.entry.take() {
                Some(entry) => entry,
                None => fatal("thread started twice", tcb.id),
            }
        })
    }

    /// Pick the next thread and switch to it.
    ///
    /// Consumes the state lock. The caller's interrupt guard keeps interrupts
    /// masked across the switch; this returns once the calling thread is
    /// dispatched again.
    pub(crate) fn reschedule(&self, mut guard: spin::MutexGuard<'_, SchedState<A>>) {
        self.assert_owner_cpu();
        let st = &mut *guard;
        let now = self.platform.now();
        st.expire_timers(now);

        let prev = st.current;
        let next = match st.run_queue.pop_front(&mut st.threads) {
            Some(slot) => slot,
            None => match st.idle {
                Some(idle) => idle,
                None => fatal_global("nothing runnable and no idle thread"),
            },
        };
        let tcb = st.threads.tcb_mut(next);
        if tcb.state != ThreadState::Runnable {
            fatal("dispatching a thread that is not runnable", tcb.id);
        }
        if tcb.stack.as_ref().is_some_and(|s| !s.check_canary()) {
            fatal("stack canary overwritten", tcb.id);
        }
        tcb.queue = QueueRef::None;
        if next == prev {
            return;
        }

        let elapsed = now - st.slice_start;
        st.slice_start = now;
        st.stats.context_switches += 1;
        if st.is_idle(next) {
            st.stats.idle_dispatches += 1;
        }

        let prev_tcb = st.threads.tcb_mut(prev);
        prev_tcb.exec_time = prev_tcb.exec_time + elapsed;
        if let Some(stack) = &prev_tcb.stack {
            let marker = 0u8;
            if !stack.contains(&marker as *const u8 as usize) {
                fatal("thread running off its own stack", prev_tcb.id);
            }
            if !stack.check_canary() {
                fatal("stack canary overwritten", prev_tcb.id);
            }
        }
        prev_tcb.tls = A::tls_get();
        #[cfg(feature = "full-fpu")]
        // Safety: interrupts are masked and `prev` is the running thread.
        unsafe {
            A::save_extended(&mut prev_tcb.extended)
        };

        st.threads.tcb_mut(next).dispatches += 1;
        st.current = next;
        let prev_ctx: *mut A::SavedContext = &mut st.threads.tcb_mut(prev).context;
        let next_ctx: *const A::SavedContext = &st.threads.tcb(next).context;
        drop(guard);

        // Safety: interrupts are masked, so nothing touches the table until
        // the switch has stored `prev` and loaded `next`.
        unsafe { A::context_switch(prev_ctx, next_ctx) };
        self.finish_switch();
    }

    /// Runs on the incoming thread right after every switch.
    fn finish_switch(&self) {
        let irq = IrqGuard::<A>::new();
        let reaped = {
            let mut guard = self.state.lock(&irq);
            let st = &mut *guard;
            let reaped = match st.pending_reap.take() {
                Some(slot) => {
                    st.stats.threads_reaped += 1;
                    st.threads.remove(slot)
                }
                None => None,
            };
            let cur = st.threads.tcb(st.current);
            // Safety: the TLS value and extended image belong to the thread
            // now running.
            unsafe { A::tls_set(cur.tls) };
            #[cfg(feature = "full-fpu")]
            unsafe {
                A::restore_extended(&cur.extended)
            };
            reaped
        };
        if let Some(tcb) = reaped {
            log::debug!("reaped detached thread {}", tcb.id);
            self.release(tcb);
        }
    }

    /// Give up the CPU; the caller stays runnable at the run queue tail.
    ///
    /// Returns immediately when nothing else is runnable.
    pub fn yield_now(&self) {
        self.assert_owner_cpu();
        let irq = IrqGuard::<A>::new();
        let mut guard = self.state.lock(&irq);
        let cur = guard.current;
        if !guard.is_idle(cur) {
            guard.make_runnable(cur);
        }
        self.reschedule(guard);
    }

    /// Terminate the calling thread.
    ///
    /// The destructor, if any, runs first with interrupts enabled. Values
    /// still alive on the thread's stack are not dropped.
    pub fn exit_now(&self) -> ! {
        self.assert_owner_cpu();
        let (id, destructor) = self.with_state(|st| {
            let tcb = st.threads.tcb_mut(st.current);
            if tcb.kind != ThreadKind::Worker {
                fatal("only spawned threads may exit", tcb.id);
            }
            (tcb.id, tcb.destructor.take())
        });
        if let Some(destructor) = destructor {
            destructor(id);
        }
        log::debug!("thread {} exited", id);

        let irq = IrqGuard::<A>::new();
        let mut guard = self.state.lock(&irq);
        let st = &mut *guard;
        let cur = st.current;
        let tcb = st.threads.tcb_mut(cur);
        tcb.state = ThreadState::Exited;
        if tcb.detached && st.pending_reap.replace(cur).is_some() {
            fatal("two detached threads awaiting reap", id);
        }
        st.wake_all(self.joiners.list_ptr());
        self.reschedule(guard);
        fatal("exited thread was dispatched", id)
    }

    /// Wait for `id` to exit, then free it.
    pub(crate) fn join(&self, id: ThreadId) -> Result<(), JoinError> {
        self.with_state(|st| {
            let tcb = st.threads.get(id).ok_or(JoinError::InvalidHandle)?;
            if st.current_id() == id {
                return Err(JoinError::WouldDeadlock);
            }
            if tcb.kind != ThreadKind::Worker {
                return Err(JoinError::InvalidHandle);
            }
            if tcb.detached {
                return Err(JoinError::Detached);
            }
            Ok(())
        })?;

        self.joiners.wait_event(self, || !self.is_alive(id));

        let tcb = self.with_state(|st| match st.threads.get(id) {
            Some(tcb) if tcb.state == ThreadState::Exited => {
                st.stats.threads_reaped += 1;
                Ok(st.threads.remove(id.slot()))
            }
            _ => Err(JoinError::InvalidHandle),
        })?;
        if let Some(tcb) = tcb {
            self.release(tcb);
        }
        log::debug!("joined thread {}", id);
        Ok(())
    }

    /// Let `id` be reaped without a join. Already exited threads go now.
    pub(crate) fn detach(&self, id: ThreadId) {
        let reaped = self.with_state(|st| {
            let exited = match st.threads.get_mut(id) {
                Some(tcb) if tcb.kind == ThreadKind::Worker => {
                    tcb.detached = true;
                    tcb.state == ThreadState::Exited
                }
                _ => false,
            };
            if exited {
                st.stats.threads_reaped += 1;
                st.threads.remove(id.slot())
            } else {
                None
            }
        });
        if let Some(tcb) = reaped {
            log::debug!("reaped detached thread {}", tcb.id);
            self.release(tcb);
        }
    }

    fn is_alive(&self, id: ThreadId) -> bool {
        matches!(
            self.thread_state(id),
            Some(ThreadState::Runnable | ThreadState::Sleeping)
        )
    }

    /// State of `id`, or `None` once it has been reaped.
    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.with_state(|st| st.threads.get(id).map(|t| t.state))
    }

    /// Identity of the calling thread.
    pub fn current(&self) -> ThreadId {
        self.with_state(|st| st.current_id())
    }

    pub fn current_name(&self) -> Option<String> {
        self.with_state(|st| st.threads.tcb(st.current).name.clone())
    }

    pub fn thread_info(&self, id: ThreadId) -> Option<ThreadInfo> {
        self.with_state(|st| st.threads.get(id).map(Tcb::info))
    }

    /// Snapshot of every thread the scheduler knows, including boot and idle.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.with_state(|st| st.threads.iter().map(Tcb::info).collect())
    }

    /// Threads waiting in the run queue.
    pub fn runnable_count(&self) -> usize {
        self.with_state(|st| st.run_queue.len())
    }

    pub fn stats(&self) -> SchedStats {
        self.with_state(|st| st.stats)
    }

    /// Check the queue membership invariants without panicking.
    pub fn check_consistency(&self) -> Result<(), InvariantViolation> {
        self.with_state(|st| st.check())
    }
}

impl<A: Arch> Drop for Scheduler<A> {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if st.current != st.boot {
            fatal("scheduler dropped off the boot thread", st.threads.tcb(st.current).id);
        }
        // Threads still parked are abandoned along with their stacks.
        *self.sleepers.list_mut() = ThreadList::new();
        *self.joiners.list_mut() = ThreadList::new();
        let allocator = &*self.allocator;
        let mut freed = 0;
        for mut tcb in st.threads.drain() {
            if let Some(stack) = tcb.stack.take() {
                // Safety: only the boot thread runs, on its own stack.
                unsafe { stack.free(allocator) };
                freed += 1;
            }
        }
        log::debug!("scheduler torn down, {} stacks freed", freed);
    }
}
