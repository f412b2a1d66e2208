//! Wait queues: FIFO lists of threads blocked on one event.
//!
//! The list inside a [`WaitQueue`] is only touched under the scheduler lock,
//! which is what makes handing out `&WaitQueue` to several threads sound.
//! A blocked thread keeps its queue borrowed for as long as it sleeps, so the
//! queue cannot move or be dropped while it is linked.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use super::list::ThreadList;
use super::{fatal, SchedState, Scheduler};
use crate::arch::Arch;
use crate::errors::WaitError;
use crate::sync::IrqGuard;
use crate::thread::{QueueRef, Slot, ThreadId, ThreadState, WakeReason};
use crate::time::Instant;

pub struct WaitQueue {
    waiters: UnsafeCell<ThreadList>,
}

// Safety: the list is only accessed with the scheduler lock held.
unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: UnsafeCell::new(ThreadList::new()),
        }
    }

    pub(crate) fn list_ptr(&self) -> NonNull<ThreadList> {
        // Safety: `UnsafeCell::get` never returns null.
        unsafe { NonNull::new_unchecked(self.waiters.get()) }
    }

    pub(crate) fn list_mut(&mut self) -> &mut ThreadList {
        self.waiters.get_mut()
    }

    /// Number of blocked threads.
    pub fn len<A: Arch>(&self, sched: &Scheduler<A>) -> usize {
        // Safety: read under the scheduler lock.
        sched.with_state(|_| unsafe { (*self.waiters.get()).len() })
    }

    pub fn is_empty<A: Arch>(&self, sched: &Scheduler<A>) -> bool {
        self.len(sched) == 0
    }

    /// Block the calling thread until it is woken.
    pub fn wait<A: Arch>(&self, sched: &Scheduler<A>) -> WakeReason {
        sched.block(self)
    }

    /// Block the calling thread until it is woken or `deadline` passes.
    pub fn wait_until<A: Arch>(&self, sched: &Scheduler<A>, deadline: Instant) -> WakeReason {
        sched.block_timeout(self, deadline)
    }

    /// Block until `cond` returns true.
    ///
    /// `cond` is evaluated with interrupts masked, and the thread is queued
    /// in the same critical section, so a wake issued right after `cond`
    /// becomes true cannot be lost. It must not block.
    pub fn wait_event<A: Arch>(&self, sched: &Scheduler<A>, cond: impl FnMut() -> bool) {
        // No deadline: only an explicit wake ends a wait.
        let _ = self.wait_event_inner(sched, None, cond);
    }

    /// Like [`WaitQueue::wait_event`], giving up once `deadline` passes.
    pub fn wait_event_until<A: Arch>(
        &self,
        sched: &Scheduler<A>,
        deadline: Instant,
        cond: impl FnMut() -> bool,
    ) -> Result<(), WaitError> {
        self.wait_event_inner(sched, Some(deadline), cond)
    }

    fn wait_event_inner<A: Arch>(
        &self,
        sched: &Scheduler<A>,
        deadline: Option<Instant>,
        mut cond: impl FnMut() -> bool,
    ) -> Result<(), WaitError> {
        loop {
            let irq = IrqGuard::<A>::new();
            if cond() {
                return Ok(());
            }
            if deadline.is_some_and(|d| d.has_passed(sched.now())) {
                return Err(WaitError::TimedOut);
            }
            sched.park(&irq, self, deadline);
        }
    }

    /// Wake the longest waiting thread.
    pub fn wake_one<A: Arch>(&self, sched: &Scheduler<A>) -> Option<ThreadId> {
        let woken = sched.with_state(|st| {
            // Safety: scheduler lock held.
            let slot = unsafe { (*self.waiters.get()).front() }?;
            st.wake_slot(slot, WakeReason::Woken);
            Some(st.threads.tcb(slot).id)
        });
        if let Some(id) = woken {
            log::trace!("woke thread {}", id);
        }
        woken
    }

    /// Wake every waiting thread, in queue order.
    pub fn wake_all<A: Arch>(&self, sched: &Scheduler<A>) -> usize {
        sched.with_state(|st| st.wake_all(self.list_ptr()))
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        debug_assert!(self.list_mut().is_empty(), "wait queue dropped with threads blocked on it");
    }
}

impl<A: Arch> SchedState<A> {
    /// Move a sleeping thread to the run queue tail.
    ///
    /// Returns false, touching nothing, if the thread is not sleeping.
    pub(crate) fn wake_slot(&mut self, slot: Slot, reason: WakeReason) -> bool {
        let tcb = self.threads.tcb_mut(slot);
        if tcb.state != ThreadState::Sleeping {
            return false;
        }
        let QueueRef::Wait(list) = tcb.queue else {
            fatal("sleeping thread is on no wait queue", tcb.id);
        };
        // Safety: the queue is alive while the sleeper borrows it, and the
        // scheduler lock is held.
        unsafe { &mut *list.as_ptr() }.remove(&mut self.threads, slot);
        self.disarm_timer(slot);
        self.threads.tcb_mut(slot).wake_reason = Some(reason);
        self.make_runnable(slot);
        if reason == WakeReason::Woken {
            self.stats.wakeups += 1;
        }
        true
    }

    pub(crate) fn wake_all(&mut self, list: NonNull<ThreadList>) -> usize {
        let mut woken = 0;
        // Safety: scheduler lock held; `list` belongs to a live queue.
        while let Some(slot) = unsafe { list.as_ref() }.front() {
            self.wake_slot(slot, WakeReason::Woken);
            woken += 1;
        }
        woken
    }
}

impl<A: Arch> Scheduler<A> {
    /// Block the calling thread on `queue` until it is woken.
    pub fn block(&self, queue: &WaitQueue) -> WakeReason {
        let irq = IrqGuard::<A>::new();
        self.park(&irq, queue, None)
    }

    /// Block the calling thread on `queue` until it is woken or the clock
    /// reaches `deadline`.
    ///
    /// A deadline that already passed returns [`WakeReason::TimedOut`]
    /// without blocking.
    pub fn block_timeout(&self, queue: &WaitQueue, deadline: Instant) -> WakeReason {
        let irq = IrqGuard::<A>::new();
        self.park(&irq, queue, Some(deadline))
    }

    /// Make a sleeping thread runnable. Does not switch.
    ///
    /// Returns false for a thread that is not sleeping (already runnable,
    /// exited, or reaped). Safe to call from interrupt handlers.
    pub fn wake(&self, id: ThreadId) -> bool {
        let woken = self.with_state(|st| match st.threads.get(id) {
            Some(_) => st.wake_slot(id.slot(), WakeReason::Woken),
            None => false,
        });
        if woken {
            log::trace!("woke thread {}", id);
        }
        woken
    }

    /// Queue the current thread on `queue` and switch away.
    ///
    /// `irq` must be the caller's guard, so that whatever it checked before
    /// parking still holds when the thread is queued.
    pub(crate) fn park(
        &self,
        irq: &IrqGuard<A>,
        queue: &WaitQueue,
        deadline: Option<Instant>,
    ) -> WakeReason {
        self.assert_owner_cpu();
        if deadline.is_some_and(|d| d.has_passed(self.now())) {
            return WakeReason::TimedOut;
        }
        let mut guard = self.state.lock(irq);
        let st = &mut *guard;
        let cur = st.current;
        let id = st.current_id();
        if st.is_idle(cur) {
            fatal("idle thread must never block", id);
        }
        let list = queue.list_ptr();
        let tcb = st.threads.tcb_mut(cur);
        tcb.state = ThreadState::Sleeping;
        tcb.wake_reason = None;
        tcb.queue = QueueRef::Wait(list);
        // Safety: scheduler lock held.
        unsafe { &mut *list.as_ptr() }.push_back(&mut st.threads, cur);
        if let Some(deadline) = deadline {
            st.arm_timer(cur, deadline);
        }
        self.reschedule(guard);

        let reason = {
            let mut guard = self.state.lock(irq);
            match guard.threads.tcb_mut(cur).wake_reason.take() {
                Some(reason) => reason,
                None => fatal("thread resumed without being woken", id),
            }
        };
        if reason == WakeReason::TimedOut {
            log::trace!("thread {} timed out", id);
        }
        reason
    }
}
