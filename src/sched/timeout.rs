//! Deadlines, sleeping and the idle thread.
//!
//! Threads that block with a deadline are also linked on a timer list kept
//! in deadline order, so expiry only ever looks at the front. Every pass
//! through the scheduler expires what is due; the idle thread halts the CPU
//! until the earliest remaining deadline.

use super::list::TimerList;
use super::{fatal, SchedState, Scheduler};
use crate::arch::Arch;
use crate::sync::IrqGuard;
use crate::thread::{Slot, WakeReason};
use crate::time::{Duration, Instant};

impl<A: Arch> SchedState<A> {
    /// Put `slot` on the timer list.
    ///
    /// Walks back from the latest deadline; equal deadlines keep arrival
    /// order.
    pub(crate) fn arm_timer(&mut self, slot: Slot, deadline: Instant) {
        self.threads.tcb_mut(slot).deadline = Some(deadline);
        let mut after = self.timers.back();
        while let Some(s) = after {
            match self.threads.tcb(s).deadline {
                Some(d) if d > deadline => after = TimerList::prev(&self.threads, s),
                _ => break,
            }
        }
        self.timers.insert_after(&mut self.threads, after, slot);
    }

    pub(crate) fn disarm_timer(&mut self, slot: Slot) {
        if self.threads.tcb_mut(slot).deadline.take().is_some() {
            self.timers.remove(&mut self.threads, slot);
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .front()
            .and_then(|slot| self.threads.tcb(slot).deadline)
    }

    /// Wake every sleeper whose deadline is at or before `now`.
    pub(crate) fn expire_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(slot) = self.timers.front() {
            let tcb = self.threads.tcb(slot);
            match tcb.deadline {
                Some(deadline) if deadline.has_passed(now) => {}
                Some(_) => break,
                None => fatal("timer list holds a thread without a deadline", tcb.id),
            }
            self.wake_slot(slot, WakeReason::TimedOut);
            fired += 1;
        }
        self.stats.timeouts_fired += fired as u64;
        fired
    }
}

impl<A: Arch> Scheduler<A> {
    /// Sleep until the clock reaches `deadline`.
    ///
    /// Returns [`WakeReason::Woken`] if [`Scheduler::wake`] cut the sleep
    /// short.
    pub fn sleep_until(&self, deadline: Instant) -> WakeReason {
        let irq = IrqGuard::<A>::new();
        self.park(&irq, &self.sleepers, Some(deadline))
    }

    /// Sleep for at least `duration`.
    pub fn sleep(&self, duration: Duration) {
        let _ = self.sleep_until(self.now() + duration);
    }

    /// Earliest pending deadline of any blocked thread.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.with_state(|st| st.next_deadline())
    }

    /// Body of the idle thread.
    ///
    /// Expires due timers; if that made nothing runnable, halts until the
    /// next deadline or an interrupt. Then offers the CPU back.
    pub(crate) fn idle_loop(&self) -> ! {
        loop {
            {
                let irq = IrqGuard::<A>::new();
                let halt = {
                    let mut guard = self.state.lock(&irq);
                    let st = &mut *guard;
                    st.expire_timers(self.platform.now());
                    st.run_queue.is_empty().then(|| st.next_deadline())
                };
                if let Some(deadline) = halt {
                    self.platform.halt_until(deadline);
                }
            }
            self.yield_now();
        }
    }
}
