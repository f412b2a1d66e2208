//! Counting semaphore built on a wait queue.

use crate::arch::Arch;
use crate::errors::WaitError;
use crate::sched::{Scheduler, WaitQueue};
use crate::time::Duration;

pub struct Semaphore {
    count: spin::Mutex<usize>,
    waiters: WaitQueue,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self {
            count: spin::Mutex::new(count),
            waiters: WaitQueue::new(),
        }
    }

    pub fn available(&self) -> usize {
        *self.count.lock()
    }

    /// Take one unit, blocking while none is available.
    pub fn down<A: Arch>(&self, sched: &Scheduler<A>) {
        self.waiters.wait_event(sched, || self.try_down());
    }

    /// Like [`Semaphore::down`], giving up after `timeout`.
    pub fn down_timeout<A: Arch>(&self, sched: &Scheduler<A>, timeout: Duration) -> Result<(), WaitError> {
        let deadline = sched.now() + timeout;
        self.waiters.wait_event_until(sched, deadline, || self.try_down())
    }

    pub fn try_down(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Return one unit and wake the longest waiter.
    pub fn up<A: Arch>(&self, sched: &Scheduler<A>) {
        *self.count.lock() += 1;
        let _ = self.waiters.wake_one(sched);
    }
}
