//! Sleeping mutual exclusion between scheduler threads.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::arch::{Arch, DefaultArch};
use crate::sched::{Scheduler, WaitQueue};
use crate::thread::ThreadId;

/// A mutex whose contenders block on a wait queue instead of spinning.
///
/// Ownership is tracked per thread; locking a mutex the caller already
/// holds panics rather than deadlocking.
pub struct Mutex<T> {
    owner: spin::Mutex<Option<ThreadId>>,
    waiters: WaitQueue,
    data: UnsafeCell<T>,
}

// Safety: `data` is only reachable through a guard, and at most one guard
// exists at a time.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: spin::Mutex::new(None),
            waiters: WaitQueue::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Block until the mutex is free, then take it.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the mutex.
    pub fn lock<'a, A: Arch>(&'a self, sched: &'a Scheduler<A>) -> MutexGuard<'a, T, A> {
        let me = sched.current();
        if *self.owner.lock() == Some(me) {
            panic!("mutex locked twice by thread {}", me);
        }
        self.waiters.wait_event(sched, || self.claim(me));
        MutexGuard { mutex: self, sched }
    }

    pub fn try_lock<'a, A: Arch>(&'a self, sched: &'a Scheduler<A>) -> Option<MutexGuard<'a, T, A>> {
        self.claim(sched.current())
            .then_some(MutexGuard { mutex: self, sched })
    }

    /// Current holder, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn claim(&self, me: ThreadId) -> bool {
        let mut owner = self.owner.lock();
        if owner.is_some() {
            return false;
        }
        *owner = Some(me);
        true
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("owner", &self.owner()).finish_non_exhaustive()
    }
}

/// Holds a [`Mutex`] locked; unlocks and wakes the next waiter on drop.
#[must_use = "the mutex unlocks as soon as the guard is dropped"]
pub struct MutexGuard<'a, T, A: Arch = DefaultArch> {
    mutex: &'a Mutex<T>,
    sched: &'a Scheduler<A>,
}

impl<T, A: Arch> Deref for MutexGuard<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, A: Arch> DerefMut for MutexGuard<'_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, A: Arch> Drop for MutexGuard<'_, T, A> {
    fn drop(&mut self) {
        *self.mutex.owner.lock() = None;
        let _ = self.mutex.waiters.wake_one(self.sched);
    }
}
