//! Interrupt-masking primitives and sleeping locks.
//!
//! On a single CPU, masking interrupts is what excludes every other actor
//! from the scheduler state. [`IrqLock`] adds a spin lock on top so that a
//! re-entrant acquisition is caught instead of silently corrupting state.

use core::marker::PhantomData;

use crate::arch::{Arch, IrqFlags};

pub mod mutex;
pub mod semaphore;

pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;

/// Interrupts stay disabled while this guard is alive.
///
/// Guards nest: dropping an inner guard restores the state the outer one
/// left, which keeps interrupts off.
#[must_use]
pub struct IrqGuard<A: Arch> {
    flags: IrqFlags,
    // Interrupt state belongs to the CPU that masked it.
    _not_send: PhantomData<*const A>,
}

impl<A: Arch> IrqGuard<A> {
    pub fn new() -> Self {
        Self {
            flags: A::irq_save(),
            _not_send: PhantomData,
        }
    }

    /// Whether interrupts were enabled before this guard masked them.
    pub fn were_enabled(&self) -> bool {
        self.flags.were_enabled()
    }
}

impl<A: Arch> Default for IrqGuard<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch> Drop for IrqGuard<A> {
    fn drop(&mut self) {
        A::irq_restore(self.flags);
    }
}

/// Data that is only touched with interrupts disabled.
pub struct IrqLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Lock for as long as `irq` keeps interrupts masked.
    ///
    /// # Panics
    ///
    /// Panics if the lock is already held: on one CPU with interrupts off
    /// that can only be re-entry from the holder itself.
    pub fn lock<'a, A: Arch>(&'a self, _irq: &'a IrqGuard<A>) -> spin::MutexGuard<'a, T> {
        match self.inner.try_lock() {
            Some(guard) => guard,
            None => panic!("scheduler invariant violated: scheduler lock re-entered"),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}
