//! Hosted architecture for tests and the `std-shim` feature.
//!
//! Register switching and the extended save area are the native routines, so
//! green threads really run on their own stacks. The interrupt mask and the
//! TLS base live in per-OS-thread cells instead of privileged registers; each
//! OS thread therefore behaves like an independent CPU.

extern crate std;

use core::cell::Cell;

use portable_atomic::{AtomicUsize, Ordering};

use super::{native, stack_top, Arch, IrqFlags, ThreadEntry};
use crate::errors::ArchError;

std::thread_local! {
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static TLS_BASE: Cell<usize> = const { Cell::new(0) };
    static CPU_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Next id handed to an OS thread that asks for its CPU id.
static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

/// Native context switch with simulated privileged state.
pub struct HostArch;

impl Arch for HostArch {
    type SavedContext = native::Context;
    #[cfg(target_arch = "x86_64")]
    type ExtendedState = native::FxArea;
    #[cfg(target_arch = "aarch64")]
    type ExtendedState = native::NeonState;

    const NAME: &'static str = "host";
    const MIN_STACK_SIZE: usize = native::MIN_STACK_SIZE;

    fn init_context(
        stack_base: *mut u8,
        stack_len: usize,
        entry: ThreadEntry,
        arg0: usize,
        arg1: usize,
    ) -> Result<Self::SavedContext, ArchError> {
        let top = stack_top::<Self>(stack_base, stack_len)?;
        Ok(native::init_context(top, entry, arg0, arg1))
    }

    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext) {
        debug_assert!(!Self::irqs_enabled(), "context switch with interrupts enabled");
        unsafe { native::switch(prev, next) }
    }

    fn tls_get() -> usize {
        TLS_BASE.with(Cell::get)
    }

    unsafe fn tls_set(tls: usize) {
        TLS_BASE.with(|c| c.set(tls));
    }

    #[cfg(feature = "full-fpu")]
    unsafe fn save_extended(state: &mut Self::ExtendedState) {
        unsafe { native::save_extended(state) }
    }

    #[cfg(feature = "full-fpu")]
    unsafe fn restore_extended(state: &Self::ExtendedState) {
        unsafe { native::restore_extended(state) }
    }

    fn irq_save() -> IrqFlags {
        IrqFlags(IRQ_ENABLED.with(|c| c.replace(false)) as usize)
    }

    fn irq_restore(flags: IrqFlags) {
        IRQ_ENABLED.with(|c| c.set(flags.were_enabled()));
    }

    fn irq_enable() {
        IRQ_ENABLED.with(|c| c.set(true));
    }

    fn irqs_enabled() -> bool {
        IRQ_ENABLED.with(Cell::get)
    }

    fn cpu_id() -> usize {
        CPU_ID.with(|c| match c.get() {
            Some(id) => id,
            None => {
                let id = NEXT_CPU.fetch_add(1, Ordering::Relaxed);
                c.set(Some(id));
                id
            }
        })
    }
}
