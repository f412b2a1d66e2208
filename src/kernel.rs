//! The process-wide scheduler.
//!
//! A unikernel has exactly one scheduler for its lifetime. [`init`] builds it
//! on the boot thread and leaks it, after which the free functions here (and
//! [`crate::yield_now`]) reach it without threading a reference through
//! every call.
//!
//! The scheduler belongs to the CPU that ran [`init`]. Lookups from any other
//! CPU find nothing, as if no scheduler had been installed there.

use core::pin::Pin;

use alloc::boxed::Box;

use crate::arch::{Arch, DefaultArch};
use crate::errors::{InitError, SpawnError};
use crate::mem::Allocator;
use crate::platform::Platform;
use crate::sched::{SchedConfig, Scheduler};
use crate::thread::{JoinHandle, ThreadId};
use crate::time::Duration;

static KERNEL: spin::Once<&'static Scheduler<DefaultArch>> = spin::Once::new();

/// Create the global scheduler, adopting the caller as its boot thread.
pub fn init(
    platform: impl Platform + 'static,
    allocator: impl Allocator + 'static,
) -> Result<&'static Scheduler<DefaultArch>, InitError> {
    init_with_config(SchedConfig::default(), platform, allocator)
}

pub fn init_with_config(
    config: SchedConfig,
    platform: impl Platform + 'static,
    allocator: impl Allocator + 'static,
) -> Result<&'static Scheduler<DefaultArch>, InitError> {
    if KERNEL.is_completed() {
        return Err(InitError::AlreadyInitialized);
    }
    let sched = Scheduler::with_config(config, platform, allocator)?;
    // Safety: the scheduler is leaked, so it never moves again.
    let sched: &'static Scheduler<DefaultArch> = Box::leak(unsafe { Pin::into_inner_unchecked(sched) });
    KERNEL.call_once(|| sched);
    log::info!("global scheduler installed");
    Ok(sched)
}

/// The scheduler of the calling CPU, once [`init`] has run there.
pub fn get() -> Option<&'static Scheduler<DefaultArch>> {
    KERNEL
        .get()
        .copied()
        .filter(|sched| sched.cpu() == DefaultArch::cpu_id())
}

/// Spawn onto the global scheduler.
pub fn spawn<F>(f: F) -> Result<JoinHandle<'static>, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    get().ok_or(SpawnError::NotInitialized)?.spawn(move |_| f())
}

/// Yield on the global scheduler; does nothing before [`init`].
pub fn yield_now() {
    if let Some(sched) = get() {
        sched.yield_now();
    }
}

/// Sleep on the global scheduler.
///
/// # Panics
///
/// Panics if [`init`] has not run.
pub fn sleep(duration: Duration) {
    match get() {
        Some(sched) => sched.sleep(duration),
        None => panic!("kernel::sleep called before kernel::init"),
    }
}

/// Identity of the calling thread, once [`init`] has run.
pub fn current() -> Option<ThreadId> {
    get().map(Scheduler::current)
}
