#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(unreachable_pub)]

//! Cooperative threads for single-CPU unikernels.
//!
//! A [`Scheduler`] multiplexes any number of threads onto one CPU. Threads
//! run until they yield, block on a [`WaitQueue`], sleep, or exit; nothing
//! preempts them. Interrupt handlers may wake sleeping threads, and when
//! nothing is runnable an idle thread halts the CPU until the next deadline.
//!
//! # Targets
//!
//! - x86_64 and AArch64, bare metal (`target_os = "none"`)
//! - Hosted on Linux with the `std-shim` feature (and always under `cargo
//!   test`), where interrupts and the thread pointer are simulated
//!
//! # Features
//!
//! - `full-fpu`: save and restore the full FPU/SIMD register file on every
//!   switch (default). Without it only the callee-saved FP state is kept.
//!   Since a switch is an ordinary call, caller-saved vector registers are
//!   already dead there, so under cooperative switching the image mainly
//!   carries the FPU status words; the full set is needed by a switch taken
//!   from interrupt context.
//! - `std-shim`: hosted build with a `std` clock
//!
//! # Quick Start
//!
//! ```ignore
//! use coop_threads::{kernel, Duration, GlobalAllocator};
//!
//! fn kernel_main(platform: impl coop_threads::Platform + 'static) -> ! {
//!     let sched = kernel::init(platform, GlobalAllocator).expect("scheduler init");
//!
//!     let worker = sched
//!         .spawn(|s| {
//!             for _ in 0..3 {
//!                 s.sleep(Duration::from_millis(10));
//!             }
//!         })
//!         .expect("spawn worker");
//!     worker.join().expect("join worker");
//!
//!     loop {
//!         kernel::sleep(Duration::from_secs(1));
//!     }
//! }
//! ```

pub mod arch;
pub mod errors;
pub mod kernel;
pub mod mem;
pub mod platform;
pub mod sched;
pub mod sync;
pub mod thread;
pub mod time;

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("{}", info);
    let _ = DefaultArch::irq_save();
    loop {
        core::hint::spin_loop();
    }
}

// Architecture abstraction
pub use arch::{Arch, DefaultArch};

// Scheduler
pub use sched::{SchedConfig, SchedStats, Scheduler, WaitQueue};

// Threads
pub use thread::{JoinHandle, ThreadBuilder, ThreadId, ThreadInfo, ThreadKind, ThreadState, WakeReason};

// Synchronization
pub use sync::{IrqGuard, Mutex, MutexGuard, Semaphore};

// Memory and platform hooks
pub use mem::{Allocator, GlobalAllocator, Stack};
pub use platform::Platform;

// Time
pub use time::{Duration, Instant};

// Errors
pub use errors::{
    ArchError, InitError, InvariantViolation, JoinError, SpawnError, ThreadError, ThreadResult, WaitError,
};

/// Yield the CPU on the global scheduler.
///
/// Does nothing before [`kernel::init`].
#[inline]
pub fn yield_now() {
    kernel::yield_now();
}

#[cfg(test)]
mod tests;
