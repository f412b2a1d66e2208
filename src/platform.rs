//! Platform services the scheduler consumes: a monotonic clock and a way
//! to park the CPU until a deadline or an interrupt.

use crate::time::Instant;

/// Clock and halt primitive for one logical CPU.
///
/// Chosen once when the scheduler is created and fixed thereafter.
pub trait Platform: Send + Sync {
    /// Nanoseconds since boot. Never decreases.
    fn now_ns(&self) -> u64;

    /// Park the CPU until `deadline` passes or any interrupt arrives.
    ///
    /// Called and returning with interrupts disabled; pending interrupt
    /// handlers get to run before this returns. `None` waits for an
    /// interrupt only. Must return promptly if `deadline` is already in the
    /// past.
    fn halt_until(&self, deadline: Option<Instant>);

    fn now(&self) -> Instant {
        Instant::from_nanos(self.now_ns())
    }
}

/// ARM generic timer: `cntpct_el0` clock, `cntp_cval_el0` wake-up.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod generic_timer {
    use portable_atomic::{AtomicU64, Ordering};

    use super::Platform;
    use crate::arch::aarch64;
    use crate::time::Instant;

    static TIMER_FREQ: AtomicU64 = AtomicU64::new(0);

    /// EL1 physical timer platform.
    ///
    /// The platform's interrupt controller must route the timer PPI; the
    /// timer output is masked again before IRQs are reopened, so no handler
    /// is needed for it.
    pub struct GenericTimer {
        _private: (),
    }

    impl GenericTimer {
        /// Read the counter frequency and take over the EL1 physical timer.
        pub fn new() -> Self {
            TIMER_FREQ.store(aarch64::timer_frequency(), Ordering::Relaxed);
            unsafe { aarch64::disarm_timer() };
            Self { _private: () }
        }

        fn freq() -> u64 {
            TIMER_FREQ.load(Ordering::Relaxed)
        }
    }

    impl Default for GenericTimer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Platform for GenericTimer {
        fn now_ns(&self) -> u64 {
            aarch64::ticks_to_ns(aarch64::get_timestamp(), Self::freq())
        }

        fn halt_until(&self, deadline: Option<Instant>) {
            if let Some(deadline) = deadline {
                if deadline.as_nanos() <= self.now_ns() {
                    return;
                }
                unsafe { aarch64::arm_timer(aarch64::ns_to_ticks(deadline.as_nanos(), Self::freq())) };
            }
            aarch64::wait_for_interrupt();
            unsafe { aarch64::disarm_timer() };
            aarch64::service_pending_irqs();
        }
    }
}

/// Hosted platform backed by the std clock.
#[cfg(any(test, feature = "std-shim"))]
pub mod std_shim {
    extern crate std;

    use super::Platform;
    use crate::time::Instant;

    /// How long a halt without deadline parks the OS thread.
    const IDLE_TICK: std::time::Duration = std::time::Duration::from_millis(1);

    /// Clock starts at zero when the platform is created.
    pub struct StdPlatform {
        epoch: std::time::Instant,
    }

    impl StdPlatform {
        pub fn new() -> Self {
            Self {
                epoch: std::time::Instant::now(),
            }
        }
    }

    impl Default for StdPlatform {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Platform for StdPlatform {
        fn now_ns(&self) -> u64 {
            u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
        }

        fn halt_until(&self, deadline: Option<Instant>) {
            match deadline {
                Some(deadline) => {
                    let now = self.now_ns();
                    if deadline.as_nanos() > now {
                        std::thread::sleep(std::time::Duration::from_nanos(deadline.as_nanos() - now));
                    }
                }
                // There are no interrupts on a host; wake up periodically.
                None => std::thread::sleep(IDLE_TICK),
            }
        }
    }

}
