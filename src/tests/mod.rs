//! Scheduler scenarios run on the host with a simulated clock.
//!
//! Every test drives its own scheduler from the test harness thread, which
//! the scheduler adopts as its boot thread. Green threads run on real stacks
//! through the native context switch.

mod helpers;
mod integration;
mod sync;
