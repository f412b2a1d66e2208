use super::{Destructor, Entry, JoinHandle, ThreadId, ThreadKind};
use crate::arch::Arch;
use crate::errors::SpawnError;
use crate::sched::Scheduler;

extern crate alloc;
use alloc::boxed::Box;
use alloc::string::String;

/// Options handed to the scheduler when it creates a thread.
#[derive(Default)]
pub(crate) struct ThreadOptions {
    pub(crate) name: Option<String>,
    /// `None` picks the scheduler's configured default.
    pub(crate) stack_size: Option<usize>,
    /// Initial value of the thread pointer register.
    pub(crate) tls: usize,
    pub(crate) detached: bool,
    pub(crate) destructor: Option<Destructor>,
}

/// Configures a thread before spawning it.
///
/// ```ignore
/// let handle = ThreadBuilder::new()
///     .name("worker")
///     .stack_size(16 * 1024)
///     .spawn(&sched, |s| s.sleep(Duration::from_millis(5)))?;
/// handle.join()?;
/// ```
pub struct ThreadBuilder {
    opts: ThreadOptions,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self {
            opts: ThreadOptions::default(),
        }
    }

    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.opts.name = Some(name.into());
        self
    }

    /// Stack size in bytes, at least [`Arch::MIN_STACK_SIZE`].
    pub fn stack_size(mut self, size: usize) -> Self {
        self.opts.stack_size = Some(size);
        self
    }

    /// Thread pointer value loaded whenever the thread is switched in.
    pub fn tls(mut self, base: usize) -> Self {
        self.opts.tls = base;
        self
    }

    /// Reap the thread as soon as it exits; its handle can no longer join.
    pub fn detached(mut self) -> Self {
        self.opts.detached = true;
        self
    }

    /// Run `f` exactly once when the thread exits, on the exiting thread.
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ThreadId) + Send + 'static,
    {
        self.opts.destructor = Some(Box::new(f));
        self
    }

    pub fn spawn<'s, A, F>(self, sched: &'s Scheduler<A>, f: F) -> Result<JoinHandle<'s, A>, SpawnError>
    where
        A: Arch,
        F: FnOnce(&Scheduler<A>) + Send + 'static,
    {
        let id = sched.create_thread(ThreadKind::Worker, self.opts, Entry::Thread(Box::new(f)))?;
        Ok(JoinHandle::new(sched, id))
    }
}

impl Default for ThreadBuilder {
    fn default() -> Self {
        Self::new()
    }
}
