use core::mem::ManuallyDrop;

use super::{ThreadId, ThreadState};
use crate::arch::{Arch, DefaultArch};
use crate::errors::JoinError;
use crate::sched::Scheduler;

/// Owned permission to join a spawned thread.
///
/// Dropping the handle detaches the thread: it is reaped as soon as it exits.
#[must_use = "dropping a JoinHandle detaches the thread"]
pub struct JoinHandle<'s, A: Arch = DefaultArch> {
    sched: &'s Scheduler<A>,
    id: ThreadId,
}

impl<'s, A: Arch> JoinHandle<'s, A> {
    pub(crate) fn new(sched: &'s Scheduler<A>, id: ThreadId) -> Self {
        Self { sched, id }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.id
    }

    /// Whether the thread has exited. Does not block.
    pub fn is_finished(&self) -> bool {
        !matches!(
            self.sched.thread_state(self.id),
            Some(ThreadState::Runnable | ThreadState::Sleeping)
        )
    }

    /// Block until the thread exits, then release its stack and slot.
    pub fn join(self) -> Result<(), JoinError> {
        let this = ManuallyDrop::new(self);
        this.sched.join(this.id)
    }

    /// Let the thread run on unobserved.
    pub fn detach(self) {
        drop(self);
    }
}

impl<A: Arch> Drop for JoinHandle<'_, A> {
    fn drop(&mut self) {
        self.sched.detach(self.id);
    }
}

impl<A: Arch> core::fmt::Debug for JoinHandle<'_, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JoinHandle").field("id", &self.id).finish()
    }
}
