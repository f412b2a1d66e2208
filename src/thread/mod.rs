//! Thread identity, state and the thread control block.

use core::fmt;
use core::num::NonZeroU64;
use core::ptr::NonNull;

extern crate alloc;
use alloc::boxed::Box;
use alloc::string::String;

use crate::arch::Arch;
use crate::mem::Stack;
use crate::sched::list::{Link, ThreadList};
use crate::sched::Scheduler;
use crate::time::{Duration, Instant};

pub mod builder;
pub mod handle;
pub(crate) mod table;

pub use builder::ThreadBuilder;
pub use handle::JoinHandle;
pub(crate) use table::{Slot, ThreadTable};

/// Unique thread identifier.
///
/// Packs the arena slot (low 32 bits) with the slot's generation (high 32
/// bits), so an id stays unique after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub(crate) const fn from_parts(slot: u32, generation: u32) -> Self {
        // Generations start at 1, so the packed value is never zero.
        let raw = ((generation as u64) << 32) | slot as u64;
        match NonZeroU64::new(raw) {
            Some(raw) => Self(raw),
            None => panic!("thread generation must be non-zero"),
        }
    }

    pub(crate) fn slot(self) -> Slot {
        Slot(self.0.get() as u32)
    }

    /// How many times the underlying slot has been reused.
    pub fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    /// Get the ID as u64.
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot().0, self.generation())
    }
}

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// In the run queue, or currently executing.
    Runnable,
    /// In exactly one wait queue, possibly with a deadline.
    Sleeping,
    /// Entry function returned or `exit_now` was called; awaiting reap.
    Exited,
}

/// What role a thread plays for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// The context that created the scheduler; runs on the boot stack.
    Boot,
    /// Dispatched only when nothing else is runnable.
    Idle,
    /// Spawned through the scheduler.
    Worker,
}

/// Why a blocked thread became runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Explicitly woken before any deadline.
    Woken,
    /// The deadline passed first.
    TimedOut,
}

/// Diagnostic snapshot of one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: Option<String>,
    pub state: ThreadState,
    pub kind: ThreadKind,
    /// Pending wake deadline, while sleeping with a timeout.
    pub deadline: Option<Instant>,
    /// Time spent executing, up to the last switch away.
    pub exec_time: Duration,
    /// How many times the thread was switched to.
    pub dispatches: u64,
    /// Owned stack size; zero for the boot thread.
    pub stack_size: usize,
    /// Lowest address of the owned stack, where its canary lives; zero for
    /// the boot thread.
    pub stack_base: usize,
    pub detached: bool,
}

pub(crate) type ThreadMain<A> = Box<dyn FnOnce(&Scheduler<A>) + Send>;
pub(crate) type Destructor = Box<dyn FnOnce(ThreadId) + Send>;

/// What a fresh context runs once dispatched.
pub(crate) enum Entry<A: Arch> {
    Idle,
    Thread(ThreadMain<A>),
}

/// Which queue currently links a thread through its `queue_link`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueRef {
    None,
    Run,
    Wait(NonNull<ThreadList>),
}

/// Thread control block.
pub(crate) struct Tcb<A: Arch> {
    pub(crate) id: ThreadId,
    pub(crate) name: Option<String>,
    pub(crate) state: ThreadState,
    pub(crate) kind: ThreadKind,
    pub(crate) context: A::SavedContext,
    #[cfg_attr(not(feature = "full-fpu"), allow(dead_code))]
    pub(crate) extended: A::ExtendedState,
    pub(crate) stack: Option<Stack>,
    pub(crate) tls: usize,
    pub(crate) entry: Option<Entry<A>>,
    pub(crate) destructor: Option<Destructor>,
    pub(crate) detached: bool,
    /// Set while sleeping with a timeout; the thread is then on the timer list.
    pub(crate) deadline: Option<Instant>,
    pub(crate) wake_reason: Option<WakeReason>,
    pub(crate) queue: QueueRef,
    pub(crate) queue_link: Link,
    pub(crate) timer_link: Link,
    pub(crate) exec_time: Duration,
    pub(crate) dispatches: u64,
}

// The only non-Send member is the wait list pointer, which is dereferenced
// under the scheduler lock alone.
unsafe impl<A: Arch> Send for Tcb<A> {}

impl<A: Arch> Tcb<A> {
    /// A runnable control block with no stack or entry; the table assigns the id.
    pub(crate) fn new(kind: ThreadKind, name: Option<String>) -> Self {
        Self {
            id: ThreadId::from_parts(0, 1),
            name,
            state: ThreadState::Runnable,
            kind,
            context: Default::default(),
            extended: Default::default(),
            stack: None,
            tls: 0,
            entry: None,
            destructor: None,
            detached: false,
            deadline: None,
            wake_reason: None,
            queue: QueueRef::None,
            queue_link: Link::default(),
            timer_link: Link::default(),
            exec_time: Duration::ZERO,
            dispatches: 0,
        }
    }

    pub(crate) fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            kind: self.kind,
            deadline: self.deadline,
            exec_time: self.exec_time,
            dispatches: self.dispatches,
            stack_size: self.stack.as_ref().map_or(0, Stack::size),
            stack_base: self.stack.as_ref().map_or(0, |s| s.base() as usize),
            detached: self.detached,
        }
    }
}
