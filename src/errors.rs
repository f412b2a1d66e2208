//! Error types for the threading system.
//!
//! Recoverable failures (resource exhaustion, misuse that can be reported)
//! are returned as values. Scheduler invariant violations are never returned:
//! they are described by [`InvariantViolation`] and turned into a panic, which
//! on bare metal halts the CPU.

#![allow(clippy::uninlined_format_args)]

use core::fmt;
extern crate alloc;
use alloc::string::String;

use crate::thread::ThreadId;

/// Result type for threading operations.
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Umbrella error type for all threading operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// Thread spawning errors
    Spawn(SpawnError),
    /// Thread joining errors
    Join(JoinError),
    /// Timed wait errors
    Wait(WaitError),
    /// Architecture-specific errors
    Arch(ArchError),
    /// Global kernel initialization errors
    Init(InitError),
}

/// Errors that can occur during thread spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// The global kernel has not been initialized
    NotInitialized,
    /// The allocator could not supply a stack or a control block
    OutOfMemory,
    /// The thread table cannot address more threads
    TooManyThreads,
    /// Stack size below the architecture minimum
    InvalidStackSize(usize),
    /// Thread name is empty
    InvalidName(String),
}

/// Errors that can occur when joining a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// A thread tried to join itself
    WouldDeadlock,
    /// The thread was detached and is reaped automatically
    Detached,
    /// The handle does not name a live thread
    InvalidHandle,
}

/// Errors returned by timed waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed before the awaited condition held
    TimedOut,
}

/// Architecture-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchError {
    /// Stack smaller than the architecture's minimum usable stack
    StackTooSmall { len: usize, min: usize },
    /// Stack base address is null
    NullStack,
}

/// Errors from [`crate::kernel::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// `init` was already called successfully
    AlreadyInitialized,
    /// The idle thread could not be created
    Spawn(SpawnError),
}

/// A broken scheduler invariant.
///
/// Never propagated as an error value: the scheduler panics with this as the
/// message. [`crate::Scheduler::check_consistency`] returns it so tests can
/// inspect the queues without crashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvariantViolation {
    /// What went wrong
    pub what: &'static str,
    /// The thread involved, if one is known
    pub thread: Option<ThreadId>,
}

impl InvariantViolation {
    pub(crate) const fn new(what: &'static str, thread: ThreadId) -> Self {
        Self {
            what,
            thread: Some(thread),
        }
    }

    pub(crate) const fn global(what: &'static str) -> Self {
        Self { what, thread: None }
    }
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::Spawn(e) => write!(f, "Thread spawn error: {}", e),
            ThreadError::Join(e) => write!(f, "Thread join error: {}", e),
            ThreadError::Wait(e) => write!(f, "Wait error: {}", e),
            ThreadError::Arch(e) => write!(f, "Architecture error: {}", e),
            ThreadError::Init(e) => write!(f, "Kernel init error: {}", e),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::NotInitialized => write!(f, "Threading system not initialized"),
            SpawnError::OutOfMemory => write!(f, "Out of memory for thread creation"),
            SpawnError::TooManyThreads => write!(f, "Maximum number of threads reached"),
            SpawnError::InvalidStackSize(size) => write!(f, "Invalid stack size: {}", size),
            SpawnError::InvalidName(name) => write!(f, "Invalid thread name: {:?}", name),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::WouldDeadlock => write!(f, "A thread cannot join itself"),
            JoinError::Detached => write!(f, "Thread is detached"),
            JoinError::InvalidHandle => write!(f, "Invalid thread handle"),
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::TimedOut => write!(f, "Wait timed out"),
        }
    }
}

impl fmt::Display for ArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchError::StackTooSmall { len, min } => {
                write!(f, "Stack of {} bytes is below the minimum of {}", len, min)
            }
            ArchError::NullStack => write!(f, "Stack base is null"),
        }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::AlreadyInitialized => write!(f, "Kernel already initialized"),
            InitError::Spawn(e) => write!(f, "Idle thread creation failed: {}", e),
        }
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread {
            Some(id) => write!(f, "scheduler invariant violated: {} (thread {})", self.what, id),
            None => write!(f, "scheduler invariant violated: {}", self.what),
        }
    }
}

impl From<SpawnError> for ThreadError {
    fn from(e: SpawnError) -> Self {
        ThreadError::Spawn(e)
    }
}

impl From<JoinError> for ThreadError {
    fn from(e: JoinError) -> Self {
        ThreadError::Join(e)
    }
}

impl From<WaitError> for ThreadError {
    fn from(e: WaitError) -> Self {
        ThreadError::Wait(e)
    }
}

impl From<ArchError> for ThreadError {
    fn from(e: ArchError) -> Self {
        ThreadError::Arch(e)
    }
}

impl From<InitError> for ThreadError {
    fn from(e: InitError) -> Self {
        ThreadError::Init(e)
    }
}

impl From<ArchError> for SpawnError {
    fn from(e: ArchError) -> Self {
        match e {
            ArchError::StackTooSmall { len, .. } => SpawnError::InvalidStackSize(len),
            ArchError::NullStack => SpawnError::OutOfMemory,
        }
    }
}

impl From<SpawnError> for InitError {
    fn from(e: SpawnError) -> Self {
        InitError::Spawn(e)
    }
}
