//! Memory for thread stacks.
//!
//! The scheduler does not manage memory itself: stacks come from an
//! [`Allocator`] handed to it at construction, and go back to the same
//! allocator when the owning thread is reaped.

use core::alloc::Layout;
use core::ptr::NonNull;

pub mod stack;

pub use stack::{Stack, STACK_CANARY};

/// Block allocator consumed by the scheduler.
///
/// Only thread stacks are drawn from it. Control blocks, names and closures
/// live on the global heap (`alloc`); the control-block arena grows with
/// `try_reserve`, so running out there still surfaces as
/// [`SpawnError::OutOfMemory`](crate::errors::SpawnError::OutOfMemory)
/// rather than an abort.
pub trait Allocator: Send + Sync {
    /// Allocate a block for `layout`, or `None` when memory is exhausted.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this allocator with the same `layout`,
    /// and must not be freed twice.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Forwards to the crate-level `#[global_allocator]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalAllocator;

impl Allocator for GlobalAllocator {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}
