//! Thread stacks with an overflow canary.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use super::Allocator;

/// Pattern written at the lowest word of every stack.
pub const STACK_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Stacks are page aligned so a platform can add guard pages later.
const STACK_ALLOC_ALIGN: usize = 4096;

/// A thread stack owned by exactly one TCB.
///
/// Stacks are not freed on drop: the owner hands them back with
/// [`Stack::free`] to the allocator they came from.
pub struct Stack {
    /// Lowest address of the region.
    memory: NonNull<u8>,
    size: usize,
}

impl Stack {
    /// Allocate a stack of `size` bytes and install the canary.
    ///
    /// Returns `None` when the allocator is exhausted.
    pub fn allocate(allocator: &dyn Allocator, size: usize) -> Option<Stack> {
        let layout = Self::layout(size)?;
        let memory = allocator.alloc(layout)?;
        let stack = Stack { memory, size };
        stack.install_canary();
        Some(stack)
    }

    /// Give the memory back to `allocator`.
    ///
    /// # Safety
    ///
    /// `allocator` must be the one that produced this stack, and no thread
    /// may still be running on it.
    pub unsafe fn free(self, allocator: &dyn Allocator) {
        if let Some(layout) = Self::layout(self.size) {
            unsafe { allocator.free(self.memory, layout) };
        }
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, STACK_ALLOC_ALIGN).ok()
    }

    /// Get the stack size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Lowest address of the stack.
    pub fn base(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    /// One past the highest address of the stack.
    pub fn end(&self) -> usize {
        self.memory.as_ptr() as usize + self.size
    }

    /// Whether `addr` lies inside this stack.
    pub fn contains(&self, addr: usize) -> bool {
        (self.base() as usize..self.end()).contains(&addr)
    }

    fn install_canary(&self) {
        unsafe { (self.base() as *mut u64).write(STACK_CANARY) };
    }

    /// Check if the stack canary is still intact.
    pub fn check_canary(&self) -> bool {
        unsafe { (self.base() as *const u64).read_volatile() == STACK_CANARY }
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.memory)
            .field("size", &self.size)
            .finish()
    }
}

unsafe impl Send for Stack {}
