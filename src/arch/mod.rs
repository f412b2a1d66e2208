//! Architecture abstraction layer for context switching and interrupt masking.
//!
//! Everything above this module is architecture-neutral: the scheduler only
//! talks to the CPU through [`Arch`]. Each supported target provides one
//! implementation; hosted builds (`cfg(test)` or the `std-shim` feature) use
//! [`host::HostArch`], which performs real register switches but keeps the
//! interrupt mask and TLS register in thread-local cells.

use crate::errors::ArchError;

/// Signature of the first function run on a fresh context.
///
/// The two arguments are the ones given to [`Arch::init_context`]. The
/// function must never return: there is no frame to return into.
pub type ThreadEntry = unsafe extern "C" fn(usize, usize) -> !;

/// Interrupt state captured by [`Arch::irq_save`].
///
/// Opaque outside the arch layer; hand it back to [`Arch::irq_restore`]
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct IrqFlags(pub(crate) usize);

impl IrqFlags {
    /// Whether interrupts were enabled when the flags were captured.
    pub fn were_enabled(self) -> bool {
        self.0 != 0
    }
}

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations of this trait involve direct hardware manipulation and
/// inline assembly. All methods marked as unsafe have specific preconditions
/// that must be upheld by the caller.
pub trait Arch: 'static {
    /// Callee-saved register file plus stack and instruction pointers.
    type SavedContext: Default + Send;

    /// Extended (FPU/SIMD) register save area.
    type ExtendedState: Default + Send;

    /// Short name for diagnostics.
    const NAME: &'static str;

    /// Smallest stack [`Arch::init_context`] accepts.
    const MIN_STACK_SIZE: usize;

    /// Required alignment of the stack pointer at a call boundary.
    const STACK_ALIGN: usize = 16;

    /// Build a context that, when first switched to, calls
    /// `entry(arg0, arg1)` on top of the given stack.
    ///
    /// The initial stack pointer is the top of the region rounded down to
    /// [`Arch::STACK_ALIGN`].
    fn init_context(
        stack_base: *mut u8,
        stack_len: usize,
        entry: ThreadEntry,
        arg0: usize,
        arg1: usize,
    ) -> Result<Self::SavedContext, ArchError>;

    /// Switch from one thread context to another.
    ///
    /// Returns only when some other thread later switches back into `prev`.
    ///
    /// # Safety
    ///
    /// - `prev` and `next` must point to valid contexts that stay alive until
    ///   the switch back into `prev`
    /// - `next` must have been produced by `init_context` or by an earlier
    ///   switch away from it
    /// - Must be called with interrupts disabled
    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext);

    /// Read the thread-local-storage base register.
    fn tls_get() -> usize;

    /// Write the thread-local-storage base register.
    ///
    /// # Safety
    ///
    /// Code running afterwards resolves thread-locals relative to `tls`.
    unsafe fn tls_set(tls: usize);

    /// Save the extended register file.
    ///
    /// Switches are ordinary calls, so the compiler has already spilled any
    /// live caller-saved vector registers; in that path the image chiefly
    /// carries the FPU status and control words (x87 FSW/FCW, MXCSR flags,
    /// FPSR/FPCR). The full register image is what an interrupt-driven
    /// switch needs.
    ///
    /// # Safety
    ///
    /// Must be called with interrupts disabled, on the thread that owns the
    /// registers being saved.
    #[cfg(feature = "full-fpu")]
    unsafe fn save_extended(state: &mut Self::ExtendedState);

    /// Restore the extended register file.
    ///
    /// # Safety
    ///
    /// `state` must hold a valid image written by `save_extended` or
    /// `Default`.
    #[cfg(feature = "full-fpu")]
    unsafe fn restore_extended(state: &Self::ExtendedState);

    /// Disable interrupts, returning the previous state.
    fn irq_save() -> IrqFlags;

    /// Restore the interrupt state returned by [`Arch::irq_save`].
    fn irq_restore(flags: IrqFlags);

    /// Unconditionally enable interrupts.
    fn irq_enable();

    /// Check if interrupts are currently enabled.
    fn irqs_enabled() -> bool;

    /// Identifier of the CPU executing the caller.
    fn cpu_id() -> usize;
}

/// Validate a stack region and return its aligned top.
pub(crate) fn stack_top<A: Arch>(stack_base: *mut u8, stack_len: usize) -> Result<usize, ArchError> {
    if stack_base.is_null() {
        return Err(ArchError::NullStack);
    }
    if stack_len < A::MIN_STACK_SIZE {
        return Err(ArchError::StackTooSmall {
            len: stack_len,
            min: A::MIN_STACK_SIZE,
        });
    }
    let top = (stack_base as usize)
        .checked_add(stack_len)
        .ok_or(ArchError::NullStack)?;
    Ok(top & !(A::STACK_ALIGN - 1))
}

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(any(test, feature = "std-shim"))]
pub mod host;

#[cfg(target_arch = "x86_64")]
pub(crate) use self::x86_64 as native;
#[cfg(target_arch = "aarch64")]
pub(crate) use self::aarch64 as native;

#[cfg(any(test, feature = "std-shim"))]
pub use host::HostArch as DefaultArch;

#[cfg(all(not(any(test, feature = "std-shim")), target_arch = "x86_64"))]
pub use self::x86_64::X86_64Arch as DefaultArch;

#[cfg(all(not(any(test, feature = "std-shim")), target_arch = "aarch64"))]
pub use self::aarch64::Aarch64Arch as DefaultArch;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("coop-threads supports x86_64 and aarch64 only.");

#[cfg(all(any(test, feature = "std-shim"), target_os = "windows"))]
compile_error!("The hosted build needs the System V calling convention; Windows hosts are not supported.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_top_alignment() {
        let mut buf = [0u8; 64 * 1024];
        let base = buf.as_mut_ptr();
        let top = stack_top::<DefaultArch>(base, buf.len() - 3).unwrap();
        assert_eq!(top % 16, 0);
        assert!(top <= base as usize + buf.len() - 3);
        assert!(top > base as usize + buf.len() - 3 - 16);
    }

    #[test]
    fn test_stack_top_rejects_small_and_null() {
        let mut buf = [0u8; 64];
        assert_eq!(
            stack_top::<DefaultArch>(buf.as_mut_ptr(), buf.len()),
            Err(ArchError::StackTooSmall {
                len: 64,
                min: <DefaultArch as Arch>::MIN_STACK_SIZE
            })
        );
        assert_eq!(
            stack_top::<DefaultArch>(core::ptr::null_mut(), 1 << 20),
            Err(ArchError::NullStack)
        );
    }
}
