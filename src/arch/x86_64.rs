//! x86_64 context switching, interrupt masking and TLS.
//!
//! The switch routine is written as a free-standing assembly function so the
//! compiler treats it as an ordinary `extern "C"` call: caller-saved
//! registers are already spilled, and only the System V callee-saved set
//! (rbx, rbp, r12-r15, the MXCSR control bits and the x87 control word) has
//! to travel through [`Context`].

use core::arch::{asm, global_asm};
use core::mem::offset_of;

use super::{stack_top, Arch, IrqFlags, ThreadEntry};
use crate::errors::ArchError;

/// Saved callee-saved state of a suspended thread.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct Context {
    pub sp: u64,
    pub ip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub mxcsr: u32,
    pub fpucw: u16,
}

const _: () = {
    assert!(offset_of!(Context, sp) == 0x00);
    assert!(offset_of!(Context, ip) == 0x08);
    assert!(offset_of!(Context, rbx) == 0x10);
    assert!(offset_of!(Context, rbp) == 0x18);
    assert!(offset_of!(Context, r12) == 0x20);
    assert!(offset_of!(Context, r13) == 0x28);
    assert!(offset_of!(Context, r14) == 0x30);
    assert!(offset_of!(Context, r15) == 0x38);
    assert!(offset_of!(Context, mxcsr) == 0x40);
    assert!(offset_of!(Context, fpucw) == 0x44);
};

/// Power-on MXCSR: all exceptions masked, round to nearest.
const MXCSR_DEFAULT: u32 = 0x1F80;
/// Power-on x87 control word: extended precision, all exceptions masked.
const FPUCW_DEFAULT: u16 = 0x037F;

pub(crate) const MIN_STACK_SIZE: usize = 4096;

// prev in rdi, next in rsi. The return address on the stack becomes the
// saved ip; resuming jumps there with the stack as it was after `ret`.
global_asm!(
    ".text",
    ".global coop_threads_ctx_switch",
    ".type coop_threads_ctx_switch, @function",
    ".p2align 4",
    "coop_threads_ctx_switch:",
    "mov rax, [rsp]",
    "lea rcx, [rsp + 8]",
    "mov [rdi + 0x00], rcx",
    "mov [rdi + 0x08], rax",
    "mov [rdi + 0x10], rbx",
    "mov [rdi + 0x18], rbp",
    "mov [rdi + 0x20], r12",
    "mov [rdi + 0x28], r13",
    "mov [rdi + 0x30], r14",
    "mov [rdi + 0x38], r15",
    "stmxcsr dword ptr [rdi + 0x40]",
    "fnstcw word ptr [rdi + 0x44]",
    "mov rbx, [rsi + 0x10]",
    "mov rbp, [rsi + 0x18]",
    "mov r12, [rsi + 0x20]",
    "mov r13, [rsi + 0x28]",
    "mov r14, [rsi + 0x30]",
    "mov r15, [rsi + 0x38]",
    "ldmxcsr dword ptr [rsi + 0x40]",
    "fldcw word ptr [rsi + 0x44]",
    "mov rsp, [rsi + 0x00]",
    "jmp qword ptr [rsi + 0x08]",
    ".size coop_threads_ctx_switch, . - coop_threads_ctx_switch",
    "",
    // First dispatch of a fresh context: rbx = entry, r12/r13 = arguments.
    // rsp is 16-byte aligned here, so the call leaves the entry function
    // with the alignment the ABI expects.
    ".global coop_threads_ctx_start",
    ".type coop_threads_ctx_start, @function",
    ".p2align 4",
    "coop_threads_ctx_start:",
    "mov rdi, r12",
    "mov rsi, r13",
    "xor ebp, ebp",
    "call rbx",
    "ud2",
    ".size coop_threads_ctx_start, . - coop_threads_ctx_start",
);

extern "C" {
    fn coop_threads_ctx_switch(prev: *mut Context, next: *const Context);
    fn coop_threads_ctx_start();
}

pub(crate) fn init_context(
    top: usize,
    entry: ThreadEntry,
    arg0: usize,
    arg1: usize,
) -> Context {
    Context {
        sp: top as u64,
        ip: coop_threads_ctx_start as usize as u64,
        rbx: entry as usize as u64,
        r12: arg0 as u64,
        r13: arg1 as u64,
        mxcsr: MXCSR_DEFAULT,
        fpucw: FPUCW_DEFAULT,
        ..Context::default()
    }
}

/// # Safety
///
/// See [`Arch::context_switch`].
#[inline(always)]
pub(crate) unsafe fn switch(prev: *mut Context, next: *const Context) {
    unsafe { coop_threads_ctx_switch(prev, next) }
}

/// FXSAVE image: x87, MMX, SSE registers and MXCSR.
#[repr(C, align(16))]
pub struct FxArea([u8; 512]);

impl Default for FxArea {
    fn default() -> Self {
        let mut area = [0u8; 512];
        area[0..2].copy_from_slice(&FPUCW_DEFAULT.to_le_bytes());
        area[24..28].copy_from_slice(&MXCSR_DEFAULT.to_le_bytes());
        FxArea(area)
    }
}

impl core::fmt::Debug for FxArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FxArea").finish_non_exhaustive()
    }
}

/// # Safety
///
/// Overwrites nothing but `area`; the caller owns the live registers.
#[cfg(feature = "full-fpu")]
pub(crate) unsafe fn save_extended(area: &mut FxArea) {
    unsafe {
        asm!("fxsave64 [{}]", in(reg) area.0.as_mut_ptr(), options(nostack, preserves_flags));
    }
}

/// # Safety
///
/// `area` must hold a valid FXSAVE image.
#[cfg(feature = "full-fpu")]
pub(crate) unsafe fn restore_extended(area: &FxArea) {
    unsafe {
        asm!(
            "fxrstor64 [{}]",
            in(reg) area.0.as_ptr(),
            out("xmm0") _, out("xmm1") _, out("xmm2") _, out("xmm3") _,
            out("xmm4") _, out("xmm5") _, out("xmm6") _, out("xmm7") _,
            out("xmm8") _, out("xmm9") _, out("xmm10") _, out("xmm11") _,
            out("xmm12") _, out("xmm13") _, out("xmm14") _, out("xmm15") _,
            out("st(0)") _, out("st(1)") _, out("st(2)") _, out("st(3)") _,
            out("st(4)") _, out("st(5)") _, out("st(6)") _, out("st(7)") _,
            options(nostack, preserves_flags)
        );
    }
}

const RFLAGS_IF: usize = 1 << 9;
const MSR_FS_BASE: u32 = 0xC000_0100;

/// Bare-metal x86_64 (ring 0).
pub struct X86_64Arch;

impl Arch for X86_64Arch {
    type SavedContext = Context;
    type ExtendedState = FxArea;

    const NAME: &'static str = "x86_64";
    const MIN_STACK_SIZE: usize = MIN_STACK_SIZE;

    fn init_context(
        stack_base: *mut u8,
        stack_len: usize,
        entry: ThreadEntry,
        arg0: usize,
        arg1: usize,
    ) -> Result<Context, ArchError> {
        let top = stack_top::<Self>(stack_base, stack_len)?;
        Ok(init_context(top, entry, arg0, arg1))
    }

    unsafe fn context_switch(prev: *mut Context, next: *const Context) {
        unsafe { switch(prev, next) }
    }

    fn tls_get() -> usize {
        let (lo, hi): (u32, u32);
        unsafe {
            asm!(
                "rdmsr",
                in("ecx") MSR_FS_BASE,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        ((hi as usize) << 32) | lo as usize
    }

    unsafe fn tls_set(tls: usize) {
        unsafe {
            asm!(
                "wrmsr",
                in("ecx") MSR_FS_BASE,
                in("eax") tls as u32,
                in("edx") (tls >> 32) as u32,
                options(nostack, preserves_flags)
            );
        }
    }

    #[cfg(feature = "full-fpu")]
    unsafe fn save_extended(state: &mut FxArea) {
        unsafe { save_extended(state) }
    }

    #[cfg(feature = "full-fpu")]
    unsafe fn restore_extended(state: &FxArea) {
        unsafe { restore_extended(state) }
    }

    fn irq_save() -> IrqFlags {
        let rflags: usize;
        unsafe {
            asm!("pushfq", "pop {}", "cli", out(reg) rflags, options(nomem));
        }
        IrqFlags(rflags & RFLAGS_IF)
    }

    fn irq_restore(flags: IrqFlags) {
        if flags.were_enabled() {
            Self::irq_enable();
        }
    }

    fn irq_enable() {
        unsafe {
            asm!("sti", options(nomem, nostack));
        }
    }

    fn irqs_enabled() -> bool {
        let rflags: usize;
        unsafe {
            asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags));
        }
        rflags & RFLAGS_IF != 0
    }

    /// Initial local APIC id, from CPUID leaf 1.
    fn cpu_id() -> usize {
        let ebx: usize;
        unsafe {
            asm!(
                "mov {0}, rbx",
                "cpuid",
                "xchg {0}, rbx",
                out(reg) ebx,
                inout("eax") 1u32 => _,
                out("ecx") _,
                out("edx") _,
                options(nomem, nostack, preserves_flags)
            );
        }
        (ebx >> 24) & 0xff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_layout() {
        unsafe extern "C" fn never(_: usize, _: usize) -> ! {
            loop {
                core::hint::spin_loop();
            }
        }
        let ctx = init_context(0x1000, never, 7, 9);
        assert_eq!(ctx.sp, 0x1000);
        assert_eq!(ctx.rbx, never as usize as u64);
        assert_eq!((ctx.r12, ctx.r13), (7, 9));
        assert_eq!(ctx.mxcsr, MXCSR_DEFAULT);
        assert_eq!(ctx.fpucw, FPUCW_DEFAULT);
        assert_eq!(ctx.rbp, 0);
    }

    #[test]
    fn test_fxarea_default_control_words() {
        let area = FxArea::default();
        assert_eq!(u16::from_le_bytes([area.0[0], area.0[1]]), FPUCW_DEFAULT);
        assert_eq!(
            u32::from_le_bytes([area.0[24], area.0[25], area.0[26], area.0[27]]),
            MXCSR_DEFAULT
        );
    }

    #[cfg(feature = "full-fpu")]
    #[test]
    fn test_extended_image_holds_status_words() {
        fn mxcsr() -> u32 {
            let mut value = 0u32;
            unsafe {
                asm!("stmxcsr [{}]", in(reg) core::ptr::addr_of_mut!(value), options(nostack, preserves_flags));
            }
            value
        }

        let before = mxcsr();
        let mut area = FxArea([0; 512]);
        unsafe { save_extended(&mut area) };
        assert_eq!(
            u32::from_le_bytes([area.0[24], area.0[25], area.0[26], area.0[27]]),
            before
        );
        unsafe { restore_extended(&area) };
        assert_eq!(mxcsr(), before);
    }
}
