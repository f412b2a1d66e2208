//! AArch64 (ARM64) context switching, interrupt masking and TLS.
//!
//! Only the AAPCS64 callee-saved state is switched: x19-x29, the link
//! register, sp, the low halves of v8-v15 and FPCR. The full NEON register
//! file is handled separately by the `full-fpu` extended state.

use core::arch::{asm, global_asm};
use core::mem::offset_of;

use super::{stack_top, Arch, IrqFlags, ThreadEntry};
use crate::errors::ArchError;

/// Saved callee-saved state of a suspended thread.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct Context {
    pub sp: u64,
    /// Resume address (x30 at the time of the switch).
    pub ip: u64,
    pub x19_x28: [u64; 10],
    pub fp: u64,
    pub d8_d15: [u64; 8],
    pub fpcr: u64,
}

const _: () = {
    assert!(offset_of!(Context, sp) == 0);
    assert!(offset_of!(Context, ip) == 8);
    assert!(offset_of!(Context, x19_x28) == 16);
    assert!(offset_of!(Context, fp) == 96);
    assert!(offset_of!(Context, d8_d15) == 104);
    assert!(offset_of!(Context, fpcr) == 168);
    assert!(core::mem::size_of::<Context>() == 176);
};

pub(crate) const MIN_STACK_SIZE: usize = 4096;

// prev in x0, next in x1. Resuming returns through the restored x30.
global_asm!(
    ".text",
    ".global coop_threads_ctx_switch",
    ".type coop_threads_ctx_switch, %function",
    ".p2align 2",
    "coop_threads_ctx_switch:",
    "mov x9, sp",
    "stp x9, x30, [x0, #0]",
    "stp x19, x20, [x0, #16]",
    "stp x21, x22, [x0, #32]",
    "stp x23, x24, [x0, #48]",
    "stp x25, x26, [x0, #64]",
    "stp x27, x28, [x0, #80]",
    "str x29, [x0, #96]",
    "stp d8, d9, [x0, #104]",
    "stp d10, d11, [x0, #120]",
    "stp d12, d13, [x0, #136]",
    "stp d14, d15, [x0, #152]",
    "mrs x9, fpcr",
    "str x9, [x0, #168]",
    "ldp x9, x30, [x1, #0]",
    "ldp x19, x20, [x1, #16]",
    "ldp x21, x22, [x1, #32]",
    "ldp x23, x24, [x1, #48]",
    "ldp x25, x26, [x1, #64]",
    "ldp x27, x28, [x1, #80]",
    "ldr x29, [x1, #96]",
    "ldp d8, d9, [x1, #104]",
    "ldp d10, d11, [x1, #120]",
    "ldp d12, d13, [x1, #136]",
    "ldp d14, d15, [x1, #152]",
    "ldr x10, [x1, #168]",
    "msr fpcr, x10",
    "mov sp, x9",
    "ret",
    ".size coop_threads_ctx_switch, . - coop_threads_ctx_switch",
    "",
    // First dispatch of a fresh context: x19 = entry, x20/x21 = arguments.
    // Zeroed fp/lr terminate frame-pointer unwinding here.
    ".global coop_threads_ctx_start",
    ".type coop_threads_ctx_start, %function",
    ".p2align 2",
    "coop_threads_ctx_start:",
    "mov x0, x20",
    "mov x1, x21",
    "mov x29, xzr",
    "mov x30, xzr",
    "blr x19",
    "brk #0x1",
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
    let mut ctx = Context {
        sp: top as u64,
        ip: coop_threads_ctx_start as usize as u64,
        ..Context::default()
    };
    ctx.x19_x28[0] = entry as usize as u64;
    ctx.x19_x28[1] = arg0 as u64;
    ctx.x19_x28[2] = arg1 as u64;
    ctx
}

/// # Safety
///
/// See [`Arch::context_switch`].
#[inline(always)]
pub(crate) unsafe fn switch(prev: *mut Context, next: *const Context) {
    unsafe { coop_threads_ctx_switch(prev, next) }
}

/// Full NEON register file plus FPCR/FPSR.
#[repr(C, align(16))]
#[derive(Debug, Clone)]
pub struct NeonState {
    pub q: [u128; 32],
    pub fpcr: u64,
    pub fpsr: u64,
}

impl Default for NeonState {
    fn default() -> Self {
        Self {
            q: [0; 32],
            fpcr: 0,
            fpsr: 0,
        }
    }
}

const _: () = {
    assert!(offset_of!(NeonState, fpcr) == 512);
    assert!(offset_of!(NeonState, fpsr) == 520);
};

/// # Safety
///
/// Overwrites nothing but `state`; the caller owns the live registers.
#[cfg(feature = "full-fpu")]
pub(crate) unsafe fn save_extended(state: &mut NeonState) {
    unsafe {
        asm!(
            "stp q0, q1, [{ctx}, #0]",
            "stp q2, q3, [{ctx}, #32]",
            "stp q4, q5, [{ctx}, #64]",
            "stp q6, q7, [{ctx}, #96]",
            "stp q8, q9, [{ctx}, #128]",
            "stp q10, q11, [{ctx}, #160]",
            "stp q12, q13, [{ctx}, #192]",
            "stp q14, q15, [{ctx}, #224]",
            "stp q16, q17, [{ctx}, #256]",
            "stp q18, q19, [{ctx}, #288]",
            "stp q20, q21, [{ctx}, #320]",
            "stp q22, q23, [{ctx}, #352]",
            "stp q24, q25, [{ctx}, #384]",
            "stp q26, q27, [{ctx}, #416]",
            "stp q28, q29, [{ctx}, #448]",
            "stp q30, q31, [{ctx}, #480]",
            "mrs {tmp}, fpcr",
            "str {tmp}, [{ctx}, #512]",
            "mrs {tmp}, fpsr",
            "str {tmp}, [{ctx}, #520]",
            ctx = in(reg) state as *mut NeonState,
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

/// # Safety
///
/// `state` must hold a valid image.
#[cfg(feature = "full-fpu")]
pub(crate) unsafe fn restore_extended(state: &NeonState) {
    unsafe {
        asm!(
            "ldr {tmp}, [{ctx}, #512]",
            "msr fpcr, {tmp}",
            "ldr {tmp}, [{ctx}, #520]",
            "msr fpsr, {tmp}",
            "ldp q0, q1, [{ctx}, #0]",
            "ldp q2, q3, [{ctx}, #32]",
            "ldp q4, q5, [{ctx}, #64]",
            "ldp q6, q7, [{ctx}, #96]",
            "ldp q8, q9, [{ctx}, #128]",
            "ldp q10, q11, [{ctx}, #160]",
            "ldp q12, q13, [{ctx}, #192]",
            "ldp q14, q15, [{ctx}, #224]",
            "ldp q16, q17, [{ctx}, #256]",
            "ldp q18, q19, [{ctx}, #288]",
            "ldp q20, q21, [{ctx}, #320]",
            "ldp q22, q23, [{ctx}, #352]",
            "ldp q24, q25, [{ctx}, #384]",
            "ldp q26, q27, [{ctx}, #416]",
            "ldp q28, q29, [{ctx}, #448]",
            "ldp q30, q31, [{ctx}, #480]",
            ctx = in(reg) state as *const NeonState,
            tmp = out(reg) _,
            out("v0") _, out("v1") _, out("v2") _, out("v3") _,
            out("v4") _, out("v5") _, out("v6") _, out("v7") _,
            out("v8") _, out("v9") _, out("v10") _, out("v11") _,
            out("v12") _, out("v13") _, out("v14") _, out("v15") _,
            out("v16") _, out("v17") _, out("v18") _, out("v19") _,
            out("v20") _, out("v21") _, out("v22") _, out("v23") _,
            out("v24") _, out("v25") _, out("v26") _, out("v27") _,
            out("v28") _, out("v29") _, out("v30") _, out("v31") _,
            options(nostack, preserves_flags)
        );
    }
}

/// DAIF.I: IRQs masked when set.
const DAIF_I: usize = 1 << 7;

/// Aff3 and Aff2..Aff0 of MPIDR_EL1.
const MPIDR_AFFINITY: usize = 0xff_00ff_ffff;

/// Bare-metal AArch64 at EL1.
pub struct Aarch64Arch;

impl Arch for Aarch64Arch {
    type SavedContext = Context;
    type ExtendedState = NeonState;

    const NAME: &'static str = "aarch64";
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
        let tls: usize;
        unsafe {
            asm!("mrs {}, tpidr_el0", out(reg) tls, options(nomem, nostack, preserves_flags));
        }
        tls
    }

    unsafe fn tls_set(tls: usize) {
        unsafe {
            asm!("msr tpidr_el0, {}", in(reg) tls, options(nostack, preserves_flags));
        }
    }

    #[cfg(feature = "full-fpu")]
    unsafe fn save_extended(state: &mut NeonState) {
        unsafe { save_extended(state) }
    }

    #[cfg(feature = "full-fpu")]
    unsafe fn restore_extended(state: &NeonState) {
        unsafe { restore_extended(state) }
    }

    fn irq_save() -> IrqFlags {
        let daif: usize;
        unsafe {
            asm!(
                "mrs {}, daif",
                "msr daifset, #2",
                out(reg) daif,
                options(nomem, nostack, preserves_flags)
            );
        }
        IrqFlags(!daif & DAIF_I)
    }

    fn irq_restore(flags: IrqFlags) {
        if flags.were_enabled() {
            Self::irq_enable();
        }
    }

    fn irq_enable() {
        unsafe {
            asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags));
        }
    }

    fn irqs_enabled() -> bool {
        let daif: usize;
        unsafe {
            asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags));
        }
        daif & DAIF_I == 0
    }

    /// Affinity fields of MPIDR_EL1.
    fn cpu_id() -> usize {
        let mpidr: usize;
        unsafe {
            asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack, preserves_flags));
        }
        mpidr & MPIDR_AFFINITY
    }
}

/// Park the core until an interrupt is pending.
///
/// Wakes on pending IRQs even while they are masked.
pub fn wait_for_interrupt() {
    unsafe {
        asm!("dsb sy", "wfi", options(nomem, nostack, preserves_flags));
    }
}

/// Briefly unmask IRQs so pending handlers run, then mask them again.
pub fn service_pending_irqs() {
    unsafe {
        asm!(
            "msr daifclr, #2",
            "isb",
            "msr daifset, #2",
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Physical counter frequency (`cntfrq_el0`), in Hz.
pub fn timer_frequency() -> u64 {
    let freq: u64;
    unsafe {
        asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack, preserves_flags));
    }
    freq
}

/// Raw physical counter value.
pub fn get_timestamp() -> u64 {
    let count: u64;
    unsafe {
        asm!("isb", "mrs {}, cntpct_el0", out(reg) count, options(nomem, nostack, preserves_flags));
    }
    count
}

/// Arm the EL1 physical timer to fire when the counter reaches `ticks`.
///
/// # Safety
///
/// Must be called at EL1. The interrupt controller routing is the
/// platform's business.
pub unsafe fn arm_timer(ticks: u64) {
    unsafe {
        asm!(
            "msr cntp_cval_el0, {val}",
            "msr cntp_ctl_el0, {en}",
            "isb",
            val = in(reg) ticks,
            en = in(reg) 1u64,
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Mask the EL1 physical timer output.
///
/// # Safety
///
/// Must be called at EL1.
pub unsafe fn disarm_timer() {
    unsafe {
        asm!(
            "msr cntp_ctl_el0, {val}",
            val = in(reg) 2u64,
            options(nomem, nostack, preserves_flags)
        );
    }
}

pub fn ticks_to_ns(ticks: u64, freq: u64) -> u64 {
    if freq == 0 {
        return 0;
    }
    ((ticks as u128 * 1_000_000_000) / freq as u128) as u64
}

pub fn ns_to_ticks(ns: u64, freq: u64) -> u64 {
    ((ns as u128 * freq as u128).div_ceil(1_000_000_000)) as u64
}
