//! Low-level AArch64 support.
//!
//! This file mirrors the x86_64 implementation; refer to x86_64.rs for
//! detailed comments on the overall switching scheme. The differences are the
//! callee-saved register set (X19-X28 and the frame pointer X29), the use of
//! the link register for the resume address, and the requirement that SP stay
//! 16-byte aligned at every memory access.
//!
//! ## Stack layout
//!
//! This is what any suspended context's stack looks like:
//!
//! ```text
//! |              |
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Saved X20    |
//! +--------------+
//! | Saved X19    |
//! +--------------+
//! | Saved X28    |
//! +--------------+
//! | Saved X27    |
//! +--------------+
//! | Saved X26    |
//! +--------------+
//! | Saved X25    |
//! +--------------+
//! | Saved X24    |
//! +--------------+
//! | Saved X23    |
//! +--------------+
//! | Saved X22    |
//! +--------------+
//! | Saved X21    |
//! +--------------+
//! | Resume PC    |
//! +--------------+
//! | Saved X29    |  <- Saved stack pointer
//! +--------------+
//! ```
//!
//! And this is the layout of a freshly seeded stack:
//!
//! ```text
//! +--------------+  <- Stack base
//! |              |
//! ~ Payload obj  ~  <- Size rounded up to `STACK_ALIGNMENT`.
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Entry func   |  <- Loaded by the start trampoline.
//! +--------------+
//! | Zeroes (x10) |  <- X19-X28 all resume as zero.
//! +--------------+
//! | Resume PC    |  <- Points to spindle_start_trampoline.
//! +--------------+
//! | Zero         |  <- X29 resumes as zero.
//! +--------------+  <- Seeded stack pointer
//! ```

use core::arch::{asm, global_asm};

use super::{allocate_obj_on_stack, push, EntryFunc};
use crate::stack::{FiberStack, StackPointer};

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

// Saved words between the seeded stack pointer and the payload: 12 register
// slots plus the 16-byte entry function slot.
const SEEDED_FRAME_WORDS: usize = 14;

// Entered via RET from switch_context the first time a seeded stack is
// switched to. At this point SP points at the entry function slot placed by
// init_stack and every callee-saved register is zero.
global_asm!(
    ".balign 4",
    asm_function_begin!("spindle_start_trampoline"),
    // Load the entry function and free its 16-byte slot, leaving SP aligned
    // on the payload object, whose address is the entry function's only
    // argument.
    "ldr x2, [sp]",
    "add sp, sp, #16",
    "mov x0, sp",
    // The entry function never returns, so there is no link register to set
    // up.
    "br x2",
    "brk #0",
    asm_function_end!("spindle_start_trampoline"),
);

extern "C" {
    // Only ever entered through a seeded resume address, never called.
    fn spindle_start_trampoline();
}

/// Seeds the initial state on a stack so that the given entry function is
/// executed with a pointer to `payload` on the first switch to this stack.
#[inline]
pub unsafe fn init_stack<T>(stack: &FiberStack, func: EntryFunc<T>, payload: T) -> StackPointer {
    let mut sp = stack.base().get();

    // Write the payload object just below the stack base, rounding to
    // STACK_ALIGNMENT.
    allocate_obj_on_stack(&mut sp, 0, payload);

    // Entry function in a padded 16-byte slot so SP stays aligned.
    push(&mut sp, Some(0));
    push(&mut sp, Some(func as StackWord));

    // Zeroes for X19-X28.
    for _ in 0..10 {
        push(&mut sp, Some(0));
    }

    // Resume address for the first switch into this stack, and a zero X29.
    push(&mut sp, Some(spindle_start_trampoline as StackWord));
    push(&mut sp, Some(0));

    StackPointer::new_unchecked(sp)
}

/// Transfers control from the running context to the context suspended at
/// `target_sp`, saving the running context's own resumption stack pointer
/// through `save_slot`.
#[inline]
pub unsafe fn switch_context(save_slot: *mut usize, target_sp: StackPointer) {
    asm!(
        // Build the suspended frame. X19-X28 cannot all be freely listed as
        // clobbers (some are LLVM reserved depending on the target), so the
        // whole callee-saved set is saved manually; this also lets a seeded
        // stack hand the entry function a zeroed register state.
        "adr lr, 0f",
        "stp x29, lr, [sp, #-96]!",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x19, x20, [sp, #80]",

        // Publish our resumption point, then adopt the target stack.
        "mov x3, sp",
        "str x3, [x0]",
        "mov sp, x2",

        // Restore the target's callee-saved set and continue at its resume
        // address: either the 0: label of the switch it suspended in, or the
        // start trampoline of a seeded stack.
        "ldp x19, x20, [sp, #80]",
        "ldp x27, x28, [sp, #64]",
        "ldp x25, x26, [sp, #48]",
        "ldp x23, x24, [sp, #32]",
        "ldp x21, x22, [sp, #16]",
        "ldp x29, lr, [sp], #96",
        "ret",

        // Some later switch_context or switch_and_reset resumes us here with
        // our callee-saved registers reloaded from the frame above.
        "0:",

        in("x0") save_slot,
        in("x2") target_sp.get(),

        // Everything caller-saved dies across a suspension; the compiler
        // reloads it from our own stack after the block.
        clobber_abi("C"),
    );
}

/// Restore-only variant of `switch_context` used when the running context
/// finishes: nothing is saved because it can never be resumed.
#[inline]
pub unsafe fn switch_and_reset(target_sp: StackPointer) -> ! {
    asm!(
        "mov sp, {target}",
        "ldp x19, x20, [sp, #80]",
        "ldp x27, x28, [sp, #64]",
        "ldp x25, x26, [sp, #48]",
        "ldp x23, x24, [sp, #32]",
        "ldp x21, x22, [sp, #16]",
        "ldp x29, lr, [sp], #96",
        "ret",

        target = in(reg) target_sp.get(),
        options(noreturn),
    );
}

/// Drops the seeded payload on a fiber stack that was never switched to.
#[inline]
pub unsafe fn drop_initial_obj(seeded_sp: StackPointer, drop_fn: unsafe fn(ptr: *mut u8)) {
    let ptr = (seeded_sp.get() as *mut u8).add(SEEDED_FRAME_WORDS * 8);
    drop_fn(ptr);
}
