//! Low-level x86_64 (SysV) support.
//!
//! The core operations are:
//! - `init_stack` to seed a stack for the first switch into it.
//! - `switch_context` to transfer control from the running context to a
//!   suspended one.
//! - `switch_and_reset` to leave a context for the last time.
//!
//! Context switching here is fully symmetric: a suspended context, whether it
//! is the thread's own sentinel or a fiber, is represented by nothing more
//! than a stack pointer. The memory just above that stack pointer holds the
//! full callee-saved register set and the address at which execution resumes.
//! Whoever loads that stack pointer and pops the frame continues exactly
//! where the owner left off; caller-saved registers are reloaded by the
//! compiler because the switch declares them clobbered.
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
//! | Resume RIP   |
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved R12    |
//! +--------------+
//! | Saved R13    |
//! +--------------+
//! | Saved R14    |
//! +--------------+
//! | Saved R15    |  <- Saved stack pointer
//! +--------------+
//! ```
//!
//! And this is the layout of a freshly seeded stack:
//!
//! ```text
//! +--------------+  <- Stack base
//! |              |
//! ~ Payload obj  ~  <- Size rounded up to `STACK_ALIGNMENT`.
//! |              |
//! +--------------+
//! | Entry func   |  <- Popped by the start trampoline.
//! +--------------+
//! | Resume RIP   |  <- Points to spindle_start_trampoline.
//! +--------------+
//! | Zeroes (x6)  |  <- RBP, RBX, R12-R15 all resume as zero.
//! +--------------+  <- Seeded stack pointer
//! ```
//!
//! The first switch into a seeded stack therefore behaves exactly like a
//! switch into a suspended context: the callee-saved set is popped (all
//! zeroes, so the entry function starts from a deterministic state) and the
//! resume address is the trampoline, which pops the entry function address
//! and calls it with the payload's stack address as its argument.

use core::arch::{asm, global_asm};

use super::{allocate_obj_on_stack, push, EntryFunc};
use crate::stack::{FiberStack, StackPointer};

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

// Number of saved words between the seeded stack pointer and the payload:
// 6 callee-saved registers, the resume address and the entry function slot.
const SEEDED_FRAME_WORDS: usize = 8;

// Entered via RET from switch_context the first time a seeded stack is
// switched to. At this point RSP points at the entry function slot placed by
// init_stack and every callee-saved register is zero.
global_asm!(
    ".balign 16",
    asm_function_begin!("spindle_start_trampoline"),
    // Pop the entry function, leaving RSP 16-byte aligned on the payload
    // object, whose address is the entry function's only argument.
    "pop rax",
    "mov rdi, rsp",
    "call rax",
    // The entry function never returns.
    "ud2",
    asm_function_end!("spindle_start_trampoline"),
);

extern "C" {
    // Only ever entered through a seeded resume address, never called.
    fn spindle_start_trampoline();
}

/// Seeds the initial state on a stack so that the given entry function is
/// executed with a pointer to `payload` on the first switch to this stack.
///
/// The payload is written to the fiber's own stack; its address on that stack
/// is passed as the single argument of the entry function.
#[inline]
pub unsafe fn init_stack<T>(stack: &FiberStack, func: EntryFunc<T>, payload: T) -> StackPointer {
    let mut sp = stack.base().get();

    // Write the payload object just below the stack base, rounding to
    // STACK_ALIGNMENT.
    allocate_obj_on_stack(&mut sp, 0, payload);

    // Entry function, popped into RAX by the start trampoline.
    push(&mut sp, Some(func as StackWord));

    // Resume address for the first switch into this stack.
    push(&mut sp, Some(spindle_start_trampoline as StackWord));

    // Zeroes for RBP, RBX and R12-R15 so the entry function observes the
    // same register state as a normal function prologue would set up.
    for _ in 0..6 {
        push(&mut sp, Some(0));
    }

    StackPointer::new_unchecked(sp)
}

/// Transfers control from the running context to the context suspended at
/// `target_sp`, saving the running context's own resumption stack pointer
/// through `save_slot`.
///
/// The write through `save_slot` happens before control leaves the current
/// stack, so the slot is valid for a later switch back the moment the target
/// starts running. This function returns only once another switch names the
/// saved stack pointer as its target.
#[inline]
pub unsafe fn switch_context(save_slot: *mut usize, target_sp: StackPointer) {
    asm!(
        // Build the suspended frame: resume address first, then the
        // callee-saved set. RBX and RBP cannot be listed as clobbers since
        // they are LLVM reserved registers, so they are saved manually; the
        // remaining callee-saved registers are saved as well so that a
        // seeded stack can hand the entry function a zeroed register state.
        "lea rax, [rip + 2f]",
        "push rax",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",

        // Publish our resumption point, then adopt the target stack.
        "mov [rdi], rsp",
        "mov rsp, rdx",

        // Restore the target's callee-saved set and continue at its resume
        // address: either the 2: label of the switch it suspended in, or the
        // start trampoline of a seeded stack.
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",

        // Some later switch_context or switch_and_reset resumes us here with
        // our callee-saved registers reloaded from the frame above.
        "2:",

        in("rdi") save_slot,
        in("rdx") target_sp.get(),

        // Everything caller-saved dies across a suspension; the compiler
        // reloads it from our own stack after the block.
        clobber_abi("sysv64"),
    );
}

/// Restore-only variant of `switch_context` used when the running context
/// finishes: nothing is saved because it can never be resumed.
///
/// The abandoned stack may still be the one executing this call, so it must
/// not be unmapped until control has moved to the target.
#[inline]
pub unsafe fn switch_and_reset(target_sp: StackPointer) -> ! {
    asm!(
        "mov rsp, {target}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
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
