// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.
//!
//! Everything outside this module deals only in saved stack
//! pointers. The layout of the saved registers is described
//! by [`RegisterFrame`], which must match `switch.s`.

use core::arch::global_asm;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("multitasking only supports x86_64");

global_asm!(include_str!("switch.s"));

// The following functions are implemented in switch.s.
//
extern "sysv64" {
    /// switch_stack replaces the current stack with a new
    /// stack, using the System V ABI. Its last action is
    /// to start executing the new thread.
    ///
    /// switch_stack takes a pointer to each thread's saved
    /// stack pointer. The current stack pointer is written
    /// to the first once the current thread's registers
    /// have been saved.
    ///
    /// # Safety
    ///
    /// `new_stack_pointer` must point to a stack pointer
    /// that was written by an earlier call to `switch_stack`,
    /// or that points to a [`RegisterFrame`] built by
    /// [`Thread::new`](crate::thread::Thread::new). The
    /// thread that owns it must not be running.
    ///
    pub fn switch_stack(current_stack_pointer: *mut u64, new_stack_pointer: *const u64);

    /// start_thread is placed into each new thread's
    /// initial [`RegisterFrame`] as its return address.
    ///
    /// It calls the function in R13, passing R12 and RBX
    /// as its two arguments. That function must never
    /// return, or an invalid instruction exception will
    /// be triggered.
    ///
    pub fn start_thread() -> !;
}

/// The registers saved on a suspended thread's stack.
///
/// The stack pointer saved in a suspended thread points
/// at one of these. Fields are in increasing address order,
/// so `rip` is the return address pushed by the `call` to
/// [`switch_stack`].
///
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterFrame {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl RegisterFrame {
    /// The number of bytes in a register frame.
    ///
    pub const SIZE: usize = core::mem::size_of::<RegisterFrame>();
}
