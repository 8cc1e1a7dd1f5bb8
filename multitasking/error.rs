// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the ways in which building or starting a ring of threads
//! can fail.
//!
//! Every error is reported before the scheduler takes over the flow of
//! execution. Once [`Scheduler::start`](crate::Scheduler::start) has
//! switched into the first thread, nothing can fail.

use crate::thread::ThreadId;
use alloc::collections::TryReserveError;
use core::fmt;

/// Building or starting the ring failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The stack size is not a usable multiple of the page size.
    InvalidStackSize {
        /// The rejected size, in bytes.
        size: usize,
    },

    /// The allocator could not provide memory for a thread's stack.
    StackAllocation {
        /// The size of the stack that could not be allocated.
        size: usize,
    },

    /// The allocator could not grow the thread table.
    ThreadTableAllocation,

    /// The thread id was not issued by this scheduler.
    UnknownThread(ThreadId),

    /// The thread has no next thread, so the ring is broken.
    Unlinked(ThreadId),

    /// Following the ring from the initial thread loops back
    /// to the given thread without ever returning to the
    /// initial thread.
    NotARing(ThreadId),

    /// The thread was created, but is not part of the ring
    /// containing the initial thread, so it would never run.
    Unreachable(ThreadId),
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::ThreadTableAllocation
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidStackSize { size } => {
                write!(f, "invalid stack size {size}: must be a non-zero multiple of the page size")
            }
            Error::StackAllocation { size } => {
                write!(f, "failed to allocate {size}-byte stack for new thread")
            }
            Error::ThreadTableAllocation => write!(f, "failed to grow the thread table"),
            Error::UnknownThread(id) => write!(f, "unknown thread {id}"),
            Error::Unlinked(id) => write!(f, "thread {id} has no next thread"),
            Error::NotARing(id) => {
                write!(f, "threads loop back to thread {id} without returning to the initial thread")
            }
            Error::Unreachable(id) => write!(f, "thread {id} is not in the ring"),
        }
    }
}
