// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the threads that make up a scheduler's ring.
//!
//! Each thread has its own stack, a saved stack pointer, and a link to
//! the thread that runs after it. Threads are created with
//! [`Scheduler::create_thread`](crate::Scheduler::create_thread), which
//! allocates the stack and places a synthetic [`RegisterFrame`] at its
//! top, so that the first switch into the thread behaves exactly like
//! returning from a previous switch.
//!
//! Calling [`Thread::debug`] will log debug info about the thread.

pub mod stacks;

use crate::scheduler::Scheduler;
use crate::switch::{start_thread, RegisterFrame};
use crate::thread::stacks::{Stack, StackBounds, StackUsage};
use crate::{Error, STACK_GAP};
use alloc::boxed::Box;
use core::any::Any;
use core::cell::{Cell, UnsafeCell};
use core::fmt;
use log::{error, info};
use x86_64::VirtAddr;

/// Names the return type of a function pointer type.
///
#[doc(hidden)]
pub trait ReturnType {
    type Output;
}

impl<T> ReturnType for fn() -> T {
    type Output = T;
}

/// The type that has no values, which is the return
/// type of every thread body.
///
/// Thread bodies are handed the scheduler so they can
/// yield, and must never return. A body is any
/// `FnOnce(&Scheduler) -> Never`, such as a function
/// declared as returning `!`.
///
pub type Never = <fn() -> ! as ReturnType>::Output;

// A thread body whose type is only recovered when
// the thread first runs.
type Body = Box<dyn Any>;

/// Uniquely identifies a thread within its scheduler.
///
/// Thread ids are issued densely, starting at 0, in the
/// order the threads are created.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    /// Returns the thread id for the given position in
    /// the thread table.
    ///
    pub(crate) const fn from_index(index: usize) -> Self {
        ThreadId(index)
    }

    /// Returns a numerical representation for the thread
    /// ID.
    ///
    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    /// The thread's state is in the CPU's
    /// registers.
    Running,

    /// The thread's state is saved on its
    /// stack.
    Suspended,
}

/// Contains the metadata for a thread of
/// execution.
///
pub struct Thread {
    // The thread's id, which is also its
    // position in the scheduler's table.
    id: ThreadId,

    // The thread's current state.
    state: Cell<ThreadState>,

    // The number of times the thread has been
    // switched in.
    runs: Cell<u64>,

    // The thread after this one in the ring.
    next: Cell<Option<ThreadId>>,

    // The thread's body, which is taken when the
    // thread first runs.
    entry_point: Cell<Option<Body>>,

    // The name of the body's type, for diagnostics.
    entry_name: &'static str,

    // The code the thread runs first, once the entry
    // shim has loaded its arguments.
    entry_address: VirtAddr,

    // The thread's stack. The bootstrap thread
    // borrows the program's initial stack, so has
    // none of its own.
    stack: Option<Stack>,

    // The thread's saved stack pointer. While the
    // thread is executing, this value will be stale.
    // When the thread is switched out, its final stack
    // pointer is written to this cell. When the thread
    // is resumed, its stack pointer is restored from
    // this value.
    stack_pointer: UnsafeCell<u64>,
}

impl Thread {
    /// Creates a new thread with the given id, allocating
    /// a stack of `stack_size` bytes and building its
    /// initial register frame.
    ///
    /// The thread starts suspended, with no next thread.
    /// When it first runs, it calls `entry_point`.
    ///
    pub(crate) fn new<F>(id: ThreadId, stack_size: usize, entry_point: F) -> Result<Thread, Error>
    where
        F: FnOnce(&Scheduler) -> Never + 'static,
    {
        let stack = Stack::new(stack_size)?;
        let entry_address = thread_entry::<F> as usize as u64;

        let rsp = unsafe {
            let mut rsp: *mut u64 = stack.top();

            // Leave a small gap at the top of the
            // stack. With the frame below, this means
            // the entry shim starts with the stack
            // aligned to 16 bytes, so the call it makes
            // sees the alignment the ABI expects.
            for _ in 0..STACK_GAP / 8 {
                rsp = push_stack(rsp, 0);
            }

            // Push the frame to be popped by switch_stack
            // the first time we switch to this thread.
            let frame = (rsp as *mut RegisterFrame).sub(1);
            frame.write(RegisterFrame {
                rbx: id.0 as u64,
                rbp: 0, // Terminates frame pointer chains.
                r12: 0, // The scheduler, filled in by arm.
                r13: entry_address,
                r14: 0,
                r15: 0,
                rip: start_thread as usize as u64,
            });

            frame as u64
        };

        let entry_name = core::any::type_name::<F>();
        let entry_address = VirtAddr::new(entry_address);
        let entry_point: Body = Box::new(entry_point);
        let bounds = stack.bounds();
        let thread = Thread {
            id,
            state: Cell::new(ThreadState::Suspended),
            runs: Cell::new(0),
            next: Cell::new(None),
            entry_point: Cell::new(Some(entry_point)),
            entry_name,
            entry_address,
            stack: Some(stack),
            stack_pointer: UnsafeCell::new(rsp),
        };

        info!(
            "Created thread {} with entrypoint {} at {:p} and stack at {:p}-{:p}",
            id,
            entry_name,
            entry_address,
            bounds.start(),
            bounds.end()
        );

        Ok(thread)
    }

    /// Creates the thread that receives the program's
    /// initial state when the scheduler starts.
    ///
    /// Its saved stack pointer is written by the first
    /// switch and never read.
    ///
    pub(crate) fn new_bootstrap_thread() -> Thread {
        Thread {
            id: ThreadId(usize::MAX),
            state: Cell::new(ThreadState::Running),
            runs: Cell::new(0),
            next: Cell::new(None),
            entry_point: Cell::new(None),
            entry_name: "bootstrap",
            entry_address: VirtAddr::zero(),
            stack: None,
            stack_pointer: UnsafeCell::new(0),
        }
    }

    /// Stores the scheduler's address in the thread's
    /// initial register frame, so the entry shim can
    /// pass it to the thread body.
    ///
    /// # Safety
    ///
    /// The thread must not have run yet, so its saved
    /// stack pointer still points to the frame built by
    /// [`Thread::new`].
    ///
    pub(crate) unsafe fn arm(&self, scheduler: &'static Scheduler) {
        let frame = *self.stack_pointer.get() as *mut RegisterFrame;
        (*frame).r12 = scheduler as *const Scheduler as u64;
    }

    /// Returns the thread's unique `ThreadId`.
    ///
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the thread's current scheduling state.
    ///
    pub fn thread_state(&self) -> ThreadState {
        self.state.get()
    }

    /// Updates the thread's scheduling state. A thread
    /// becoming `Running` counts as one more run.
    ///
    pub(crate) fn set_state(&self, new_state: ThreadState) {
        if new_state == ThreadState::Running {
            self.runs.set(self.runs.get() + 1);
        }

        self.state.set(new_state);
    }

    /// Returns the number of times the thread has been
    /// switched in.
    ///
    pub fn runs(&self) -> u64 {
        self.runs.get()
    }

    /// Returns the thread after this one in the ring.
    ///
    pub fn next(&self) -> Option<ThreadId> {
        self.next.get()
    }

    pub(crate) fn set_next(&self, next: ThreadId) {
        self.next.set(Some(next));
    }

    /// Returns the name of the thread body's type.
    ///
    pub fn entry_name(&self) -> &'static str {
        self.entry_name
    }

    /// Returns the address of the code the thread runs
    /// first, which calls the thread body.
    ///
    pub fn entry_address(&self) -> VirtAddr {
        self.entry_address
    }

    /// Returns the bounds of the thread's stack.
    ///
    pub fn stack_bounds(&self) -> Option<StackBounds> {
        self.stack.as_ref().map(Stack::bounds)
    }

    /// Returns whether the canary at the bottom of the
    /// thread's stack is intact.
    ///
    pub fn stack_intact(&self) -> bool {
        self.stack.as_ref().map_or(true, Stack::canary_intact)
    }

    /// Returns the thread's saved stack pointer.
    ///
    /// This is stale while the thread is running.
    ///
    pub fn saved_stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(unsafe { *self.stack_pointer.get() })
    }

    /// Returns a pointer to the thread's saved stack
    /// pointer, for use with `switch_stack`.
    ///
    pub(crate) fn stack_pointer(&self) -> *mut u64 {
        self.stack_pointer.get()
    }

    /// Takes the thread body, which is only present
    /// until the thread first runs.
    ///
    fn take_entry_point(&self) -> Option<Body> {
        self.entry_point.take()
    }

    /// Returns how much of the thread's stack is in use,
    /// given the thread's current stack pointer. This is
    /// `None` if the thread has no stack of its own, or
    /// the stack pointer is outside it.
    ///
    pub fn stack_usage(&self, stack_pointer: VirtAddr) -> Option<StackUsage> {
        self.stack_bounds()
            .and_then(|bounds| StackUsage::new(bounds, stack_pointer))
    }

    /// Logs debug information about the thread's stack,
    /// given the thread's current stack pointer.
    ///
    /// For a suspended thread, `stack_pointer` should be
    /// its [`saved_stack_pointer`](Thread::saved_stack_pointer).
    ///
    pub fn debug(&self, stack_pointer: VirtAddr) {
        let stack_bounds = match self.stack_bounds() {
            Some(bounds) => bounds,
            None => {
                info!("thread {} has no stack", self.id);
                return;
            }
        };

        let usage = match StackUsage::new(stack_bounds, stack_pointer) {
            Some(usage) => usage,
            None => {
                error!(
                    "thread {}: current stack pointer {:p} is not in stack bounds {:p}-{:p}",
                    self.id,
                    stack_pointer,
                    stack_bounds.start(),
                    stack_bounds.end()
                );
                return;
            }
        };

        if !self.stack_intact() {
            error!("thread {}: stack canary overwritten", self.id);
        }

        info!(
            "thread {} ({:?}, {} runs): {}",
            self.id,
            self.thread_state(),
            self.runs(),
            usage
        );
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("runs", &self.runs.get())
            .field("next", &self.next.get())
            .field("entry_name", &self.entry_name)
            .field("entry_address", &self.entry_address)
            .field("stack", &self.stack_bounds())
            .finish()
    }
}

/// push_stack is used to build a new thread's stack
/// without having to drop down to assembly.
///
unsafe fn push_stack(mut rsp: *mut u64, value: u64) -> *mut u64 {
    // We move the stack pointer down by 8 bytes, write
    // the value to the new space, then return the updated
    // stack pointer.
    rsp = rsp.sub(1);
    rsp.write(value);
    rsp
}

/// thread_entry is called by `start_thread` on each
/// thread's own stack the first time it runs. There
/// is one for each type of thread body.
///
extern "sysv64" fn thread_entry<F>(scheduler: *const Scheduler, id: usize) -> !
where
    F: FnOnce(&Scheduler) -> Never + 'static,
{
    let scheduler = unsafe { &*scheduler };
    let thread = match scheduler.thread(ThreadId(id)) {
        Some(thread) => thread,
        None => panic!("thread {} started by a scheduler that does not own it", id),
    };

    match thread.take_entry_point().map(|body| body.downcast::<F>()) {
        Some(Ok(entry_point)) => entry_point(scheduler),
        Some(Err(_)) => panic!("thread {} has a body of the wrong type", id),
        None => panic!("thread {} started twice", id),
    }
}
