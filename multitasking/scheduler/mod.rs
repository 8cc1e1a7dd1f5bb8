// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a simple round robin scheduler for a fixed ring of threads.
//!
//! ## Initialisation
//!
//! Threads are created with [`Scheduler::create_thread`] and joined into a
//! ring with [`Scheduler::link`] or [`Scheduler::link_ring`]. Nothing runs
//! until [`Scheduler::start`] is called, at which point the scheduler
//! checks the ring, takes ownership of the flow of execution, and never
//! hands it back.
//!
//! ## Thread switching
//!
//! Each thread body is passed the scheduler and calls [`Scheduler::tick`]
//! to hand over to the next thread in the ring. There is no preemption:
//! a thread that never calls `tick` keeps the CPU forever.

use crate::switch::switch_stack;
use crate::thread::{Never, Thread, ThreadId, ThreadState};
use crate::{Config, Error};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::arch::asm;
use core::cell::Cell;
use core::convert::Infallible;
use log::info;
use x86_64::VirtAddr;

/// Scheduler is a basic thread scheduler.
///
/// It implements a round-robin algorithm over a
/// fixed ring of threads.
///
#[derive(Debug)]
pub struct Scheduler {
    config: Config,

    // All threads, indexed by their thread id.
    threads: Vec<Thread>,

    // The currently executing thread. This is only
    // meaningful once the scheduler has started.
    current: Cell<ThreadId>,

    // The number of calls to tick.
    ticks: Cell<u64>,

    // Whether start has switched into the ring.
    started: Cell<bool>,
}

impl Scheduler {
    /// Returns a scheduler with no threads, which will
    /// create threads as described by `config`.
    ///
    pub fn new(config: Config) -> Result<Scheduler, Error> {
        config.validate()?;
        Ok(Scheduler {
            config,
            threads: Vec::new(),
            current: Cell::new(ThreadId::from_index(0)),
            ticks: Cell::new(0),
            started: Cell::new(false),
        })
    }

    /// Creates a new thread, allocating a stack.
    ///
    /// The new thread is not part of the ring until it
    /// is linked to and from other threads. When the
    /// thread first runs, it calls `entry_point`.
    ///
    pub fn create_thread<F>(&mut self, entry_point: F) -> Result<ThreadId, Error>
    where
        F: FnOnce(&Scheduler) -> Never + 'static,
    {
        self.threads.try_reserve(1)?;
        let id = ThreadId::from_index(self.threads.len());
        let thread = Thread::new(id, self.config.stack_size(), entry_point)?;
        self.threads.push(thread);

        Ok(id)
    }

    /// Sets the thread that runs after `thread`.
    ///
    pub fn link(&mut self, thread: ThreadId, next: ThreadId) -> Result<(), Error> {
        if self.thread(next).is_none() {
            return Err(Error::UnknownThread(next));
        }

        self.thread(thread)
            .ok_or(Error::UnknownThread(thread))?
            .set_next(next);

        Ok(())
    }

    /// Links the given threads into a ring, in order,
    /// with the last thread followed by the first.
    ///
    pub fn link_ring(&mut self, ring: &[ThreadId]) -> Result<(), Error> {
        for (i, &thread) in ring.iter().enumerate() {
            self.link(thread, ring[(i + 1) % ring.len()])?;
        }

        Ok(())
    }

    /// Checks that following the ring from `initial`
    /// returns to `initial`, having visited every
    /// thread.
    ///
    fn check_ring(&self, initial: ThreadId) -> Result<(), Error> {
        let mut thread = self.thread(initial).ok_or(Error::UnknownThread(initial))?;
        let mut visited = Vec::new();
        visited.try_reserve(self.threads.len())?;
        visited.resize(self.threads.len(), false);
        loop {
            visited[thread.id().as_usize()] = true;
            let next = thread.next().ok_or(Error::Unlinked(thread.id()))?;
            if next == initial {
                break;
            }

            if visited[next.as_usize()] {
                return Err(Error::NotARing(next));
            }

            thread = &self.threads[next.as_usize()];
        }

        match visited.iter().position(|seen| !seen) {
            Some(index) => Err(Error::Unreachable(ThreadId::from_index(index))),
            None => Ok(()),
        }
    }

    /// Hands control over to the scheduler.
    ///
    /// This checks the ring, then switches from the
    /// program's initial state into `initial`, which
    /// is never resumed. `start` only returns if the
    /// ring is invalid.
    ///
    pub fn start(self, initial: ThreadId) -> Result<Infallible, Error> {
        self.check_ring(initial)?;

        // The scheduler and its threads now live for
        // the rest of the program.
        let scheduler: &'static Scheduler = Box::leak(Box::new(self));
        for thread in scheduler.threads.iter() {
            // Safety: no thread has run yet.
            unsafe { thread.arm(scheduler) };
        }

        info!(
            "Starting scheduler with {} threads at thread {}",
            scheduler.threads.len(),
            initial
        );

        let next = &scheduler.threads[initial.as_usize()];
        scheduler.started.set(true);
        scheduler.current.set(initial);
        next.set_state(ThreadState::Running);

        // The bootstrap thread receives the program's
        // initial stack pointer, which is never read.
        let bootstrap = Thread::new_bootstrap_thread();
        unsafe { switch_stack(bootstrap.stack_pointer(), next.stack_pointer()) };

        unreachable!("bootstrap thread was re-scheduled somehow");
    }

    /// Schedules out the current thread and switches to
    /// the next thread in the ring.
    ///
    /// `tick` returns when the ring comes back around to
    /// the calling thread.
    ///
    /// # Panics
    ///
    /// `tick` panics if the scheduler has not been
    /// started, as there is no running thread to switch
    /// away from.
    ///
    pub fn tick(&self) {
        if !self.started.get() {
            panic!("scheduler has not been started");
        }

        let previous = self.current_thread();
        let next = match previous.next() {
            Some(next) => &self.threads[next.as_usize()],
            None => unreachable!("thread {} left the ring", previous.id()),
        };

        debug_assert!(
            previous.stack_intact(),
            "thread {} overflowed its stack",
            previous.id()
        );

        self.ticks.set(self.ticks.get() + 1);
        self.current.set(next.id());
        previous.set_state(ThreadState::Suspended);
        next.set_state(ThreadState::Running);

        if previous.id() == next.id() {
            // We're already running the right
            // thread, so return without doing
            // anything further.
            return;
        }

        // Retrieve a pointer to each stack pointer. These point
        // to the value in the Thread structure, where we keep a
        // copy of the current stack pointer.
        let current_stack_pointer = previous.stack_pointer();
        let new_stack_pointer = next.stack_pointer();

        unsafe { switch_stack(current_stack_pointer, new_stack_pointer) };
    }

    /// Returns the currently executing thread's id.
    ///
    /// Before the scheduler is started, this is the
    /// first thread created.
    ///
    pub fn current(&self) -> ThreadId {
        self.current.get()
    }

    fn current_thread(&self) -> &Thread {
        &self.threads[self.current.get().as_usize()]
    }

    /// Returns the thread with the given id.
    ///
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id.as_usize())
    }

    /// Returns an iterator over all threads, in the
    /// order they were created.
    ///
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.iter()
    }

    /// Returns the number of threads.
    ///
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Returns whether the scheduler has no threads.
    ///
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Returns the number of calls to [`tick`](Scheduler::tick).
    ///
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    /// Logs debug info about every thread's stack.
    ///
    /// Once the scheduler has started, this reads the
    /// current stack pointer to debug the running
    /// thread. Every other thread is debugged using
    /// its saved stack pointer.
    ///
    pub fn debug(&self) {
        let rsp: u64;
        unsafe {
            asm!("mov {}, rsp", out(reg) rsp, options(nostack, nomem, preserves_flags));
        }

        for thread in self.threads.iter() {
            if self.started.get() && thread.id() == self.current() {
                thread.debug(VirtAddr::new(rsp));
            } else {
                thread.debug(thread.saved_stack_pointer());
            }
        }
    }
}
