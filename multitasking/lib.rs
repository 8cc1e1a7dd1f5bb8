// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements cooperative multitasking, using a fixed ring of threads.
//!
//! ## Threads
//!
//! The [`thread`] module implements threads, each of which has its own
//! stack and saved execution state. A thread is created with
//! [`Scheduler::create_thread`], which places a synthetic register frame
//! at the top of the new stack so that switching into the thread for the
//! first time starts its body.
//!
//! ## Cooperative multitasking
//!
//! The [`scheduler`] module links threads into a ring and switches between
//! them in round-robin order. Switches only happen when the running thread
//! calls [`Scheduler::tick`]; there is no preemption. Once
//! [`Scheduler::start`] has switched into the first thread, the program's
//! initial flow of execution is never resumed.
//!
//! ```no_run
//! use multitasking::{Config, Scheduler};
//!
//! fn body(scheduler: &Scheduler) -> ! {
//!     loop {
//!         scheduler.tick();
//!     }
//! }
//!
//! let mut scheduler = Scheduler::new(Config::default()).unwrap();
//! let a = scheduler.create_thread(body).unwrap();
//! let b = scheduler.create_thread(body).unwrap();
//! scheduler.link_ring(&[a, b]).unwrap();
//! let err = scheduler.start(a).unwrap_err();
//! panic!("failed to start scheduler: {}", err);
//! ```

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

extern crate alloc;

mod config;
mod error;
mod pretty;
pub mod scheduler;
mod switch;
pub mod thread;

pub use crate::config::{Config, DEFAULT_STACK_PAGES, PAGE_SIZE, STACK_GAP};
pub use crate::error::Error;
pub use crate::scheduler::Scheduler;
pub use crate::switch::RegisterFrame;
pub use crate::thread::stacks::StackUsage;
pub use crate::thread::{Never, ThreadId, ThreadState};
