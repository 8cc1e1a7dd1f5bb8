// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Runs four threads in a ring, forever.
//!
//! Each thread prints a value kept on its own stack, then yields to the
//! next thread. The output alternates between the two thread bodies:
//!
//! ```text
//! in function 1 (0x1111)
//! in function 2 (0x2222)
//! in function 1 (0x1111)
//! ...
//! ```

use console::println;
use log::LevelFilter;
use multitasking::{Config, Error, Scheduler, ThreadId};
use std::process;

fn func1(scheduler: &Scheduler) -> ! {
    let local_var = 0x1111;
    loop {
        println!("in function 1 ({:#X})", local_var);
        scheduler.tick();
    }
}

fn func2(scheduler: &Scheduler) -> ! {
    let local_var = 0x2222;
    loop {
        println!("in function 2 ({:#X})", local_var);
        scheduler.tick();
    }
}

/// Creates the threads and links them into a ring,
/// returning the scheduler and the first thread.
///
fn build() -> Result<(Scheduler, ThreadId), Error> {
    let mut scheduler = Scheduler::new(Config::default())?;
    let threads = [
        scheduler.create_thread(func1)?,
        scheduler.create_thread(func2)?,
        scheduler.create_thread(func1)?,
        scheduler.create_thread(func2)?,
    ];

    scheduler.link_ring(&threads)?;

    Ok((scheduler, threads[0]))
}

fn main() {
    if let Err(err) = console::init(LevelFilter::Info) {
        eprintln!("failed to install logger: {}", err);
    }

    let err = match build() {
        Ok((scheduler, first)) => match scheduler.start(first) {
            Ok(never) => match never {},
            Err(err) => err,
        },
        Err(err) => err,
    };

    eprintln!("failed to start threads: {}", err);
    process::exit(1);
}
