// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the `print` and `println` macros and a logger, all writing to
//! standard output.
//!
//! Output is written to [`CONSOLE`], protected with a spin lock, so each
//! call to [`print`] or [`println`] produces contiguous output. The
//! [`Logger`] writes one line per log record through the same lock, and is
//! installed by calling [`init`].
//!
//! # Examples
//!
//! ```
//! console::println!("This is written to standard output {}!", 1);
//! ```

#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Mutex, MutexGuard};
use std::fmt;
use std::io::{self, Write};

/// Console writes text to standard output.
///
pub struct Console;

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        io::stdout().write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// CONSOLE is the console device used by the [`print`]
/// and [`println`] macros.
///
pub static CONSOLE: Mutex<Console> = Mutex::new(Console);

/// Locks the console, so a sequence of writes is not
/// interleaved with other output.
///
pub fn lock() -> MutexGuard<'static, Console> {
    CONSOLE.lock()
}

/// _print writes text to standard output by
/// acquiring CONSOLE using a spin lock.
///
/// Output that cannot be written is dropped,
/// as there is nowhere left to report it.
///
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = fmt::Write::write_fmt(&mut *lock(), args);
}

/// Print to standard output.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Print to standard output, with a newline.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Formats a log record as a single line of output.
///
/// Info records are printed as they are, so that
/// diagnostics read like ordinary output. Other
/// levels are prefixed with the level.
///
pub struct Line<'record, 'args>(pub &'record Record<'args>);

impl fmt::Display for Line<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let record = self.0;
        match record.level() {
            Level::Info => write!(f, "{}", record.args()),
            level => write!(f, "{}: {}", level, record.args()),
        }
    }
}

/// Logger writes log records to the console.
///
pub struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("{}", Line(record));
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

static LOGGER: Logger = Logger;

/// Installs [`Logger`] as the global logger, recording
/// messages up to `level`.
///
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);

    Ok(())
}
