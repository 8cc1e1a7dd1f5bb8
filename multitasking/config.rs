// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Configures the stacks given to new threads.

use crate::switch::RegisterFrame;
use crate::Error;

/// The size of a page of memory. Stack sizes are
/// always a whole number of pages.
///
pub const PAGE_SIZE: usize = 4096;

/// The number of pages in each thread's stack, unless
/// configured otherwise.
///
/// A single page is enough for a thread body that does
/// little more than yield, but formatted output through
/// the standard library can use more than that.
///
pub const DEFAULT_STACK_PAGES: usize = 16; // 16 4-KiB pages = 64 KiB.

/// The number of bytes left unused at the top of each
/// new thread's stack, above its initial register frame.
///
pub const STACK_GAP: usize = 16;

/// Describes how new threads are created.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    stack_pages: usize,
}

impl Config {
    /// Returns the default configuration.
    ///
    pub const fn new() -> Self {
        Config {
            stack_pages: DEFAULT_STACK_PAGES,
        }
    }

    /// Returns a configuration with single-page stacks.
    ///
    pub const fn minimal() -> Self {
        Config { stack_pages: 1 }
    }

    /// Sets the number of pages in each thread's stack.
    ///
    #[must_use]
    pub const fn stack_pages(mut self, pages: usize) -> Self {
        self.stack_pages = pages;
        self
    }

    /// Returns the size of each thread's stack in bytes.
    ///
    pub const fn stack_size(&self) -> usize {
        self.stack_pages.saturating_mul(PAGE_SIZE)
    }

    /// Checks that the stack has room for the canary, the
    /// gap, and the initial register frame.
    ///
    pub fn validate(&self) -> Result<(), Error> {
        let size = self.stack_size();
        if self.stack_pages == 0 || self.stack_pages.checked_mul(PAGE_SIZE).is_none() {
            return Err(Error::InvalidStackSize { size });
        }

        if size < STACK_GAP + RegisterFrame::SIZE + core::mem::size_of::<u64>() {
            return Err(Error::InvalidStackSize { size });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
