// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Includes helpers for allocating and describing the stacks used by
//! threads.
//!
//! Each thread owns exactly one [`Stack`], allocated by [`Stack::new`]
//! when the thread is created. Stacks are never resized. The lowest
//! word of each stack holds a canary value, which is overwritten if
//! the thread runs off the bottom of its stack.

use crate::pretty::Bytes;
use crate::Error;
use alloc::alloc::{alloc, dealloc, Layout};
use core::fmt;
use core::ptr::NonNull;
use x86_64::VirtAddr;

/// The alignment of each stack, as required by the
/// System V ABI.
///
const STACK_ALIGN: usize = 16;

/// The value written to the lowest word of each stack.
///
pub const STACK_CANARY: u64 = 0x5a5a_c0de_f00d_5a5a;

/// Describes the address space used for a stack.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    start: VirtAddr,
    end: VirtAddr,
}

impl StackBounds {
    /// Returns a set of stack bounds consisting of the
    /// `size` bytes starting at `start`.
    ///
    pub fn new(start: VirtAddr, size: u64) -> Self {
        StackBounds {
            start,
            end: start + size,
        }
    }

    /// Returns the smallest valid address in the stack bounds.
    /// As the stack grows downwards, this is also known as the
    /// bottom of the stack.
    ///
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Returns the address just past the largest valid address
    /// in the stack bounds. As the stack grows downwards, this
    /// is also known as the top of the stack.
    ///
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Returns the number of bytes included in the bounds.
    ///
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns whether the stack bounds include the given
    /// virtual address. The top of the stack is included,
    /// as that is where an empty stack points.
    ///
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr <= self.end
    }
}

/// Describes how much of a stack is in use, given a
/// stack pointer within its bounds.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackUsage {
    used: u64,
    free: u64,
}

impl StackUsage {
    /// Returns the usage of the stack described by `bounds`
    /// when its stack pointer is `stack_pointer`, or `None`
    /// if the stack pointer is outside the bounds.
    ///
    pub fn new(bounds: StackBounds, stack_pointer: VirtAddr) -> Option<Self> {
        if !bounds.contains(stack_pointer) {
            return None;
        }

        // The stack grows downwards, so the used part is
        // everything above the stack pointer.
        Some(StackUsage {
            used: bounds.end() - stack_pointer,
            free: stack_pointer - bounds.start(),
        })
    }

    /// Returns the number of bytes in use.
    ///
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Returns the number of bytes still available.
    ///
    pub fn free(&self) -> u64 {
        self.free
    }

    /// Returns the size of the stack.
    ///
    pub fn total(&self) -> u64 {
        self.used + self.free
    }

    /// Returns the share of the stack in use, as a whole
    /// percentage rounded down.
    ///
    pub fn percent_used(&self) -> u64 {
        (100 * self.used).checked_div(self.total()).unwrap_or(0)
    }
}

impl fmt::Display for StackUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}%) of stack used, {} / {} remaining.",
            Bytes(self.used),
            self.percent_used(),
            Bytes(self.free),
            Bytes(self.total())
        )
    }
}

/// A fixed-size block of memory used as a thread's stack.
///
/// The memory is released when the stack is dropped, which
/// only happens if the scheduler that owns it is never
/// started.
///
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    layout: Layout,
}

impl Stack {
    /// Allocates a new stack of `size` bytes and writes
    /// the canary to its lowest word.
    ///
    /// `size` must be a non-zero multiple of 16.
    ///
    pub fn new(size: usize) -> Result<Self, Error> {
        if size == 0 || size % STACK_ALIGN != 0 {
            return Err(Error::InvalidStackSize { size });
        }

        let layout = Layout::from_size_align(size, STACK_ALIGN)
            .map_err(|_| Error::InvalidStackSize { size })?;

        // Safety: layout has a non-zero size.
        let base = unsafe { alloc(layout) };
        let base = NonNull::new(base).ok_or(Error::StackAllocation { size })?;
        unsafe { base.as_ptr().cast::<u64>().write(STACK_CANARY) };

        Ok(Stack { base, layout })
    }

    /// Returns the stack's address range.
    ///
    pub fn bounds(&self) -> StackBounds {
        StackBounds::new(
            VirtAddr::from_ptr(self.base.as_ptr().cast_const()),
            self.layout.size() as u64,
        )
    }

    /// Returns a pointer to the top of the stack. This
    /// is just past the last byte of the stack, and is
    /// aligned to 16 bytes.
    ///
    pub fn top(&self) -> *mut u64 {
        // Safety: the offset is the size of the allocation.
        unsafe { self.base.as_ptr().add(self.layout.size()).cast::<u64>() }
    }

    /// Returns whether the canary at the bottom of the
    /// stack is still intact.
    ///
    pub fn canary_intact(&self) -> bool {
        unsafe { self.base.as_ptr().cast::<u64>().read_volatile() == STACK_CANARY }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_stack_bounds() {
        let bounds = StackBounds::new(VirtAddr::new(0x1000), 0x1000);
        assert_eq!(bounds.start(), VirtAddr::new(0x1000));
        assert_eq!(bounds.end(), VirtAddr::new(0x2000));
        assert_eq!(bounds.size(), 0x1000);
        assert!(bounds.contains(VirtAddr::new(0x1000)));
        assert!(bounds.contains(VirtAddr::new(0x1fff)));
        assert!(bounds.contains(VirtAddr::new(0x2000)));
        assert!(!bounds.contains(VirtAddr::new(0xfff)));
        assert!(!bounds.contains(VirtAddr::new(0x2001)));
    }

    #[test]
    fn test_stack_usage() {
        let bounds = StackBounds::new(VirtAddr::new(0x1000), 0x1000);
        let usage = StackUsage::new(bounds, VirtAddr::new(0x1c00)).unwrap();
        assert_eq!(usage.used(), 0x400);
        assert_eq!(usage.free(), 0xc00);
        assert_eq!(usage.total(), 0x1000);
        assert_eq!(usage.percent_used(), 25);
        assert_eq!(
            usage.to_string(),
            "1 KiB (25%) of stack used, 3 KiB / 4 KiB remaining."
        );

        let empty = StackUsage::new(bounds, bounds.end()).unwrap();
        assert_eq!((empty.used(), empty.percent_used()), (0, 0));

        assert_eq!(StackUsage::new(bounds, VirtAddr::new(0xff8)), None);
        assert_eq!(StackUsage::new(bounds, VirtAddr::new(0x2008)), None);
    }

    #[test]
    fn test_new_stack() {
        let stack = Stack::new(4096).unwrap();
        let bounds = stack.bounds();
        assert_eq!(bounds.size(), 4096);
        assert!(bounds.start().is_aligned(16u64));
        assert_eq!(VirtAddr::from_ptr(stack.top().cast_const()), bounds.end());
        assert!(stack.canary_intact());

        unsafe { bounds.start().as_mut_ptr::<u64>().write(0) };
        assert!(!stack.canary_intact());
    }

    #[test]
    fn test_invalid_stack_size() {
        assert_eq!(
            Stack::new(0).unwrap_err(),
            Error::InvalidStackSize { size: 0 }
        );
        assert_eq!(
            Stack::new(4095).unwrap_err(),
            Error::InvalidStackSize { size: 4095 }
        );
    }
}
