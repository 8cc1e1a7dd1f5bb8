// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Formats byte counts using [powers of 2 for larger units](https://en.wikipedia.org/wiki/Byte#Units_based_on_powers_of_2).

use core::fmt;

const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// A number of bytes, displayed in the largest unit
/// that still gives a non-zero whole number.
///
/// Partial units are truncated, so 4000 bytes is
/// displayed as "3 KiB".
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bytes(pub u64);

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut value = self.0;
        let mut unit = 0;
        while value >= 1024 && unit + 1 < UNITS.len() {
            value >>= 10;
            unit += 1;
        }

        write!(f, "{} {}", value, UNITS[unit])
    }
}
