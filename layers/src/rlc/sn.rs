//! Sequence-Number Space
//!
//! RLC AM sequence numbers live in a modulo space of size `2^sn_bits` and
//! wrap. Every comparison between sequence numbers must go through
//! [`SnSize::distance`] or [`SnSize::in_window`]; raw integer comparison is
//! meaningless across the wrap point.

use serde::{Deserialize, Serialize};

/// Configured SN field length (TS 38.322 AM: 12 or 18 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnSize {
    /// 12-bit sequence numbers
    Size12,
    /// 18-bit sequence numbers
    Size18,
}

impl SnSize {
    /// Field width in bits
    pub fn bits(&self) -> u32 {
        match self {
            SnSize::Size12 => 12,
            SnSize::Size18 => 18,
        }
    }

    /// Size of the modulo space (`2^bits`)
    pub fn mod_size(&self) -> u32 {
        1 << self.bits()
    }

    /// AM window size: half the SN space (TS 38.322 7.2)
    pub fn window_size(&self) -> u32 {
        self.mod_size() / 2
    }

    /// Wrap a value into the SN space
    pub fn wrap(&self, sn: u32) -> u32 {
        sn & (self.mod_size() - 1)
    }

    /// Forward modulo distance from `a` to `b`
    pub fn distance(&self, a: u32, b: u32) -> u32 {
        self.wrap(b.wrapping_sub(a))
    }

    /// True iff `sn` lies in `[lower, lower + size)` of the modulo space
    pub fn in_window(&self, sn: u32, lower: u32, size: u32) -> bool {
        self.distance(lower, sn) < size
    }
}
