//! Allocation Table
//!
//! The allocation table is a flat array of 8 byte entries, one per data block, forming doubly
//! linked lists of block runs. Index 0 is reserved, so the entry for block `b` lives at index
//! `b + 1`.
//!
//! A run of more than one block is a "multi block segment": the sign bit of `next` is set on the
//! run's first entry, and the entry after it (index `b + 2`) stores one past the run's last block
//! in its `next` field.
//!
//! ```text
//! prev == i32::MIN            start of a chain
//! next & 0x7FFF_FFFF == 0     end of a chain
//! next < 0                    multi block segment
//! ```

use crate::I32;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub const ENTRY_SIZE: usize = 8;

pub const LIST_START: i32 = i32::MIN;

/// Mask removing the multi block flag from a link
pub const INDEX_MASK: u32 = 0x7FFF_FFFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Entry {
    pub prev: I32,
    pub next: I32,
}

assert_eq_size!(Entry, [u8; ENTRY_SIZE]);
