//! Journal Map
//!
//! One entry per logical block of the journaled storage, giving the physical block that currently
//! holds its data. The top bit of the physical index is a flag and is not part of the index.

use crate::U32;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub const ENTRY_SIZE: usize = 8;

pub const PHYSICAL_INDEX_MASK: u32 = 0x7FFF_FFFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct MapEntry {
    pub physical_index: U32,
    pub _reserved: U32,
}

impl MapEntry {
    pub fn physical_index(self) -> u32 {
        self.physical_index.get() & PHYSICAL_INDEX_MASK
    }
}

assert_eq_size!(MapEntry, [u8; ENTRY_SIZE]);
