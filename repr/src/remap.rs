//! Remap Map Entries
//!
//! A remap table translates a virtual address space onto extents of a base storage. The top
//! `segment_bits` bits of a virtual offset select a segment; the remaining bits are an offset
//! within that segment. Each segment is one or more map entries, contiguous in virtual space.
//!
//! The entries are stored outside the header, `map_entry_count` of them, ordered by virtual
//! offset.

use crate::{I32, I64};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub const ENTRY_SIZE: usize = 0x20;

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct MapEntry {
    pub virtual_offset: I64,
    pub physical_offset: I64,
    pub size: I64,
    pub alignment: I32,
    pub _reserved: I32,
}

assert_eq_size!(MapEntry, [u8; ENTRY_SIZE]);
