//! Directory and File Tables
//!
//! Both tables are arrays of 0x60 byte records stored in allocation table chains. Records 0 and 1
//! are bookkeeping: the `parent_dir_index` field of record 0 holds the number of records in the
//! table, and record 1 heads the list of live entries via `next_in_chain_index`. Record 2 of the
//! directory table is the root directory.
//!
//! An index of 0 means "none".

use crate::{I32, I64};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub const ENTRY_SIZE: usize = 0x60;

pub const NAME_SIZE: usize = 0x40;

/// Index of the root directory in the directory table
pub const ROOT_DIRECTORY_INDEX: u32 = 2;

/// Index of the record whose `next_in_chain_index` starts the list of live entries
pub const CHAIN_HEAD_INDEX: u32 = 1;

/// A record of either table
///
/// The fields at 0x48 and 0x4C differ between the two tables: a file stores its first block and
/// its size, a directory stores its first child directory and its first file.
#[derive(Copy, Clone, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Entry {
    pub parent_dir_index: I32,
    /// NUL terminated UTF-8
    pub name: [u8; NAME_SIZE],
    pub next_sibling_index: I32,
    /// `block_index` for files, `first_child_index` for directories
    pub field_48: I32,
    /// `file_size` for files, `first_file_index` for directories
    pub field_4c: I64,
    pub _reserved: I64,
    pub next_in_chain_index: I32,
}

assert_eq_size!(Entry, [u8; ENTRY_SIZE]);

impl Entry {
    /// The name, up to (not including) the first NUL
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_SIZE);
        &self.name[..len]
    }
}

#[test]
fn name_without_terminator() {
    let mut entry: Entry = crate::read(&[0u8; ENTRY_SIZE]).unwrap();
    entry.name[..4].copy_from_slice(b"save");
    assert_eq!(entry.name_bytes(), b"save");

    entry.name = [b'a'; NAME_SIZE];
    assert_eq!(entry.name_bytes().len(), NAME_SIZE);
}
