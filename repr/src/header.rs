//! Container Header
//!
//! The first 0x4000 bytes of the image. Each region starts at a fixed offset:
//!
//! ```text
//! 0x000  CMAC over the layout table (0x10 bytes)
//! 0x100  layout table           "DISF"
//! 0x300  duplex header          "DPFS"
//! 0x344  integrity header       "IVFC"
//! 0x408  journal header         "JNGL"
//! 0x428  journal map header
//! 0x608  save header            "SAVE"
//! 0x620  allocation table header
//! 0x650  data remap header      "RMAP"
//! 0x690  metadata remap header  "RMAP"
//! 0x6D8  extra data
//! ```
//!
//! The layout table is the single source of truth for where every other region lives. Offsets in
//! it are relative to different storages: map entry tables and the data remap region are
//! relative to the image, duplex master bitmaps and integrity master hashes are relative to the
//! header, L1 and data duplex layers plus the journal data are relative to the data remap storage,
//! and everything else is relative to the metadata remap storage.

use crate::{Magic, I32, I64, U32, U64};
use bitflags::bitflags;
use static_assertions::const_assert;
use std::mem;
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub const SIZE: usize = 0x4000;

pub const CMAC_OFFSET: usize = 0x000;
pub const CMAC_SIZE: usize = 0x10;
pub const LAYOUT_OFFSET: usize = 0x100;
pub const LAYOUT_SIZE: usize = 0x200;
/// The layout hash covers everything from the duplex header to the end of the header
pub const LAYOUT_HASH_OFFSET: usize = 0x108;
pub const LAYOUT_HASHED_START: usize = 0x300;
pub const DUPLEX_OFFSET: usize = 0x300;
pub const IVFC_OFFSET: usize = 0x344;
pub const JOURNAL_OFFSET: usize = 0x408;
pub const JOURNAL_MAP_OFFSET: usize = 0x428;
pub const SAVE_OFFSET: usize = 0x608;
pub const FAT_OFFSET: usize = 0x620;
pub const DATA_REMAP_OFFSET: usize = 0x650;
pub const META_REMAP_OFFSET: usize = 0x690;
pub const EXTRA_DATA_OFFSET: usize = 0x6D8;

pub const LAYOUT_MAGIC: Magic = Magic(*b"DISF");
pub const DUPLEX_MAGIC: Magic = Magic(*b"DPFS");
pub const IVFC_MAGIC: Magic = Magic(*b"IVFC");
pub const JOURNAL_MAGIC: Magic = Magic(*b"JNGL");
pub const SAVE_MAGIC: Magic = Magic(*b"SAVE");
pub const REMAP_MAGIC: Magic = Magic(*b"RMAP");

pub const DUPLEX_LAYER_COUNT: usize = 3;
pub const IVFC_MAX_LEVEL_COUNT: usize = 6;

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Layout {
    pub magic: Magic,
    pub version: U32,
    /// SHA-256 of header bytes `0x300..0x4000`
    pub hash: [u8; 0x20],
    pub file_map_entry_offset: I64,
    pub file_map_entry_size: I64,
    pub meta_map_entry_offset: I64,
    pub meta_map_entry_size: I64,
    pub file_map_data_offset: I64,
    pub file_map_data_size: I64,
    pub duplex_l1_offset_a: I64,
    pub duplex_l1_offset_b: I64,
    pub duplex_l1_size: I64,
    pub duplex_data_offset_a: I64,
    pub duplex_data_offset_b: I64,
    pub duplex_data_size: I64,
    pub journal_data_offset: I64,
    pub journal_data_size_a: I64,
    pub journal_data_size_b: I64,
    pub size_reserved_area: I64,
    pub duplex_master_offset_a: I64,
    pub duplex_master_offset_b: I64,
    pub duplex_master_size: I64,
    pub ivfc_master_hash_offset_a: I64,
    pub ivfc_master_hash_offset_b: I64,
    pub ivfc_master_hash_size: I64,
    pub journal_map_table_offset: I64,
    pub journal_map_table_size: I64,
    pub journal_physical_bitmap_offset: I64,
    pub journal_physical_bitmap_size: I64,
    pub journal_virtual_bitmap_offset: I64,
    pub journal_virtual_bitmap_size: I64,
    pub journal_free_bitmap_offset: I64,
    pub journal_free_bitmap_size: I64,
    pub ivfc_l1_offset: I64,
    pub ivfc_l1_size: I64,
    pub ivfc_l2_offset: I64,
    pub ivfc_l2_size: I64,
    pub ivfc_l3_offset: I64,
    pub ivfc_l3_size: I64,
    pub fat_offset: I64,
    pub fat_size: I64,
    /// 1 if the B master bitmap is authoritative
    pub duplex_index: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct DuplexLayer {
    pub offset: I64,
    pub size: I64,
    pub block_size_power: U32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Duplex {
    pub magic: Magic,
    pub version: U32,
    /// Master bitmap, L1 bitmap, data
    pub layers: [DuplexLayer; DUPLEX_LAYER_COUNT],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct IvfcLevel {
    pub offset: I64,
    pub size: I64,
    pub block_size_power: U32,
    pub _reserved: U32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Ivfc {
    pub magic: Magic,
    pub version: U32,
    pub master_hash_size: U32,
    pub level_count: U32,
    pub levels: [IvfcLevel; IVFC_MAX_LEVEL_COUNT],
    pub salt_source: [u8; 0x20],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Journal {
    pub magic: Magic,
    pub version: U32,
    pub total_size: I64,
    pub journal_size: I64,
    pub block_size: I64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct JournalMap {
    pub version: U32,
    pub main_data_block_count: U32,
    pub journal_block_count: U32,
    pub _reserved: U32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Save {
    pub magic: Magic,
    pub version: U32,
    pub block_count: I64,
    pub block_size: I64,
}

/// Allocation table header, directly after the save header
#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Fat {
    pub block_size: I64,
    pub fat_offset: I64,
    pub fat_block_count: U32,
    pub _pad0: U32,
    pub data_offset: I64,
    pub data_block_count: U32,
    pub _pad1: U32,
    pub directory_table_block: I32,
    pub file_table_block: I32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Remap {
    pub magic: Magic,
    pub version: U32,
    pub map_entry_count: I32,
    pub map_segment_count: I32,
    pub segment_bits: I32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ExtraData {
    pub title_id: U64,
    pub user_id: [u8; 0x10],
    pub save_id: U64,
    pub save_data_type: u8,
    pub _reserved0: [u8; 0x1F],
    pub owner_id: U64,
    /// Seconds since the unix epoch
    pub timestamp: I64,
    pub flags: U32,
    pub _reserved1: U32,
    pub data_size: I64,
    pub journal_size: I64,
}

bitflags! {
    pub struct SaveDataFlags: u32 {
        const KEEP_AFTER_RESETTING_SYSTEM_SAVE_DATA = 1;
        const KEEP_AFTER_REFURBISHMENT = 1 << 1;
        const KEEP_AFTER_RESETTING_SYSTEM_SAVE_DATA_WITHOUT_USER_SAVE_DATA = 1 << 2;
        const NEEDS_SECURE_DELETE = 1 << 3;
    }
}

impl ExtraData {
    pub fn flags(&self) -> SaveDataFlags {
        SaveDataFlags::from_bits_truncate(self.flags.get())
    }
}

const_assert!(LAYOUT_OFFSET + mem::size_of::<Layout>() <= DUPLEX_OFFSET);
const_assert!(DUPLEX_OFFSET + mem::size_of::<Duplex>() == IVFC_OFFSET);
const_assert!(IVFC_OFFSET + mem::size_of::<Ivfc>() <= JOURNAL_OFFSET);
const_assert!(JOURNAL_OFFSET + mem::size_of::<Journal>() == JOURNAL_MAP_OFFSET);
const_assert!(SAVE_OFFSET + mem::size_of::<Save>() == FAT_OFFSET);
const_assert!(FAT_OFFSET + mem::size_of::<Fat>() == DATA_REMAP_OFFSET);
const_assert!(DATA_REMAP_OFFSET + mem::size_of::<Remap>() <= META_REMAP_OFFSET);
const_assert!(EXTRA_DATA_OFFSET + mem::size_of::<ExtraData>() <= SIZE);
