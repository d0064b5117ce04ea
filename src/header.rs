use crate::errors::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use repr::header as raw;
use repr::header::SaveDataFlags;
use repr::Magic;
use sha2::{Digest, Sha256};
use std::convert::TryFrom;
use zerocopy::{FromBytes, Unaligned};

fn non_negative(name: &'static str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::malformed(format!("negative header field {}: {}", name, value)))
}

fn non_negative_32(name: &'static str, value: i32) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::malformed(format!("negative header field {}: {}", name, value)))
}

fn check_magic(region: &'static str, expected: Magic, actual: Magic) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::BadMagic {
            region,
            expected,
            actual,
        })
    }
}

fn read_region<T: FromBytes + Unaligned + Copy>(data: &[u8], offset: usize) -> Result<T> {
    data.get(offset..)
        .and_then(repr::read)
        .ok_or_else(|| Error::malformed(format!("header too short for region at {:#x}", offset)))
}

macro_rules! layout {
    ($($field:ident),* $(,)?) => {
        /// Offsets and sizes of every region of the container
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct Layout {
            pub version: u32,
            pub hash: [u8; 0x20],
            $(pub $field: u64,)*
            pub duplex_index: u8,
        }

        impl Layout {
            fn from_raw(layout: &raw::Layout) -> Result<Self> {
                check_magic("layout table", raw::LAYOUT_MAGIC, layout.magic)?;
                Ok(Self {
                    version: layout.version.get(),
                    hash: layout.hash,
                    $($field: non_negative(stringify!($field), layout.$field.get())?,)*
                    duplex_index: layout.duplex_index,
                })
            }
        }
    };
}

layout!(
    file_map_entry_offset,
    file_map_entry_size,
    meta_map_entry_offset,
    meta_map_entry_size,
    file_map_data_offset,
    file_map_data_size,
    duplex_l1_offset_a,
    duplex_l1_offset_b,
    duplex_l1_size,
    duplex_data_offset_a,
    duplex_data_offset_b,
    duplex_data_size,
    journal_data_offset,
    journal_data_size_a,
    journal_data_size_b,
    size_reserved_area,
    duplex_master_offset_a,
    duplex_master_offset_b,
    duplex_master_size,
    ivfc_master_hash_offset_a,
    ivfc_master_hash_offset_b,
    ivfc_master_hash_size,
    journal_map_table_offset,
    journal_map_table_size,
    journal_physical_bitmap_offset,
    journal_physical_bitmap_size,
    journal_virtual_bitmap_offset,
    journal_virtual_bitmap_size,
    journal_free_bitmap_offset,
    journal_free_bitmap_size,
    ivfc_l1_offset,
    ivfc_l1_size,
    ivfc_l2_offset,
    ivfc_l2_size,
    ivfc_l3_offset,
    ivfc_l3_size,
    fat_offset,
    fat_size,
);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DuplexLayerInfo {
    pub offset: u64,
    pub size: u64,
    pub block_size_power: u32,
}

impl DuplexLayerInfo {
    pub fn block_size(&self) -> Result<u32> {
        1u32.checked_shl(self.block_size_power)
            .filter(|&size| size > 0)
            .ok_or_else(|| {
                Error::malformed(format!(
                    "invalid duplex block size power {}",
                    self.block_size_power
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplexHeader {
    pub version: u32,
    pub layers: [DuplexLayerInfo; raw::DUPLEX_LAYER_COUNT],
}

impl DuplexHeader {
    fn from_raw(duplex: &raw::Duplex) -> Result<Self> {
        check_magic("duplex header", raw::DUPLEX_MAGIC, duplex.magic)?;
        let layer = |i: usize| -> Result<DuplexLayerInfo> {
            let layer = &duplex.layers[i];
            Ok(DuplexLayerInfo {
                offset: non_negative("duplex layer offset", layer.offset.get())?,
                size: non_negative("duplex layer size", layer.size.get())?,
                block_size_power: layer.block_size_power.get(),
            })
        };
        Ok(Self {
            version: duplex.version.get(),
            layers: [layer(0)?, layer(1)?, layer(2)?],
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IvfcLevelInfo {
    pub offset: u64,
    pub size: u64,
    pub block_size_power: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfcHeader {
    pub version: u32,
    pub master_hash_size: u32,
    /// Only the levels in use, at most 6
    pub levels: Vec<IvfcLevelInfo>,
    pub salt_source: [u8; 0x20],
}

impl IvfcHeader {
    fn from_raw(ivfc: &raw::Ivfc) -> Result<Self> {
        check_magic("integrity header", raw::IVFC_MAGIC, ivfc.magic)?;
        let level_count = (ivfc.level_count.get() as usize).min(raw::IVFC_MAX_LEVEL_COUNT);
        let levels = ivfc.levels[..level_count]
            .iter()
            .map(|level| {
                Ok(IvfcLevelInfo {
                    offset: non_negative("integrity level offset", level.offset.get())?,
                    size: non_negative("integrity level size", level.size.get())?,
                    block_size_power: level.block_size_power.get(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            version: ivfc.version.get(),
            master_hash_size: ivfc.master_hash_size.get(),
            levels,
            salt_source: ivfc.salt_source,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    pub version: u32,
    pub total_size: u64,
    pub journal_size: u64,
    pub block_size: u64,
}

impl JournalHeader {
    fn from_raw(journal: &raw::Journal) -> Result<Self> {
        check_magic("journal header", raw::JOURNAL_MAGIC, journal.magic)?;
        Ok(Self {
            version: journal.version.get(),
            total_size: non_negative("journal total size", journal.total_size.get())?,
            journal_size: non_negative("journal size", journal.journal_size.get())?,
            block_size: non_negative("journal block size", journal.block_size.get())?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct JournalMapHeader {
    pub version: u32,
    pub main_data_block_count: u32,
    pub journal_block_count: u32,
}

impl From<&raw::JournalMap> for JournalMapHeader {
    fn from(map: &raw::JournalMap) -> Self {
        Self {
            version: map.version.get(),
            main_data_block_count: map.main_data_block_count.get(),
            journal_block_count: map.journal_block_count.get(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SaveHeader {
    pub version: u32,
    pub block_count: u64,
    pub block_size: u64,
}

impl SaveHeader {
    fn from_raw(save: &raw::Save) -> Result<Self> {
        check_magic("save header", raw::SAVE_MAGIC, save.magic)?;
        Ok(Self {
            version: save.version.get(),
            block_count: non_negative("save block count", save.block_count.get())?,
            block_size: non_negative("save block size", save.block_size.get())?,
        })
    }
}

/// Where the file tree's allocation table and entry tables live
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FatHeader {
    pub block_size: u64,
    pub fat_offset: u64,
    pub fat_block_count: u32,
    pub data_offset: u64,
    pub data_block_count: u32,
    pub directory_table_block: u32,
    pub file_table_block: u32,
}

impl FatHeader {
    fn from_raw(fat: &raw::Fat) -> Result<Self> {
        Ok(Self {
            block_size: non_negative("allocation table block size", fat.block_size.get())?,
            fat_offset: non_negative("allocation table offset", fat.fat_offset.get())?,
            fat_block_count: fat.fat_block_count.get(),
            data_offset: non_negative("data offset", fat.data_offset.get())?,
            data_block_count: fat.data_block_count.get(),
            directory_table_block: non_negative_32(
                "directory table block",
                fat.directory_table_block.get(),
            )?,
            file_table_block: non_negative_32("file table block", fat.file_table_block.get())?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RemapHeader {
    pub version: u32,
    pub map_entry_count: u32,
    pub map_segment_count: u32,
    pub segment_bits: u32,
}

impl RemapHeader {
    fn from_raw(region: &'static str, remap: &raw::Remap) -> Result<Self> {
        check_magic(region, raw::REMAP_MAGIC, remap.magic)?;
        Ok(Self {
            version: remap.version.get(),
            map_entry_count: non_negative_32("map entry count", remap.map_entry_count.get())?,
            map_segment_count: non_negative_32(
                "map segment count",
                remap.map_segment_count.get(),
            )?,
            segment_bits: non_negative_32("segment bits", remap.segment_bits.get())?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExtraData {
    pub title_id: u64,
    pub user_id: [u8; 0x10],
    pub save_id: u64,
    pub save_data_type: u8,
    pub owner_id: u64,
    pub timestamp: i64,
    pub flags: SaveDataFlags,
    pub data_size: i64,
    pub journal_size: i64,
}

impl ExtraData {
    /// The timestamp as a date, if it is representable
    pub fn modified_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

impl From<&raw::ExtraData> for ExtraData {
    fn from(extra: &raw::ExtraData) -> Self {
        Self {
            title_id: extra.title_id.get(),
            user_id: extra.user_id,
            save_id: extra.save_id.get(),
            save_data_type: extra.save_data_type,
            owner_id: extra.owner_id.get(),
            timestamp: extra.timestamp.get(),
            flags: extra.flags(),
            data_size: extra.data_size.get(),
            journal_size: extra.journal_size.get(),
        }
    }
}

/// The parsed 0x4000 byte container header
#[derive(Debug, Clone)]
pub struct Header {
    pub layout: Layout,
    pub duplex: DuplexHeader,
    pub ivfc: IvfcHeader,
    pub journal: JournalHeader,
    pub journal_map: JournalMapHeader,
    pub save: SaveHeader,
    pub fat: FatHeader,
    pub data_remap: RemapHeader,
    pub meta_remap: RemapHeader,
    pub extra_data: ExtraData,
    data: Vec<u8>,
}

impl Header {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < raw::SIZE {
            return Err(Error::malformed(format!(
                "header is {:#x} bytes, expected {:#x}",
                data.len(),
                raw::SIZE
            )));
        }
        let layout: raw::Layout = read_region(&data, raw::LAYOUT_OFFSET)?;
        let duplex: raw::Duplex = read_region(&data, raw::DUPLEX_OFFSET)?;
        let ivfc: raw::Ivfc = read_region(&data, raw::IVFC_OFFSET)?;
        let journal: raw::Journal = read_region(&data, raw::JOURNAL_OFFSET)?;
        let journal_map: raw::JournalMap = read_region(&data, raw::JOURNAL_MAP_OFFSET)?;
        let save: raw::Save = read_region(&data, raw::SAVE_OFFSET)?;
        let fat: raw::Fat = read_region(&data, raw::FAT_OFFSET)?;
        let data_remap: raw::Remap = read_region(&data, raw::DATA_REMAP_OFFSET)?;
        let meta_remap: raw::Remap = read_region(&data, raw::META_REMAP_OFFSET)?;
        let extra_data: raw::ExtraData = read_region(&data, raw::EXTRA_DATA_OFFSET)?;

        Ok(Self {
            layout: Layout::from_raw(&layout)?,
            duplex: DuplexHeader::from_raw(&duplex)?,
            ivfc: IvfcHeader::from_raw(&ivfc)?,
            journal: JournalHeader::from_raw(&journal)?,
            journal_map: JournalMapHeader::from(&journal_map),
            save: SaveHeader::from_raw(&save)?,
            fat: FatHeader::from_raw(&fat)?,
            data_remap: RemapHeader::from_raw("data remap header", &data_remap)?,
            meta_remap: RemapHeader::from_raw("metadata remap header", &meta_remap)?,
            extra_data: ExtraData::from(&extra_data),
            data,
        })
    }

    /// The raw header bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn cmac(&self) -> &[u8] {
        &self.data[raw::CMAC_OFFSET..raw::CMAC_OFFSET + raw::CMAC_SIZE]
    }

    /// The bytes covered by the CMAC
    pub fn signed_region(&self) -> &[u8] {
        &self.data[raw::LAYOUT_OFFSET..raw::LAYOUT_OFFSET + raw::LAYOUT_SIZE]
    }

    pub fn is_layout_hash_valid(&self) -> bool {
        compute_layout_hash(&self.data)[..] == self.layout.hash[..]
    }

    fn header_slice(&self, what: &str, offset: u64, size: u64) -> Result<&[u8]> {
        let end = offset.checked_add(size);
        match end {
            Some(end) if end <= raw::SIZE as u64 => Ok(&self.data[offset as usize..end as usize]),
            _ => Err(Error::malformed(format!(
                "{} at {:#x}+{:#x} lies outside the header",
                what, offset, size
            ))),
        }
    }

    /// The master bitmap of the duplex hierarchy, A or B
    pub fn duplex_master(&self, b: bool) -> Result<&[u8]> {
        let offset = if b {
            self.layout.duplex_master_offset_b
        } else {
            self.layout.duplex_master_offset_a
        };
        self.header_slice("duplex master bitmap", offset, self.layout.duplex_master_size)
    }

    /// The top hash of the integrity tree
    pub fn master_hash(&self) -> Result<&[u8]> {
        self.header_slice(
            "integrity master hash",
            self.layout.ivfc_master_hash_offset_a,
            self.layout.ivfc_master_hash_size,
        )
    }
}

/// SHA-256 of the hashed part of a raw header
pub fn compute_layout_hash(header: &[u8]) -> [u8; 0x20] {
    let digest = Sha256::digest(&header[raw::LAYOUT_HASHED_START..raw::SIZE]);
    let mut hash = [0; 0x20];
    hash.copy_from_slice(&digest);
    hash
}
