//! Journaled block indirection
//!
//! Every logical block of the journaled storage is redirected to a physical block of the journal
//! data area through the journal map.

use crate::errors::{Error, Result};
use crate::header::JournalMapHeader;
use crate::storage::{check_range, read_all, Storage};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct JournalMapEntry {
    pub virtual_index: u32,
    pub physical_index: u32,
}

/// Block bitmaps kept alongside the map
///
/// They track modified and free physical blocks for block allocation on commit. Reads and in place
/// writes don't consult them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalBitmaps {
    pub modified_physical: Vec<u8>,
    pub modified_virtual: Vec<u8>,
    pub free_blocks: Vec<u8>,
}

impl JournalBitmaps {
    pub fn load<S: ?Sized + Storage>(
        modified_physical: &S,
        modified_virtual: &S,
        free_blocks: &S,
    ) -> Result<Self> {
        Ok(Self {
            modified_physical: read_all(modified_physical)?,
            modified_virtual: read_all(modified_virtual)?,
            free_blocks: read_all(free_blocks)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct JournalMap {
    header: JournalMapHeader,
    entries: Vec<JournalMapEntry>,
    bitmaps: JournalBitmaps,
}

impl JournalMap {
    /// Read one entry per main data block from `map_source`
    pub fn load<S: ?Sized + Storage>(
        header: JournalMapHeader,
        map_source: &S,
        bitmaps: JournalBitmaps,
    ) -> Result<Self> {
        let entry_size = repr::journal::ENTRY_SIZE as u64;
        let table_size = u64::from(header.main_data_block_count) * entry_size;
        if table_size > map_source.size() {
            return Err(Error::malformed(format!(
                "journal map of {} blocks doesn't fit in {:#x} bytes",
                header.main_data_block_count,
                map_source.size()
            )));
        }
        let mut bytes = vec![0; table_size as usize];
        map_source.read_at(0, &mut bytes)?;
        let entries = bytes
            .chunks_exact(entry_size as usize)
            .zip(0..)
            .map(|(chunk, virtual_index)| {
                repr::read::<repr::journal::MapEntry>(chunk)
                    .map(|raw| JournalMapEntry {
                        virtual_index,
                        physical_index: raw.physical_index(),
                    })
                    .ok_or_else(|| Error::malformed("truncated journal map entry"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            header,
            entries,
            bitmaps,
        })
    }

    pub fn from_entries(header: JournalMapHeader, entries: Vec<JournalMapEntry>) -> Self {
        Self {
            header,
            entries,
            bitmaps: JournalBitmaps::default(),
        }
    }

    pub fn header(&self) -> &JournalMapHeader {
        &self.header
    }

    pub fn entries(&self) -> &[JournalMapEntry] {
        &self.entries
    }

    pub fn bitmaps(&self) -> &JournalBitmaps {
        &self.bitmaps
    }

    pub fn get_physical_block(&self, virtual_block: u32) -> Option<u32> {
        self.entries
            .get(virtual_block as usize)
            .map(|entry| entry.physical_index)
    }
}

pub struct JournalStorage<S> {
    base: S,
    map: JournalMap,
    block_size: u32,
    size: u64,
}

impl<S: Storage> JournalStorage<S> {
    pub fn new(base: S, map: JournalMap, block_size: u32) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::malformed("journal block size is zero"));
        }
        let size = map.entries().len() as u64 * u64::from(block_size);
        Ok(Self {
            base,
            map,
            block_size,
            size,
        })
    }

    pub fn map(&self) -> &JournalMap {
        &self.map
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn for_each_run<F>(&self, offset: u64, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(u64, usize, usize) -> Result<()>,
    {
        check_range(self.kind(), offset, len, self.size)?;
        let block_size = u64::from(self.block_size);
        let mut position = offset;
        let mut done = 0;
        while done < len {
            let block = (position / block_size) as u32;
            let block_pos = position % block_size;
            let physical_block = self.map.get_physical_block(block).ok_or(Error::OutOfRange {
                storage: self.kind(),
                offset: position,
                len: (len - done) as u64,
            })?;
            let n = (block_size - block_pos).min((len - done) as u64) as usize;

            f(u64::from(physical_block) * block_size + block_pos, done, n)?;

            done += n;
            position += n as u64;
        }
        Ok(())
    }
}

impl<S: Storage> Storage for JournalStorage<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let base = &self.base;
        self.for_each_run(offset, buf.len(), |physical, start, n| {
            base.read_at(physical, &mut buf[start..start + n])
        })
    }

    /// Overwrite the mapped physical blocks
    ///
    /// No new blocks are allocated, so the write is not power loss safe.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let base = &self.base;
        self.for_each_run(offset, buf.len(), |physical, start, n| {
            base.write_at(physical, &buf[start..start + n])
        })
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&self) -> Result<()> {
        self.base.flush()
    }

    fn kind(&self) -> &'static str {
        "journal storage"
    }
}
