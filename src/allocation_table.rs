//! Linked block-run allocation table
//!
//! Files and the two entry tables are stored as chains of block runs ("segments"). The table is
//! parsed once, then walked with [`AllocationTableIterator`], a plain value cursor which is
//! passed the table on every move, so any number of cursors can walk the same table.

use crate::errors::{Error, Result};
use crate::storage::{check_range, Storage};
use parking_lot::Mutex;
use repr::allocation_table::{ENTRY_SIZE, INDEX_MASK, LIST_START};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocationTableEntry {
    pub prev: i32,
    pub next: i32,
}

impl AllocationTableEntry {
    pub fn is_list_start(self) -> bool {
        self.prev == LIST_START
    }

    pub fn is_list_end(self) -> bool {
        self.next as u32 & INDEX_MASK == 0
    }

    pub fn is_multi_block_segment(self) -> bool {
        self.next < 0
    }

    pub fn is_single_block_segment(self) -> bool {
        self.next >= 0
    }

    /// Table index of the next segment's first entry
    pub fn next_index(self) -> u32 {
        self.next as u32 & INDEX_MASK
    }

    /// Table index of the previous segment's first entry
    pub fn prev_index(self) -> u32 {
        self.prev as u32 & INDEX_MASK
    }
}

impl From<repr::allocation_table::Entry> for AllocationTableEntry {
    fn from(raw: repr::allocation_table::Entry) -> Self {
        Self {
            prev: raw.prev.get(),
            next: raw.next.get(),
        }
    }
}

/// A run of physically contiguous blocks in a chain
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Segment {
    pub physical_block: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationTable {
    entries: Vec<AllocationTableEntry>,
}

impl AllocationTable {
    /// Parse `source.size() / 8` entries
    pub fn load<S: ?Sized + Storage>(source: &S) -> Result<Self> {
        let count = usize::try_from(source.size() / ENTRY_SIZE as u64)
            .map_err(|_| Error::malformed("allocation table is too large"))?;
        let mut bytes = vec![0; count * ENTRY_SIZE];
        source.read_at(0, &mut bytes)?;

        let entries = bytes
            .chunks_exact(ENTRY_SIZE)
            .map(|chunk| {
                repr::read::<repr::allocation_table::Entry>(chunk)
                    .map(AllocationTableEntry::from)
                    .ok_or_else(|| Error::malformed("truncated allocation table entry"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<AllocationTableEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[AllocationTableEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, index: u32) -> Result<AllocationTableEntry> {
        self.entries.get(index as usize).copied().ok_or_else(|| {
            Error::malformed(format!(
                "allocation table index {} is past the end of the table ({} entries)",
                index,
                self.entries.len()
            ))
        })
    }

    /// Size of the segment whose first block is `physical_block`
    fn segment_size(&self, physical_block: u32) -> Result<u32> {
        let entry = self.entry(physical_block + 1)?;
        if entry.is_single_block_segment() {
            return Ok(1);
        }
        let length_entry = self.entry(physical_block + 2)?;
        let size = i64::from(length_entry.next) - i64::from(physical_block);
        if size <= 0 || size > self.entries.len() as i64 {
            return Err(Error::malformed(format!(
                "invalid segment length {} at block {}",
                size, physical_block
            )));
        }
        Ok(size as u32)
    }

    /// Start a cursor at the first segment of the chain beginning at `initial_block`
    pub fn begin(&self, initial_block: u32) -> Result<AllocationTableIterator> {
        let index = initial_block
            .checked_add(1)
            .ok_or(Error::InvalidStartBlock {
                block: initial_block,
            })?;
        match self.entries.get(index as usize) {
            Some(entry) if entry.is_list_start() => {}
            _ => {
                return Err(Error::InvalidStartBlock {
                    block: initial_block,
                })
            }
        }
        Ok(AllocationTableIterator {
            virtual_block: 0,
            physical_block: initial_block,
            current_segment_size: self.segment_size(initial_block)?,
        })
    }

    /// Every segment of the chain starting at `initial_block`, in order
    ///
    /// Fails with [`Error::CyclicChain`] if any block is covered twice, either by revisiting a
    /// segment or by segments that overlap.
    pub fn chain(&self, initial_block: u32) -> Result<Vec<Segment>> {
        let mut iterator = self.begin(initial_block)?;
        let mut visited = HashSet::new();
        let mut segments = Vec::new();
        loop {
            let end = iterator.physical_block + iterator.current_segment_size;
            let revisited = (iterator.physical_block..end).find(|&block| !visited.insert(block));
            if let Some(block) = revisited {
                return Err(Error::CyclicChain {
                    start: initial_block,
                    block,
                });
            }
            segments.push(Segment {
                physical_block: iterator.physical_block,
                length: iterator.current_segment_size,
            });
            if !iterator.move_next(self)? {
                return Ok(segments);
            }
        }
    }

    /// Total number of blocks in the chain starting at `initial_block`
    pub fn chain_block_count(&self, initial_block: u32) -> Result<u64> {
        Ok(self
            .chain(initial_block)?
            .iter()
            .map(|segment| u64::from(segment.length))
            .sum())
    }
}

/// A cursor over one chain of an [`AllocationTable`]
///
/// `virtual_block` is the index of the first block of the current segment within the chain,
/// `physical_block` is where that segment starts in the data storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocationTableIterator {
    pub virtual_block: u64,
    pub physical_block: u32,
    pub current_segment_size: u32,
}

impl AllocationTableIterator {
    /// Advance to the next segment. Returns false at the end of the chain.
    pub fn move_next(&mut self, table: &AllocationTable) -> Result<bool> {
        let current = table.entry(self.physical_block + 1)?;
        if current.is_list_end() {
            return Ok(false);
        }
        let physical_block = current.next_index() - 1;
        let size = table.segment_size(physical_block)?;

        self.virtual_block += u64::from(self.current_segment_size);
        self.physical_block = physical_block;
        self.current_segment_size = size;
        Ok(true)
    }

    /// Step back to the previous segment. Returns false at the start of the chain.
    pub fn move_previous(&mut self, table: &AllocationTable) -> Result<bool> {
        let current = table.entry(self.physical_block + 1)?;
        if current.is_list_start() {
            return Ok(false);
        }
        let prev_index = current.prev_index();
        if prev_index == 0 {
            return Err(Error::malformed(format!(
                "block {} links back to the reserved table entry",
                self.physical_block
            )));
        }
        let physical_block = prev_index - 1;
        let size = table.segment_size(physical_block)?;
        let virtual_block = self
            .virtual_block
            .checked_sub(u64::from(size))
            .ok_or_else(|| {
                Error::malformed(format!(
                    "chain walks back past its start at block {}",
                    physical_block
                ))
            })?;

        self.virtual_block = virtual_block;
        self.physical_block = physical_block;
        self.current_segment_size = size;
        Ok(true)
    }

    /// Move until the current segment contains `block`
    ///
    /// Returns false if the chain doesn't reach `block`. A chain can't have more segments than
    /// the table has entries, so walking further than that means the chain loops.
    pub fn seek(&mut self, table: &AllocationTable, block: u64) -> Result<bool> {
        let start = self.physical_block;
        let budget = table.len() + 1;
        for _ in 0..budget {
            let moved = if block < self.virtual_block {
                self.move_previous(table)?
            } else if block >= self.virtual_block + u64::from(self.current_segment_size) {
                self.move_next(table)?
            } else {
                return Ok(true);
            };
            if !moved {
                return Ok(false);
            }
        }
        Err(Error::CyclicChain {
            start,
            block: self.physical_block,
        })
    }
}

/// One chain of blocks presented as a contiguous storage
///
/// Keeps its last cursor position, so sequential reads don't re-walk the chain from the start.
pub struct AllocationTableStorage<S> {
    base: S,
    table: Arc<AllocationTable>,
    block_size: u32,
    initial_block: u32,
    size: u64,
    cursor: Mutex<AllocationTableIterator>,
}

impl<S: Storage> AllocationTableStorage<S> {
    /// Open the chain at `initial_block` as a storage of `size` bytes
    ///
    /// Fails if the chain holds fewer than `size` bytes.
    pub fn new(
        base: S,
        table: Arc<AllocationTable>,
        block_size: u32,
        initial_block: u32,
        size: u64,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::malformed("allocation table block size is zero"));
        }
        let capacity = table.chain_block_count(initial_block)? * u64::from(block_size);
        if size > capacity {
            return Err(Error::malformed(format!(
                "chain at block {} holds {:#x} bytes, expected at least {:#x}",
                initial_block, capacity, size
            )));
        }
        let cursor = table.begin(initial_block)?;
        Ok(Self {
            base,
            table,
            block_size,
            initial_block,
            size,
            cursor: Mutex::new(cursor),
        })
    }

    /// Open the chain at `initial_block`, sized to every block in the chain
    pub fn open_chain(
        base: S,
        table: Arc<AllocationTable>,
        block_size: u32,
        initial_block: u32,
    ) -> Result<Self> {
        let size = table.chain_block_count(initial_block)? * u64::from(block_size);
        Self::new(base, table, block_size, initial_block, size)
    }

    pub fn initial_block(&self) -> u32 {
        self.initial_block
    }

    /// Call `f` for each physically contiguous piece of `offset..offset + len`
    fn for_each_run<F>(&self, offset: u64, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(u64, usize, usize) -> Result<()>,
    {
        check_range(self.kind(), offset, len, self.size)?;
        let block_size = u64::from(self.block_size);
        let mut cursor = self.cursor.lock();
        let mut position = offset;
        let mut done = 0;
        while done < len {
            let block = position / block_size;
            if !cursor.seek(&self.table, block)? {
                return Err(Error::OutOfRange {
                    storage: self.kind(),
                    offset: position,
                    len: (len - done) as u64,
                });
            }
            let segment_pos = position - cursor.virtual_block * block_size;
            let physical_offset = u64::from(cursor.physical_block) * block_size + segment_pos;
            let remaining_in_segment =
                u64::from(cursor.current_segment_size) * block_size - segment_pos;
            let n = remaining_in_segment.min((len - done) as u64) as usize;

            f(physical_offset, done, n)?;

            done += n;
            position += n as u64;
        }
        Ok(())
    }
}

impl<S: Storage> Storage for AllocationTableStorage<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let base = &self.base;
        self.for_each_run(offset, buf.len(), |physical, start, n| {
            base.read_at(physical, &mut buf[start..start + n])
        })
    }

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
        "allocation table storage"
    }
}
