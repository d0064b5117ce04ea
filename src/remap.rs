//! Segmented virtual to physical address remapping
//!
//! The top `segment_bits` bits of a virtual offset pick a segment; each segment is a run of map
//! entries that are contiguous in virtual space, each entry pointing at its own physical extent
//! of the base storage.

use crate::errors::{Error, Result};
use crate::header::RemapHeader;
use crate::storage::Storage;
use std::convert::TryFrom;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub virtual_offset: u64,
    pub physical_offset: u64,
    pub size: u64,
    pub alignment: u32,
    /// Index of the entry directly following this one in virtual space
    next: Option<usize>,
}

impl MapEntry {
    pub fn new(virtual_offset: u64, physical_offset: u64, size: u64) -> Self {
        Self {
            virtual_offset,
            physical_offset,
            size,
            alignment: 0,
            next: None,
        }
    }

    pub fn virtual_offset_end(&self) -> u64 {
        self.virtual_offset + self.size
    }

    fn from_raw(raw: &repr::remap::MapEntry) -> Result<Self> {
        let field = |name: &str, value: i64| {
            u64::try_from(value)
                .map_err(|_| Error::malformed(format!("negative remap entry {}: {}", name, value)))
        };
        let entry = Self {
            virtual_offset: field("virtual offset", raw.virtual_offset.get())?,
            physical_offset: field("physical offset", raw.physical_offset.get())?,
            size: field("size", raw.size.get())?,
            alignment: raw.alignment.get() as u32,
            next: None,
        };
        if entry.virtual_offset.checked_add(entry.size).is_none()
            || entry.physical_offset.checked_add(entry.size).is_none()
        {
            return Err(Error::malformed(format!(
                "remap entry at {:#x} overflows",
                entry.virtual_offset
            )));
        }
        Ok(entry)
    }
}

/// A maximal run of virtually contiguous map entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapSegment {
    pub offset: u64,
    pub length: u64,
    first_entry: usize,
    entry_count: usize,
}

pub struct RemapStorage<S> {
    base: S,
    header: RemapHeader,
    entries: Vec<MapEntry>,
    segments: Vec<RemapSegment>,
    size: u64,
}

impl<S: Storage> RemapStorage<S> {
    /// Read `header.map_entry_count` entries from `entry_source` and build the segment table
    pub fn load<E: ?Sized + Storage>(base: S, header: RemapHeader, entry_source: &E) -> Result<Self> {
        let entry_size = repr::remap::ENTRY_SIZE;
        let table_size = u64::from(header.map_entry_count) * entry_size as u64;
        if table_size > entry_source.size() {
            return Err(Error::malformed(format!(
                "{} remap entries don't fit in a {:#x} byte table",
                header.map_entry_count,
                entry_source.size()
            )));
        }
        let mut bytes = vec![0; table_size as usize];
        entry_source.read_at(0, &mut bytes)?;
        let entries = bytes
            .chunks_exact(entry_size)
            .map(|chunk| {
                repr::read::<repr::remap::MapEntry>(chunk)
                    .ok_or_else(|| Error::malformed("truncated remap entry"))
                    .and_then(|raw| MapEntry::from_raw(&raw))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(base, header, entries)
    }

    pub fn new(base: S, header: RemapHeader, mut entries: Vec<MapEntry>) -> Result<Self> {
        if header.segment_bits == 0 || header.segment_bits >= 64 {
            return Err(Error::malformed(format!(
                "invalid remap segment bits {}",
                header.segment_bits
            )));
        }
        for pair in entries.windows(2) {
            if pair[0].virtual_offset_end() > pair[1].virtual_offset {
                return Err(Error::malformed(format!(
                    "remap entries at {:#x} and {:#x} are unsorted or overlap",
                    pair[0].virtual_offset, pair[1].virtual_offset
                )));
            }
        }
        let base_size = base.size();
        if let Some(entry) = entries
            .iter()
            .find(|entry| entry.physical_offset + entry.size > base_size)
        {
            return Err(Error::OutOfRange {
                storage: base.kind(),
                offset: entry.physical_offset,
                len: entry.size,
            });
        }

        let segments = group_segments(
            &mut entries,
            header.map_segment_count as usize,
            header.segment_bits,
        )?;
        let size = entries
            .last()
            .map_or(0, |entry| entry.virtual_offset_end());
        Ok(Self {
            base,
            header,
            entries,
            segments,
            size,
        })
    }

    pub fn header(&self) -> &RemapHeader {
        &self.header
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn segments(&self) -> &[RemapSegment] {
        &self.segments
    }

    pub fn get_ref(&self) -> &S {
        &self.base
    }

    fn segment_index(&self, offset: u64) -> u64 {
        offset >> (64 - self.header.segment_bits)
    }

    /// Index of the entry holding the byte at virtual `offset`
    fn find_entry(&self, offset: u64) -> Option<usize> {
        let segment = self
            .segments
            .get(usize::try_from(self.segment_index(offset)).ok()?)?;
        if offset < segment.offset || offset - segment.offset >= segment.length {
            return None;
        }
        let entries = &self.entries[segment.first_entry..segment.first_entry + segment.entry_count];
        entries
            .iter()
            .position(|entry| entry.virtual_offset_end() > offset)
            .map(|i| segment.first_entry + i)
            .filter(|&i| self.entries[i].virtual_offset <= offset)
    }

    /// The physical offset and map entry for virtual `offset`
    pub fn translate(&self, offset: u64) -> Result<(u64, &MapEntry)> {
        let entry = self
            .find_entry(offset)
            .map(|i| &self.entries[i])
            .ok_or(Error::OutOfRange {
                storage: self.kind(),
                offset,
                len: 0,
            })?;
        Ok((entry.physical_offset + (offset - entry.virtual_offset), entry))
    }

    fn for_each_run<F>(&self, offset: u64, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(u64, usize, usize) -> Result<()>,
    {
        let out_of_range = |position: u64, remaining: usize| Error::OutOfRange {
            storage: self.kind(),
            offset: position,
            len: remaining as u64,
        };
        if len == 0 {
            return Ok(());
        }
        let mut entry_index = self
            .find_entry(offset)
            .ok_or_else(|| out_of_range(offset, len))?;
        let mut position = offset;
        let mut done = 0;
        while done < len {
            let entry = &self.entries[entry_index];
            let entry_pos = position - entry.virtual_offset;
            let n = (entry.size - entry_pos).min((len - done) as u64) as usize;

            f(entry.physical_offset + entry_pos, done, n)?;

            done += n;
            position += n as u64;
            if done < len {
                entry_index = entry
                    .next
                    .ok_or_else(|| out_of_range(position, len - done))?;
            }
        }
        Ok(())
    }
}

/// Split `entries` into `segment_count` segments and link each entry to its successor
///
/// A segment ends where virtual contiguity breaks or where the next entry falls in another
/// segment slot.
fn group_segments(
    entries: &mut [MapEntry],
    segment_count: usize,
    segment_bits: u32,
) -> Result<Vec<RemapSegment>> {
    let slot = |entry: &MapEntry| entry.virtual_offset >> (64 - segment_bits);
    let mut segments = Vec::with_capacity(segment_count);
    let mut i = 0;
    for _ in 0..segment_count {
        let first_entry = i;
        if first_entry >= entries.len() {
            return Err(Error::malformed(format!(
                "remap table declares {} segments but only {} entries",
                segment_count,
                entries.len()
            )));
        }
        i += 1;
        while i < entries.len()
            && entries[i - 1].virtual_offset_end() == entries[i].virtual_offset
            && slot(&entries[i]) == slot(&entries[first_entry])
        {
            entries[i - 1].next = Some(i);
            i += 1;
        }
        let offset = entries[first_entry].virtual_offset;
        segments.push(RemapSegment {
            offset,
            length: entries[i - 1].virtual_offset_end() - offset,
            first_entry,
            entry_count: i - first_entry,
        });
    }
    if i != entries.len() {
        return Err(Error::malformed(format!(
            "{} remap entries are not covered by any segment",
            entries.len() - i
        )));
    }
    Ok(segments)
}

impl<S: Storage> Storage for RemapStorage<S> {
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

    /// End of the last mapped virtual range
    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&self) -> Result<()> {
        self.base.flush()
    }

    fn kind(&self) -> &'static str {
        "remap storage"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn header(segment_bits: u32, map_entry_count: u32, map_segment_count: u32) -> RemapHeader {
        RemapHeader {
            version: 0,
            map_entry_count,
            map_segment_count,
            segment_bits,
        }
    }

    fn base() -> MemoryStorage {
        MemoryStorage::new((0..0x2000).map(|i| (i % 251) as u8).collect())
    }

    #[test]
    fn single_entry() {
        let base = base();
        let remap = RemapStorage::new(
            &base,
            header(2, 1, 1),
            vec![MapEntry::new(0, 0x1000, 0x200)],
        )
        .unwrap();

        let mut buf = [0; 0x10];
        remap.read_at(0x50, &mut buf).unwrap();
        let mut expected = [0; 0x10];
        base.read_at(0x1050, &mut expected).unwrap();
        assert_eq!(buf, expected);

        let (physical, entry) = remap.translate(0x50).unwrap();
        assert_eq!(physical, 0x1050);
        assert!(entry.virtual_offset <= 0x50 && 0x50 < entry.virtual_offset_end());
    }

    #[test]
    fn read_spans_entries_and_segments() {
        let base = base();
        let segment_1 = 1u64 << 62;
        let remap = RemapStorage::new(
            &base,
            header(2, 3, 2),
            vec![
                MapEntry::new(0, 0x400, 0x100),
                MapEntry::new(0x100, 0x000, 0x100),
                MapEntry::new(segment_1, 0x800, 0x80),
            ],
        )
        .unwrap();
        assert_eq!(remap.segments().len(), 2);
        assert_eq!(remap.segments()[0].length, 0x200);
        assert_eq!(remap.segments()[1].offset, segment_1);

        let mut buf = [0; 0x20];
        remap.read_at(0xF0, &mut buf).unwrap();
        let mut expected = [0; 0x20];
        base.read_at(0x4F0, &mut expected[..0x10]).unwrap();
        base.read_at(0x000, &mut expected[0x10..]).unwrap();
        assert_eq!(buf, expected);

        let mut buf = [0; 4];
        remap.read_at(segment_1 + 0x10, &mut buf).unwrap();
        let mut expected = [0; 4];
        base.read_at(0x810, &mut expected).unwrap();
        assert_eq!(buf, expected);

        // Every mapped offset reads the same bytes as its translation
        for &offset in &[0u64, 0xFF, 0x100, 0x1FF, segment_1, segment_1 + 0x7F] {
            let (physical, _) = remap.translate(offset).unwrap();
            let mut a = [0];
            let mut b = [0];
            remap.read_at(offset, &mut a).unwrap();
            base.read_at(physical, &mut b).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn out_of_range() {
        let base = base();
        let remap = RemapStorage::new(
            &base,
            header(2, 1, 1),
            vec![MapEntry::new(0, 0x1000, 0x200)],
        )
        .unwrap();

        let mut buf = [0; 0x10];
        // Runs off the end of the only entry
        assert!(matches!(
            remap.read_at(0x1F8, &mut buf),
            Err(Error::OutOfRange { offset: 0x200, .. })
        ));
        // Segment 1 doesn't exist
        assert!(remap.read_at(1 << 62, &mut buf).is_err());
        assert!(remap.translate(0x200).is_err());
    }

    #[test]
    fn writes_follow_entries() {
        let base = MemoryStorage::new(vec![0; 0x40]);
        let remap = RemapStorage::new(
            &base,
            header(2, 2, 1),
            vec![MapEntry::new(0, 0x20, 0x10), MapEntry::new(0x10, 0x00, 0x10)],
        )
        .unwrap();
        remap.write_at(0x0E, &[1, 2, 3, 4]).unwrap();
        let data = base.to_vec();
        assert_eq!(&data[0x2E..0x30], &[1, 2]);
        assert_eq!(&data[0x00..0x02], &[3, 4]);
    }

    #[test]
    fn segment_not_at_slot_start() {
        let base = base();
        let remap = RemapStorage::new(
            &base,
            header(2, 1, 1),
            vec![MapEntry::new(0x100, 0x1000, 0x80)],
        )
        .unwrap();
        assert_eq!(remap.translate(0x140).unwrap().0, 0x1040);

        let mut buf = [0; 0x10];
        remap.read_at(0x140, &mut buf).unwrap();
        let mut expected = [0; 0x10];
        base.read_at(0x1040, &mut expected).unwrap();
        assert_eq!(buf, expected);

        assert!(remap.translate(0xFF).is_err());
        assert!(remap.translate(0x180).is_err());
    }

    #[test]
    fn contiguous_entries_split_at_slot_boundary() {
        let base = base();
        let slot_1 = 1u64 << 62;
        let remap = RemapStorage::new(
            &base,
            header(2, 2, 2),
            vec![
                MapEntry::new(slot_1 - 0x100, 0x000, 0x100),
                MapEntry::new(slot_1, 0x100, 0x100),
            ],
        )
        .unwrap();
        assert_eq!(remap.segments().len(), 2);
        assert_eq!(remap.segments()[0].length, 0x100);
        assert_eq!(remap.segments()[1].offset, slot_1);
        assert_eq!(remap.translate(slot_1 - 1).unwrap().0, 0xFF);
        assert_eq!(remap.translate(slot_1 + 1).unwrap().0, 0x101);
    }

    #[test]
    fn rejects_bad_tables() {
        let base = base();
        let overlapping = vec![MapEntry::new(0, 0, 0x100), MapEntry::new(0x80, 0x100, 0x100)];
        assert!(RemapStorage::new(&base, header(2, 2, 1), overlapping).is_err());

        let too_many_segments = vec![MapEntry::new(0, 0, 0x100)];
        assert!(RemapStorage::new(&base, header(2, 1, 2), too_many_segments).is_err());

        let uncovered = vec![MapEntry::new(0, 0, 0x100), MapEntry::new(0x200, 0, 0x100)];
        assert!(RemapStorage::new(&base, header(2, 2, 1), uncovered).is_err());

        let past_base = vec![MapEntry::new(0, 0x1F00, 0x200)];
        assert!(RemapStorage::new(&base, header(2, 1, 1), past_base).is_err());

        assert!(RemapStorage::new(&base, header(0, 0, 0), Vec::new()).is_err());
    }

    #[test]
    fn load_entries() {
        let base = base();
        let mut table = Vec::new();
        for &(virtual_offset, physical_offset, size) in &[(0i64, 0x100i64, 0x40i64), (0x40, 0, 0x40)] {
            table.extend_from_slice(&virtual_offset.to_le_bytes());
            table.extend_from_slice(&physical_offset.to_le_bytes());
            table.extend_from_slice(&size.to_le_bytes());
            table.extend_from_slice(&[0; 8]);
        }
        let remap =
            RemapStorage::load(&base, header(2, 2, 1), &MemoryStorage::new(table)).unwrap();
        assert_eq!(remap.size(), 0x80);
        assert_eq!(remap.translate(0x41).unwrap().0, 0x01);
    }
}
