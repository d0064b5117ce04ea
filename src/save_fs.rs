//! The file tree
//!
//! Directories and files are fixed size records in two tables, each stored as an allocation table
//! chain. Records refer to each other by table index; here they are kept in flat arrays indexed the
//! same way, with index 0 meaning "none".

use crate::allocation_table::{AllocationTable, AllocationTableStorage};
use crate::errors::{Error, Result};
use crate::header::FatHeader;
use crate::storage::{EmptyStorage, SharedStorage, Storage};
use bstr::ByteSlice;
use indexmap::IndexMap;
use repr::fs::{CHAIN_HEAD_INDEX, ENTRY_SIZE, ROOT_DIRECTORY_INDEX};
use slog::Logger;
use std::convert::TryFrom;
use std::sync::Arc;

/// Fields shared by files and directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Index in its own table
    pub index: u32,
    /// Index in the directory table
    pub parent_dir: Option<u32>,
    pub name: String,
    pub next_sibling: Option<u32>,
    pub next_in_chain: Option<u32>,
    pub full_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub info: EntryInfo,
    /// First block of the file's chain, negative for an empty file
    pub block_index: i32,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub info: EntryInfo,
    /// Index in the directory table
    pub first_child: Option<u32>,
    /// Index in the file table
    pub first_file: Option<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Entry<'a> {
    File(&'a FileEntry),
    Directory(&'a DirectoryEntry),
}

impl<'a> Entry<'a> {
    pub fn info(&self) -> &'a EntryInfo {
        match *self {
            Entry::File(file) => &file.info,
            Entry::Directory(dir) => &dir.info,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }
}

/// The contents of an opened file
pub enum FileStorage {
    Empty(EmptyStorage),
    Chain(AllocationTableStorage<SharedStorage>),
}

impl Storage for FileStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            FileStorage::Empty(s) => s.read_at(offset, buf),
            FileStorage::Chain(s) => s.read_at(offset, buf),
        }
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            FileStorage::Empty(s) => s.write_at(offset, buf),
            FileStorage::Chain(s) => s.write_at(offset, buf),
        }
    }

    fn size(&self) -> u64 {
        match self {
            FileStorage::Empty(s) => s.size(),
            FileStorage::Chain(s) => s.size(),
        }
    }

    fn flush(&self) -> Result<()> {
        match self {
            FileStorage::Empty(s) => s.flush(),
            FileStorage::Chain(s) => s.flush(),
        }
    }

    fn kind(&self) -> &'static str {
        "file storage"
    }
}

pub struct SaveFs {
    base: SharedStorage,
    table: Arc<AllocationTable>,
    block_size: u32,
    root: DirectoryEntry,
    directory_slots: Vec<Option<DirectoryEntry>>,
    file_slots: Vec<Option<FileEntry>>,
    /// Live entries in allocation order
    directories: Vec<u32>,
    files: Vec<u32>,
    directory_paths: IndexMap<String, u32>,
    file_paths: IndexMap<String, u32>,
    logger: Logger,
}

impl SaveFs {
    /// Load the tree stored in `base`, using the allocation table in `fat`
    pub fn open<F: ?Sized + Storage>(base: SharedStorage, fat: &F, header: &FatHeader) -> Result<Self> {
        Self::open_with_logger(base, fat, header, crate::savefile::default_logger())
    }

    pub fn open_with_logger<F: ?Sized + Storage>(
        base: SharedStorage,
        fat: &F,
        header: &FatHeader,
        logger: Logger,
    ) -> Result<Self> {
        let block_size = u32::try_from(header.block_size)
            .ok()
            .filter(|&size| size > 0)
            .ok_or_else(|| {
                Error::malformed(format!("invalid file tree block size {}", header.block_size))
            })?;
        let table = Arc::new(AllocationTable::load(fat)?);
        slog::debug!(logger, "Loaded allocation table"; "entries" => table.len(), "block_size" => block_size);

        let directory_records = {
            let storage = AllocationTableStorage::open_chain(
                base.clone(),
                table.clone(),
                block_size,
                header.directory_table_block,
            )?;
            read_table(&storage, ROOT_DIRECTORY_INDEX + 1, "directory table")?
        };
        let file_records = {
            let storage = AllocationTableStorage::open_chain(
                base.clone(),
                table.clone(),
                block_size,
                header.file_table_block,
            )?;
            read_table(&storage, CHAIN_HEAD_INDEX + 1, "file table")?
        };
        let counts = Counts {
            directories: directory_records.len(),
            files: file_records.len(),
        };

        let directories = live_indices(&directory_records, "directory table")?;
        let files = live_indices(&file_records, "file table")?;

        let mut directory_slots = vec![None; directory_records.len()];
        let root_is_live = directories.contains(&ROOT_DIRECTORY_INDEX);
        let materialized = directories
            .iter()
            .chain(Some(&ROOT_DIRECTORY_INDEX).filter(|_| !root_is_live));
        for &index in materialized {
            let record = &directory_records[index as usize];
            directory_slots[index as usize] = Some(DirectoryEntry {
                info: entry_info(index, record, counts.directories, counts, true)?,
                first_child: link(record.field_48.get().into(), counts.directories, "first child")?,
                first_file: link(record.field_4c.get(), counts.files, "first file")?,
            });
        }
        let mut file_slots = vec![None; file_records.len()];
        for &index in &files {
            let record = &file_records[index as usize];
            file_slots[index as usize] = Some(FileEntry {
                info: entry_info(index, record, counts.files, counts, false)?,
                block_index: record.field_48.get(),
                file_size: u64::try_from(record.field_4c.get()).map_err(|_| {
                    Error::malformed(format!("file {} has negative size", index))
                })?,
            });
        }

        let paths = directory_slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map(|dir| entry_path(&directory_slots, Entry::Directory(dir)))
                    .transpose()
            })
            .collect::<Result<Vec<_>>>()?;
        for (slot, path) in directory_slots.iter_mut().zip(paths) {
            if let (Some(dir), Some(path)) = (slot, path) {
                dir.info.full_path = path;
            }
        }
        let mut directory_paths = IndexMap::with_capacity(directories.len());
        for &index in &directories {
            if let Some(dir) = &directory_slots[index as usize] {
                directory_paths.insert(dir.info.full_path.clone(), index);
            }
        }

        let mut file_paths = IndexMap::with_capacity(files.len());
        for &index in &files {
            let path = match &file_slots[index as usize] {
                Some(file) => entry_path(&directory_slots, Entry::File(file))?,
                None => continue,
            };
            if let Some(file) = &mut file_slots[index as usize] {
                file.info.full_path = path.clone();
            }
            file_paths.insert(path, index);
        }

        slog::info!(logger, "Loaded file tree";
            "directories" => directories.len(),
            "files" => files.len(),
            "directory_records" => counts.directories,
            "file_records" => counts.files
        );

        let root = directory_slots[ROOT_DIRECTORY_INDEX as usize]
            .clone()
            .ok_or_else(|| Error::malformed("root directory is missing"))?;

        Ok(Self {
            base,
            table,
            block_size,
            root,
            directory_slots,
            file_slots,
            directories,
            files,
            directory_paths,
            file_paths,
            logger,
        })
    }

    pub fn table(&self) -> &Arc<AllocationTable> {
        &self.table
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn root(&self) -> &DirectoryEntry {
        &self.root
    }

    pub fn directory(&self, index: u32) -> Option<&DirectoryEntry> {
        self.directory_slots.get(index as usize)?.as_ref()
    }

    pub fn file(&self, index: u32) -> Option<&FileEntry> {
        self.file_slots.get(index as usize)?.as_ref()
    }

    /// Live directories in allocation order
    pub fn directories(&self) -> impl Iterator<Item = &DirectoryEntry> + '_ {
        self.directories
            .iter()
            .filter_map(move |&index| self.directory(index))
    }

    /// Live files in allocation order
    pub fn files(&self) -> impl Iterator<Item = &FileEntry> + '_ {
        self.files.iter().filter_map(move |&index| self.file(index))
    }

    /// Subdirectories of `dir`, following sibling links
    pub fn child_directories<'a>(
        &'a self,
        dir: &DirectoryEntry,
    ) -> impl Iterator<Item = &'a DirectoryEntry> + 'a {
        let limit = self.directory_slots.len();
        let mut next = dir.first_child;
        std::iter::from_fn(move || {
            let child = self.directory(next?)?;
            next = child.info.next_sibling;
            Some(child)
        })
        .take(limit)
    }

    /// Files directly in `dir`, following sibling links
    pub fn child_files<'a>(&'a self, dir: &DirectoryEntry) -> impl Iterator<Item = &'a FileEntry> + 'a {
        let limit = self.file_slots.len();
        let mut next = dir.first_file;
        std::iter::from_fn(move || {
            let file = self.file(next?)?;
            next = file.info.next_sibling;
            Some(file)
        })
        .take(limit)
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.file_paths.contains_key(path)
    }

    pub fn entry(&self, path: &str) -> Option<Entry<'_>> {
        if let Some(&index) = self.file_paths.get(path) {
            return self.file(index).map(Entry::File);
        }
        self.directory_paths
            .get(path)
            .and_then(|&index| self.directory(index))
            .map(Entry::Directory)
    }

    pub fn open_file(&self, path: &str) -> Result<FileStorage> {
        let file = self
            .file_paths
            .get(path)
            .and_then(|&index| self.file(index))
            .ok_or_else(|| Error::NotFound {
                path: path.to_string(),
            })?;
        self.open_file_entry(file)
    }

    pub fn open_file_entry(&self, file: &FileEntry) -> Result<FileStorage> {
        let initial_block = match u32::try_from(file.block_index) {
            Ok(block) => block,
            Err(_) => {
                slog::trace!(self.logger, "Opened empty file"; "path" => &file.info.full_path);
                return Ok(FileStorage::Empty(EmptyStorage));
            }
        };
        let storage = AllocationTableStorage::new(
            self.base.clone(),
            self.table.clone(),
            self.block_size,
            initial_block,
            file.file_size,
        )?;
        Ok(FileStorage::Chain(storage))
    }

    /// Rebuild the full path of `entry` from its parent links
    pub fn resolve_path(&self, entry: Entry<'_>) -> Result<String> {
        entry_path(&self.directory_slots, entry)
    }
}

#[derive(Debug, Copy, Clone)]
struct Counts {
    directories: usize,
    files: usize,
}

/// Read every record of a table; the first field of record 0 holds the record count
fn read_table<S: Storage>(
    storage: &S,
    minimum: u32,
    what: &'static str,
) -> Result<Vec<repr::fs::Entry>> {
    let mut count_bytes = [0; 4];
    storage.read_at(0, &mut count_bytes)?;
    let raw_count = i32::from_le_bytes(count_bytes);
    let count = u32::try_from(raw_count)
        .ok()
        .filter(|&count| count >= minimum)
        .ok_or_else(|| Error::malformed(format!("{} has invalid record count {}", what, raw_count)))?;
    let len = u64::from(count) * ENTRY_SIZE as u64;
    if len > storage.size() {
        return Err(Error::malformed(format!(
            "{} of {} records doesn't fit in its {:#x} byte chain",
            what,
            count,
            storage.size()
        )));
    }
    let mut bytes = vec![0; len as usize];
    storage.read_at(0, &mut bytes)?;
    bytes
        .chunks_exact(ENTRY_SIZE)
        .map(|chunk| repr::read(chunk).ok_or_else(|| Error::malformed("truncated table record")))
        .collect()
}

/// Table indices of the live records, following `next_in_chain` from the chain head
fn live_indices(records: &[repr::fs::Entry], what: &str) -> Result<Vec<u32>> {
    let mut live = Vec::new();
    let mut next = records[CHAIN_HEAD_INDEX as usize].next_in_chain_index.get();
    while next != 0 {
        let index = u32::try_from(next)
            .ok()
            .filter(|&index| index > CHAIN_HEAD_INDEX && (index as usize) < records.len())
            .ok_or_else(|| Error::malformed(format!("{} chain has invalid index {}", what, next)))?;
        if live.len() >= records.len() {
            return Err(Error::malformed(format!("{} chain does not terminate", what)));
        }
        live.push(index);
        next = records[index as usize].next_in_chain_index.get();
    }
    Ok(live)
}

fn link(value: i64, count: usize, what: &str) -> Result<Option<u32>> {
    if value == 0 {
        return Ok(None);
    }
    u32::try_from(value)
        .ok()
        .filter(|&index| (index as usize) < count)
        .map(Some)
        .ok_or_else(|| Error::malformed(format!("{} index {} is out of range", what, value)))
}

fn entry_info(
    index: u32,
    record: &repr::fs::Entry,
    own_count: usize,
    counts: Counts,
    is_dir: bool,
) -> Result<EntryInfo> {
    let parent_dir = if is_dir && index == ROOT_DIRECTORY_INDEX {
        None
    } else {
        let parent = link(
            record.parent_dir_index.get().into(),
            counts.directories,
            "parent directory",
        )?;
        if parent.is_none() {
            return Err(Error::malformed(format!("entry {} has no parent", index)));
        }
        parent
    };
    Ok(EntryInfo {
        index,
        parent_dir,
        name: record.name_bytes().to_str_lossy().into_owned(),
        next_sibling: link(record.next_sibling_index.get().into(), own_count, "sibling")?,
        next_in_chain: link(record.next_in_chain_index.get().into(), own_count, "chain")?,
        full_path: String::new(),
    })
}

/// Join the names from the root down to `entry` with `/`
fn entry_path(directories: &[Option<DirectoryEntry>], entry: Entry<'_>) -> Result<String> {
    let info = entry.info();
    if entry.is_dir() && info.index == ROOT_DIRECTORY_INDEX {
        return Ok("/".to_string());
    }
    let mut names = vec![info.name.as_str()];
    let mut current = info.parent_dir;
    loop {
        let index = current.ok_or_else(|| {
            Error::malformed(format!("{:?} is not reachable from the root", info.name))
        })?;
        if index == ROOT_DIRECTORY_INDEX {
            break;
        }
        if names.len() > directories.len() {
            return Err(Error::malformed(format!(
                "parent directories of {:?} form a cycle",
                info.name
            )));
        }
        let dir = directories
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                Error::malformed(format!(
                    "{:?} has parent {} which is not a live directory",
                    info.name, index
                ))
            })?;
        names.push(&dir.info.name);
        current = dir.info.parent_dir;
    }
    let mut path = String::new();
    for name in names.iter().rev() {
        path.push('/');
        path.push_str(name);
    }
    Ok(path)
}
