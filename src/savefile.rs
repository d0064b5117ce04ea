use crate::config::{IntegrityCheckLevel, OpenOptions, Validity};
use crate::duplex::{DuplexLayer, HierarchicalDuplexStorage};
use crate::errors::{Error, Result};
use crate::header::{compute_layout_hash, ExtraData, Header};
use crate::integrity::{IntegrityInput, Validator};
use crate::journal::{JournalBitmaps, JournalMap, JournalStorage};
use crate::keys::MacKey;
use crate::progress::Progress;
use crate::remap::RemapStorage;
use crate::save_fs::{DirectoryEntry, FileEntry, FileStorage, SaveFs};
use crate::storage::{read_all, ImageFile, SharedStorage, Storage, StorageReader, SubStorage};
use slog::{Drain, Logger};
use std::convert::TryFrom;
use std::fs;
use std::io;
use std::path::{Component, Path};
use std::sync::Arc;

pub(crate) fn default_logger() -> Logger {
    slog::Logger::root(slog_stdlog::StdLog.fuse(), slog::o!())
}

/// An opened save data container
pub struct Savefile {
    base: SharedStorage,
    header: Header,
    header_validity: Validity,
    signature_validity: Validity,
    journal: SharedStorage,
    validator: Box<dyn Validator>,
    fs: SaveFs,
    check_level: IntegrityCheckLevel,
    logger: Logger,
}

/// Results of [`Savefile::verify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Layout hash of the header
    pub header: Validity,
    /// CMAC of the header
    pub signature: Validity,
    /// One entry per hash tree level, the data level last
    pub levels: Vec<Validity>,
}

impl VerifyReport {
    /// True if nothing checked came out invalid
    pub fn is_valid(&self) -> bool {
        std::iter::once(&self.header)
            .chain(Some(&self.signature))
            .chain(&self.levels)
            .all(|&validity| validity != Validity::Invalid)
    }
}

impl Savefile {
    pub fn open<P: AsRef<Path>>(path: P, options: &OpenOptions) -> Result<Self> {
        Self::open_with_logger(path, options, default_logger())
    }

    pub fn open_with_logger<P: AsRef<Path>>(
        path: P,
        options: &OpenOptions,
        logger: Logger,
    ) -> Result<Self> {
        Self::_open_with_logger(path.as_ref(), options, logger)
    }

    fn _open_with_logger(path: &Path, options: &OpenOptions, logger: Logger) -> Result<Self> {
        let path_str = path.display().to_string();
        let logger = logger.new(slog::o!("file" => path_str));
        let image = if options.writable {
            ImageFile::open_writable(path)?
        } else {
            ImageFile::open(path)?
        };
        Self::with_logger(Arc::new(image), options, logger)
    }

    pub fn new(storage: SharedStorage, options: &OpenOptions) -> Result<Self> {
        Self::with_logger(storage, options, default_logger())
    }

    pub fn with_logger(base: SharedStorage, options: &OpenOptions, logger: Logger) -> Result<Self> {
        let header_size = repr::header::SIZE;
        if base.size() < header_size as u64 {
            return Err(Error::malformed(format!(
                "image is {:#x} bytes, smaller than its header",
                base.size()
            )));
        }
        let mut header_bytes = vec![0; header_size];
        base.read_at(0, &mut header_bytes)?;
        let header = Header::parse(header_bytes)?;
        log_header(&logger, &header);

        let check_level = options.integrity_check_level;
        let header_validity = Validity::from_match(header.is_layout_hash_valid());
        check_validity(&logger, check_level, "header hash", header_validity)?;
        let signature_validity = match options.key.cmac(header.signed_region()) {
            Some(mac) => Validity::from_match(mac[..] == *header.cmac()),
            None => Validity::Unchecked,
        };
        check_validity(&logger, check_level, "header signature", signature_validity)?;

        let layout = &header.layout;
        let data_remap: SharedStorage = {
            let entries = slice(&base, layout.file_map_entry_offset, layout.file_map_entry_size)?;
            let data = slice(&base, layout.file_map_data_offset, layout.file_map_data_size)?;
            let remap = RemapStorage::load(data, header.data_remap, &entries)?;
            slog::debug!(logger, "Loaded data remap";
                "entries" => remap.entries().len(),
                "segments" => remap.segments().len(),
                "size" => remap.size()
            );
            Arc::new(remap)
        };

        let duplex: SharedStorage = {
            let use_master_b = layout.duplex_index == 1;
            let master = header.duplex_master(use_master_b)?;
            let [_, l1, data] = header.duplex.layers;
            let layers = vec![
                DuplexLayer {
                    data_a: slice(&data_remap, layout.duplex_l1_offset_a, layout.duplex_l1_size)?,
                    data_b: slice(&data_remap, layout.duplex_l1_offset_b, layout.duplex_l1_size)?,
                    block_size: l1.block_size()?,
                },
                DuplexLayer {
                    data_a: slice(
                        &data_remap,
                        layout.duplex_data_offset_a,
                        layout.duplex_data_size,
                    )?,
                    data_b: slice(
                        &data_remap,
                        layout.duplex_data_offset_b,
                        layout.duplex_data_size,
                    )?,
                    block_size: data.block_size()?,
                },
            ];
            let duplex = HierarchicalDuplexStorage::new(master, layers)?;
            slog::debug!(logger, "Loaded duplex storage";
                "master_b" => use_master_b,
                "l1_block_size" => duplex.layers()[0].block_size(),
                "data_block_size" => duplex.layers()[1].block_size(),
                "size" => duplex.size()
            );
            Arc::new(duplex)
        };

        let meta_remap: SharedStorage = {
            let entries = slice(&base, layout.meta_map_entry_offset, layout.meta_map_entry_size)?;
            let remap = RemapStorage::load(duplex, header.meta_remap, &entries)?;
            slog::debug!(logger, "Loaded metadata remap";
                "entries" => remap.entries().len(),
                "segments" => remap.segments().len(),
                "size" => remap.size()
            );
            Arc::new(remap)
        };

        let journal: SharedStorage = {
            let table = slice(
                &meta_remap,
                layout.journal_map_table_offset,
                layout.journal_map_table_size,
            )?;
            let bitmaps = JournalBitmaps::load(
                &slice(
                    &meta_remap,
                    layout.journal_physical_bitmap_offset,
                    layout.journal_physical_bitmap_size,
                )?,
                &slice(
                    &meta_remap,
                    layout.journal_virtual_bitmap_offset,
                    layout.journal_virtual_bitmap_size,
                )?,
                &slice(
                    &meta_remap,
                    layout.journal_free_bitmap_offset,
                    layout.journal_free_bitmap_size,
                )?,
            )?;
            let map = JournalMap::load(header.journal_map, &table, bitmaps)?;
            let data_size = layout
                .journal_data_size_b
                .checked_add(layout.size_reserved_area)
                .ok_or_else(|| Error::malformed("journal data size overflows"))?;
            let data = slice(&data_remap, layout.journal_data_offset, data_size)?;
            let block_size = u32::try_from(header.journal.block_size).map_err(|_| {
                Error::malformed(format!(
                    "journal block size {} is too large",
                    header.journal.block_size
                ))
            })?;
            let journal = JournalStorage::new(data, map, block_size)?;
            slog::debug!(logger, "Loaded journal";
                "blocks" => journal.map().entries().len(),
                "block_size" => block_size,
                "journal_blocks" => header.journal_map.journal_block_count
            );
            Arc::new(journal)
        };

        let verified = options.integrity_layer.open(IntegrityInput {
            master_hash: header.master_hash()?.to_vec(),
            hash_levels: vec![
                slice(&meta_remap, layout.ivfc_l1_offset, layout.ivfc_l1_size)?,
                slice(&meta_remap, layout.ivfc_l2_offset, layout.ivfc_l2_size)?,
                slice(&meta_remap, layout.ivfc_l3_offset, layout.ivfc_l3_size)?,
            ],
            data: journal.clone(),
            level_info: header.ivfc.levels.clone(),
            salt_source: header.ivfc.salt_source,
            check_level,
        })?;

        let fat = slice(&meta_remap, layout.fat_offset, layout.fat_size)?;
        let fs = SaveFs::open_with_logger(verified.data, &fat, &header.fat, logger.clone())?;

        Ok(Self {
            base,
            header,
            header_validity,
            signature_validity,
            journal,
            validator: verified.validator,
            fs,
            check_level,
            logger,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn extra_data(&self) -> &ExtraData {
        &self.header.extra_data
    }

    pub fn header_validity(&self) -> Validity {
        self.header_validity
    }

    pub fn signature_validity(&self) -> Validity {
        self.signature_validity
    }

    /// The journaled storage, below the integrity layer
    pub fn journal_storage(&self) -> &SharedStorage {
        &self.journal
    }

    pub fn fs(&self) -> &SaveFs {
        &self.fs
    }

    pub fn files(&self) -> impl Iterator<Item = &FileEntry> + '_ {
        self.fs.files()
    }

    pub fn directories(&self) -> impl Iterator<Item = &DirectoryEntry> + '_ {
        self.fs.directories()
    }

    pub fn root(&self) -> &DirectoryEntry {
        self.fs.root()
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.fs.file_exists(path)
    }

    pub fn open_file(&self, path: &str) -> Result<FileStorage> {
        self.fs.open_file(path)
    }

    pub fn open_file_entry(&self, file: &FileEntry) -> Result<FileStorage> {
        self.fs.open_file_entry(file)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        read_all(&self.open_file(path)?)
    }

    /// Check the header and every hash tree level
    ///
    /// Invalid results are reported, not returned as errors.
    pub fn verify(&self, progress: &mut dyn Progress) -> Result<VerifyReport> {
        let levels = self.validator.validate(progress)?;
        let report = VerifyReport {
            header: self.header_validity,
            signature: self.signature_validity,
            levels,
        };
        if !report.is_valid() && self.check_level != IntegrityCheckLevel::None {
            slog::warn!(self.logger, "Verification found invalid data"; "report" => ?report);
        }
        Ok(report)
    }

    /// Write every directory and file to `output`, returning the number of files written
    pub fn extract_all<P: AsRef<Path>>(&self, output: P, progress: &mut dyn Progress) -> Result<usize> {
        let output = output.as_ref();
        let total = self.files().map(|file| file.file_size).sum::<u64>();
        progress.set_total(total);
        fs::create_dir_all(output)?;

        for dir in self.directories() {
            let relative = relative_path(&dir.info.full_path)?;
            fs::create_dir_all(output.join(relative))?;
        }

        let mut count = 0;
        for file in self.files() {
            let relative = relative_path(&file.info.full_path)?;
            let destination = output.join(relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            progress.log_message(&file.info.full_path);
            let mut reader = StorageReader::new(self.open_file_entry(file)?);
            let mut out = fs::File::create(&destination)?;
            io::copy(&mut reader, &mut out)?;
            progress.report_add(file.file_size);
            slog::trace!(self.logger, "Extracted file";
                "path" => &file.info.full_path,
                "size" => file.file_size
            );
            count += 1;
        }
        slog::info!(self.logger, "Extracted files"; "count" => count, "bytes" => total);
        Ok(count)
    }

    /// Recompute the layout hash and, if `key` can produce one, the header CMAC
    ///
    /// Returns whether the header was signed. The image must be writable.
    pub fn commit_header(&mut self, key: &dyn MacKey) -> Result<bool> {
        use repr::header::{CMAC_OFFSET, CMAC_SIZE, LAYOUT_HASH_OFFSET, LAYOUT_OFFSET, LAYOUT_SIZE};

        let mut bytes = self.header.data().to_vec();
        let hash = compute_layout_hash(&bytes);
        bytes[LAYOUT_HASH_OFFSET..LAYOUT_HASH_OFFSET + hash.len()].copy_from_slice(&hash);
        let mac = key.cmac(&bytes[LAYOUT_OFFSET..LAYOUT_OFFSET + LAYOUT_SIZE]);
        if let Some(mac) = &mac {
            bytes[CMAC_OFFSET..CMAC_OFFSET + CMAC_SIZE].copy_from_slice(mac);
        }

        self.base.write_at(0, &bytes)?;
        self.base.flush()?;
        self.header = Header::parse(bytes)?;
        self.header_validity = Validity::Valid;
        self.signature_validity = if mac.is_some() {
            Validity::Valid
        } else {
            Validity::Unchecked
        };
        slog::info!(self.logger, "Committed header"; "signed" => mac.is_some());
        Ok(mac.is_some())
    }
}

fn slice(storage: &SharedStorage, offset: u64, size: u64) -> Result<SharedStorage> {
    Ok(Arc::new(SubStorage::new(storage.clone(), offset, size)?))
}

fn check_validity(
    logger: &Logger,
    level: IntegrityCheckLevel,
    what: &str,
    validity: Validity,
) -> Result<()> {
    if validity != Validity::Invalid {
        return Ok(());
    }
    match level {
        IntegrityCheckLevel::None => Ok(()),
        IntegrityCheckLevel::WarnOnInvalid => {
            slog::warn!(logger, "Invalid {}", what);
            Ok(())
        }
        IntegrityCheckLevel::ErrorOnInvalid => Err(Error::Integrity {
            what: format!("invalid {}", what),
        }),
    }
}

/// `full_path` without its leading `/`, refusing anything that would leave the output directory
fn relative_path(full_path: &str) -> Result<&Path> {
    let relative = Path::new(full_path.trim_start_matches('/'));
    if relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        Ok(relative)
    } else {
        Err(Error::malformed(format!(
            "refusing to extract {:?} outside the output directory",
            full_path
        )))
    }
}

fn log_header(logger: &Logger, header: &Header) {
    let layout = &header.layout;
    let extra = &header.extra_data;
    slog::debug!(logger, "Read header";
        "layout_version" => layout.version,
        "duplex_index" => layout.duplex_index,
        "file_map_data_size" => layout.file_map_data_size,
        "duplex_data_size" => layout.duplex_data_size,
        "journal_data_size" => layout.journal_data_size_b,
        "journal_block_size" => header.journal.block_size,
        "journal_blocks" => header.journal_map.main_data_block_count,
        "save_block_size" => header.save.block_size,
        "fat_block_size" => header.fat.block_size,
        "directory_table_block" => header.fat.directory_table_block,
        "file_table_block" => header.fat.file_table_block,
        "data_remap_entries" => header.data_remap.map_entry_count,
        "meta_remap_entries" => header.meta_remap.map_entry_count,
        "ivfc_levels" => header.ivfc.levels.len(),
        "title_id" => format!("{:016x}", extra.title_id),
        "save_id" => format!("{:016x}", extra.save_id),
        "flags" => ?extra.flags,
        "timestamp" => ?extra.modified_time()
    )
}
