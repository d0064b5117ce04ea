use savefs::config::{IntegrityCheckLevel, OpenOptions, Validity};
use savefs::integrity::{IntegrityInput, IntegrityLayer, Validator, VerifiedStorage};
use savefs::storage::{read_all, MemoryStorage, SharedStorage, Storage};
use savefs::{Error, MacKey, Progress, Result, Savefile};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;

/// A complete container, built region by region
///
/// ```text
/// 0x0000  header
/// 0x4000  data remap entries
/// 0x4100  metadata remap entries
/// 0x5000  data remap area (0x1100 bytes)
/// ```
mod image {
    use sha2::{Digest, Sha256};

    pub const SIZE: usize = 0x6100;
    const ENTRY_TABLE_DATA: usize = 0x4000;
    const ENTRY_TABLE_META: usize = 0x4100;
    const DATA_AREA: usize = 0x5000;
    const DATA_AREA_SIZE: usize = 0x1100;

    // data remap virtual layout
    const L1_A: usize = 0x0;
    const L1_B: usize = 0x40;
    const L1_SIZE: usize = 0x40;
    const DATA_A: usize = 0x100;
    const DATA_B: usize = 0x500;
    const DATA_SIZE: usize = 0x400;
    const JOURNAL_DATA: usize = 0x900;
    const JOURNAL_DATA_SIZE: usize = 0x800;

    // inside the header
    pub const MASTER_HASH: usize = 0x1000;
    const MASTER_A: usize = 0x1100;
    const MASTER_B: usize = 0x1110;

    // metadata remap virtual layout
    const JOURNAL_TABLE: usize = 0x0;
    const IVFC_L1: usize = 0x60;
    const FAT: usize = 0xF0;

    /// Data blocks 2, 3 and 8 are read from mirror B
    const DATA_BITMAP: u32 = 0x3080_0000;
    /// One entry carries the flag bit
    const JOURNAL_MAP: [u32; 4] = [2, 0x8000_0000, 3, 1];
    const JOURNAL_BLOCK_SIZE: usize = 0x200;
    const FS_BLOCK_SIZE: usize = 0x100;

    pub const SAVE_DAT_SIZE: usize = 0x150;
    pub const TITLE_ID: u64 = 0x0100_0000_0000_ABCD;

    pub fn save_dat() -> Vec<u8> {
        (0..SAVE_DAT_SIZE).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn layout_field(image: &mut [u8], index: usize, value: usize) {
        put(image, 0x128 + index * 8, &(value as i64).to_le_bytes());
    }

    /// Data remap: virtual 0..0x900 lives at 0x800 of the area, the rest at 0
    fn write_data(image: &mut [u8], offset: usize, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            let v = offset + i;
            let physical = if v < 0x900 { 0x800 + v } else { v - 0x900 };
            image[DATA_AREA + physical] = b;
        }
    }

    /// Metadata remap: virtual 0..0x100 lives at 0x200 of the duplex data, the rest at 0
    fn write_meta(image: &mut [u8], offset: usize, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            let v = offset + i;
            let duplex = if v < 0x100 { 0x200 + v } else { v - 0x100 };
            let from_b = DATA_BITMAP & (0x8000_0000 >> (duplex / 0x40)) != 0;
            let mirror = if from_b { DATA_B } else { DATA_A };
            write_data(image, mirror + duplex, &[b]);
        }
    }

    fn write_journal(image: &mut [u8], offset: usize, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            let logical = offset + i;
            let physical =
                (JOURNAL_MAP[logical / JOURNAL_BLOCK_SIZE] & 0x7FFF_FFFF) as usize;
            write_data(
                image,
                JOURNAL_DATA + physical * JOURNAL_BLOCK_SIZE + logical % JOURNAL_BLOCK_SIZE,
                &[b],
            );
        }
    }

    fn record(
        parent: i32,
        name: &str,
        next_sibling: i32,
        field_48: i32,
        field_4c: i64,
        next_in_chain: i32,
    ) -> Vec<u8> {
        let mut record = vec![0; 0x60];
        put(&mut record, 0, &parent.to_le_bytes());
        put(&mut record, 4, name.as_bytes());
        put(&mut record, 0x44, &next_sibling.to_le_bytes());
        put(&mut record, 0x48, &field_48.to_le_bytes());
        put(&mut record, 0x4C, &field_4c.to_le_bytes());
        put(&mut record, 0x5C, &next_in_chain.to_le_bytes());
        record
    }

    fn table(count: i32, records: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = record(count, "", 0, 0, 0, 0);
        for r in records {
            bytes.extend_from_slice(r);
        }
        bytes
    }

    pub fn rehash(image: &mut [u8]) {
        let hash = Sha256::digest(&image[0x300..0x4000]);
        put(image, 0x108, &hash);
    }

    pub fn build() -> Vec<u8> {
        let mut image = vec![0; SIZE];

        // layout table
        put(&mut image, 0x100, b"DISF");
        let fields = [
            ENTRY_TABLE_DATA,
            0x40,
            ENTRY_TABLE_META,
            0x40,
            DATA_AREA,
            DATA_AREA_SIZE,
            L1_A,
            L1_B,
            L1_SIZE,
            DATA_A,
            DATA_B,
            DATA_SIZE,
            JOURNAL_DATA,
            JOURNAL_DATA_SIZE,
            JOURNAL_DATA_SIZE,
            0,
            MASTER_A,
            MASTER_B,
            4,
            MASTER_HASH,
            MASTER_HASH + 0x20,
            0x20,
            JOURNAL_TABLE,
            0x20,
            0x20,
            0x10,
            0x30,
            0x10,
            0x40,
            0x10,
            IVFC_L1,
            0x20,
            0x80,
            0x20,
            0xA0,
            0x20,
            FAT,
            0x40,
        ];
        for (index, &value) in fields.iter().enumerate() {
            layout_field(&mut image, index, value);
        }
        // duplex index: master B is current
        image[0x128 + 38 * 8] = 1;

        put(&mut image, 0x300, b"DPFS");
        put(&mut image, 0x308 + 20 + 16, &4u32.to_le_bytes());
        put(&mut image, 0x308 + 40 + 16, &6u32.to_le_bytes());

        put(&mut image, 0x344, b"IVFC");
        put(&mut image, 0x34C, &0x20u32.to_le_bytes());
        put(&mut image, 0x350, &4u32.to_le_bytes());

        put(&mut image, 0x408, b"JNGL");
        put(&mut image, 0x420, &(JOURNAL_BLOCK_SIZE as i64).to_le_bytes());
        put(&mut image, 0x42C, &4u32.to_le_bytes());

        put(&mut image, 0x608, b"SAVE");
        put(&mut image, 0x618, &(FS_BLOCK_SIZE as i64).to_le_bytes());
        put(&mut image, 0x620, &(FS_BLOCK_SIZE as i64).to_le_bytes());
        put(&mut image, 0x648, &0i32.to_le_bytes());
        put(&mut image, 0x64C, &2i32.to_le_bytes());

        for &remap in &[0x650, 0x690] {
            put(&mut image, remap, b"RMAP");
            put(&mut image, remap + 8, &2i32.to_le_bytes());
            put(&mut image, remap + 12, &1i32.to_le_bytes());
            put(&mut image, remap + 16, &2i32.to_le_bytes());
        }

        put(&mut image, 0x6D8, &TITLE_ID.to_le_bytes());
        put(&mut image, 0x6F0, &7u64.to_le_bytes());
        put(&mut image, 0x720, &1_600_000_000i64.to_le_bytes());

        // master bitmaps: A would select every block of the second level from B
        put(&mut image, MASTER_A, &0xFFFF_FFFFu32.to_be_bytes());
        put(&mut image, MASTER_B, &0x4000_0000u32.to_be_bytes());
        let l1_hash = Sha256::digest(&[0u8; 0x20]);
        put(&mut image, MASTER_HASH, &l1_hash);

        // remap entry tables: virtual, physical, size
        let remap_entry = |v: usize, p: usize, size: usize| {
            let mut entry = Vec::new();
            for &x in &[v, p, size] {
                entry.extend_from_slice(&(x as i64).to_le_bytes());
            }
            entry.extend_from_slice(&[0; 8]);
            entry
        };
        put(&mut image, ENTRY_TABLE_DATA, &remap_entry(0, 0x800, 0x900));
        put(&mut image, ENTRY_TABLE_DATA + 0x20, &remap_entry(0x900, 0, 0x800));
        put(&mut image, ENTRY_TABLE_META, &remap_entry(0, 0x200, 0x100));
        put(&mut image, ENTRY_TABLE_META + 0x20, &remap_entry(0x100, 0, 0x100));

        // duplex levels, the stale copy of every block filled with garbage
        write_data(&mut image, L1_A, &[0xEE; 2 * L1_SIZE]);
        write_data(&mut image, L1_A, &DATA_BITMAP.to_be_bytes());
        write_data(&mut image, DATA_A, &[0xEE; 2 * DATA_SIZE]);
        write_meta(&mut image, 0, &[0; 0x200]);

        // journal map
        let mut map = Vec::new();
        for &physical in &JOURNAL_MAP {
            map.extend_from_slice(&physical.to_le_bytes());
            map.extend_from_slice(&[0; 4]);
        }
        write_meta(&mut image, JOURNAL_TABLE, &map);

        // allocation table: directory table in blocks 0-1, file table in 2 then 3, save.dat in
        // 4 then 6
        let mut fat = Vec::new();
        let entries: [(i32, i32); 8] = [
            (0, 0),
            (i32::MIN, i32::MIN),
            (1, 2),
            (i32::MIN, 4),
            (3, 0),
            (i32::MIN, 7),
            (0, 0),
            (5, 0),
        ];
        for &(prev, next) in &entries {
            fat.extend_from_slice(&prev.to_le_bytes());
            fat.extend_from_slice(&next.to_le_bytes());
        }
        write_meta(&mut image, FAT, &fat);

        let directories = table(
            4,
            &[
                record(0, "", 0, 0, 0, 2),
                record(0, "", 0, 3, 3, 3),
                record(2, "sub", 0, 0, 2, 0),
            ],
        );
        write_journal(&mut image, 0, &directories);
        let files = table(
            4,
            &[
                record(0, "", 0, 0, 0, 2),
                record(3, "empty.bin", 0, -1, 0, 3),
                record(2, "save.dat", 0, 4, SAVE_DAT_SIZE as i64, 0),
            ],
        );
        write_journal(&mut image, 2 * FS_BLOCK_SIZE, &files);
        let contents = save_dat();
        write_journal(&mut image, 4 * FS_BLOCK_SIZE, &contents[..FS_BLOCK_SIZE]);
        write_journal(&mut image, 6 * FS_BLOCK_SIZE, &contents[FS_BLOCK_SIZE..]);

        rehash(&mut image);
        image
    }
}

fn strict() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.integrity_check_level(IntegrityCheckLevel::ErrorOnInvalid);
    options
}

fn open(image: Vec<u8>, options: &OpenOptions) -> Result<Savefile> {
    Savefile::new(Arc::new(MemoryStorage::new(image)), options)
}

/// Truncated SHA-256 standing in for AES-CMAC
struct TestKey;

impl MacKey for TestKey {
    fn cmac(&self, data: &[u8]) -> Option<[u8; 0x10]> {
        let mut mac = [0; 0x10];
        mac.copy_from_slice(&Sha256::digest(data)[..0x10]);
        Some(mac)
    }
}

#[derive(Default)]
struct Recorder {
    total: u64,
    done: u64,
    messages: Vec<String>,
}

impl Progress for Recorder {
    fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    fn report_add(&mut self, amount: u64) {
        self.done += amount;
    }

    fn log_message(&mut self, message: &str) {
        self.messages.push(message.to_string());
    }
}

#[test]
fn lists_tree() {
    let save = open(image::build(), &strict()).unwrap();
    assert_eq!(save.header_validity(), Validity::Valid);
    assert_eq!(save.signature_validity(), Validity::Unchecked);
    assert_eq!(save.extra_data().title_id, image::TITLE_ID);
    assert_eq!(save.header().layout.duplex_index, 1);

    let directories: Vec<_> = save
        .directories()
        .map(|dir| dir.info.full_path.clone())
        .collect();
    assert_eq!(directories, ["/", "/sub"]);
    let files: Vec<_> = save
        .files()
        .map(|file| file.info.full_path.clone())
        .collect();
    assert_eq!(files, ["/sub/empty.bin", "/save.dat"]);
    assert_eq!(save.root().first_file, Some(3));
}

#[test]
fn reads_files() {
    let save = open(image::build(), &strict()).unwrap();
    assert!(save.file_exists("/save.dat"));
    assert!(!save.file_exists("/save.bak"));

    assert_eq!(save.read_file("/save.dat").unwrap(), image::save_dat());
    assert!(save.read_file("/sub/empty.bin").unwrap().is_empty());

    let file = save.files().find(|f| f.info.name == "save.dat").unwrap();
    let storage = save.open_file_entry(file).unwrap();
    let mut buf = [0; 0x10];
    storage.read_at(0xF8, &mut buf).unwrap();
    assert_eq!(&buf[..], &image::save_dat()[0xF8..0x108]);

    assert!(matches!(
        save.open_file("/missing"),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn writes_go_through_the_journal() {
    let storage = Arc::new(MemoryStorage::new(image::build()));
    let save = Savefile::new(storage.clone(), &strict()).unwrap();
    let file = save.open_file("/save.dat").unwrap();
    file.write_at(0xFE, &[1, 2, 3, 4]).unwrap();

    let mut expected = image::save_dat();
    expected[0xFE..0x102].copy_from_slice(&[1, 2, 3, 4]);
    assert_eq!(save.read_file("/save.dat").unwrap(), expected);

    let reopened = Savefile::new(storage, &strict()).unwrap();
    assert_eq!(reopened.read_file("/save.dat").unwrap(), expected);
}

#[test]
fn master_bitmap_follows_duplex_index() {
    let mut image = image::build();
    // selects master A, which points every level at the stale copies
    image[0x128 + 38 * 8] = 0;
    assert!(open(image, &strict()).is_err());
}

#[test]
fn verify_reports_levels() {
    let save = open(image::build(), &strict()).unwrap();
    let mut recorder = Recorder::default();
    let report = save.verify(&mut recorder).unwrap();
    assert_eq!(report.header, Validity::Valid);
    assert_eq!(report.signature, Validity::Unchecked);
    assert_eq!(report.levels, [Validity::Unchecked; 4]);
    assert!(report.is_valid());
}

#[test]
fn corrupt_header_hash() {
    let mut image = image::build();
    image[0x3000] ^= 1;

    assert!(matches!(
        open(image.clone(), &strict()),
        Err(Error::Integrity { .. })
    ));

    let mut warn = OpenOptions::new();
    warn.integrity_check_level(IntegrityCheckLevel::WarnOnInvalid);
    let save = open(image.clone(), &warn).unwrap();
    assert_eq!(save.header_validity(), Validity::Invalid);
    assert!(!save.verify(&mut ()).unwrap().is_valid());

    let save = open(image, &OpenOptions::new()).unwrap();
    assert_eq!(save.header_validity(), Validity::Invalid);
    assert_eq!(save.read_file("/save.dat").unwrap(), image::save_dat());
}

#[test]
fn commit_header_signs() {
    let mut image = image::build();
    image[0x3000] ^= 1;
    let storage = Arc::new(MemoryStorage::new(image));

    let mut save = Savefile::new(storage.clone(), &OpenOptions::new()).unwrap();
    assert!(!save.commit_header(&savefs::NoKey).unwrap());
    assert_eq!(save.header_validity(), Validity::Valid);
    assert_eq!(save.signature_validity(), Validity::Unchecked);

    assert!(save.commit_header(&TestKey).unwrap());
    assert_eq!(save.signature_validity(), Validity::Valid);

    let mut options = strict();
    options.key(Arc::new(TestKey));
    let save = Savefile::new(storage.clone(), &options).unwrap();
    assert_eq!(save.header_validity(), Validity::Valid);
    assert_eq!(save.signature_validity(), Validity::Valid);

    // a bad signature is caught once a key is available
    let mut data = storage.to_vec();
    data[0] ^= 1;
    assert!(matches!(
        open(data, &options),
        Err(Error::Integrity { .. })
    ));
}

#[test]
fn extracts_everything() {
    let save = open(image::build(), &strict()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = Recorder::default();

    let count = save.extract_all(dir.path(), &mut recorder).unwrap();
    assert_eq!(count, 2);
    assert_eq!(recorder.total, image::SAVE_DAT_SIZE as u64);
    assert_eq!(recorder.done, recorder.total);
    assert_eq!(recorder.messages, ["/sub/empty.bin", "/save.dat"]);

    assert_eq!(
        std::fs::read(dir.path().join("save.dat")).unwrap(),
        image::save_dat()
    );
    assert!(std::fs::read(dir.path().join("sub/empty.bin"))
        .unwrap()
        .is_empty());
}

#[test]
fn opens_image_file_with_logger() {
    use sloggers::terminal::{Destination, TerminalLoggerBuilder};
    use sloggers::types::Severity;
    use sloggers::Build;

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    let logger = builder.build().unwrap();

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&image::build()).unwrap();
    tmp.flush().unwrap();

    let save = Savefile::open_with_logger(tmp.path(), &strict(), logger.clone()).unwrap();
    assert_eq!(save.read_file("/save.dat").unwrap(), image::save_dat());
    assert!(matches!(
        save.open_file("/save.dat").unwrap().write_at(0, &[0]),
        Err(Error::Unsupported { .. })
    ));
    drop(save);

    let mut options = strict();
    options.writable(true);
    let mut save = Savefile::open_with_logger(tmp.path(), &options, logger).unwrap();
    assert!(save.commit_header(&TestKey).unwrap());
    drop(save);

    options.key(Arc::new(TestKey));
    let save = Savefile::open(tmp.path(), &options).unwrap();
    assert_eq!(save.signature_validity(), Validity::Valid);
}

/// Checks the first hash level against the master hash
struct FirstLevelCheck;

struct FirstLevelValidator {
    level: SharedStorage,
    master_hash: Vec<u8>,
    levels: usize,
}

impl Validator for FirstLevelValidator {
    fn validate(&self, progress: &mut dyn Progress) -> Result<Vec<Validity>> {
        progress.set_total(self.levels as u64);
        let hash = Sha256::digest(&read_all(&self.level)?);
        let mut levels = vec![Validity::Unchecked; self.levels];
        levels[0] = Validity::from_match(hash[..] == self.master_hash[..]);
        progress.report_add(1);
        Ok(levels)
    }
}

impl IntegrityLayer for FirstLevelCheck {
    fn open(&self, input: IntegrityInput) -> Result<VerifiedStorage> {
        assert_eq!(input.hash_levels.len(), 3);
        assert_eq!(input.level_info.len(), 4);
        assert_eq!(input.check_level, IntegrityCheckLevel::ErrorOnInvalid);
        let levels = input.level_count();
        Ok(VerifiedStorage {
            validator: Box::new(FirstLevelValidator {
                level: input.hash_levels[0].clone(),
                master_hash: input.master_hash,
                levels,
            }),
            data: input.data,
        })
    }
}

#[test]
fn custom_integrity_layer() {
    let mut options = strict();
    options.integrity_layer(Arc::new(FirstLevelCheck));

    let save = open(image::build(), &options).unwrap();
    let mut recorder = Recorder::default();
    let report = save.verify(&mut recorder).unwrap();
    assert_eq!(report.levels[0], Validity::Valid);
    assert!(report.is_valid());
    assert_eq!(recorder.done, 1);

    let mut image = image::build();
    image[image::MASTER_HASH] ^= 1;
    image::rehash(&mut image);
    let save = open(image, &options).unwrap();
    let report = save.verify(&mut ()).unwrap();
    assert_eq!(report.levels[0], Validity::Invalid);
    assert!(!report.is_valid());
}
