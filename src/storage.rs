use crate::errors::{Error, Result};
use parking_lot::{Mutex, RwLock};
use positioned_io::{RandomAccessFile, ReadAt, WriteAt};
use std::convert::TryFrom;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// A byte addressable storage
///
/// Reads and writes are exact: a request which can't be fully satisfied is an error. Every layer
/// of a container is a `Storage` stacked on top of another one.
pub trait Storage: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let _ = (offset, buf);
        Err(Error::Unsupported {
            storage: self.kind(),
            operation: "write",
        })
    }

    fn size(&self) -> u64;

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Short name used in error messages
    fn kind(&self) -> &'static str {
        "storage"
    }
}

pub type SharedStorage = Arc<dyn Storage>;

macro_rules! deref_storage {
    () => {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            (**self).read_at(offset, buf)
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            (**self).write_at(offset, buf)
        }

        fn size(&self) -> u64 {
            (**self).size()
        }

        fn flush(&self) -> Result<()> {
            (**self).flush()
        }

        fn kind(&self) -> &'static str {
            (**self).kind()
        }
    };
}

impl<S: ?Sized + Storage> Storage for &S {
    deref_storage!();
}

impl<S: ?Sized + Storage> Storage for Box<S> {
    deref_storage!();
}

impl<S: ?Sized + Storage> Storage for Arc<S> {
    deref_storage!();
}

pub(crate) fn check_range(storage: &'static str, offset: u64, len: usize, size: u64) -> Result<()> {
    let len = len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfRange {
            storage,
            offset,
            len,
        }),
    }
}

/// Read the whole storage into memory
pub fn read_all<S: ?Sized + Storage>(storage: &S) -> Result<Vec<u8>> {
    let len = usize::try_from(storage.size())
        .map_err(|_| Error::malformed("storage is too large to read into memory"))?;
    let mut buf = vec![0; len];
    storage.read_at(0, &mut buf)?;
    Ok(buf)
}

/// An in-memory, fixed size, writable storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl From<Vec<u8>> for MemoryStorage {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl Storage for MemoryStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        check_range(self.kind(), offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        check_range(self.kind(), offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn kind(&self) -> &'static str {
        "memory storage"
    }
}

/// A container image on the host filesystem
pub struct ImageFile {
    file: Mutex<RandomAccessFile>,
    size: u64,
    writable: bool,
}

impl ImageFile {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::_open(path.as_ref(), false)
    }

    pub fn open_writable<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::_open(path.as_ref(), true)
    }

    fn _open(path: &Path, writable: bool) -> io::Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let size = file.metadata()?.len();
        let file = RandomAccessFile::try_new(file)?;
        Ok(Self {
            file: Mutex::new(file),
            size,
            writable,
        })
    }
}

impl Storage for ImageFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.kind(), offset, buf.len(), self.size)?;
        self.file.lock().read_exact_at(offset, buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::Unsupported {
                storage: "read-only image file",
                operation: "write",
            });
        }
        check_range(self.kind(), offset, buf.len(), self.size)?;
        self.file.lock().write_all_at(offset, buf)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&self) -> Result<()> {
        if self.writable {
            self.file.lock().flush()?;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "image file"
    }
}

/// A window of `size` bytes starting at `offset` of a base storage
#[derive(Debug, Clone)]
pub struct SubStorage<S> {
    base: S,
    offset: u64,
    size: u64,
}

impl<S: Storage> SubStorage<S> {
    pub fn new(base: S, offset: u64, size: u64) -> Result<Self> {
        let end = offset.checked_add(size);
        if end.map_or(true, |end| end > base.size()) {
            return Err(Error::OutOfRange {
                storage: base.kind(),
                offset,
                len: size,
            });
        }
        Ok(Self { base, offset, size })
    }

    pub fn get_ref(&self) -> &S {
        &self.base
    }
}

impl<S: Storage> Storage for SubStorage<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.kind(), offset, buf.len(), self.size)?;
        self.base.read_at(self.offset + offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(self.kind(), offset, buf.len(), self.size)?;
        self.base.write_at(self.offset + offset, buf)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&self) -> Result<()> {
        self.base.flush()
    }

    fn kind(&self) -> &'static str {
        "sub storage"
    }
}

/// A zero length storage
#[derive(Debug, Copy, Clone, Default)]
pub struct EmptyStorage;

impl Storage for EmptyStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.kind(), offset, buf.len(), 0)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(self.kind(), offset, buf.len(), 0)
    }

    fn size(&self) -> u64 {
        0
    }

    fn kind(&self) -> &'static str {
        "empty storage"
    }
}

/// Adapts a storage to `io::Read` and `io::Seek`
#[derive(Debug)]
pub struct StorageReader<S> {
    storage: S,
    position: u64,
}

impl<S: Storage> StorageReader<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            position: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

impl<S: Storage> io::Read for StorageReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.storage.size().saturating_sub(self.position);
        let len = remaining.min(buf.len() as u64) as usize;
        if len == 0 {
            return Ok(0);
        }
        self.storage
            .read_at(self.position, &mut buf[..len])
            .map_err(into_io_error)?;
        self.position += len as u64;
        Ok(len)
    }
}

impl<S: Storage> io::Seek for StorageReader<S> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let new_position = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::End(delta) => offset_by(self.storage.size(), delta),
            io::SeekFrom::Current(delta) => offset_by(self.position, delta),
        };
        match new_position {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

fn offset_by(base: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}

fn into_io_error(e: Error) -> io::Error {
    match e {
        Error::Io { source } => source,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
