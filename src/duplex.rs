//! A/B mirrored storage
//!
//! A duplex storage holds two copies of its data. A bitmap with one bit per block says which copy
//! is current: a set bit selects mirror B. Bitmaps are stored as big endian 32 bit words, most
//! significant bit first.
//!
//! The bitmaps are themselves duplexed: the hierarchy starts at a master bitmap stored in the
//! header, which selects the blocks of the next level's bitmap, and so on down to the data.

use crate::errors::{Error, Result};
use crate::storage::{check_range, Storage};
use byteorder::{BigEndian, ByteOrder};
use std::convert::TryFrom;

/// Number of `block_size` blocks needed to cover `size` bytes
fn block_count(size: u64, block_size: u32) -> u64 {
    let block_size = u64::from(block_size);
    (size + block_size - 1) / block_size
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplexBitmap {
    words: Vec<u32>,
    len: u64,
}

impl DuplexBitmap {
    /// Decode a bitmap of `len` bits from the start of `bytes`
    pub fn from_bytes(bytes: &[u8], len: u64) -> Result<Self> {
        let word_count = usize::try_from((len + 31) / 32)
            .map_err(|_| Error::malformed("duplex bitmap is too large"))?;
        if bytes.len() / 4 < word_count {
            return Err(Error::malformed(format!(
                "duplex bitmap of {} bits needs {:#x} bytes, only {:#x} available",
                len,
                word_count * 4,
                bytes.len()
            )));
        }
        let mut words = vec![0; word_count];
        BigEndian::read_u32_into(&bytes[..word_count * 4], &mut words);
        Ok(Self { words, len })
    }

    /// Read a bitmap of `len` bits from the start of `source`
    pub fn load<S: ?Sized + Storage>(source: &S, len: u64) -> Result<Self> {
        let byte_len = (len + 31) / 32 * 4;
        if byte_len > source.size() {
            return Err(Error::malformed(format!(
                "duplex bitmap of {} bits needs {:#x} bytes, only {:#x} available",
                len,
                byte_len,
                source.size()
            )));
        }
        let mut bytes = vec![0; byte_len as usize];
        source.read_at(0, &mut bytes)?;
        Self::from_bytes(&bytes, len)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if block `index` is read from mirror B
    pub fn bit(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let word = self.words[(index / 32) as usize];
        word & (0x8000_0000 >> (index % 32)) != 0
    }
}

/// One level of a duplex hierarchy
#[derive(Debug)]
pub struct DuplexStorage<S> {
    bitmap: DuplexBitmap,
    data_a: S,
    data_b: S,
    block_size: u32,
    size: u64,
}

impl<S: Storage> DuplexStorage<S> {
    pub fn new(bitmap: DuplexBitmap, data_a: S, data_b: S, block_size: u32) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::malformed("duplex block size is zero"));
        }
        let size = data_a.size();
        if data_b.size() != size {
            return Err(Error::malformed(format!(
                "duplex mirrors differ in size: {:#x} and {:#x}",
                size,
                data_b.size()
            )));
        }
        let blocks = block_count(size, block_size);
        if bitmap.len() < blocks {
            return Err(Error::malformed(format!(
                "duplex bitmap covers {} blocks, data has {}",
                bitmap.len(),
                blocks
            )));
        }
        Ok(Self {
            bitmap,
            data_a,
            data_b,
            block_size,
            size,
        })
    }

    pub fn bitmap(&self) -> &DuplexBitmap {
        &self.bitmap
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}

impl<S: Storage> Storage for DuplexStorage<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.kind(), offset, buf.len(), self.size)?;
        let block_size = u64::from(self.block_size);
        let mut position = offset;
        let mut done = 0;
        while done < buf.len() {
            let block = position / block_size;
            let block_pos = position % block_size;
            let n = (block_size - block_pos).min((buf.len() - done) as u64) as usize;
            let mirror = if self.bitmap.bit(block) {
                &self.data_b
            } else {
                &self.data_a
            };
            mirror.read_at(position, &mut buf[done..done + n])?;
            done += n;
            position += n as u64;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn kind(&self) -> &'static str {
        "duplex storage"
    }
}

/// The two mirrors of one hierarchy level and the block size its bitmap describes
#[derive(Debug)]
pub struct DuplexLayer<S> {
    pub data_a: S,
    pub data_b: S,
    pub block_size: u32,
}

/// A chain of duplex storages, each selected by a bitmap read out of the level before it
///
/// Reads go to the last level.
#[derive(Debug)]
pub struct HierarchicalDuplexStorage<S> {
    layers: Vec<DuplexStorage<S>>,
}

impl<S: Storage> HierarchicalDuplexStorage<S> {
    /// Build the hierarchy from the authoritative master bitmap and the levels below it
    pub fn new(master_bitmap: &[u8], layers: Vec<DuplexLayer<S>>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::malformed("duplex hierarchy has no levels"));
        }
        let mut built: Vec<DuplexStorage<S>> = Vec::with_capacity(layers.len());
        for layer in layers {
            let blocks = block_count(layer.data_a.size(), layer.block_size.max(1));
            let bitmap = match built.last() {
                None => DuplexBitmap::from_bytes(master_bitmap, blocks)?,
                Some(previous) => DuplexBitmap::load(previous, blocks)?,
            };
            built.push(DuplexStorage::new(
                bitmap,
                layer.data_a,
                layer.data_b,
                layer.block_size,
            )?);
        }
        Ok(Self { layers: built })
    }

    pub fn layers(&self) -> &[DuplexStorage<S>] {
        &self.layers
    }

    fn data_layer(&self) -> &DuplexStorage<S> {
        // never empty once constructed
        &self.layers[self.layers.len() - 1]
    }
}

impl<S: Storage> Storage for HierarchicalDuplexStorage<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.data_layer().read_at(offset, buf)
    }

    fn size(&self) -> u64 {
        self.data_layer().size()
    }

    fn kind(&self) -> &'static str {
        "hierarchical duplex storage"
    }
}
