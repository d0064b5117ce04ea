//! A save data container is a fixed-size image made of several stacked storage layers. The
//! first 0x4000 bytes are a header describing every other region:
//!
//! * [Header](header/index.html): layout table, duplex, integrity, journal, save and remap
//!   headers, plus the extra data block
//! * [Remap Map Entries](remap/index.html): two tables mapping virtual ranges onto physical ones
//! * Duplex Layers: A/B mirrored data, selected per block by a bitmap
//! * [Journal Map](journal/index.html): logical to physical block indirection
//! * [Allocation Table](allocation_table/index.html): linked list of block runs
//! * [Directory and File Tables](fs/index.html): fixed size records forming the file tree
//!
//! All integers are stored little endian.

use std::fmt;
use zerocopy::byteorder::LittleEndian;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

pub mod allocation_table;
pub mod fs;
pub mod header;
pub mod journal;
pub mod remap;

pub type U32 = zerocopy::byteorder::U32<LittleEndian>;
pub type U64 = zerocopy::byteorder::U64<LittleEndian>;
pub type I32 = zerocopy::byteorder::I32<LittleEndian>;
pub type I64 = zerocopy::byteorder::I64<LittleEndian>;

/// Four ASCII bytes at the start of each header region
#[derive(Copy, Clone, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Magic(pub [u8; 4]);

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Magic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Magic(\"{}\")", self)
    }
}

/// Copy a `T` out of the start of `bytes`
///
/// Returns `None` if `bytes` is shorter than `T`
pub fn read<T: FromBytes + Unaligned + Copy>(bytes: &[u8]) -> Option<T> {
    LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes).map(|(layout, _)| *layout)
}

#[test]
fn magic_display() {
    assert_eq!(format!("{}", Magic(*b"DISF")), "DISF");
    assert_eq!(format!("{}", Magic([b'R', 0, b'A', b'P'])), "R\\x00AP");
}

#[test]
fn read_short_input() {
    let bytes = [1u8, 0, 0];
    assert!(read::<U32>(&bytes).is_none());
    let bytes = [1u8, 0, 0, 0, 0xFF];
    assert_eq!(read::<U32>(&bytes).map(|v| v.get()), Some(1));
}
