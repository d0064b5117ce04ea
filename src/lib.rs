//! Reader for console save data containers
//!
//! A container image is a stack of storages. From the bottom up:
//!
//! 1. the data remap, mapping virtual ranges of the data area onto the image
//! 2. a hierarchical duplex storage choosing between A/B copies of each block
//! 3. the metadata remap over the duplex output
//! 4. the journal, redirecting logical blocks to physical ones
//! 5. an integrity layer (pass-through unless one is supplied)
//! 6. the file tree, stored in allocation table chains
//!
//! [`Savefile`] wires the stack up from the header and exposes the files.

pub mod allocation_table;
pub mod config;
pub mod duplex;
pub mod errors;
pub mod header;
pub mod integrity;
pub mod journal;
pub mod keys;
pub mod progress;
pub mod remap;
pub mod save_fs;
mod savefile;
pub mod storage;

pub use crate::config::{IntegrityCheckLevel, OpenOptions, Validity};
pub use crate::errors::{Error, Result};
pub use crate::keys::{MacKey, NoKey};
pub use crate::progress::Progress;
pub use crate::save_fs::{DirectoryEntry, Entry, FileEntry, FileStorage, SaveFs};
pub use crate::savefile::{Savefile, VerifyReport};
pub use crate::storage::{SharedStorage, Storage};
