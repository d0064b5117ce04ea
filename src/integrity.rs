//! The hash tree layer between the journal and the file tree
//!
//! Verifying the hash tree is left to an [`IntegrityLayer`] supplied through
//! [`OpenOptions`](crate::config::OpenOptions). The default [`PassThrough`] layer reads the journal
//! storage directly and checks nothing.

use crate::config::{IntegrityCheckLevel, Validity};
use crate::errors::Result;
use crate::header::IvfcLevelInfo;
use crate::progress::Progress;
use crate::storage::SharedStorage;

/// Everything an integrity layer is built from
pub struct IntegrityInput {
    /// Top hash, from the header
    pub master_hash: Vec<u8>,
    /// Hash levels L1 to L3
    pub hash_levels: Vec<SharedStorage>,
    /// The journal storage holding the file tree
    pub data: SharedStorage,
    pub level_info: Vec<IvfcLevelInfo>,
    pub salt_source: [u8; 0x20],
    pub check_level: IntegrityCheckLevel,
}

impl IntegrityInput {
    /// Number of levels a validator reports on: every hash level plus the data
    pub fn level_count(&self) -> usize {
        self.hash_levels.len() + 1
    }
}

pub trait Validator: Send + Sync {
    /// Check every level, returning one result per level
    fn validate(&self, progress: &mut dyn Progress) -> Result<Vec<Validity>>;
}

/// The storage the file tree is read from and the means to check it
pub struct VerifiedStorage {
    pub data: SharedStorage,
    pub validator: Box<dyn Validator>,
}

pub trait IntegrityLayer: Send + Sync {
    fn open(&self, input: IntegrityInput) -> Result<VerifiedStorage>;
}

/// Reads the data level unchanged
#[derive(Debug, Copy, Clone, Default)]
pub struct PassThrough;

struct Unchecked {
    levels: usize,
}

impl Validator for Unchecked {
    fn validate(&self, progress: &mut dyn Progress) -> Result<Vec<Validity>> {
        progress.log_message("integrity levels are not checked");
        Ok(vec![Validity::Unchecked; self.levels])
    }
}

impl IntegrityLayer for PassThrough {
    fn open(&self, input: IntegrityInput) -> Result<VerifiedStorage> {
        let levels = input.level_count();
        Ok(VerifiedStorage {
            data: input.data,
            validator: Box::new(Unchecked { levels }),
        })
    }
}
