use repr::Magic;
use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Magic mismatch in {region}: expected {expected}, got {actual}")]
    BadMagic {
        region: &'static str,
        expected: Magic,
        actual: Magic,
    },
    #[error("Malformed container: {what}")]
    Malformed { what: String },
    #[error("Cannot start allocation table iteration at block {block}")]
    InvalidStartBlock { block: u32 },
    #[error("Range {offset:#x}+{len:#x} is out of bounds for {storage}")]
    OutOfRange {
        storage: &'static str,
        offset: u64,
        len: u64,
    },
    #[error("Allocation table chain starting at block {start} revisits block {block}")]
    CyclicChain { start: u32, block: u32 },
    #[error("No such file or directory: {path}")]
    NotFound { path: String },
    #[error("{operation} is not supported by {storage}")]
    Unsupported {
        storage: &'static str,
        operation: &'static str,
    },
    #[error("Integrity check failed: {what}")]
    Integrity { what: String },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn malformed<S: Into<String>>(what: S) -> Self {
        Error::Malformed { what: what.into() }
    }

    /// True for every error caused by an inconsistent or corrupt image
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Error::BadMagic { .. }
                | Error::Malformed { .. }
                | Error::InvalidStartBlock { .. }
                | Error::OutOfRange { .. }
                | Error::CyclicChain { .. }
        )
    }
}
