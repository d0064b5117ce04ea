//! Key material for signing the header
//!
//! The header's layout table is authenticated with an AES-CMAC. The cipher itself isn't part of
//! this crate: callers holding the key provide a `MacKey`.

pub const CMAC_SIZE: usize = repr::header::CMAC_SIZE;

pub trait MacKey: Send + Sync {
    /// The MAC of `data`, or `None` if no key is available
    fn cmac(&self, data: &[u8]) -> Option<[u8; CMAC_SIZE]>;
}

/// No key: headers can't be verified or signed
#[derive(Debug, Copy, Clone, Default)]
pub struct NoKey;

impl MacKey for NoKey {
    fn cmac(&self, _data: &[u8]) -> Option<[u8; CMAC_SIZE]> {
        None
    }
}
