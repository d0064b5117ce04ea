use crate::integrity::{IntegrityLayer, PassThrough};
use crate::keys::{MacKey, NoKey};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntegrityCheckLevel {
    /// Don't check anything
    None,
    /// Check, and log a warning for anything that fails
    WarnOnInvalid,
    /// Check, and fail to open (or read) when anything fails
    ErrorOnInvalid,
}

impl Default for IntegrityCheckLevel {
    fn default() -> Self {
        IntegrityCheckLevel::None
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Validity {
    Unchecked,
    Invalid,
    Valid,
}

impl Default for Validity {
    fn default() -> Self {
        Validity::Unchecked
    }
}

impl Validity {
    pub fn from_match(matches: bool) -> Self {
        if matches {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}

/// Everything needed to open a container besides the image itself
#[derive(Clone)]
pub struct OpenOptions {
    pub(crate) integrity_check_level: IntegrityCheckLevel,
    pub(crate) writable: bool,
    pub(crate) key: Arc<dyn MacKey>,
    pub(crate) integrity_layer: Arc<dyn IntegrityLayer>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self {
            integrity_check_level: IntegrityCheckLevel::default(),
            writable: false,
            key: Arc::new(NoKey),
            integrity_layer: Arc::new(PassThrough),
        }
    }

    pub fn integrity_check_level(&mut self, level: IntegrityCheckLevel) -> &mut Self {
        self.integrity_check_level = level;
        self
    }

    /// Open image files for writing, needed to commit the header
    pub fn writable(&mut self, writable: bool) -> &mut Self {
        self.writable = writable;
        self
    }

    /// Key used to check the header signature
    pub fn key(&mut self, key: Arc<dyn MacKey>) -> &mut Self {
        self.key = key;
        self
    }

    /// Replace the default pass-through integrity layer
    pub fn integrity_layer(&mut self, layer: Arc<dyn IntegrityLayer>) -> &mut Self {
        self.integrity_layer = layer;
        self
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("integrity_check_level", &self.integrity_check_level)
            .field("writable", &self.writable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = OpenOptions::default();
        assert_eq!(options.integrity_check_level, IntegrityCheckLevel::None);
        assert!(!options.writable);
        assert_eq!(options.key.cmac(b"data"), None);
        assert_eq!(Validity::default(), Validity::Unchecked);
    }

    #[test]
    fn builder() {
        let mut options = OpenOptions::new();
        options
            .integrity_check_level(IntegrityCheckLevel::WarnOnInvalid)
            .writable(true);
        assert_eq!(
            options.integrity_check_level,
            IntegrityCheckLevel::WarnOnInvalid
        );
        assert!(options.writable);
        assert_eq!(Validity::from_match(false), Validity::Invalid);
    }
}
