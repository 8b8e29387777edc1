//! Firmware image handling.
//!
//! - `segment`: the address-sorted segment store
//! - `srecord`: Motorola S-record loader/saver
//!
//! [`Firmware`] ties a store to the parser selected at construction time.

pub mod segment;
pub mod srecord;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

pub use segment::{Segment, SegmentStore};
pub use srecord::SRecordParser;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Segment index {index} out of range (count {count})")]
    InvalidIndex { index: usize, count: usize },
    #[error("Parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Firmware file formats understood by [`Firmware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserKind {
    /// Motorola S-record (S19/S28/S37).
    #[default]
    SRecord,
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParserKind::SRecord => write!(f, "S-record"),
        }
    }
}

/// A firmware file format.
pub trait FirmwareParser: Send {
    /// Parse `path` and add every data record to `store`.
    fn load(&self, path: &Path, store: &mut SegmentStore) -> Result<(), FirmwareError>;

    /// Write the full content of `store` to `path`.
    fn save(&self, path: &Path, store: &SegmentStore) -> Result<(), FirmwareError>;
}

/// Firmware image plus the parser used for file I/O.
pub struct Firmware {
    kind: ParserKind,
    parser: Box<dyn FirmwareParser>,
    store: SegmentStore,
}

impl Firmware {
    /// Create an empty image using the given file format.
    pub fn new(kind: ParserKind) -> Self {
        let parser: Box<dyn FirmwareParser> = match kind {
            ParserKind::SRecord => Box::new(SRecordParser::default()),
        };
        Self {
            kind,
            parser,
            store: SegmentStore::new(),
        }
    }

    pub fn parser_kind(&self) -> ParserKind {
        self.kind
    }

    /// Merge the content of `path` into the image.
    ///
    /// On a parse error the image keeps its previous content.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display(), format = %self.kind))]
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), FirmwareError> {
        let mut staged = self.store.clone();
        self.parser.load(path.as_ref(), &mut staged)?;
        self.store = staged;
        info!(
            segments = self.store.segment_count(),
            bytes = self.store.total_len(),
            "Firmware loaded"
        );
        Ok(())
    }

    #[instrument(skip(self, path), fields(path = %path.as_ref().display(), format = %self.kind))]
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), FirmwareError> {
        self.parser.save(path.as_ref(), &self.store)?;
        info!(segments = self.store.segment_count(), "Firmware saved");
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.store.segment_count()
    }

    pub fn segment(&self, idx: usize) -> Result<&Segment, FirmwareError> {
        self.store.segment(idx)
    }

    pub fn add_data(&mut self, address: u32, data: &[u8]) -> Result<(), FirmwareError> {
        self.store.add_data(address, data)
    }

    pub fn remove_data(&mut self, address: u32, len: u32) -> Result<(), FirmwareError> {
        self.store.remove_data(address, len)
    }

    /// Drop all content; the image can be reused afterwards.
    pub fn clear(&mut self) {
        self.store.clear();
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }
}

impl fmt::Debug for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firmware")
            .field("kind", &self.kind)
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_load_keeps_content() {
        let dir = std::env::temp_dir().join(format!("blt-fw-keep-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.srec");
        std::fs::write(&path, "S1130000FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF00\n").unwrap();

        let mut fw = Firmware::new(ParserKind::SRecord);
        fw.add_data(0x10, b"keep").unwrap();
        assert!(matches!(
            fw.load_from_file(&path),
            Err(FirmwareError::Parse { line: 1, .. })
        ));
        assert_eq!(fw.segment_count(), 1);
        assert_eq!(fw.segment(0).unwrap().data(), b"keep");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_clear_and_reuse() {
        let mut fw = Firmware::new(ParserKind::SRecord);
        fw.add_data(0x0, &[1, 2, 3]).unwrap();
        fw.clear();
        assert_eq!(fw.segment_count(), 0);
        assert!(matches!(
            fw.segment(0),
            Err(FirmwareError::InvalidIndex { index: 0, count: 0 })
        ));
        fw.add_data(0x8, &[4]).unwrap();
        assert_eq!(fw.segment_count(), 1);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let mut fw = Firmware::new(ParserKind::SRecord);
        let err = fw
            .load_from_file("/nonexistent/blt/firmware.srec")
            .unwrap_err();
        assert!(matches!(err, FirmwareError::Io(_)));
    }
}
