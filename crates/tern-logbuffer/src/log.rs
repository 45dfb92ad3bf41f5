//! Mapped raw log files.
//!
//! A log file is three equal term buffers followed by one metadata page.
//! The driver creates log files (named by registration id inside the
//! driver directory) and owns their lifetime; clients map them by the name
//! carried in readiness responses.

use std::io;
use std::path::Path;

use tern_primitives::{MmapRegion, Region};

use crate::descriptor::{
    check_page_size, check_term_length, compute_log_length, LogMetadata, LOG_META_DATA_LENGTH,
    PARTITION_COUNT,
};

#[derive(Debug)]
pub enum LogError {
    Length(crate::descriptor::LengthError),
    Io(io::Error),
    /// File length does not match three terms plus metadata.
    Misshapen { file_length: usize },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Length(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "log file io: {e}"),
            Self::Misshapen { file_length } => {
                write!(f, "log file length {file_length} does not describe a term buffer layout")
            }
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LogError {
    fn from(e: io::Error) -> Self {
        LogError::Io(e)
    }
}

impl From<crate::descriptor::LengthError> for LogError {
    fn from(e: crate::descriptor::LengthError) -> Self {
        LogError::Length(e)
    }
}

/// Parameters fixed at log creation.
#[derive(Debug, Clone, Copy)]
pub struct LogParams {
    pub correlation_id: i64,
    pub initial_term_id: i32,
    pub term_length: usize,
    pub mtu_length: usize,
    pub page_size: usize,
    /// Touch every page up front rather than faulting lazily.
    pub pre_touch: bool,
}

/// A mapped log: three terms plus metadata.
pub struct MappedRawLog {
    mmap: MmapRegion,
    term_length: usize,
}

impl MappedRawLog {
    /// Create and initialise a log file.
    pub fn create(path: &Path, params: LogParams) -> Result<Self, LogError> {
        check_term_length(params.term_length)?;
        check_page_size(params.page_size)?;

        let length = compute_log_length(params.term_length);
        let mmap = MmapRegion::create(path, length)?;

        if params.pre_touch {
            mmap.pre_touch(params.page_size);
        }

        let log = Self { mmap, term_length: params.term_length };
        unsafe {
            let metadata = &mut *(log.metadata_region().as_ptr() as *mut LogMetadata);
            metadata.init(
                params.correlation_id,
                params.initial_term_id,
                params.term_length as i32,
                params.mtu_length as i32,
                params.page_size as i32,
            );
        }

        Ok(log)
    }

    /// Map an existing log file; the term length is recovered from the file
    /// length and cross-checked against the metadata.
    pub fn map_existing(path: &Path) -> Result<Self, LogError> {
        let mmap = MmapRegion::attach(path)?;
        let file_length = mmap.len();

        if file_length <= LOG_META_DATA_LENGTH
            || (file_length - LOG_META_DATA_LENGTH) % PARTITION_COUNT != 0
        {
            return Err(LogError::Misshapen { file_length });
        }
        let term_length = (file_length - LOG_META_DATA_LENGTH) / PARTITION_COUNT;
        check_term_length(term_length)?;

        let log = Self { mmap, term_length };
        if log.metadata().term_length as usize != term_length {
            return Err(LogError::Misshapen { file_length });
        }

        Ok(log)
    }

    #[inline]
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.mmap.path()
    }

    /// One of the three term buffers.
    #[inline]
    pub fn term(&self, index: usize) -> Region {
        assert!(index < PARTITION_COUNT);
        self.mmap.region().slice(index * self.term_length, self.term_length)
    }

    #[inline]
    fn metadata_region(&self) -> Region {
        self.mmap
            .region()
            .slice(PARTITION_COUNT * self.term_length, LOG_META_DATA_LENGTH)
    }

    #[inline]
    pub fn metadata(&self) -> &LogMetadata {
        // SAFETY: region covers an initialised metadata page and lives as
        // long as self.
        unsafe { LogMetadata::from_region(self.metadata_region()) }
    }

    /// Zero the header region of a term ahead of its reuse. Called on the
    /// *next-next* term during rotation so appends never land in stale
    /// frames.
    pub fn pre_clean_term(&self, index: usize) {
        let term = self.term(index);
        unsafe {
            std::ptr::write_bytes(term.as_ptr(), 0, term.len());
        }
    }

    /// Keep the file on disk after this mapping drops (driver hand-off to
    /// a lingering owner).
    pub fn release_file_ownership(&mut self) {
        self.mmap.release_ownership();
    }
}
