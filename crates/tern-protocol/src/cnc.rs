//! The command-and-control (CnC) file.
//!
//! One file, `cnc.dat`, in the driver directory describes every shared
//! region a client needs: the command ring, the response broadcast, the two
//! counter buffers, and the error log. The metadata header is written last
//! by the driver (version field released after the lengths), and a client
//! validates the version before trusting any offset.

use std::io;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use tern_primitives::{MmapRegion, Region};

/// File name within the driver directory.
pub const CNC_FILE: &str = "cnc.dat";

/// Metadata header length: two cache line pairs.
pub const CNC_METADATA_LENGTH: usize = 256;

/// Compose a semantic version: `major << 16 | minor << 8 | patch`.
pub const fn semantic_version_compose(major: u8, minor: u8, patch: u8) -> i32 {
    ((major as i32) << 16) | ((minor as i32) << 8) | patch as i32
}

pub const fn semantic_version_major(version: i32) -> u8 {
    ((version >> 16) & 0xFF) as u8
}

/// Current CnC file version.
pub const CNC_VERSION: i32 = semantic_version_compose(1, 0, 0);

#[repr(C)]
pub struct CncMetadata {
    pub cnc_version: AtomicI32,
    pub to_driver_buffer_length: i32,
    pub to_clients_buffer_length: i32,
    pub counter_metadata_buffer_length: i32,
    pub counter_values_buffer_length: i32,
    pub error_log_buffer_length: i32,
    pub client_liveness_timeout_ns: i64,
    pub start_timestamp_ms: i64,
    pub pid: i64,
    _pad: [u8; CNC_METADATA_LENGTH - 48],
}

const _: () = assert!(size_of::<CncMetadata>() == CNC_METADATA_LENGTH);

/// Region lengths that define a CnC layout.
#[derive(Debug, Clone, Copy)]
pub struct CncLengths {
    pub to_driver: usize,
    pub to_clients: usize,
    pub counter_metadata: usize,
    pub counter_values: usize,
    pub error_log: usize,
}

impl CncLengths {
    pub fn total_file_length(&self) -> usize {
        CNC_METADATA_LENGTH
            + self.to_driver
            + self.to_clients
            + self.counter_metadata
            + self.counter_values
            + self.error_log
    }
}

#[derive(Debug)]
pub enum CncError {
    Io(io::Error),
    /// Mapped file shorter than its own metadata claims.
    FileTooShort { file_length: usize, required: usize },
    /// Major version differs between client and driver.
    VersionMismatch { file_version: i32, expected: i32 },
    /// Version field still zero: the driver has not finished initialising.
    NotInitialised,
}

impl std::fmt::Display for CncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "cnc file io: {e}"),
            Self::FileTooShort { file_length, required } => {
                write!(f, "cnc file length {file_length} < required {required}")
            }
            Self::VersionMismatch { file_version, expected } => write!(
                f,
                "cnc version mismatch: file={}.{}.{} expected major {}",
                semantic_version_major(*file_version),
                (file_version >> 8) & 0xFF,
                file_version & 0xFF,
                semantic_version_major(*expected),
            ),
            Self::NotInitialised => write!(f, "cnc file not yet initialised by a driver"),
        }
    }
}

impl std::error::Error for CncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CncError {
    fn from(e: io::Error) -> Self {
        CncError::Io(e)
    }
}

/// A mapped CnC file, created by the driver or attached by a client.
pub struct CncFile {
    mmap: MmapRegion,
    lengths: CncLengths,
}

impl CncFile {
    /// Create and initialise the CnC file. The version field is stored with
    /// release semantics only after every other header field is in place,
    /// so an attaching client that reads a valid version sees a complete
    /// header.
    pub fn create(
        dir: &Path,
        lengths: CncLengths,
        client_liveness_timeout_ns: i64,
        start_timestamp_ms: i64,
    ) -> Result<Self, CncError> {
        let path = dir.join(CNC_FILE);
        let mmap = MmapRegion::create(&path, lengths.total_file_length())?;

        {
            let region = mmap.region();
            // SAFETY: freshly created zeroed mapping, no other mappers yet.
            let metadata = unsafe { &mut *(region.as_ptr() as *mut CncMetadata) };
            metadata.to_driver_buffer_length = lengths.to_driver as i32;
            metadata.to_clients_buffer_length = lengths.to_clients as i32;
            metadata.counter_metadata_buffer_length = lengths.counter_metadata as i32;
            metadata.counter_values_buffer_length = lengths.counter_values as i32;
            metadata.error_log_buffer_length = lengths.error_log as i32;
            metadata.client_liveness_timeout_ns = client_liveness_timeout_ns;
            metadata.start_timestamp_ms = start_timestamp_ms;
            metadata.pid = unsafe { libc::getpid() } as i64;
            metadata.cnc_version.store(CNC_VERSION, Ordering::Release);
        }

        Ok(Self { mmap, lengths })
    }

    /// Map an existing CnC file and validate it.
    pub fn map_existing(dir: &Path) -> Result<Self, CncError> {
        let path = dir.join(CNC_FILE);
        let mmap = MmapRegion::attach(&path)?;

        if mmap.len() < CNC_METADATA_LENGTH {
            return Err(CncError::FileTooShort { file_length: mmap.len(), required: CNC_METADATA_LENGTH });
        }

        let metadata = unsafe { &*(mmap.region().as_ptr() as *const CncMetadata) };
        let version = metadata.cnc_version.load(Ordering::Acquire);

        if version == 0 {
            return Err(CncError::NotInitialised);
        }
        if semantic_version_major(version) != semantic_version_major(CNC_VERSION) {
            return Err(CncError::VersionMismatch { file_version: version, expected: CNC_VERSION });
        }

        let lengths = CncLengths {
            to_driver: metadata.to_driver_buffer_length as usize,
            to_clients: metadata.to_clients_buffer_length as usize,
            counter_metadata: metadata.counter_metadata_buffer_length as usize,
            counter_values: metadata.counter_values_buffer_length as usize,
            error_log: metadata.error_log_buffer_length as usize,
        };

        let required = lengths.total_file_length();
        if mmap.len() < required {
            return Err(CncError::FileTooShort { file_length: mmap.len(), required });
        }

        Ok(Self { mmap, lengths })
    }

    #[inline]
    pub fn metadata(&self) -> &CncMetadata {
        unsafe { &*(self.mmap.region().as_ptr() as *const CncMetadata) }
    }

    #[inline]
    pub fn lengths(&self) -> CncLengths {
        self.lengths
    }

    pub fn path(&self) -> PathBuf {
        self.mmap.path().to_path_buf()
    }

    #[inline]
    pub fn client_liveness_timeout_ns(&self) -> i64 {
        self.metadata().client_liveness_timeout_ns
    }

    pub fn to_driver_region(&self) -> Region {
        self.mmap.region().slice(CNC_METADATA_LENGTH, self.lengths.to_driver)
    }

    pub fn to_clients_region(&self) -> Region {
        let offset = CNC_METADATA_LENGTH + self.lengths.to_driver;
        self.mmap.region().slice(offset, self.lengths.to_clients)
    }

    pub fn counter_metadata_region(&self) -> Region {
        let offset = CNC_METADATA_LENGTH + self.lengths.to_driver + self.lengths.to_clients;
        self.mmap.region().slice(offset, self.lengths.counter_metadata)
    }

    pub fn counter_values_region(&self) -> Region {
        let offset = CNC_METADATA_LENGTH
            + self.lengths.to_driver
            + self.lengths.to_clients
            + self.lengths.counter_metadata;
        self.mmap.region().slice(offset, self.lengths.counter_values)
    }

    pub fn error_log_region(&self) -> Region {
        let offset = CNC_METADATA_LENGTH
            + self.lengths.to_driver
            + self.lengths.to_clients
            + self.lengths.counter_metadata
            + self.lengths.counter_values;
        self.mmap.region().slice(offset, self.lengths.error_log)
    }

    /// Keep the file on disk when this mapping drops.
    pub fn release_file_ownership(&mut self) {
        self.mmap.release_ownership();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_primitives::rb::RB_TRAILER_LENGTH;

    fn lengths() -> CncLengths {
        CncLengths {
            to_driver: 64 * 1024 + RB_TRAILER_LENGTH,
            to_clients: 64 * 1024 + tern_primitives::BROADCAST_TRAILER_LENGTH,
            counter_metadata: 64 * 512,
            counter_values: 64 * 128,
            error_log: 8 * 1024,
        }
    }

    #[test]
    fn create_then_map_recovers_layout() {
        let dir = tempfile::tempdir().unwrap();
        let created = CncFile::create(dir.path(), lengths(), 5_000_000_000, 1234).unwrap();

        let mapped = CncFile::map_existing(dir.path()).unwrap();
        assert_eq!(mapped.client_liveness_timeout_ns(), 5_000_000_000);
        assert_eq!(mapped.metadata().start_timestamp_ms, 1234);
        assert_eq!(mapped.lengths().to_driver, lengths().to_driver);

        // Regions tile the file without overlap.
        let a = mapped.to_driver_region();
        let b = mapped.to_clients_region();
        assert_eq!(a.as_ptr() as usize + a.len(), b.as_ptr() as usize);

        drop(mapped);
        drop(created);
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let created = CncFile::create(dir.path(), lengths(), 1, 1).unwrap();

        created
            .metadata()
            .cnc_version
            .store(semantic_version_compose(99, 0, 0), Ordering::Release);

        assert!(matches!(
            CncFile::map_existing(dir.path()),
            Err(CncError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn uninitialised_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _raw = MmapRegion::create(&dir.path().join(CNC_FILE), 4096).unwrap();
        assert!(matches!(CncFile::map_existing(dir.path()), Err(CncError::NotInitialised)));
    }

    #[test]
    fn semantic_version_parts() {
        let v = semantic_version_compose(1, 2, 3);
        assert_eq!(semantic_version_major(v), 1);
        assert_eq!((v >> 8) & 0xFF, 2);
        assert_eq!(v & 0xFF, 3);
    }
}
