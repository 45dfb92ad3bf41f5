//! File-backed memory-mapped regions shared across processes.
//!
//! The driver creates every shared file (CnC file, log buffers) and is the
//! only party that unlinks them. Clients attach to existing files and never
//! take ownership.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::region::Region;

/// A file-backed `MAP_SHARED` mapping.
pub struct MmapRegion {
    ptr: *mut u8,
    len: usize,
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
    owns_file: bool,
}

impl MmapRegion {
    /// Create the backing file, size it, and map it read/write.
    ///
    /// The file is created with mode 0600 and is deleted when this region
    /// drops (the creator owns the file).
    pub fn create(path: &Path, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size must be > 0"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.set_len(size as u64)?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len: size,
            file,
            path: path.to_path_buf(),
            owns_file: true,
        })
    }

    /// Map an existing file read/write. The file's current length becomes
    /// the mapping length. Attached regions do not delete the file.
    pub fn attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;

        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "mapped file is empty"));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len: size,
            file,
            path: path.to_path_buf(),
            owns_file: false,
        })
    }

    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping stays valid until this MmapRegion drops.
        unsafe { Region::from_raw(self.ptr, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Touch every page so first use does not fault on the hot path.
    pub fn pre_touch(&self, page_size: usize) {
        let mut off = 0usize;
        while off < self.len {
            unsafe {
                std::ptr::write_volatile(self.ptr.add(off), std::ptr::read_volatile(self.ptr.add(off)));
            }
            off += page_size;
        }
    }

    /// The file will be deleted when this region drops.
    pub fn take_ownership(&mut self) {
        self.owns_file = true;
    }

    /// The file will be left on disk when this region drops.
    pub fn release_ownership(&mut self) {
        self.owns_file = false;
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }

        if self.owns_file {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// SAFETY: the mapping is shared memory; concurrent access is governed by
// the atomics of the structures built over it.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_attach_shares_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.map");

        let owner = MmapRegion::create(&path, 4096).unwrap();
        unsafe { std::ptr::write(owner.region().as_ptr(), 0x5a) };

        let attached = MmapRegion::attach(&path).unwrap();
        assert_eq!(attached.len(), 4096);
        assert_eq!(unsafe { std::ptr::read(attached.region().as_ptr()) }, 0x5a);

        unsafe { std::ptr::write(attached.region().as_ptr().add(7), 0x17) };
        assert_eq!(unsafe { std::ptr::read(owner.region().as_ptr().add(7)) }, 0x17);
    }

    #[test]
    fn owner_deletes_attacher_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned.map");

        let owner = MmapRegion::create(&path, 1024).unwrap();
        {
            let _attached = MmapRegion::attach(&path).unwrap();
        }
        assert!(path.exists());

        drop(owner);
        assert!(!path.exists());
    }

    #[test]
    fn permissions_are_0600() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perm.map");
        let _owner = MmapRegion::create(&path, 512).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn zero_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MmapRegion::create(&dir.path().join("zero.map"), 0).is_err());
    }
}
