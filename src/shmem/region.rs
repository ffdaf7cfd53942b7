//! Host-side memory backing a pool block

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    ptr::NonNull,
};

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{GslError, Result};

use super::config::BackingType;

/// A host mapping that can be shared with a remote domain
#[derive(Debug)]
pub struct HostRegion {
    name: String,
    size: usize,
    backing_type: BackingType,
    mmap: MmapMut,
    base: NonNull<u8>,
    _file: Option<File>,
    #[cfg(unix)]
    _owned_fd: Option<OwnedFd>,
    path: Option<PathBuf>,
}

impl HostRegion {
    /// Create a zero-filled region of `size` bytes
    pub fn new(
        name: &str,
        size: usize,
        backing_type: BackingType,
        dir: Option<&Path>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(GslError::bad_parameter("size", "Region size must be greater than 0"));
        }

        match backing_type {
            BackingType::Anonymous => {
                let mmap = MmapMut::map_anon(size)
                    .map_err(|e| GslError::from_io(e, "Failed to create anonymous mapping"))?;
                Ok(Self::assemble(name, size, backing_type, mmap, None, None))
            }
            BackingType::FileBacked => {
                let dir = dir.ok_or_else(|| {
                    GslError::bad_parameter("file_dir", "File-backed regions need a directory")
                })?;
                Self::create_file_backing(name, size, dir)
            }
            #[cfg(target_os = "linux")]
            BackingType::MemFd => Self::create_memfd_backing(name, size),
        }
    }

    fn assemble(
        name: &str,
        size: usize,
        backing_type: BackingType,
        mut mmap: MmapMut,
        file: Option<File>,
        path: Option<PathBuf>,
    ) -> Self {
        // A successful mapping is never at address zero.
        let base = NonNull::new(mmap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            name: name.to_string(),
            size,
            backing_type,
            mmap,
            base,
            _file: file,
            #[cfg(unix)]
            _owned_fd: None,
            path,
        }
    }

    fn create_file_backing(name: &str, size: usize, dir: &Path) -> Result<Self> {
        let path = dir.join(format!("{}_{}", name, std::process::id()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| GslError::from_io(e, "Failed to create backing file"))?;

        file.set_len(size as u64)
            .map_err(|e| GslError::from_io(e, "Failed to set file size"))?;

        let mmap = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&file)
                .map_err(|e| GslError::from_io(e, "Failed to create memory mapping"))?
        };

        Ok(Self::assemble(name, size, BackingType::FileBacked, mmap, Some(file), Some(path)))
    }

    #[cfg(target_os = "linux")]
    fn create_memfd_backing(name: &str, size: usize) -> Result<Self> {
        use nix::{
            sys::memfd::{memfd_create, MemFdCreateFlag},
            unistd::ftruncate,
        };
        use std::ffi::CString;

        let name_cstr = CString::new(name)
            .map_err(|_| GslError::bad_parameter("name", "Name contains null bytes"))?;

        let owned_fd = memfd_create(&name_cstr, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|e| GslError::platform(format!("Failed to create memfd: {}", e)))?;

        ftruncate(&owned_fd, size as i64)
            .map_err(|e| GslError::platform(format!("Failed to set memfd size: {}", e)))?;

        let mmap = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&owned_fd)
                .map_err(|e| GslError::from_io(e, "Failed to create memory mapping"))?
        };

        let mut region = Self::assemble(name, size, BackingType::MemFd, mmap, None, None);
        region._owned_fd = Some(owned_fd);
        Ok(region)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn backing_type(&self) -> BackingType {
        self.backing_type
    }

    /// Base address of the mapping
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Descriptor a remote mapper can import, if the backing has one
    #[cfg(unix)]
    pub fn fd(&self) -> Option<RawFd> {
        if let Some(fd) = &self._owned_fd {
            return Some(fd.as_raw_fd());
        }
        self._file.as_ref().map(|f| f.as_raw_fd())
    }

    #[cfg(not(unix))]
    pub fn fd(&self) -> Option<i32> {
        None
    }

    /// Zero the first `len` bytes
    pub fn clear(&self, len: usize) {
        let len = len.min(self.size);
        unsafe { std::ptr::write_bytes(self.base.as_ptr(), 0, len) };
    }

    /// Flush changes to the backing store
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| GslError::from_io(e, "Failed to flush memory mapping"))
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(e) = std::fs::remove_file(path) {
                log::warn!("Failed to remove backing file {}: {}", path.display(), e);
            }
        }
    }
}

// The region is only reached through raw pointers handed out by the pool,
// whose block-state lock serializes ownership.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_region_is_zeroed() {
        let region = HostRegion::new("anon", 8192, BackingType::Anonymous, None).unwrap();
        assert_eq!(region.size(), 8192);
        let bytes = unsafe { std::slice::from_raw_parts(region.base().as_ptr(), 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_backed_region_removes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path;
        {
            let region =
                HostRegion::new("filed", 4096, BackingType::FileBacked, Some(dir.path())).unwrap();
            assert!(region.fd().is_some());
            path = dir.path().join(format!("filed_{}", std::process::id()));
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memfd_region() {
        let region = HostRegion::new("memfd", 4096, BackingType::MemFd, None).unwrap();
        assert!(region.fd().is_some());
        unsafe { *region.base().as_ptr() = 7 };
        region.clear(4096);
        assert_eq!(unsafe { *region.base().as_ptr() }, 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(HostRegion::new("zero", 0, BackingType::Anonymous, None).is_err());
    }
}
