//! Shared-memory cache mappings (§5 "shared-resource policy"): each cache is
//! mapped `MAP_SHARED` with read/write/execute into both the supervisor's
//! and the guest's address space. This module owns the writer side's
//! mapping; the guest side is out of scope (§1 "external collaborators").

use std::os::fd::AsFd;
use std::path::Path;

use rustix::fs::{Mode, OFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open shared-memory backing file {path}: {source}")]
    Open { path: String, source: rustix::io::Errno },
    #[error("failed to size shared-memory backing file {path} to {len} bytes: {source}")]
    Truncate { path: String, len: usize, source: rustix::io::Errno },
    #[error("mmap of {len} bytes failed: {source}")]
    Mmap { len: usize, source: rustix::io::Errno },
}

/// A `MAP_SHARED` mapping of one module's backing shared-memory object
/// (either a code-cache pair, `2 * cache_half_size` bytes, or one shadow
/// stack). Unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

// The mapping is `MAP_SHARED`, so concurrent writers (this process and the
// guest) are expected; `Engine` is the sole owner of the writer-side handle
// and serialises writes to it via the producer loop / pause protocol.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Open (creating/truncating as needed) the shared-memory backing file
    /// at `path` to exactly `len` bytes and map it `READ | WRITE | EXEC`,
    /// `MAP_SHARED`.
    pub fn open(path: impl AsRef<Path>, len: usize) -> Result<Self, Error> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let file = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|source| Error::Open { path: path_str.clone(), source })?;
        rustix::fs::ftruncate(&file, len as u64)
            .map_err(|source| Error::Truncate { path: path_str.clone(), len, source })?;

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE | ProtFlags::EXEC,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|source| Error::Mmap { len, source })?;

        Ok(Self { ptr: ptr.cast(), len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole mapped region as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        let ptr = std::ptr::NonNull::new(self.ptr.cast()).expect("mapped region pointer is never null");
        if let Err(err) = unsafe { munmap(ptr.as_ptr(), self.len) } {
            tracing::warn!(%err, "failed to unmap shared-memory region");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_sizes_a_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1234-libexample.so.cc");
        let mut region = MappedRegion::open(&path, 0x2000).unwrap();
        assert_eq!(region.len(), 0x2000);
        region.as_mut_slice()[0] = 0xe9;
        assert_eq!(region.as_mut_slice()[0], 0xe9);
    }
}
