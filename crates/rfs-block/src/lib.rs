#![deny(unsafe_code)]
//! Byte regions that back a RingFS image.
//!
//! The ring lives in one contiguous byte region. On a real image that is a
//! shared read-write memory map of the whole file ([`MmapRegion`]); tests use
//! an owned buffer ([`MemRegion`]). Callers mutate bytes in place and then
//! sync the touched range.

use memmap2::{MmapMut, MmapOptions};
use rfs_error::{Result, RfsError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// A mutable, syncable byte region.
pub trait Region: Send {
    /// Region length in bytes.
    fn len_bytes(&self) -> u64;

    fn bytes(&self) -> &[u8];

    fn bytes_mut(&mut self) -> &mut [u8];

    /// Persist `len` bytes starting at `offset`.
    fn sync_range(&mut self, offset: u64, len: u64) -> Result<()>;

    /// Persist the whole region.
    fn sync(&mut self) -> Result<()> {
        let len = self.len_bytes();
        self.sync_range(0, len)
    }
}

fn checked_range(offset: u64, len: u64, region_len: u64) -> Result<(usize, usize)> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| RfsError::InvalidArgument("sync range overflows u64".to_owned()))?;
    if end > region_len {
        return Err(RfsError::InvalidArgument(format!(
            "sync out of bounds: offset={offset} len={len} region_len={region_len}"
        )));
    }
    let start = usize::try_from(offset)
        .map_err(|_| RfsError::InvalidArgument("sync offset overflows usize".to_owned()))?;
    let len = usize::try_from(len)
        .map_err(|_| RfsError::InvalidArgument("sync length overflows usize".to_owned()))?;
    Ok((start, len))
}

// ── File-backed mapping ─────────────────────────────────────────────────────

/// Shared mapping of an entire image file.
///
/// A read-only region is mapped copy-on-write: in-memory updates (such as
/// access times) are visible to the caller but never reach the file, and
/// syncing is a no-op.
#[derive(Debug)]
pub struct MmapRegion {
    path: PathBuf,
    mmap: MmapMut,
    read_only: bool,
}

impl MmapRegion {
    /// Map an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = Self::map(&file, &path, false)?;
        debug!(path = %path.display(), len = mmap.len(), "mapped image read-write");
        Ok(Self {
            path,
            mmap,
            read_only: false,
        })
    }

    /// Map an existing image without write access to the file.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = Self::map(&file, &path, true)?;
        debug!(path = %path.display(), len = mmap.len(), "mapped image read-only");
        Ok(Self {
            path,
            mmap,
            read_only: true,
        })
    }

    /// Create (or extend/truncate) `path` to exactly `size` bytes and map it.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(size)?;
        let mmap = Self::map(&file, &path, false)?;
        debug!(path = %path.display(), size, "created image");
        Ok(Self {
            path,
            mmap,
            read_only: false,
        })
    }

    #[allow(unsafe_code)]
    fn map(file: &File, path: &Path, read_only: bool) -> Result<MmapMut> {
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(RfsError::InvalidArgument(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if metadata.len() == 0 {
            return Err(RfsError::Format(format!("{} is empty", path.display())));
        }
        // SAFETY: the image is owned by this process for the lifetime of the
        // mapping; no other code truncates or rewrites the file underneath it.
        let mmap = unsafe {
            if read_only {
                MmapOptions::new().map_copy(file)?
            } else {
                MmapMut::map_mut(file)?
            }
        };
        Ok(mmap)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Flush every dirty page and drop the mapping.
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        debug!(path = %self.path.display(), "unmapped image");
        Ok(())
    }
}

impl Region for MmapRegion {
    fn len_bytes(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    fn sync_range(&mut self, offset: u64, len: u64) -> Result<()> {
        let (start, len) = checked_range(offset, len, self.len_bytes())?;
        if self.read_only || len == 0 {
            return Ok(());
        }
        trace!(offset = start, len, "msync");
        self.mmap.flush_range(start, len)?;
        Ok(())
    }
}

// ── In-memory region ────────────────────────────────────────────────────────

/// Heap-backed region that records how often it was synced.
#[derive(Debug, Clone, Default)]
pub struct MemRegion {
    bytes: Vec<u8>,
    sync_calls: u64,
}

impl MemRegion {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            sync_calls: 0,
        }
    }

    #[must_use]
    pub fn sync_calls(&self) -> u64 {
        self.sync_calls
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

impl Region for MemRegion {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn sync_range(&mut self, offset: u64, len: u64) -> Result<()> {
        checked_range(offset, len, self.len_bytes())?;
        self.sync_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_region_counts_syncs_and_checks_bounds() {
        let mut region = MemRegion::new(64);
        region.bytes_mut()[10] = 7;
        region.sync_range(0, 64).expect("in bounds");
        region.sync().expect("whole region");
        assert_eq!(region.sync_calls(), 2);
        assert!(region.sync_range(60, 5).is_err());
        assert!(region.sync_range(u64::MAX, 2).is_err());
        assert_eq!(region.sync_calls(), 2);
        assert_eq!(region.into_inner()[10], 7);
    }

    #[test]
    fn mmap_region_persists_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.rfs");
        {
            let mut region = MmapRegion::create(&path, 4096).expect("create");
            assert_eq!(region.len_bytes(), 4096);
            region.bytes_mut()[100..104].copy_from_slice(b"ring");
            region.sync_range(100, 4).expect("sync");
            region.close().expect("close");
        }
        let on_disk = std::fs::read(&path).expect("read back");
        assert_eq!(on_disk.len(), 4096);
        assert_eq!(&on_disk[100..104], b"ring");

        let reopened = MmapRegion::open(&path).expect("open");
        assert_eq!(&reopened.bytes()[100..104], b"ring");
        assert!(!reopened.is_read_only());
    }

    #[test]
    fn read_only_region_never_writes_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.rfs");
        std::fs::write(&path, vec![1_u8; 512]).expect("seed");

        let mut region = MmapRegion::open_read_only(&path).expect("open");
        assert!(region.is_read_only());
        region.bytes_mut()[0] = 9;
        region.sync().expect("no-op sync");
        assert_eq!(region.bytes()[0], 9);
        drop(region);

        assert_eq!(std::fs::read(&path).expect("read")[0], 1);
    }

    #[test]
    fn open_rejects_empty_and_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = dir.path().join("empty.rfs");
        std::fs::write(&empty, b"").expect("touch");
        assert!(matches!(
            MmapRegion::open(&empty),
            Err(RfsError::Format(_))
        ));
        assert!(matches!(
            MmapRegion::open(dir.path().join("missing.rfs")),
            Err(RfsError::Io(_))
        ));
    }
}
