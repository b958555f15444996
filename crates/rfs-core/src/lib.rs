#![forbid(unsafe_code)]
//! Path-level filesystem operations over a RingFS ring.
//!
//! RingFS has one directory, the Root node. Every other name is a Reserved
//! node whose payload is the file's contents. [`PathOps`] is the interface
//! the FUSE adapter and the tests drive; [`RingFs`] implements it.
//!
//! Every mutating call persists the headers and payload ranges it touched
//! before returning, so there is no write-back state and `fsync` only
//! checks that the path exists.

use rfs_alloc::{OpenOptions, Ring};
use rfs_block::{MmapRegion, Region};
use rfs_error::{Result, RfsError};
use rfs_ondisk::{NodeHeader, NodeKind, NodeTime};
use rfs_types::{
    NODE_NAME_MAX, NodeOffset, ParseError, S_IFMT, S_IFREG, STATFS_BLOCK_SIZE, blocks_for,
    u64_to_usize,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, trace};

// ── VFS-level types ─────────────────────────────────────────────────────────

/// Kind of object a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Directory,
    RegularFile,
}

/// Attributes returned by [`PathOps::getattr`], analogous to `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    pub kind: FileKind,
    /// File size in bytes (the node's `data_size`).
    pub size: u64,
    /// Number of 512-byte blocks.
    pub blocks: u64,
    /// POSIX permission bits (lower 12 bits of mode).
    pub perm: u16,
    /// Full stored mode, file type bits included.
    pub mode: u16,
    /// 2 for the root directory, 1 for files.
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Preferred I/O block size.
    pub blksize: u32,
}

impl NodeAttr {
    #[must_use]
    pub fn from_header(header: &NodeHeader) -> Self {
        let directory = header.is_root();
        Self {
            kind: if directory {
                FileKind::Directory
            } else {
                FileKind::RegularFile
            },
            size: header.data_size,
            blocks: blocks_for(header.data_size, 512),
            perm: header.permissions(),
            mode: header.mode,
            nlink: if directory { 2 } else { 1 },
            uid: header.uid,
            gid: header.gid,
            atime: header.atime.to_system_time(),
            mtime: header.mtime.to_system_time(),
            ctime: header.ctime.to_system_time(),
            blksize: STATFS_BLOCK_SIZE,
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (a bare file name, not a path).
    pub name: Vec<u8>,
    pub kind: FileKind,
    /// 1-based position in the listing, usable as a readdir cookie.
    pub offset: u64,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Filesystem statistics returned by [`PathOps::statfs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStat {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

// ── PathOps trait ───────────────────────────────────────────────────────────

/// Path-dispatched filesystem operations.
///
/// Paths are byte strings with a leading `/`. RingFS is flat: `/` is the
/// Root directory and `/name` is a file. Anything nested reports
/// `NotFound`. Calls are expected to be serialized by the caller.
pub trait PathOps: Send {
    /// Attributes of the root directory or a file.
    fn getattr(&self, path: &[u8]) -> Result<NodeAttr>;

    /// List the root directory: `.`, `..`, then every file.
    fn readdir(&self, path: &[u8]) -> Result<Vec<DirEntry>>;

    /// Existence check; no handle state is kept.
    fn open(&self, path: &[u8]) -> Result<()>;

    /// Read up to `size` bytes at `offset`. Returns fewer bytes near the end
    /// of data and none past it. Updates the access time when bytes are read.
    fn read(&mut self, path: &[u8], offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Create an empty file; fails with `Exists` if the name is taken.
    fn mknod(&mut self, path: &[u8], mode: u32, uid: u32, gid: u32) -> Result<NodeAttr>;

    /// Like [`PathOps::mknod`], but returns the existing attributes when the
    /// name is taken.
    fn create(&mut self, path: &[u8], mode: u32, uid: u32, gid: u32) -> Result<NodeAttr>;

    /// Write `data` at `offset`, growing the file as needed. Returns the
    /// number of bytes written.
    fn write(&mut self, path: &[u8], offset: u64, data: &[u8]) -> Result<u32>;

    /// Set the file length; new bytes read as zero.
    fn truncate(&mut self, path: &[u8], size: u64) -> Result<()>;

    /// Rename a file, replacing any file already named `to`.
    ///
    /// Not atomic: the replaced file is freed before the source is renamed.
    fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<()>;

    fn unlink(&mut self, path: &[u8]) -> Result<()>;

    fn chmod(&mut self, path: &[u8], mode: u32) -> Result<()>;

    /// Change owner and/or group; `None` leaves the field unchanged.
    fn chown(&mut self, path: &[u8], uid: Option<u32>, gid: Option<u32>) -> Result<()>;

    /// Set access and modification times; `None` means "now".
    fn utimens(
        &mut self,
        path: &[u8],
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()>;

    fn statfs(&self) -> Result<FsStat>;

    /// Existence check: every mutation is already persisted.
    fn fsync(&self, path: &[u8]) -> Result<()>;
}

// ── Path handling ───────────────────────────────────────────────────────────

/// Reduce a path to the flat name it addresses. `/` yields the empty name.
fn node_name(path: &[u8]) -> Result<&[u8]> {
    let name = path.strip_prefix(b"/").unwrap_or(path);
    if name.contains(&b'/') {
        return Err(RfsError::NotFound(String::from_utf8_lossy(path).into_owned()));
    }
    if name.len() > NODE_NAME_MAX {
        return Err(RfsError::NameTooLong);
    }
    Ok(name)
}

fn not_found(path: &[u8]) -> RfsError {
    RfsError::NotFound(String::from_utf8_lossy(path).into_owned())
}

fn name_error(err: &ParseError) -> RfsError {
    RfsError::InvalidArgument(err.to_string())
}

fn payload_overrun(node: NodeOffset, end: u64) -> RfsError {
    RfsError::Corruption {
        offset: node.0,
        detail: format!("payload end {end} is past the node capacity"),
    }
}

fn permission_bits(mode: u32) -> u16 {
    u16::try_from(mode & u32::from(!S_IFMT)).unwrap_or(0)
}

// ── RingFs ──────────────────────────────────────────────────────────────────

/// [`PathOps`] over a [`Ring`].
#[derive(Debug)]
pub struct RingFs<R: Region> {
    ring: Ring<R>,
}

impl RingFs<MmapRegion> {
    /// Map the image at `path` read-write and open its ring.
    pub fn open_image(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let region = MmapRegion::open(path)?;
        Ok(Self::new(Ring::open(region, options)?))
    }

    /// Map the image at `path` copy-on-write; nothing is written back.
    pub fn open_image_read_only(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let region = MmapRegion::open_read_only(path)?;
        Ok(Self::new(Ring::open(region, options)?))
    }
}

impl<R: Region> RingFs<R> {
    #[must_use]
    pub fn new(ring: Ring<R>) -> Self {
        Self { ring }
    }

    #[must_use]
    pub fn ring(&self) -> &Ring<R> {
        &self.ring
    }

    #[must_use]
    pub fn into_ring(self) -> Ring<R> {
        self.ring
    }

    /// Resolve `path` to the Root node or a file node.
    fn resolve(&self, path: &[u8]) -> Result<(NodeOffset, NodeHeader)> {
        let name = node_name(path)?;
        self.ring
            .find_by_name(name, true)?
            .ok_or_else(|| not_found(path))
    }

    /// Resolve `path` to a file node only.
    fn resolve_file(&self, path: &[u8]) -> Result<(NodeOffset, NodeHeader)> {
        let name = node_name(path)?;
        self.ring
            .find_by_name(name, false)?
            .ok_or_else(|| not_found(path))
    }

    /// Bump the root directory's modification and change times.
    fn touch_root(&mut self) -> Result<()> {
        let mut root = self.ring.header_of_kind(NodeOffset::ROOT, NodeKind::Root)?;
        let now = NodeTime::now();
        root.mtime = now;
        root.ctime = now;
        self.ring.write_header(NodeOffset::ROOT, &root)
    }

    fn make_node(&mut self, path: &[u8], mode: u32, uid: u32, gid: u32) -> Result<NodeAttr> {
        let name = node_name(path)?;
        let node = self.ring.allocate(0, None)?;
        let mut header = self.ring.header(node)?;
        if let Err(err) = header.set_name(name) {
            self.ring.free(node)?;
            return Err(name_error(&err));
        }
        let now = NodeTime::now();
        header.mode = S_IFREG | permission_bits(mode);
        header.uid = uid;
        header.gid = gid;
        header.atime = now;
        header.mtime = now;
        header.ctime = now;
        self.ring.write_header(node, &header)?;
        self.touch_root()?;
        debug!(name = %header.name_lossy(), offset = node.0, "created file");
        Ok(NodeAttr::from_header(&header))
    }

    /// Zero `start..end` of the payload of `node` and sync it.
    fn zero_fill(&mut self, node: NodeOffset, start: u64, end: u64) -> Result<()> {
        if end <= start {
            return Ok(());
        }
        let from = u64_to_usize(start, "fill_start").map_err(|err| name_error(&err))?;
        let to = u64_to_usize(end, "fill_end").map_err(|err| name_error(&err))?;
        self.ring
            .payload_mut(node)?
            .get_mut(from..to)
            .ok_or_else(|| payload_overrun(node, end))?
            .fill(0);
        self.ring.sync_payload(node, start, end - start)
    }

    fn update_header(
        &mut self,
        path: &[u8],
        update: impl FnOnce(&mut NodeHeader),
    ) -> Result<()> {
        let (node, mut header) = self.resolve(path)?;
        update(&mut header);
        header.ctime = NodeTime::now();
        self.ring.write_header(node, &header)
    }
}

impl<R: Region> PathOps for RingFs<R> {
    fn getattr(&self, path: &[u8]) -> Result<NodeAttr> {
        let (_, header) = self.resolve(path)?;
        Ok(NodeAttr::from_header(&header))
    }

    fn readdir(&self, path: &[u8]) -> Result<Vec<DirEntry>> {
        let (_, header) = self.resolve(path)?;
        if !header.is_root() {
            return Err(RfsError::InvalidArgument(format!(
                "{} is not a directory",
                String::from_utf8_lossy(path)
            )));
        }

        let mut entries = vec![
            DirEntry {
                name: b".".to_vec(),
                kind: FileKind::Directory,
                offset: 1,
            },
            DirEntry {
                name: b"..".to_vec(),
                kind: FileKind::Directory,
                offset: 2,
            },
        ];
        for entry in self.ring.nodes() {
            let (_, header) = entry?;
            if header.is_reserved() {
                let offset = entries.len() as u64 + 1;
                entries.push(DirEntry {
                    name: header.name_bytes().to_vec(),
                    kind: FileKind::RegularFile,
                    offset,
                });
            }
        }
        trace!(entries = entries.len(), "listed root");
        Ok(entries)
    }

    fn open(&self, path: &[u8]) -> Result<()> {
        self.resolve(path).map(|_| ())
    }

    fn read(&mut self, path: &[u8], offset: u64, size: u32) -> Result<Vec<u8>> {
        let (node, mut header) = self.resolve_file(path)?;
        if offset >= header.data_size || size == 0 {
            return Ok(Vec::new());
        }
        let end = offset
            .saturating_add(u64::from(size))
            .min(header.data_size);
        let from = u64_to_usize(offset, "read_offset").map_err(|err| name_error(&err))?;
        let to = u64_to_usize(end, "read_end").map_err(|err| name_error(&err))?;
        let data = self
            .ring
            .payload(node)?
            .get(from..to)
            .ok_or_else(|| payload_overrun(node, end))?
            .to_vec();

        header.atime = NodeTime::now();
        self.ring.write_header(node, &header)?;
        trace!(offset, len = data.len(), "read");
        Ok(data)
    }

    fn mknod(&mut self, path: &[u8], mode: u32, uid: u32, gid: u32) -> Result<NodeAttr> {
        let name = node_name(path)?;
        if self.ring.find_by_name(name, true)?.is_some() {
            return Err(RfsError::Exists);
        }
        self.make_node(path, mode, uid, gid)
    }

    fn create(&mut self, path: &[u8], mode: u32, uid: u32, gid: u32) -> Result<NodeAttr> {
        let name = node_name(path)?;
        if let Some((_, header)) = self.ring.find_by_name(name, true)? {
            return Ok(NodeAttr::from_header(&header));
        }
        self.make_node(path, mode, uid, gid)
    }

    fn write(&mut self, path: &[u8], offset: u64, data: &[u8]) -> Result<u32> {
        let written = u32::try_from(data.len())
            .map_err(|_| RfsError::InvalidArgument("write larger than 4 GiB".to_owned()))?;
        let (mut node, mut header) = self.resolve_file(path)?;
        let end = offset
            .checked_add(u64::from(written))
            .ok_or(RfsError::NoSpace)?;
        let old_size = header.data_size;

        if end > header.capacity() {
            node = self.ring.resize(node, end)?;
            header = self.ring.header(node)?;
        } else if end > header.data_size {
            header.data_size = end;
        }
        self.zero_fill(node, old_size, offset)?;

        // Header first so the new data_size is on disk before the bytes.
        let now = NodeTime::now();
        header.mtime = now;
        header.ctime = now;
        self.ring.write_header(node, &header)?;

        let from = u64_to_usize(offset, "write_offset").map_err(|err| name_error(&err))?;
        let to = u64_to_usize(end, "write_end").map_err(|err| name_error(&err))?;
        self.ring
            .payload_mut(node)?
            .get_mut(from..to)
            .ok_or_else(|| payload_overrun(node, end))?
            .copy_from_slice(data);
        self.ring.sync_payload(node, offset, u64::from(written))?;
        trace!(offset, len = written, data_size = header.data_size, "wrote");
        Ok(written)
    }

    fn truncate(&mut self, path: &[u8], size: u64) -> Result<()> {
        let (node, header) = self.resolve_file(path)?;
        let old_size = header.data_size;
        let node = self.ring.resize(node, size)?;
        self.zero_fill(node, old_size, size)?;

        let mut header = self.ring.header(node)?;
        let now = NodeTime::now();
        header.mtime = now;
        header.ctime = now;
        self.ring.write_header(node, &header)?;
        debug!(name = %header.name_lossy(), from = old_size, to = size, "truncated");
        Ok(())
    }

    fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<()> {
        let from_name = node_name(from)?;
        let to_name = node_name(to)?;
        if to_name.is_empty() {
            return Err(RfsError::InvalidArgument(
                "cannot rename onto the root directory".to_owned(),
            ));
        }
        let (source, _) = self.resolve_file(from)?;
        if from_name == to_name {
            return Ok(());
        }

        if let Some((target, _)) = self.ring.find_by_name(to_name, false)? {
            self.ring.free(target)?;
            debug!(name = %String::from_utf8_lossy(to_name), "replaced existing file");
        }

        // Freeing another node never moves a Reserved node, so `source` is
        // still valid here.
        let mut header = self.ring.header(source)?;
        header.set_name(to_name).map_err(|err| name_error(&err))?;
        header.ctime = NodeTime::now();
        self.ring.write_header(source, &header)?;
        self.touch_root()?;
        debug!(
            from = %String::from_utf8_lossy(from_name),
            to = %String::from_utf8_lossy(to_name),
            "renamed"
        );
        Ok(())
    }

    fn unlink(&mut self, path: &[u8]) -> Result<()> {
        let (node, header) = self.resolve_file(path)?;
        self.ring.free(node)?;
        self.touch_root()?;
        debug!(name = %header.name_lossy(), "unlinked");
        Ok(())
    }

    fn chmod(&mut self, path: &[u8], mode: u32) -> Result<()> {
        self.update_header(path, |header| {
            header.set_permissions(permission_bits(mode));
        })
    }

    fn chown(&mut self, path: &[u8], uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.update_header(path, |header| {
            if let Some(uid) = uid {
                header.uid = uid;
            }
            if let Some(gid) = gid {
                header.gid = gid;
            }
        })
    }

    fn utimens(
        &mut self,
        path: &[u8],
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        self.update_header(path, |header| {
            header.atime = atime.map_or_else(NodeTime::now, NodeTime::from_system_time);
            header.mtime = mtime.map_or_else(NodeTime::now, NodeTime::from_system_time);
        })
    }

    fn statfs(&self) -> Result<FsStat> {
        let free = self.ring.total_bytes(NodeKind::Free)?;
        let blocks_free = blocks_for(free, STATFS_BLOCK_SIZE);
        Ok(FsStat {
            block_size: STATFS_BLOCK_SIZE,
            blocks: blocks_for(self.ring.len(), STATFS_BLOCK_SIZE),
            blocks_free,
            blocks_available: blocks_free,
            files: self.ring.count(NodeKind::Reserved)?,
            files_free: 0,
            name_max: u32::try_from(NODE_NAME_MAX).unwrap_or(u32::MAX),
        })
    }

    fn fsync(&self, path: &[u8]) -> Result<()> {
        self.resolve(path).map(|_| ())
    }
}
