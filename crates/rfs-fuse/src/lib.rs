#![forbid(unsafe_code)]
//! FUSE adapter for RingFS.
//!
//! Kernel requests arrive through `fuser` addressed by inode number. The
//! adapter keeps a per-mount table from inode numbers to file names, turns
//! each request into a path, and forwards it to a [`PathOps`]
//! implementation. Errors are mapped through [`RfsError::to_errno()`].
//!
//! `fuser` runs one request at a time on the session thread, which is the
//! serialization [`PathOps`] expects.

use fuser::{
    FUSE_ROOT_ID, FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, TimeOrNow,
};
use rfs_core::{FileKind, FsStat, NodeAttr, PathOps};
use rfs_error::{Result, RfsError};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// TTL for cached attributes and entries.
///
/// The mount is the only writer, so the kernel cache stays coherent; a short
/// TTL keeps external edits to the image visible after a remount.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// Structured error context for FUSE operation failures.
pub struct FuseErrorContext<'a> {
    pub error: &'a RfsError,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // Missing names are routine for lookup; keep them out of warn.
        if errno == libc::ENOENT {
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "FUSE op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
    }
}

fn to_file_attr(ino: u64, attr: &NodeAttr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── Inode table ─────────────────────────────────────────────────────────────

/// Inode numbers handed out during this mount.
///
/// Numbers are never reused within a mount; a renamed file keeps its number.
#[derive(Debug)]
struct InodeTable {
    names: HashMap<u64, Vec<u8>>,
    inos: HashMap<Vec<u8>, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        Self {
            names: HashMap::new(),
            inos: HashMap::new(),
            next: FUSE_ROOT_ID + 1,
        }
    }

    /// Path for `ino`: `/` for the root, `/name` for files.
    fn path(&self, ino: u64) -> Option<Vec<u8>> {
        if ino == FUSE_ROOT_ID {
            return Some(b"/".to_vec());
        }
        self.names.get(&ino).map(|name| path_of(name))
    }

    fn assign(&mut self, name: &[u8]) -> u64 {
        if let Some(ino) = self.inos.get(name) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.inos.insert(name.to_vec(), ino);
        self.names.insert(ino, name.to_vec());
        ino
    }

    fn forget(&mut self, name: &[u8]) {
        if let Some(ino) = self.inos.remove(name) {
            self.names.remove(&ino);
        }
    }

    fn rename(&mut self, from: &[u8], to: &[u8]) {
        if from == to {
            return;
        }
        self.forget(to);
        if let Some(ino) = self.inos.remove(from) {
            self.inos.insert(to.to_vec(), ino);
            self.names.insert(ino, to.to_vec());
        }
    }
}

fn path_of(name: &[u8]) -> Vec<u8> {
    let mut path = Vec::with_capacity(name.len() + 1);
    path.push(b'/');
    path.extend_from_slice(name);
    path
}

fn unmounted() -> RfsError {
    RfsError::NotFound("filesystem is no longer mounted".to_owned())
}

/// A directory entry ready for `ReplyDirectory::add`.
#[derive(Debug, Clone)]
struct ListedEntry {
    ino: u64,
    offset: u64,
    kind: FileType,
    name: Vec<u8>,
}

/// Attribute changes carried by one `setattr` request.
#[derive(Debug, Clone, Default)]
struct SetAttr {
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
}

/// `Now` maps to `None`, which [`PathOps::utimens`] stamps with the current
/// time; an absent time keeps `current`.
fn utimens_arg(requested: Option<TimeOrNow>, current: SystemTime) -> Option<SystemTime> {
    match requested {
        Some(TimeOrNow::SpecificTime(time)) => Some(time),
        Some(TimeOrNow::Now) => None,
        None => Some(current),
    }
}

// ── RingFuse ────────────────────────────────────────────────────────────────

/// FUSE filesystem backed by a [`PathOps`] implementation.
pub struct RingFuse {
    fs: Option<Box<dyn PathOps>>,
    inodes: InodeTable,
    read_only: bool,
}

impl std::fmt::Debug for RingFuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingFuse")
            .field("mounted", &self.fs.is_some())
            .field("inodes", &self.inodes.names.len())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl RingFuse {
    #[must_use]
    pub fn new(fs: Box<dyn PathOps>, options: &MountOptions) -> Self {
        Self {
            fs: Some(fs),
            inodes: InodeTable::new(),
            read_only: options.read_only,
        }
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn ops(&self) -> Result<&dyn PathOps> {
        self.fs.as_deref().ok_or_else(unmounted)
    }

    fn ops_mut(fs: &mut Option<Box<dyn PathOps>>) -> Result<&mut Box<dyn PathOps>> {
        fs.as_mut().ok_or_else(unmounted)
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            Err(RfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn path(&self, ino: u64) -> Result<Vec<u8>> {
        self.inodes
            .path(ino)
            .ok_or_else(|| RfsError::NotFound(format!("inode {ino}")))
    }

    /// Path of `name` inside `parent`; only the root has children.
    fn child_path(parent: u64, name: &OsStr) -> Result<Vec<u8>> {
        if parent != FUSE_ROOT_ID {
            return Err(RfsError::NotFound(format!(
                "inode {parent} is not a directory"
            )));
        }
        Ok(path_of(name.as_bytes()))
    }

    // ── Request bodies ──────────────────────────────────────────────────

    fn do_lookup(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = Self::child_path(parent, name)?;
        let attr = self.ops()?.getattr(&path)?;
        let ino = self.inodes.assign(name.as_bytes());
        Ok(to_file_attr(ino, &attr))
    }

    fn do_getattr(&self, ino: u64) -> Result<FileAttr> {
        let path = self.path(ino)?;
        let attr = self.ops()?.getattr(&path)?;
        Ok(to_file_attr(ino, &attr))
    }

    /// Entries after cookie `offset`, with inode numbers assigned.
    fn do_readdir(&mut self, ino: u64, offset: u64) -> Result<Vec<ListedEntry>> {
        let path = self.path(ino)?;
        let entries = self.ops()?.readdir(&path)?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries.into_iter().filter(|entry| entry.offset > offset) {
            // `.` and `..` both name the root.
            let ino = if entry.kind == FileKind::Directory {
                FUSE_ROOT_ID
            } else {
                self.inodes.assign(&entry.name)
            };
            out.push(ListedEntry {
                ino,
                offset: entry.offset,
                kind: to_fuser_file_type(entry.kind),
                name: entry.name,
            });
        }
        Ok(out)
    }

    fn do_open(&self, ino: u64) -> Result<()> {
        let path = self.path(ino)?;
        self.ops()?.open(&path)
    }

    fn do_read(&mut self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let path = self.path(ino)?;
        Self::ops_mut(&mut self.fs)?.read(&path, offset, size)
    }

    fn do_write(&mut self, ino: u64, offset: u64, data: &[u8]) -> Result<u32> {
        self.writable()?;
        let path = self.path(ino)?;
        Self::ops_mut(&mut self.fs)?.write(&path, offset, data)
    }

    fn do_create(
        &mut self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        uid: u32,
        gid: u32,
        exclusive: bool,
    ) -> Result<FileAttr> {
        self.writable()?;
        let path = Self::child_path(parent, name)?;
        let fs = Self::ops_mut(&mut self.fs)?;
        let attr = if exclusive {
            fs.mknod(&path, mode, uid, gid)?
        } else {
            fs.create(&path, mode, uid, gid)?
        };
        let ino = self.inodes.assign(name.as_bytes());
        Ok(to_file_attr(ino, &attr))
    }

    fn do_setattr(&mut self, ino: u64, request: &SetAttr) -> Result<FileAttr> {
        self.writable()?;
        let path = self.path(ino)?;
        let fs = Self::ops_mut(&mut self.fs)?;
        if let Some(mode) = request.mode {
            fs.chmod(&path, mode)?;
        }
        if request.uid.is_some() || request.gid.is_some() {
            fs.chown(&path, request.uid, request.gid)?;
        }
        if let Some(size) = request.size {
            fs.truncate(&path, size)?;
        }
        if request.atime.is_some() || request.mtime.is_some() {
            let current = fs.getattr(&path)?;
            fs.utimens(
                &path,
                utimens_arg(request.atime, current.atime),
                utimens_arg(request.mtime, current.mtime),
            )?;
        }
        let attr = fs.getattr(&path)?;
        Ok(to_file_attr(ino, &attr))
    }

    fn do_rename(
        &mut self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<()> {
        self.writable()?;
        let from = Self::child_path(parent, name)?;
        let to = Self::child_path(newparent, newname)?;
        Self::ops_mut(&mut self.fs)?.rename(&from, &to)?;
        self.inodes.rename(name.as_bytes(), newname.as_bytes());
        Ok(())
    }

    fn do_unlink(&mut self, parent: u64, name: &OsStr) -> Result<()> {
        self.writable()?;
        let path = Self::child_path(parent, name)?;
        Self::ops_mut(&mut self.fs)?.unlink(&path)?;
        self.inodes.forget(name.as_bytes());
        Ok(())
    }

    fn do_statfs(&self) -> Result<FsStat> {
        self.ops()?.statfs()
    }

    fn do_fsync(&self, ino: u64) -> Result<()> {
        let path = self.path(ino)?;
        self.ops()?.fsync(&path)
    }
}

impl Filesystem for RingFuse {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), c_int> {
        info!(read_only = self.read_only, "RingFS session started");
        Ok(())
    }

    fn destroy(&mut self) {
        // Dropping the handle unmaps the image.
        self.fs = None;
        info!("RingFS session ended");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "lookup",
                    ino: parent,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "getattr",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let cookie = u64::try_from(offset).unwrap_or(0);
        match self.do_readdir(ino, cookie) {
            Ok(entries) => {
                for entry in &entries {
                    let full = reply.add(
                        entry.ino,
                        i64::try_from(entry.offset).unwrap_or(i64::MAX),
                        entry.kind,
                        OsStr::from_bytes(&entry.name),
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "readdir",
                    ino,
                    offset: Some(cookie),
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.do_open(ino) {
            // Stateless open: no file handles are tracked.
            Ok(()) => reply.opened(0, 0),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "open",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.do_read(ino, byte_offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "read",
                    ino,
                    offset: Some(byte_offset),
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.do_write(ino, byte_offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "write",
                    ino,
                    offset: Some(byte_offset),
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.do_create(parent, name, mode, req.uid(), req.gid(), false) {
            Ok(attr) => reply.created(&ATTR_TTL, &attr, 0, 0, 0),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "create",
                    ino: parent,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.do_create(parent, name, mode, req.uid(), req.gid(), true) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "mknod",
                    ino: parent,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let request = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
        };
        match self.do_setattr(ino, &request) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "setattr",
                    ino,
                    offset: size,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.do_rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "rename",
                    ino: parent,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "unlink",
                    ino: parent,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.do_statfs() {
            Ok(stat) => reply.statfs(
                stat.blocks,
                stat.blocks_free,
                stat.blocks_available,
                stat.files,
                stat.files_free,
                stat.block_size,
                stat.name_max,
                stat.block_size,
            ),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "statfs",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.do_fsync(ino) {
            Ok(()) => reply.ok(),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "fsync",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("ringfs".to_owned()),
        MountOption::Subtype("rfs".to_owned()),
        MountOption::DefaultPermissions,
    ];

    if options.read_only {
        opts.push(MountOption::RO);
    } else {
        opts.push(MountOption::RW);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

/// Mount `fs` at `mountpoint` and serve requests until it is unmounted.
pub fn mount(
    fs: Box<dyn PathOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> std::result::Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    if !mountpoint.is_dir() {
        return Err(FuseError::InvalidMountpoint(format!(
            "mountpoint is not a directory: {}",
            mountpoint.display()
        )));
    }
    let fuse_opts = build_mount_options(options);
    info!(
        mountpoint = %mountpoint.display(),
        read_only = options.read_only,
        "mounting RingFS"
    );
    fuser::mount2(RingFuse::new(fs, options), mountpoint, &fuse_opts)?;
    debug!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(())
}
