//! FUSE operation table for a mounted image.
//!
//! Every handler answers from the shared image slot. Once the cleanup
//! routine has destroyed the image, handlers fail with `EIO` until the
//! unmount lands.

use super::constants::{NAME_MAX, TTL};
use super::image::{link_bytes, EntryKind, ImageSlot, ImageSource};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use libc::{c_int, EINVAL, EIO, EISDIR, ENODATA, ENOENT, ENOTDIR, EROFS};
use log::{debug, trace};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

/// One directory entry as handed to `readdir`.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    /// Inode of the entry
    pub ino: u64,
    /// Offset to resume listing after this entry
    pub offset: i64,
    /// Entry type
    pub kind: FileType,
    /// Entry name
    pub name: OsString,
}

/// Values returned by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    /// Total blocks of `bsize` bytes; none are ever free
    pub blocks: u64,
    /// Number of inodes
    pub files: u64,
    /// Block size
    pub bsize: u32,
    /// Longest name
    pub namelen: u32,
}

/// Read-only filesystem backed by an image slot.
pub struct SquashFs<I> {
    image: Arc<ImageSlot<I>>,
    handles: HashMap<u64, Vec<u8>>,
    next_fh: u64,
}

impl<I: ImageSource> SquashFs<I> {
    /// Serves the image held in `image`.
    pub fn new(image: Arc<ImageSlot<I>>) -> Self {
        Self {
            image,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    /// Number of open file handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn attr_of(&self, ino: u64) -> Result<FileAttr, c_int> {
        self.image
            .with(|image| {
                let index = image.index();
                index
                    .get(ino)
                    .map(|inode| inode.attr(index, image.block_size()))
                    .ok_or(ENOENT)
            })
            .unwrap_or(Err(EIO))
    }

    /// Attributes of `name` inside directory `parent`.
    pub fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr, c_int> {
        self.image
            .with(|image| {
                let index = image.index();
                let dir = index.get(parent).ok_or(ENOENT)?;
                if !dir.is_dir() {
                    return Err(ENOTDIR);
                }
                index
                    .lookup(parent, name)
                    .map(|inode| inode.attr(index, image.block_size()))
                    .ok_or(ENOENT)
            })
            .unwrap_or(Err(EIO))
    }

    /// Attributes of inode `ino`.
    pub fn do_getattr(&self, ino: u64) -> Result<FileAttr, c_int> {
        self.attr_of(ino)
    }

    /// Target of the symlink `ino`; `EINVAL` for anything else.
    pub fn do_readlink(&self, ino: u64) -> Result<Vec<u8>, c_int> {
        self.image
            .with(|image| match image.index().get(ino).map(|inode| &inode.entry.kind) {
                Some(EntryKind::Symlink(target)) => Ok(link_bytes(target).to_vec()),
                Some(_) => Err(EINVAL),
                None => Err(ENOENT),
            })
            .unwrap_or(Err(EIO))
    }

    /// Decodes the file and keeps it behind a new handle until `release`.
    pub fn do_open(&mut self, ino: u64, flags: i32) -> Result<u64, c_int> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(EROFS);
        }
        let content = self
            .image
            .with(|image| {
                let inode = image.index().get(ino).ok_or(ENOENT)?;
                match inode.entry.kind {
                    EntryKind::File { .. } => image.read_file(inode).map_err(|e| {
                        debug!("read of inode {} failed: {}", ino, e);
                        e.raw_os_error().unwrap_or(EIO)
                    }),
                    EntryKind::Directory => Err(EISDIR),
                    _ => Err(EINVAL),
                }
            })
            .unwrap_or(Err(EIO))?;

        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, content);
        Ok(fh)
    }

    /// Up to `size` bytes of handle `fh` from `offset`, short at the end.
    pub fn do_read(&self, fh: u64, offset: i64, size: u32) -> Result<&[u8], c_int> {
        let content = self.handles.get(&fh).ok_or(EINVAL)?;
        let start = usize::try_from(offset).map_err(|_| EINVAL)?.min(content.len());
        let end = start.saturating_add(size as usize).min(content.len());
        Ok(&content[start..end])
    }

    /// Frees handle `fh`.
    pub fn do_release(&mut self, fh: u64) {
        self.handles.remove(&fh);
    }

    /// Checks that `ino` is a directory.
    pub fn do_opendir(&self, ino: u64) -> Result<(), c_int> {
        self.image
            .with(|image| match image.index().get(ino) {
                Some(inode) if inode.is_dir() => Ok(()),
                Some(_) => Err(ENOTDIR),
                None => Err(ENOENT),
            })
            .unwrap_or(Err(EIO))
    }

    /// Entries of directory `ino` starting after `offset`.
    pub fn dir_entries(&self, ino: u64, offset: i64) -> Result<Vec<DirEntry>, c_int> {
        self.image
            .with(|image| {
                let index = image.index();
                let dir = index.get(ino).ok_or(ENOENT)?;
                if !dir.is_dir() {
                    return Err(ENOTDIR);
                }

                let mut entries = vec![
                    (dir.ino, FileType::Directory, OsString::from(".")),
                    (dir.parent, FileType::Directory, OsString::from("..")),
                ];
                entries.extend(
                    dir.children
                        .iter()
                        .filter_map(|child| index.get(*child))
                        .map(|child| (child.ino, child.file_type(), child.name.clone())),
                );

                let skip = usize::try_from(offset).unwrap_or(0);
                Ok(entries
                    .into_iter()
                    .enumerate()
                    .skip(skip)
                    .map(|(i, (ino, kind, name))| DirEntry {
                        ino,
                        offset: (i + 1) as i64,
                        kind,
                        name,
                    })
                    .collect())
            })
            .unwrap_or(Err(EIO))
    }

    /// Image-wide counts for `statfs`.
    pub fn do_statfs(&self) -> Result<FsStats, c_int> {
        self.image
            .with(|image| {
                let bsize = image.block_size();
                FsStats {
                    blocks: image.bytes_used().div_ceil(u64::from(bsize)),
                    files: image.index().len() as u64,
                    bsize,
                    namelen: NAME_MAX,
                }
            })
            .ok_or(EIO)
    }
}

/// Images carry no extended attributes, so every name is missing and the
/// list is empty.
fn reply_empty_xattr(size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(0);
    } else {
        reply.data(&[]);
    }
}

impl<I: ImageSource> Filesystem for SquashFs<I> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("fuse session initialised");
        Ok(())
    }

    fn destroy(&mut self) {
        self.handles.clear();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!("lookup parent: {}, name: {:?}", parent, name);
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {}

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.do_readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(EROFS);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.do_read(fh, offset, size) {
            Ok(data) => reply.data(data),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.do_release(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.do_opendir(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(errno) => reply.error(errno),
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
        match self.dir_entries(ino, offset) {
            Ok(entries) => {
                for entry in entries {
                    if reply.add(entry.ino, entry.offset, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.do_statfs() {
            Ok(stats) => reply.statfs(
                stats.blocks,
                0,
                0,
                stats.files,
                0,
                stats.bsize,
                stats.namelen,
                stats.bsize,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        match self.attr_of(ino) {
            Ok(_) => reply.error(ENODATA),
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.attr_of(ino) {
            Ok(_) => reply_empty_xattr(size, reply),
            Err(errno) => reply.error(errno),
        }
    }
}
