//! SquashFS image access.
//!
//! Decoding is done by `backhand`; this module only opens the image, builds
//! an inode index the FUSE handlers can answer from, and hands out file
//! contents on demand.

use super::constants::{BLOCK_SIZE, DEFAULT_BLOCK_SIZE, INITIAL_INODE, ROOT_INODE};
use super::error::{Error, Result};
use backhand::{FilesystemReader, InnerNode, SquashfsFileReader};
use fuser::{FileAttr, FileType};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

/// Type of a node stored in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Directory
    Directory,
    /// Regular file of the given length
    File {
        /// Uncompressed length in bytes
        size: u64,
    },
    /// Symbolic link and its target
    Symlink(PathBuf),
    /// Character device
    CharDevice,
    /// Block device
    BlockDevice,
    /// FIFO
    NamedPipe,
    /// Unix socket
    Socket,
}

impl EntryKind {
    fn file_type(&self) -> FileType {
        match self {
            EntryKind::Directory => FileType::Directory,
            EntryKind::File { .. } => FileType::RegularFile,
            EntryKind::Symlink(_) => FileType::Symlink,
            EntryKind::CharDevice => FileType::CharDevice,
            EntryKind::BlockDevice => FileType::BlockDevice,
            EntryKind::NamedPipe => FileType::NamedPipe,
            EntryKind::Socket => FileType::Socket,
        }
    }

    fn size(&self) -> u64 {
        match self {
            EntryKind::File { size } => *size,
            EntryKind::Symlink(target) => target.as_os_str().len() as u64,
            _ => 0,
        }
    }
}

/// One node as read from the image, before inode numbers are assigned.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Absolute path inside the image
    pub path: PathBuf,
    /// Node type
    pub kind: EntryKind,
    /// Permission bits
    pub perm: u16,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Modification time, seconds since the epoch
    pub mtime: u32,
    /// Position of the node in the archive's node list
    pub node: usize,
}

/// An indexed node.
#[derive(Debug, Clone)]
pub struct Inode {
    /// Inode number handed to the kernel
    pub ino: u64,
    /// Inode number of the containing directory; the root is its own parent
    pub parent: u64,
    /// Last path component
    pub name: OsString,
    /// The node as read from the image
    pub entry: ImageEntry,
    /// Inode numbers of the directory's children, in image order
    pub children: Vec<u64>,
}

impl Inode {
    /// Whether this node is a directory.
    pub fn is_dir(&self) -> bool {
        self.entry.kind == EntryKind::Directory
    }

    /// FUSE file type of the node.
    pub fn file_type(&self) -> FileType {
        self.entry.kind.file_type()
    }

    /// Attributes reported to the kernel.
    pub fn attr(&self, index: &Index, blksize: u32) -> FileAttr {
        let size = self.entry.kind.size();
        let mtime = UNIX_EPOCH + Duration::from_secs(u64::from(self.entry.mtime));
        let nlink = if self.is_dir() {
            let subdirs = self
                .children
                .iter()
                .filter_map(|ino| index.get(*ino))
                .filter(|child| child.is_dir())
                .count();
            2 + subdirs as u32
        } else {
            1
        };

        FileAttr {
            ino: self.ino,
            size,
            blocks: size.div_ceil(BLOCK_SIZE),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: self.file_type(),
            perm: self.entry.perm & 0o7777,
            nlink,
            uid: self.entry.uid,
            gid: self.entry.gid,
            rdev: 0,
            flags: 0,
            blksize,
        }
    }
}

/// Inode table over every node of an image. Inode 1 is the root.
#[derive(Debug, Clone, Default)]
pub struct Index {
    inodes: Vec<Inode>,
}

impl Index {
    /// Builds the table from the image's node list.
    ///
    /// Parents are indexed before their children regardless of input order.
    /// A node whose parent is missing is dropped with a warning.
    pub fn build(mut entries: Vec<ImageEntry>) -> Self {
        entries.sort_by_key(|entry| normal_components(&entry.path).count());

        let has_root = entries
            .first()
            .is_some_and(|first| {
                first.kind == EntryKind::Directory && normal_components(&first.path).count() == 0
            });
        let root_entry = if has_root {
            entries.remove(0)
        } else {
            ImageEntry {
                path: PathBuf::from("/"),
                kind: EntryKind::Directory,
                perm: 0o755,
                uid: 0,
                gid: 0,
                mtime: 0,
                node: usize::MAX,
            }
        };

        let mut inodes = vec![Inode {
            ino: ROOT_INODE,
            parent: ROOT_INODE,
            name: OsString::from("/"),
            entry: root_entry,
            children: Vec::new(),
        }];
        let mut by_path: HashMap<PathBuf, u64> = HashMap::new();
        by_path.insert(PathBuf::new(), ROOT_INODE);

        let mut next_inode = INITIAL_INODE;
        for entry in entries {
            let relative: PathBuf = normal_components(&entry.path).collect();
            let Some(name) = relative.file_name().map(OsStr::to_os_string) else {
                continue;
            };
            let parent_path = relative.parent().map(Path::to_path_buf).unwrap_or_default();
            let Some(&parent) = by_path.get(&parent_path) else {
                warn!("no parent directory for {}", entry.path.display());
                continue;
            };
            if !inodes[(parent - 1) as usize].is_dir() {
                warn!("parent of {} is not a directory", entry.path.display());
                continue;
            }

            let ino = next_inode;
            next_inode += 1;
            inodes[(parent - 1) as usize].children.push(ino);
            by_path.insert(relative, ino);
            inodes.push(Inode {
                ino,
                parent,
                name,
                entry,
                children: Vec::new(),
            });
        }

        debug!("indexed {} inodes", inodes.len());
        Self { inodes }
    }

    /// Inode by number.
    pub fn get(&self, ino: u64) -> Option<&Inode> {
        let pos = ino.checked_sub(1)?;
        self.inodes.get(usize::try_from(pos).ok()?)
    }

    /// Finds `name` inside directory `parent`.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Option<&Inode> {
        let dir = self.get(parent)?;
        dir.children
            .iter()
            .filter_map(|ino| self.get(*ino))
            .find(|child| child.name == name)
    }

    /// Number of inodes, root included.
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// Always false for a built index, which at least holds the root.
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }
}

fn normal_components(path: &Path) -> impl Iterator<Item = &OsStr> {
    path.components().filter_map(|component| match component {
        Component::Normal(part) => Some(part),
        _ => None,
    })
}

/// What the FUSE handlers need from an opened image.
pub trait ImageSource: Send {
    /// Inode table of the image.
    fn index(&self) -> &Index;

    /// Block size used for attribute and statfs replies.
    fn block_size(&self) -> u32;

    /// Size of the image in bytes, used for statfs.
    fn bytes_used(&self) -> u64;

    /// Decodes the whole content of a regular file.
    fn read_file(&self, inode: &Inode) -> io::Result<Vec<u8>>;
}

/// A SquashFS image opened through `backhand`.
pub struct SquashImage {
    reader: FilesystemReader<'static>,
    files: HashMap<usize, SquashfsFileReader>,
    index: Index,
    bytes_used: u64,
}

impl SquashImage {
    /// Opens and indexes the image at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ImageOpen` if the file cannot be opened or is not a
    /// readable SquashFS image.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::ImageOpen {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let bytes_used = file.metadata().map(|m| m.len()).unwrap_or(0);
        let reader =
            FilesystemReader::from_reader(BufReader::new(file)).map_err(|e| Error::ImageOpen {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let mut files = HashMap::new();
        let entries = reader
            .files()
            .enumerate()
            .map(|(node, entry)| ImageEntry {
                path: entry.fullpath.clone(),
                kind: match &entry.inner {
                    InnerNode::File(file) => {
                        files.insert(node, file.clone());
                        EntryKind::File {
                            size: u64::from(file.basic.file_size),
                        }
                    }
                    InnerNode::Symlink(link) => EntryKind::Symlink(link.link.clone()),
                    InnerNode::Dir(_) => EntryKind::Directory,
                    InnerNode::CharacterDevice(_) => EntryKind::CharDevice,
                    InnerNode::BlockDevice(_) => EntryKind::BlockDevice,
                    InnerNode::NamedPipe => EntryKind::NamedPipe,
                    InnerNode::Socket => EntryKind::Socket,
                },
                perm: entry.header.permissions,
                uid: entry.header.uid,
                gid: entry.header.gid,
                mtime: entry.header.mtime,
                node,
            })
            .collect();
        let index = Index::build(entries);

        debug!(
            "opened image {} ({} files)",
            path.display(),
            files.len()
        );
        Ok(Self {
            reader,
            files,
            index,
            bytes_used,
        })
    }
}

impl ImageSource for SquashImage {
    fn index(&self) -> &Index {
        &self.index
    }

    fn block_size(&self) -> u32 {
        match self.reader.block_size {
            0 => DEFAULT_BLOCK_SIZE,
            size => size,
        }
    }

    fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    fn read_file(&self, inode: &Inode) -> io::Result<Vec<u8>> {
        let file = self
            .files
            .get(&inode.entry.node)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut content = Vec::with_capacity(inode.entry.kind.size() as usize);
        self.reader.file(&file.basic).reader().read_to_end(&mut content)?;
        Ok(content)
    }
}

/// Slot holding the opened image, shared between the FUSE handlers and the
/// cleanup routine. Emptying it is how the image is destroyed.
pub struct ImageSlot<I> {
    image: Mutex<Option<I>>,
}

impl<I: ImageSource> ImageSlot<I> {
    /// Wraps an opened image.
    pub fn new(image: I) -> Self {
        Self {
            image: Mutex::new(Some(image)),
        }
    }

    /// Runs `f` against the image, or returns `None` once it is destroyed.
    pub fn with<R>(&self, f: impl FnOnce(&I) -> R) -> Option<R> {
        self.image.lock().as_ref().map(f)
    }

    /// Whether the image has not been destroyed yet.
    pub fn is_open(&self) -> bool {
        self.image.lock().is_some()
    }

    /// Drops the image. Returns false if it was already gone.
    pub fn destroy(&self) -> bool {
        self.image.lock().take().is_some()
    }
}

/// Symlink targets as raw bytes for readlink replies.
pub fn link_bytes(target: &Path) -> &[u8] {
    target.as_os_str().as_bytes()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modules::classify::{classify, ImageKind};
    use backhand::{FilesystemWriter, NodeHeader};
    use std::io::Cursor;

    /// Writes a small SquashFS image holding `/etc/hostname`.
    pub(crate) fn write_sample_image(path: &Path) -> anyhow::Result<()> {
        let mut writer = FilesystemWriter::default();
        writer.push_dir("etc", NodeHeader::new(0o755, 0, 0, 1_700_000_000))?;
        writer.push_file(
            Cursor::new(b"sandbox\n".to_vec()),
            "etc/hostname",
            NodeHeader::new(0o644, 0, 0, 1_700_000_000),
        )?;
        let mut out = File::create(path)?;
        writer.write(&mut out)?;
        Ok(())
    }

    pub(crate) fn entry(path: &str, kind: EntryKind, node: usize) -> ImageEntry {
        ImageEntry {
            path: PathBuf::from(path),
            kind,
            perm: 0o755,
            uid: 0,
            gid: 0,
            mtime: 1_700_000_000,
            node,
        }
    }

    /// In-memory image keyed by node position.
    pub(crate) struct MemImage {
        pub index: Index,
        pub contents: HashMap<usize, Vec<u8>>,
    }

    impl MemImage {
        pub(crate) fn sample() -> Self {
            let entries = vec![
                entry("/etc/hostname", EntryKind::File { size: 8 }, 3),
                entry("/", EntryKind::Directory, 0),
                entry("/etc", EntryKind::Directory, 1),
                entry("/bin", EntryKind::Directory, 2),
                entry("/bin/sh", EntryKind::Symlink(PathBuf::from("busybox")), 4),
            ];
            let mut contents = HashMap::new();
            contents.insert(3, b"sandbox\n".to_vec());
            Self {
                index: Index::build(entries),
                contents,
            }
        }
    }

    impl ImageSource for MemImage {
        fn index(&self) -> &Index {
            &self.index
        }

        fn block_size(&self) -> u32 {
            4096
        }

        fn bytes_used(&self) -> u64 {
            8192
        }

        fn read_file(&self, inode: &Inode) -> io::Result<Vec<u8>> {
            self.contents
                .get(&inode.entry.node)
                .cloned()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    #[test]
    fn test_index_orders_parents_first() {
        let image = MemImage::sample();
        let index = &image.index;
        assert_eq!(index.len(), 5);

        let etc = index.lookup(ROOT_INODE, OsStr::new("etc")).unwrap();
        assert!(etc.is_dir());
        assert_eq!(etc.parent, ROOT_INODE);

        let hostname = index.lookup(etc.ino, OsStr::new("hostname")).unwrap();
        assert_eq!(hostname.parent, etc.ino);
        assert_eq!(hostname.file_type(), FileType::RegularFile);
    }

    #[test]
    fn test_root_is_synthesized_when_missing() {
        let index = Index::build(vec![entry("/a", EntryKind::File { size: 1 }, 0)]);
        let root = index.get(ROOT_INODE).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.children.len(), 1);
    }

    #[test]
    fn test_orphans_are_dropped() {
        let index = Index::build(vec![
            entry("/", EntryKind::Directory, 0),
            entry("/missing/file", EntryKind::File { size: 1 }, 1),
        ]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_lookup_misses() {
        let image = MemImage::sample();
        assert!(image.index.lookup(ROOT_INODE, OsStr::new("nope")).is_none());
        assert!(image.index.lookup(999, OsStr::new("etc")).is_none());
        assert!(image.index.get(0).is_none());
    }

    #[test]
    fn test_attributes() {
        let image = MemImage::sample();
        let index = &image.index;
        let root = index.get(ROOT_INODE).unwrap().attr(index, 4096);
        assert_eq!(root.kind, FileType::Directory);
        // "." plus "etc" and "bin"
        assert_eq!(root.nlink, 4);

        let sh = index
            .lookup(index.lookup(ROOT_INODE, OsStr::new("bin")).unwrap().ino, OsStr::new("sh"))
            .unwrap();
        let attr = sh.attr(index, 4096);
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(attr.size, "busybox".len() as u64);
        assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    }

    #[test]
    fn test_slot_destroy_once() {
        let slot = ImageSlot::new(MemImage::sample());
        assert!(slot.is_open());
        assert_eq!(slot.with(|image| image.index().len()), Some(5));
        assert!(slot.destroy());
        assert!(!slot.destroy());
        assert!(slot.with(|image| image.index().len()).is_none());
    }

    #[test]
    fn test_open_real_image() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rootfs.sqfs");
        write_sample_image(&path)?;
        assert_eq!(classify(&path)?, ImageKind::Image);

        let image = SquashImage::open(&path)?;
        let index = image.index();
        assert!(index.get(ROOT_INODE).unwrap().is_dir());

        let etc = index.lookup(ROOT_INODE, OsStr::new("etc")).unwrap();
        assert!(etc.is_dir());
        let hostname = index.lookup(etc.ino, OsStr::new("hostname")).unwrap();
        assert_eq!(hostname.entry.kind, EntryKind::File { size: 8 });
        assert_eq!(hostname.entry.perm & 0o777, 0o644);
        assert_eq!(hostname.entry.mtime, 1_700_000_000);

        assert_eq!(image.read_file(hostname)?, b"sandbox\n");
        // Reading twice decodes again from the archive
        assert_eq!(image.read_file(hostname)?, b"sandbox\n");
        assert!(image.read_file(etc).is_err());
        assert!(image.block_size() > 0);
        assert!(image.bytes_used() > 0);
        Ok(())
    }

    #[test]
    fn test_open_rejects_non_image() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("not-an-image");
        std::fs::write(&path, [0u8; 4096])?;
        assert!(matches!(
            SquashImage::open(&path),
            Err(Error::ImageOpen { .. })
        ));
        assert!(matches!(
            SquashImage::open(dir.path().join("missing")),
            Err(Error::ImageOpen { .. })
        ));
        Ok(())
    }
}
