//! Filesystem and process constants.

use std::time::Duration;

/// SquashFS superblock magic, 0x73717368 stored little-endian
pub const SQUASHFS_MAGIC: [u8; 4] = *b"hsqs";

// File system constants
/// How long the kernel may cache attributes and entries
pub const TTL: Duration = Duration::from_secs(1);
/// Unit of `st_blocks`
pub const BLOCK_SIZE: u64 = 512;
/// Inode number of the image root
pub const ROOT_INODE: u64 = 1;
/// First inode number handed to a non-root node
pub const INITIAL_INODE: u64 = 2;
/// Longest file name reported by statfs
pub const NAME_MAX: u32 = 255;
/// Block size assumed when the image reports none
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Mount directory permissions before umask; the sandbox narrows them later
pub const MOUNT_DIR_MODE: u32 = 0o777;

/// FUSE character device
pub const FUSE_DEVICE: &str = "/dev/fuse";
/// Filesystem subtype, shown as `fuse.squashfs` in the mount table
pub const FS_SUBTYPE: &str = "squashfs";
/// Mount table of the current process
pub const MOUNT_TABLE: &str = "/proc/self/mounts";
/// Setuid helpers able to detach a FUSE mount without privileges, newest first
pub const FUSERMOUNT: [&str; 2] = ["fusermount3", "fusermount"];

// Worker environment
/// Variable through which the worker learns the mount point
pub const MOUNT_POINT_ENV: &str = "SQUASHMOUNT_MOUNT_POINT";
/// Worker argument replaced by the mount point
pub const MOUNT_POINT_PLACEHOLDER: &str = "{}";
/// Worker program when neither a command nor `$SHELL` is given
pub const DEFAULT_SHELL: &str = "/bin/sh";
