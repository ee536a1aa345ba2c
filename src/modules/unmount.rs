//! Unmounting that cannot leave a busy mount behind.
//!
//! A plain unmount fails with `EBUSY` while any process still has its
//! working directory or an open file inside the mount, and `fuser` only logs
//! that. `FuseUnmount` checks the mount table afterwards and lazily detaches
//! whatever is still there, so the mount point is free once teardown returns.

use super::constants::{FUSERMOUNT, MOUNT_TABLE};
use super::lifecycle::Unmount;
use log::{debug, warn};
use nix::errno::Errno;
use nix::mount::{self, MntFlags};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Unmount handle that falls back to a lazy detach.
pub struct FuseUnmount<U> {
    inner: U,
    mount_point: PathBuf,
}

impl<U: Unmount> FuseUnmount<U> {
    /// Wraps `inner`, which unmounts the FUSE filesystem at `mount_point`.
    /// `mount_point` must be absolute, as the mount table lists it.
    pub fn new<P: AsRef<Path>>(inner: U, mount_point: P) -> Self {
        Self {
            inner,
            mount_point: mount_point.as_ref().to_path_buf(),
        }
    }
}

impl<U: Unmount> Unmount for FuseUnmount<U> {
    fn unmount(&mut self) -> io::Result<()> {
        self.inner.unmount()?;
        if !is_fuse_mounted(&self.mount_point)? {
            return Ok(());
        }
        warn!(
            "{} is still busy, detaching it",
            self.mount_point.display()
        );
        detach(&self.mount_point)
    }
}

/// Whether a FUSE filesystem is mounted at `mount_point`.
///
/// # Errors
///
/// Returns the I/O error if the mount table cannot be read.
pub fn is_fuse_mounted(mount_point: &Path) -> io::Result<bool> {
    let table = fs::read_to_string(MOUNT_TABLE)?;
    Ok(fuse_mounted_in(&table, mount_point))
}

/// Looks `mount_point` up in mount table text in `/proc/mounts` format.
pub fn fuse_mounted_in(table: &str, mount_point: &Path) -> bool {
    table.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let (Some(_source), Some(target), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return false;
        };
        (fstype == "fuse" || fstype.starts_with("fuse."))
            && decode_mount_field(target) == mount_point
    })
}

/// Undoes the octal escapes (`\040` for a space) used in the mount table.
fn decode_mount_field(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = bytes.get(i + 1..i + 4).filter(|_| bytes[i] == b'\\');
        match escape.and_then(|digits| u8::from_str_radix(std::str::from_utf8(digits).ok()?, 8).ok()) {
            Some(byte) => {
                decoded.push(byte);
                i += 4;
            }
            None => {
                decoded.push(bytes[i]);
                i += 1;
            }
        }
    }
    PathBuf::from(OsString::from_vec(decoded))
}

/// Lazily detaches the mount at `mount_point`: directly when privileged,
/// through `fusermount -u -z` otherwise.
fn detach(mount_point: &Path) -> io::Result<()> {
    match mount::umount2(mount_point, MntFlags::MNT_DETACH) {
        Ok(()) => return Ok(()),
        Err(Errno::EPERM) => debug!("umount2 not permitted, trying fusermount"),
        Err(e) => return Err(e.into()),
    }

    let mut last = io::Error::from(io::ErrorKind::NotFound);
    for program in FUSERMOUNT {
        match Command::new(program)
            .arg("-u")
            .arg("-z")
            .arg(mount_point)
            .output()
        {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                last = io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "{} -u -z failed: {}",
                        program,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                );
            }
            Err(e) => last = e,
        }
    }
    Err(last)
}
