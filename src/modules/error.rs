//! Error type shared by every stage of a mount.
//!
//! Each variant names the stage that failed so an operator can tell from a
//! single diagnostic line where the mount attempt stopped.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can stop a mount from being set up or served.
#[derive(Debug, Error)]
pub enum Error {
    /// The mount directory argument was empty.
    #[error("mount point can't be empty")]
    EmptyMountPoint,

    /// Another mount session is already live in this process.
    #[error("a mount session is already active at {}", .0.display())]
    SessionActive(PathBuf),

    /// `stat` on a path failed.
    #[error("can't stat {}: {source}", .path.display())]
    Stat {
        /// Path that was inspected
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// A file could not be opened.
    #[error("can't open {}: {source}", .path.display())]
    Open {
        /// Path that was opened
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// A file could not be read, including files shorter than the magic.
    #[error("can't read {}: {source}", .path.display())]
    Read {
        /// Path that was read
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// The archive library refused the image.
    #[error("failed to open {}: {reason}", .path.display())]
    ImageOpen {
        /// Image path
        path: PathBuf,
        /// Message reported by the archive library
        reason: String,
    },

    /// The mount directory did not exist and could not be created.
    #[error("failed to create: {}: {source}", .path.display())]
    CreateMountPoint {
        /// Mount directory
        path: PathBuf,
        /// Underlying errno
        source: nix::Error,
    },

    /// No FUSE session could be created at all.
    #[error("failed to create fuse session: {reason}")]
    SessionCreate {
        /// Why the FUSE device was unusable
        reason: String,
    },

    /// The FUSE session existed but mounting it failed.
    #[error("failed to mount {}: {source}", .path.display())]
    Mount {
        /// Mount point
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// Termination signal handlers could not be installed.
    #[error("can't set signal handlers: {0}")]
    SignalHandlers(#[source] io::Error),

    /// A termination signal tore the session down before serving began.
    #[error("mount session at {} was torn down before serving", .path.display())]
    SessionClosed {
        /// Mount point
        path: PathBuf,
    },

    /// The worker process could not be spawned.
    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        /// Program that was spawned
        program: String,
        /// Underlying I/O error
        source: io::Error,
    },

    /// The blocking FUSE loop returned an error.
    #[error("fuse loop failed: {0}")]
    ServiceLoop(#[source] io::Error),
}

impl Error {
    /// Returns true for configuration errors, which are raised before any
    /// resource is touched.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::EmptyMountPoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_and_mount_failures_are_distinguishable() {
        let session = Error::SessionCreate {
            reason: "/dev/fuse not found".to_string(),
        };
        let mount = Error::Mount {
            path: PathBuf::from("/tmp/mnt"),
            source: io::Error::from_raw_os_error(libc::EPERM),
        };

        let session_msg = session.to_string();
        let mount_msg = mount.to_string();
        assert!(session_msg.contains("failed to create fuse session"));
        assert!(mount_msg.contains("failed to mount"));
        assert!(!session_msg.contains("failed to mount"));
        assert!(!mount_msg.contains("fuse session"));
    }

    #[test]
    fn test_io_errors_name_the_path() {
        let err = Error::Read {
            path: PathBuf::from("/tmp/image.sqfs"),
            source: io::Error::from(io::ErrorKind::UnexpectedEof),
        };
        assert!(err.to_string().starts_with("can't read /tmp/image.sqfs"));
        assert!(!err.is_config());
    }

    #[test]
    fn test_session_closed_names_mount_point() {
        let err = Error::SessionClosed {
            path: PathBuf::from("/tmp/mnt"),
        };
        assert!(err.to_string().contains("/tmp/mnt"));
        assert!(!err.is_config());
    }

    #[test]
    fn test_empty_mount_point_is_config_error() {
        assert!(Error::EmptyMountPoint.is_config());
        assert_eq!(Error::EmptyMountPoint.to_string(), "mount point can't be empty");
    }
}
