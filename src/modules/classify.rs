//! Image classification.
//!
//! Decides whether a path can be used as a container root as-is (a
//! directory), needs mounting (a SquashFS image), or is neither.

use super::constants::SQUASHFS_MAGIC;
use super::error::{Error, Result};
use log::debug;
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

/// What a path turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// A directory, usable without mounting
    Directory,
    /// A regular file starting with the SquashFS magic
    Image,
    /// Anything else
    Other,
}

impl ImageKind {
    /// Returns true when the path should be mounted before use.
    pub fn is_mountable(self) -> bool {
        self == ImageKind::Image
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageKind::Directory => "directory",
            ImageKind::Image => "image",
            ImageKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Classifies `path` as a directory, a SquashFS image, or something else.
///
/// # Errors
///
/// * `Error::Stat` if the path cannot be inspected
/// * `Error::Open` if a regular file cannot be opened
/// * `Error::Read` if fewer than four bytes can be read from a regular file
pub fn classify<P: AsRef<Path>>(path: P) -> Result<ImageKind> {
    let path = path.as_ref();
    let metadata = fs::metadata(path).map_err(|source| Error::Stat {
        path: path.to_path_buf(),
        source,
    })?;

    if metadata.is_dir() {
        return Ok(ImageKind::Directory);
    }
    if !metadata.is_file() {
        return Ok(ImageKind::Other);
    }

    let mut file = File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(
        "magic number: {:02x}{:02x}{:02x}{:02x}",
        magic[3], magic[2], magic[1], magic[0]
    );

    if magic == SQUASHFS_MAGIC {
        Ok(ImageKind::Image)
    } else {
        Ok(ImageKind::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use tempfile::tempdir;

    #[test]
    fn test_directory_is_directory() -> anyhow::Result<()> {
        let dir = tempdir()?;
        // Contents are never looked at
        fs::write(dir.path().join("hsqs"), b"hsqs")?;
        assert_eq!(classify(dir.path())?, ImageKind::Directory);
        Ok(())
    }

    #[test]
    fn test_magic_is_image() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("image.sqfs");
        fs::write(&path, [0x68, 0x73, 0x71, 0x73, 0x04, 0x00, 0x00, 0x00])?;
        assert_eq!(classify(&path)?, ImageKind::Image);
        assert!(classify(&path)?.is_mountable());
        Ok(())
    }

    #[test]
    fn test_exact_magic_length_is_image() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("image.sqfs");
        fs::write(&path, b"hsqs")?;
        assert_eq!(classify(&path)?, ImageKind::Image);
        Ok(())
    }

    #[test]
    fn test_wrong_magic_is_other() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("image.sqfs");
        fs::write(&path, [0u8; 4])?;
        assert_eq!(classify(&path)?, ImageKind::Other);

        // Big-endian magic is a different format
        fs::write(&path, b"sqsh")?;
        assert_eq!(classify(&path)?, ImageKind::Other);
        Ok(())
    }

    #[test]
    fn test_short_file_is_read_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("short");
        fs::write(&path, b"hsq")?;
        match classify(&path) {
            Err(Error::Read { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected read error, got {:?}", other),
        }

        fs::write(&path, b"")?;
        assert!(matches!(classify(&path), Err(Error::Read { .. })));
        Ok(())
    }

    #[test]
    fn test_missing_path_is_stat_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        assert!(matches!(classify(&path), Err(Error::Stat { .. })));
    }

    #[test]
    fn test_socket_is_other() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("sock");
        let _listener = UnixListener::bind(&path)?;
        assert_eq!(classify(&path)?, ImageKind::Other);
        Ok(())
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ImageKind::Directory.to_string(), "directory");
        assert_eq!(ImageKind::Image.to_string(), "image");
        assert_eq!(ImageKind::Other.to_string(), "other");
    }
}
