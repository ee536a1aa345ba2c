//! Runtime configuration.
//!
//! `Config` is what the caller controls: verbosity and a couple of mount
//! knobs. The FUSE mount options and the `fuser` log filter are derived
//! from it.

use super::constants::FS_SUBTYPE;
use fuser::MountOption;
use log::LevelFilter;
use std::path::Path;

/// Number of `-v` flags at which the FUSE library's own request tracing is
/// switched on.
pub const SERVICE_DEBUG_VERBOSITY: u8 = 2;

/// Caller-facing configuration shared with the rest of the launcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// How many "more verbose" steps above the baseline were requested
    pub verbosity: u8,
    /// Let users other than the mounting user access the mount
    pub allow_other: bool,
    /// Source name shown in the mount table; the image path when unset
    pub fs_name: Option<String>,
}

impl Config {
    /// Creates a configuration with the given verbosity and defaults otherwise.
    pub fn with_verbosity(verbosity: u8) -> Self {
        Self {
            verbosity,
            ..Self::default()
        }
    }

    /// Log level for this crate's own diagnostics.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    /// Whether the FUSE library's request tracing is on.
    pub fn service_debug(&self) -> bool {
        self.verbosity >= SERVICE_DEBUG_VERBOSITY
    }

    /// Log level applied to the `fuser` module.
    pub fn service_log_level(&self) -> LevelFilter {
        if self.service_debug() {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        }
    }

    /// Options the image at `image` is mounted with.
    pub fn mount_options(&self, image: &Path) -> Vec<MountOption> {
        let fs_name = self
            .fs_name
            .clone()
            .unwrap_or_else(|| image.display().to_string());
        let mut options = vec![
            MountOption::RO,
            MountOption::FSName(fs_name),
            MountOption::Subtype(FS_SUBTYPE.to_string()),
            MountOption::DefaultPermissions,
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_service_debug_only_at_highest_tier() {
        assert!(!Config::with_verbosity(0).service_debug());
        assert!(!Config::with_verbosity(1).service_debug());
        assert!(Config::with_verbosity(2).service_debug());
        assert!(Config::with_verbosity(5).service_debug());
    }

    #[test]
    fn test_service_log_levels() {
        assert_eq!(Config::with_verbosity(0).service_log_level(), LevelFilter::Warn);
        assert_eq!(Config::with_verbosity(1).service_log_level(), LevelFilter::Warn);
        assert_eq!(Config::with_verbosity(2).service_log_level(), LevelFilter::Debug);
    }

    #[test]
    fn test_log_level_tiers() {
        assert_eq!(Config::with_verbosity(0).log_level(), LevelFilter::Info);
        assert_eq!(Config::with_verbosity(1).log_level(), LevelFilter::Debug);
        assert_eq!(Config::with_verbosity(3).log_level(), LevelFilter::Trace);
    }

    #[test]
    fn test_mount_options() {
        let image = PathBuf::from("/tmp/image.sqfs");
        let options = Config::default().mount_options(&image);
        assert!(options.contains(&MountOption::RO));
        assert!(options.contains(&MountOption::FSName("/tmp/image.sqfs".to_string())));
        assert!(options.contains(&MountOption::Subtype("squashfs".to_string())));
        assert!(!options.contains(&MountOption::AllowOther));

        let config = Config {
            allow_other: true,
            ..Config::default()
        };
        assert!(config.mount_options(&image).contains(&MountOption::AllowOther));
    }

    #[test]
    fn test_fs_name_overrides_image_path() {
        let config = Config {
            fs_name: Some("rootfs".to_string()),
            ..Config::default()
        };
        let options = config.mount_options(Path::new("/tmp/image.sqfs"));
        assert!(options.contains(&MountOption::FSName("rootfs".to_string())));
        assert!(!options.contains(&MountOption::FSName("/tmp/image.sqfs".to_string())));
    }
}
