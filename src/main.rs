use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use log::{error, info};
use squashmount::{classify, Config, ImageKind, Worker};
use std::ffi::OsString;
use std::fmt::Display;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase logging verbosity (-vv also traces FUSE requests)
    #[arg(short, long, global = true, action = ArgAction::Count, env = "SQUASHMOUNT_VERBOSE")]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount an image and run a command against it
    Mount {
        /// Let other users access the mount
        #[arg(long, env = "SQUASHMOUNT_ALLOW_OTHER")]
        allow_other: bool,
        /// Source name shown in the mount table (defaults to the image path)
        #[arg(long)]
        fs_name: Option<String>,
        /// SquashFS image, or a directory to use in place
        image: PathBuf,
        /// Mount point, created if missing
        mount_dir: OsString,
        /// Command to run; `{}` is replaced by the mount point. Defaults to $SHELL
        #[arg(last = true)]
        command: Vec<OsString>,
    },
    /// Report whether a path is a directory, an image or neither
    Classify {
        /// Path to inspect
        path: PathBuf,
    },
}

/// Logs a single diagnostic line and exits non-zero.
fn fatal(err: impl Display) -> ! {
    error!("{}", err);
    process::exit(1);
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Mount {
            allow_other,
            fs_name,
            ..
        } => Config {
            verbosity: cli.verbose,
            allow_other: *allow_other,
            fs_name: fs_name.clone(),
        },
        Commands::Classify { .. } => Config::with_verbosity(cli.verbose),
    };

    env_logger::Builder::new()
        .filter_level(config.log_level())
        .filter_module("fuser", config.service_log_level())
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Classify { path } => {
            let kind = classify(&path).unwrap_or_else(|e| fatal(e));
            println!("{}", kind);
        }
        Commands::Mount {
            image,
            mount_dir,
            command,
            ..
        } => {
            let worker = Worker::from_argv(&command);
            match classify(&image).unwrap_or_else(|e| fatal(e)) {
                ImageKind::Directory => {
                    info!("{} is a directory, nothing to mount", image.display());
                    let status = worker
                        .spawn(&image)
                        .unwrap_or_else(|e| fatal(e))
                        .wait()
                        .context("waiting for worker")?;
                    process::exit(status.code().unwrap_or(1));
                }
                ImageKind::Image => {
                    let outcome = squashmount::run(&mount_dir, &image, &worker, &config)
                        .unwrap_or_else(|e| fatal(e));
                    match outcome.worker_status {
                        Some(status) => info!("worker finished: {}", status),
                        None => info!("worker status unknown"),
                    }
                    if let Some(trigger) = outcome.trigger {
                        info!("unmounted {} ({})", outcome.mount_point.display(), trigger);
                    }
                }
                ImageKind::Other => fatal(format!(
                    "{}: not a directory or squashfs image",
                    image.display()
                )),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VERBOSE_ENV: &str = "SQUASHMOUNT_VERBOSE";

    #[test]
    #[serial]
    fn test_mount_command_line() {
        let cli = Cli::try_parse_from([
            "sqmount", "-vv", "mount", "--fs-name", "rootfs", "image.sqfs", "/tmp/mnt", "--",
            "ls", "{}",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Mount {
                allow_other,
                fs_name,
                image,
                mount_dir,
                command,
            } => {
                assert!(!allow_other);
                assert_eq!(fs_name.as_deref(), Some("rootfs"));
                assert_eq!(image, PathBuf::from("image.sqfs"));
                assert_eq!(mount_dir, OsString::from("/tmp/mnt"));
                assert_eq!(command, vec![OsString::from("ls"), OsString::from("{}")]);
            }
            Commands::Classify { .. } => panic!("parsed as classify"),
        }
    }

    #[test]
    #[serial]
    fn test_mount_requires_image_and_dir() {
        assert!(Cli::try_parse_from(["sqmount", "mount", "image.sqfs"]).is_err());
        assert!(Cli::try_parse_from(["sqmount", "image.sqfs", "/tmp/mnt"]).is_err());
    }

    #[test]
    #[serial]
    fn test_verbosity_from_environment() {
        env::set_var(VERBOSE_ENV, "2");
        let from_env = Cli::try_parse_from(["sqmount", "classify", "image.sqfs"]);
        // Flags on the command line win over the environment
        let from_flag = Cli::try_parse_from(["sqmount", "-v", "classify", "image.sqfs"]);
        env::remove_var(VERBOSE_ENV);

        assert_eq!(from_env.unwrap().verbose, 2);
        assert_eq!(from_flag.unwrap().verbose, 1);
        assert_eq!(
            Cli::try_parse_from(["sqmount", "classify", "image.sqfs"])
                .unwrap()
                .verbose,
            0
        );
    }
}
