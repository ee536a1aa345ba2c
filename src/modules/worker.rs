//! The worker process: the program that runs against the mount.

use super::constants::{DEFAULT_SHELL, MOUNT_POINT_ENV, MOUNT_POINT_PLACEHOLDER};
use super::error::{Error, Result};
use log::info;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Child, Command};

/// Program and arguments to run once the image is mounted.
///
/// The worker finds the mount point in `SQUASHMOUNT_MOUNT_POINT`, and any
/// argument equal to `{}` is replaced by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    program: OsString,
    args: Vec<OsString>,
}

impl Worker {
    /// Runs `program` with `args`.
    pub fn new<S, I, A>(program: S, args: I) -> Self
    where
        S: AsRef<OsStr>,
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        Self {
            program: program.as_ref().to_os_string(),
            args: args.into_iter().map(|a| a.as_ref().to_os_string()).collect(),
        }
    }

    /// The user's `$SHELL`, or `/bin/sh`.
    pub fn shell() -> Self {
        let shell = env::var_os("SHELL")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| OsString::from(DEFAULT_SHELL));
        Self::new(shell, Vec::<OsString>::new())
    }

    /// Builds a worker from command-line words; empty means the shell.
    pub fn from_argv(argv: &[OsString]) -> Self {
        match argv.split_first() {
            Some((program, args)) => Self::new(program, args),
            None => Self::shell(),
        }
    }

    /// Program that will be run.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Command for running against `mount_point`.
    pub fn command(&self, mount_point: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.env(MOUNT_POINT_ENV, mount_point);
        for arg in &self.args {
            if arg == MOUNT_POINT_PLACEHOLDER {
                command.arg(mount_point);
            } else {
                command.arg(arg);
            }
        }
        command
    }

    /// Starts the worker.
    ///
    /// # Errors
    ///
    /// Returns `Error::Spawn` if the process cannot be started.
    pub fn spawn(&self, mount_point: &Path) -> Result<Child> {
        let child = self
            .command(mount_point)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;
        info!(
            "started worker {} (pid {})",
            self.program.to_string_lossy(),
            child.id()
        );
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_placeholder_substitution() {
        let worker = Worker::new("ls", ["-la", "{}", "{}/etc"]);
        let mount_point = PathBuf::from("/tmp/mnt");
        let command = worker.command(&mount_point);

        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args, vec![OsStr::new("-la"), OsStr::new("/tmp/mnt"), OsStr::new("{}/etc")]);

        let env: Vec<_> = command.get_envs().collect();
        assert!(env.contains(&(OsStr::new(MOUNT_POINT_ENV), Some(OsStr::new("/tmp/mnt")))));
    }

    #[test]
    fn test_empty_argv_is_shell() {
        let worker = Worker::from_argv(&[]);
        assert!(!worker.program().is_empty());

        let worker = Worker::from_argv(&[OsString::from("true"), OsString::from("x")]);
        assert_eq!(worker, Worker::new("true", ["x"]));
    }

    #[test]
    fn test_worker_sees_mount_point() {
        let worker = Worker::new(
            "sh",
            ["-c", "test \"$SQUASHMOUNT_MOUNT_POINT\" = \"$0\"", "{}"],
        );
        let status = worker
            .spawn(Path::new("/tmp/requested"))
            .unwrap()
            .wait()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_spawn_failure() {
        let worker = Worker::new("/nonexistent/squashmount-worker", Vec::<&str>::new());
        match worker.spawn(Path::new("/tmp/mnt")) {
            Err(Error::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/squashmount-worker")
            }
            other => panic!("expected spawn error, got {:?}", other.map(|c| c.id())),
        }
    }
}
