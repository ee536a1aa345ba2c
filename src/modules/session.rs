//! Mount session management.
//!
//! This module provides the `MountSession` type which owns one live mount:
//! the opened image, the FUSE session bound to the mount point, and the
//! cleanup routine shared with the lifecycle triggers. At most one session
//! exists per process.

use super::config::Config;
use super::constants::{FUSE_DEVICE, MOUNT_DIR_MODE};
use super::error::{Error, Result};
use super::filesystem::SquashFs;
use super::image::{ImageSlot, SquashImage};
use super::lifecycle::{self, Release, SessionState, Teardown, Trigger};
use super::unmount::FuseUnmount;
use super::worker::Worker;
use fuser::MountOption;
use log::{debug, error, info};
use nix::sys::stat::Mode;
use nix::unistd::{self, Pid};
use parking_lot::Mutex;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

static ACTIVE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Process-wide claim that a mount session is live.
#[derive(Debug)]
pub struct SessionClaim {
    _private: (),
}

impl SessionClaim {
    /// Takes the claim for `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionActive` if another session holds it.
    pub fn acquire(mount_point: &Path) -> Result<Self> {
        let mut active = ACTIVE.lock();
        if let Some(current) = active.as_ref() {
            return Err(Error::SessionActive(current.clone()));
        }
        *active = Some(mount_point.to_path_buf());
        Ok(Self { _private: () })
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        ACTIVE.lock().take();
    }
}

/// Result of serving a mount until its worker finished.
#[derive(Debug)]
pub struct ServiceOutcome {
    /// Where the image was mounted
    pub mount_point: PathBuf,
    /// What ended the service
    pub trigger: Option<Trigger>,
    /// Exit status of the worker, known when its exit ended the service
    pub worker_status: Option<ExitStatus>,
}

type Session = fuser::Session<SquashFs<SquashImage>>;

/// One mounted image.
///
/// # Example
///
/// ```no_run
/// use squashmount::{Config, MountSession, Worker};
///
/// # fn main() -> anyhow::Result<()> {
/// let session = MountSession::mount("/tmp/rootfs", "/tmp/image.sqfs", &Config::default())?;
/// let outcome = session.serve(&Worker::new("ls", ["{}"]))?;
/// println!("worker finished: {:?}", outcome.worker_status);
/// # Ok(())
/// # }
/// ```
pub struct MountSession {
    mount_point: PathBuf,
    session: Option<Session>,
    teardown: Arc<Teardown>,
    signal_thread: Option<JoinHandle<()>>,
    _claim: SessionClaim,
}

impl MountSession {
    /// Opens `image` and mounts it at `mount_dir`.
    ///
    /// The mount directory is created if it does not exist. On success the
    /// image and the FUSE session are both live and termination-signal
    /// handlers are installed; on failure nothing is left behind.
    ///
    /// # Errors
    ///
    /// * `Error::EmptyMountPoint` before anything is touched
    /// * `Error::SessionActive` if this process already holds a session
    /// * `Error::ImageOpen` if the image cannot be opened; the mount
    ///   directory is not created
    /// * `Error::CreateMountPoint`, `Error::SessionCreate`, `Error::Mount`,
    ///   `Error::SignalHandlers` for the later stages
    pub fn mount<P: AsRef<Path>, Q: AsRef<Path>>(
        mount_dir: P,
        image_path: Q,
        config: &Config,
    ) -> Result<Self> {
        let mount_point = mount_dir.as_ref();
        if mount_point.as_os_str().is_empty() {
            return Err(Error::EmptyMountPoint);
        }
        let claim = SessionClaim::acquire(mount_point)?;
        info!("mount point: {}", mount_point.display());

        let teardown = Arc::new(Teardown::new(mount_point));
        Self::setup(
            mount_point,
            image_path.as_ref(),
            config,
            Path::new(FUSE_DEVICE),
            teardown,
            claim,
        )
    }

    fn setup(
        mount_point: &Path,
        image_path: &Path,
        config: &Config,
        device: &Path,
        teardown: Arc<Teardown>,
        claim: SessionClaim,
    ) -> Result<Self> {
        debug!("fuse debug output: {}", config.service_debug());
        let fail = |e: Error| {
            teardown.advance(SessionState::Failed);
            e
        };

        teardown.advance(SessionState::OpeningImage);
        let image = Arc::new(ImageSlot::new(SquashImage::open(image_path).map_err(fail)?));

        teardown.advance(SessionState::Mounting);
        create_mount_point(mount_point).map_err(fail)?;
        let absolute = fs::canonicalize(mount_point)
            .map_err(|source| Error::Stat {
                path: mount_point.to_path_buf(),
                source,
            })
            .map_err(fail)?;
        let mut session = establish(
            SquashFs::new(Arc::clone(&image)),
            mount_point,
            &config.mount_options(image_path),
            device,
        )
        .map_err(fail)?;

        teardown.arm(
            image as Arc<dyn Release>,
            Box::new(FuseUnmount::new(session.unmount_callable(), absolute)),
        );
        let signal_thread = match lifecycle::install_signal_handlers(Arc::clone(&teardown)) {
            Ok(thread) => thread,
            Err(e) => {
                teardown.run(Trigger::Dropped);
                return Err(Error::SignalHandlers(e));
            }
        };

        Ok(Self {
            mount_point: mount_point.to_path_buf(),
            session: Some(session),
            teardown,
            signal_thread: Some(signal_thread),
            _claim: claim,
        })
    }

    /// Directory the image is mounted at.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.teardown.state()
    }

    /// Spawns `worker` against the mount and answers filesystem requests
    /// until it exits.
    ///
    /// Requests are answered on a dedicated thread. This returns as soon as
    /// cleanup has completed, even if a process left behind by the worker
    /// still holds the detached mount busy.
    ///
    /// # Errors
    ///
    /// * `Error::SessionClosed` if a signal tore the session down already
    /// * `Error::Spawn` if the worker cannot be started
    /// * `Error::ServiceLoop` if the FUSE loop fails
    pub fn serve(mut self, worker: &Worker) -> Result<ServiceOutcome> {
        if !self.teardown.advance(SessionState::Serving) {
            return Err(Error::SessionClosed {
                path: self.mount_point.clone(),
            });
        }
        let Some(session) = self.session.take() else {
            return Err(Error::SessionClosed {
                path: self.mount_point.clone(),
            });
        };

        let (served_tx, served_rx) = mpsc::channel();
        let loop_teardown = Arc::clone(&self.teardown);
        thread::Builder::new()
            .name("squashmount-fuse".to_string())
            .spawn(move || {
                let mut session = session;
                let served = session.run();
                if let Err(e) = &served {
                    error!("fuse loop failed: {}", e);
                }
                served_tx.send(served).ok();
                loop_teardown.run(Trigger::LoopEnded);
            })
            .map_err(Error::ServiceLoop)?;

        let child = worker.spawn(&self.mount_point)?;
        self.teardown.set_worker(Pid::from_raw(child.id() as i32));
        let watcher = lifecycle::watch_worker(child, Arc::clone(&self.teardown)).map_err(|source| {
            Error::Spawn {
                program: "worker supervisor".to_string(),
                source,
            }
        })?;

        self.teardown.wait();
        let trigger = self.teardown.trigger();
        debug!(
            "{} closed ({})",
            self.mount_point.display(),
            trigger.map_or_else(|| "unknown".to_string(), |t| t.to_string())
        );

        let worker_status = if trigger == Some(Trigger::WorkerExited) || watcher.is_finished() {
            match watcher.join() {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    error!("can't collect worker status: {}", e);
                    None
                }
                Err(_) => {
                    error!("worker supervisor panicked");
                    None
                }
            }
        } else {
            None
        };
        if let Some(thread) = self.signal_thread.take() {
            if thread.join().is_err() {
                error!("signal thread panicked");
            }
        }

        match served_rx.try_recv() {
            Ok(served) => served.map_err(Error::ServiceLoop)?,
            Err(TryRecvError::Empty) => {
                debug!("fuse loop still draining, leaving it detached")
            }
            Err(TryRecvError::Disconnected) => error!("fuse loop thread panicked"),
        }
        Ok(ServiceOutcome {
            mount_point: self.mount_point.clone(),
            trigger,
            worker_status,
        })
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        self.teardown.run(Trigger::Dropped);
    }
}

/// Mounts `image_path` at `mount_dir`, runs `worker` against it and tears
/// the mount down once the worker has exited.
///
/// # Errors
///
/// Any error of [`MountSession::mount`] or [`MountSession::serve`].
pub fn run<P: AsRef<Path>, Q: AsRef<Path>>(
    mount_dir: P,
    image_path: Q,
    worker: &Worker,
    config: &Config,
) -> Result<ServiceOutcome> {
    MountSession::mount(mount_dir, image_path, config)?.serve(worker)
}

/// Creates the mount directory unless it already is one.
fn create_mount_point(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    debug!("creating mount point {}", path.display());
    unistd::mkdir(path, Mode::from_bits_truncate(MOUNT_DIR_MODE)).map_err(|source| {
        Error::CreateMountPoint {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Checks that a FUSE session can be created at all, i.e. that the FUSE
/// device is present.
fn check_fuse_device(device: &Path) -> Result<()> {
    let metadata = fs::metadata(device).map_err(|e| Error::SessionCreate {
        reason: format!("{}: {}", device.display(), e),
    })?;
    if !metadata.file_type().is_char_device() {
        return Err(Error::SessionCreate {
            reason: format!("{} is not a character device", device.display()),
        });
    }
    Ok(())
}

/// Creates the FUSE session and mounts it.
fn establish(
    fs: SquashFs<SquashImage>,
    mount_point: &Path,
    options: &[MountOption],
    device: &Path,
) -> Result<Session> {
    check_fuse_device(device)?;
    fuser::Session::new(fs, mount_point, options).map_err(|source| Error::Mount {
        path: mount_point.to_path_buf(),
        source,
    })
}
