//! Lifecycle coordination for a mount session.
//!
//! Shutdown is two-phase. A trigger (worker exit, a termination signal, or
//! the FUSE loop ending on its own) calls [`Teardown::run`], which removes
//! the signal handlers, destroys the image and unmounts, in that order. The
//! serving thread blocks in [`Teardown::wait`] until that has happened.
//! `run` is serialised and performs the work exactly once; every later call
//! returns `false` after the first one has finished.

use super::image::{ImageSlot, ImageSource};
use libc::{SIGHUP, SIGINT, SIGTERM};
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use signal_hook::iterator::{Handle, Signals};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Signals that end the service.
pub const TERM_SIGNALS: [libc::c_int; 3] = [SIGINT, SIGTERM, SIGHUP];

/// States of a mount session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing acquired yet
    Empty,
    /// Image is being opened
    OpeningImage,
    /// Mount directory and FUSE session are being set up
    Mounting,
    /// FUSE loop is running
    Serving,
    /// Teardown in progress
    Unmounting,
    /// Teardown done
    Closed,
    /// Setup failed before serving
    Failed,
}

impl SessionState {
    /// Whether `self → next` is a legal transition.
    pub fn can_advance(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Empty, OpeningImage)
                | (OpeningImage, Mounting)
                | (OpeningImage, Failed)
                | (Mounting, Serving)
                | (Mounting, Failed)
                | (Mounting, Unmounting)
                | (Serving, Unmounting)
                | (Unmounting, Closed)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// What started the teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The worker process exited
    WorkerExited,
    /// The service received a termination signal
    Signal(libc::c_int),
    /// The FUSE loop returned by itself
    LoopEnded,
    /// The session was dropped on an error path
    Dropped,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::WorkerExited => f.write_str("worker exited"),
            Trigger::Signal(sig) => write!(f, "signal {}", sig),
            Trigger::LoopEnded => f.write_str("fuse loop ended"),
            Trigger::Dropped => f.write_str("session dropped"),
        }
    }
}

/// Something that can be unmounted once.
pub trait Unmount: Send {
    /// Removes the mount. Called at most once.
    fn unmount(&mut self) -> io::Result<()>;
}

impl Unmount for fuser::SessionUnmounter {
    fn unmount(&mut self) -> io::Result<()> {
        fuser::SessionUnmounter::unmount(self)
    }
}

/// Something holding the opened image.
pub trait Release: Send + Sync {
    /// Destroys the image; false if it was already gone.
    fn release(&self) -> bool;
}

impl<I: ImageSource> Release for ImageSlot<I> {
    fn release(&self) -> bool {
        self.destroy()
    }
}

#[derive(Default)]
struct Armed {
    signals: Option<Handle>,
    image: Option<Arc<dyn Release>>,
    unmounter: Option<Box<dyn Unmount>>,
    worker: Option<Pid>,
    trigger: Option<Trigger>,
}

/// Cleanup routine shared by the service thread and the trigger threads.
pub struct Teardown {
    mount_point: PathBuf,
    state: Mutex<SessionState>,
    settled: Condvar,
    armed: Mutex<Armed>,
}

impl Teardown {
    /// Creates an unarmed teardown for the mount at `mount_point`.
    pub fn new<P: AsRef<Path>>(mount_point: P) -> Self {
        Self {
            mount_point: mount_point.as_ref().to_path_buf(),
            state: Mutex::new(SessionState::Empty),
            settled: Condvar::new(),
            armed: Mutex::new(Armed::default()),
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Moves to `next`, logging and ignoring illegal transitions.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if !state.can_advance(next) {
            warn!("ignoring session transition {:?} -> {:?}", *state, next);
            return false;
        }
        debug!("session {:?} -> {:?}", *state, next);
        *state = next;
        if next.is_terminal() {
            self.settled.notify_all();
        }
        true
    }

    /// Blocks until the session is closed or has failed, and returns that
    /// state.
    pub fn wait(&self) -> SessionState {
        let mut state = self.state.lock();
        while !state.is_terminal() {
            self.settled.wait(&mut state);
        }
        *state
    }

    /// Hands the image and the unmount handle to the cleanup routine.
    pub fn arm(&self, image: Arc<dyn Release>, unmounter: Box<dyn Unmount>) {
        let mut armed = self.armed.lock();
        armed.image = Some(image);
        armed.unmounter = Some(unmounter);
    }

    /// Hands over the signal handle closed first during teardown.
    pub fn set_signals(&self, handle: Handle) {
        self.armed.lock().signals = Some(handle);
    }

    /// Registers the worker so a teardown it did not cause can stop it.
    ///
    /// If the teardown already ran, the worker is sent `SIGTERM` right away
    /// and false is returned.
    pub fn set_worker(&self, pid: Pid) -> bool {
        let state = self.state.lock();
        if state.is_terminal() {
            debug!("session already {:?}, terminating worker {}", *state, pid);
            terminate(pid);
            return false;
        }
        self.armed.lock().worker = Some(pid);
        true
    }

    /// Trigger recorded by the call that performed the teardown.
    pub fn trigger(&self) -> Option<Trigger> {
        self.armed.lock().trigger
    }

    /// Runs the cleanup sequence. Returns true only for the call that did
    /// the work.
    pub fn run(&self, trigger: Trigger) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() || *state == SessionState::Empty {
            return false;
        }
        debug!("session {:?} -> {:?} ({})", *state, SessionState::Unmounting, trigger);
        *state = SessionState::Unmounting;

        let mut armed = self.armed.lock();
        armed.trigger = Some(trigger);

        if let Some(handle) = armed.signals.take() {
            handle.close();
        }
        if let Some(image) = armed.image.take() {
            if image.release() {
                debug!("image destroyed");
            }
        }
        if let Some(mut unmounter) = armed.unmounter.take() {
            debug!("unmounting: {}", self.mount_point.display());
            if let Err(e) = unmounter.unmount() {
                warn!("unmount of {} failed: {}", self.mount_point.display(), e);
            }
        }
        if let Some(pid) = armed.worker.take() {
            if trigger != Trigger::WorkerExited {
                debug!("terminating worker {}", pid);
                terminate(pid);
            }
        }

        *state = SessionState::Closed;
        self.settled.notify_all();
        true
    }
}

fn terminate(pid: Pid) {
    if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
        debug!("worker {} already gone: {}", pid, e);
    }
}

/// Installs the termination-signal handlers. The returned thread runs the
/// teardown on the first signal and ends once the handlers are removed.
pub fn install_signal_handlers(teardown: Arc<Teardown>) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    teardown.set_signals(signals.handle());

    thread::Builder::new()
        .name("squashmount-signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("received signal {}, shutting down", sig);
                teardown.run(Trigger::Signal(sig));
            }
        })
}

/// Waits for the worker on a supervisory thread and tears the session down
/// once it has fully exited.
pub fn watch_worker(
    mut child: Child,
    teardown: Arc<Teardown>,
) -> io::Result<JoinHandle<io::Result<ExitStatus>>> {
    thread::Builder::new()
        .name("squashmount-worker".to_string())
        .spawn(move || {
            let status = child.wait();
            match &status {
                Ok(status) => debug!("worker exited: {}", status),
                Err(e) => warn!("waiting for worker failed: {}", e),
            }
            teardown.run(Trigger::WorkerExited);
            status
        })
}
