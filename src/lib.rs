#![doc(html_root_url = "https://docs.rs/squashmount/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! squashmount: mount a SquashFS image through FUSE for one worker process
//! 
//! The current process becomes the filesystem service while a spawned worker
//! runs against the mount point. When the worker exits the image is released
//! and the mount is torn down, exactly once.
//! 
//! ## Features
//! 
//! - Image classification (directory, SquashFS image, other)
//! - Unprivileged FUSE mount of the image, read-only
//! - Worker-exit and signal driven teardown
//! - Distinct diagnostics for every setup stage
//! 
//! ## Quick Start
//! 
//! ```rust,no_run
//! use squashmount::{classify, Config, ImageKind, Worker};
//! 
//! # fn main() -> anyhow::Result<()> {
//! if classify("/tmp/image.sqfs")? == ImageKind::Image {
//!     let outcome = squashmount::run(
//!         "/tmp/rootfs",
//!         "/tmp/image.sqfs",
//!         &Worker::new("ls", ["-la", "{}"]),
//!         &Config::default(),
//!     )?;
//!     println!("worker status: {:?}", outcome.worker_status);
//! }
//! # Ok(())
//! # }
//! ```
//! 
//! ## Verbosity
//! 
//! - `0`: info
//! - `1`: debug
//! - `2` and above: trace, plus FUSE request tracing

pub mod modules;

pub use modules::classify::{classify, ImageKind};
pub use modules::config::Config;
pub use modules::error::{Error, Result};
pub use modules::session::{run, MountSession, ServiceOutcome};

// Re-export commonly used types
pub use modules::lifecycle::{SessionState, Trigger};
pub use modules::worker::Worker;
