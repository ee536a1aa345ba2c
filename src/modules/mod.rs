//! Core mount modules.
//! 
//! This module provides the main components of a mount:
//! 
//! - `classify`: Tells directories, SquashFS images and everything else apart
//! - `session`: Mount session setup, serving and teardown
//! - `lifecycle`: Worker-exit and signal driven shutdown
//! - `filesystem`: FUSE operation table over an opened image
//! - `unmount`: Unmounting with a lazy-detach fallback

pub mod classify;
pub mod config;
pub mod constants;
pub mod error;
pub mod filesystem;
/// SquashFS image access through `backhand`.
pub mod image;
pub mod lifecycle;
pub mod session;
pub mod unmount;
/// Worker process handoff.
pub mod worker;
