//! podlink: a peer-to-peer edge pod runtime.
//!
//! Pods run inside isolated execution contexts and are managed through a
//! CRI-shaped verb set (sandboxes, containers, images) exposed over
//! [`crosslink`], the message-channel RPC substrate. The P2P transport and
//! the execution sandbox itself are collaborators reached through trait
//! seams ([`cri::container::ContextSpawner`], [`cri::image::ImageFetcher`]);
//! this crate owns the lifecycle, correlation and state-machine logic in
//! between.

pub mod config;
pub mod cri;
pub mod error;
pub mod logger;

pub use config::RuntimeConfig;
pub use cri::Runtime;
pub use error::{Error, Result};
