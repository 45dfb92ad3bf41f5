//! Client API for the tern transport.
//!
//! A [`Client`] attaches to a running driver through its CnC file, issues
//! commands over the shared command ring, and observes responses on the
//! broadcast. Publications append messages to driver-owned log buffers;
//! subscriptions poll images of remote producer sessions from the same
//! kind of buffers.

#[macro_use]
mod macros;

pub mod client;
pub mod conductor;
pub mod image;
pub mod publication;
pub mod subscription;

pub use client::{Client, ClientContext, ClientError, Counter};
pub use image::{FragmentAssembler, Image};
pub use publication::{
    ExclusivePublication, Publication, ADMIN_ACTION, BACK_PRESSURED, CLOSED, MAX_POSITION_EXCEEDED,
    NOT_CONNECTED, PUBLICATION_ERROR,
};
pub use subscription::Subscription;

use std::path::PathBuf;

/// Default driver directory, matching the driver's own default.
pub fn default_driver_dir() -> PathBuf {
    let base = if cfg!(target_os = "linux") && std::path::Path::new("/dev/shm").is_dir() {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir()
    };

    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    base.join(format!("tern-{user}"))
}
