//! Flatten a multi-layer container image into a single-layer image.
//!
//! The layers of the source image are replayed bottom to top into a union view
//! ([`image::FileSystem`]), honouring whiteouts and opaque directories.  The view is written out
//! as one deterministic tar layer, and a new config and manifest referencing only that layer are
//! packed into an image archive.  [`squash::run`] drives the whole pipeline.

pub mod error;
pub mod image;
pub mod oci;
pub mod progress;
pub mod spool;
pub mod squash;
pub mod util;

pub use error::{Error, Result};

/// File bodies up to this size are kept in memory; larger ones go to the [`spool::Spool`].
pub const INLINE_CONTENT_MAX: usize = 64;

/// Prefix of the reference name generated when no tag is given.
pub const DEFAULT_TAG_PREFIX: &str = "docker-squash";
