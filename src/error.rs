//! Error types for docker-squash.
//!
//! Every stage of the pipeline reports failures through [`Error`], and all fallible operations
//! return [`Result<T>`].
//!
//! # Error Categories
//!
//! - **Input**: [`SourceRead`], [`UnsupportedImage`]
//! - **Layer replay**: [`Resolution`], [`BrokenLink`]
//! - **Output**: [`Write`], [`InvalidConfig`], [`InvalidReference`]
//! - **Control**: [`Interrupted`]
//!
//! [`SourceRead`]: Error::SourceRead
//! [`UnsupportedImage`]: Error::UnsupportedImage
//! [`Resolution`]: Error::Resolution
//! [`BrokenLink`]: Error::BrokenLink
//! [`Write`]: Error::Write
//! [`InvalidConfig`]: Error::InvalidConfig
//! [`InvalidReference`]: Error::InvalidReference
//! [`Interrupted`]: Error::Interrupted

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for squash operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input image could not be loaded or parsed.
    #[error("reading source image: {context}")]
    SourceRead {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The input holds more than one image or platform.
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    /// A layer contains inconsistent data, such as a malformed whiteout.
    #[error("layer {layer}: {path:?}: {reason}")]
    Resolution {
        layer: usize,
        path: PathBuf,
        reason: String,
    },

    /// A hardlink points to a path that has no linkable entry.
    #[error("layer {layer}: hardlink {path:?} points to missing target {target:?}")]
    BrokenLink {
        layer: usize,
        path: PathBuf,
        target: PathBuf,
    },

    /// Producing the squashed layer or the output archive failed.
    #[error("writing {context}")]
    Write {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The image configuration is malformed or cannot be serialized.
    #[error("invalid image config: {context}")]
    InvalidConfig {
        context: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The output reference name is not a valid image reference.
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    /// The operation was cancelled before it finished.
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    pub(crate) fn source_read(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::SourceRead {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn bad_source(context: impl Into<String>) -> Self {
        Error::SourceRead {
            context: context.into(),
            source: None,
        }
    }

    pub(crate) fn write(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Write {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid_config(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::InvalidConfig {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn resolution(
        layer: usize,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Resolution {
            layer,
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Reports the error as [`Error::Interrupted`] if `cancel` fired in the meantime.
    pub(crate) fn or_interrupted(self, cancel: &CancellationToken) -> Self {
        if cancel.is_cancelled() {
            Error::Interrupted
        } else {
            self
        }
    }

    /// Name of the pipeline stage that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::SourceRead { .. } | Error::UnsupportedImage(_) => "load",
            Error::Resolution { .. } | Error::BrokenLink { .. } => "resolve",
            Error::Write { .. } => "write",
            Error::InvalidConfig { .. } => "rebuild",
            Error::InvalidReference(_) => "configure",
            Error::Interrupted => "interrupted",
        }
    }
}
