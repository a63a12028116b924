//! Progress reporting.
//!
//! The pipeline never prints anything itself.  It announces each stage and reports a running
//! byte count through a [`Progress`] observer, which the binary renders with `indicatif`.  The
//! squash result does not depend on which observer is attached.

use std::io::{self, Write};

/// Receives progress notifications from the pipeline.
pub trait Progress: Send + Sync {
    /// A new stage starts; `message` is a human readable description of it.
    fn stage(&self, message: &str);

    /// `total` bytes have been produced so far in the current stage.  Counts passed within one
    /// stage never decrease.
    fn advance(&self, total: u64);

    /// The current stage is done.
    fn finish(&self) {}
}

/// An observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn stage(&self, _message: &str) {}
    fn advance(&self, _total: u64) {}
}

/// A writer that reports the running byte count to a [`Progress`] observer.
pub struct ProgressWriter<'p, W> {
    inner: W,
    progress: &'p dyn Progress,
    written: u64,
}

impl<'p, W: Write> ProgressWriter<'p, W> {
    pub fn new(inner: W, progress: &'p dyn Progress) -> Self {
        Self {
            inner,
            progress,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ProgressWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        self.progress.advance(self.written);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
