use std::{
    io::{self, Read, Write},
    path::{Component, Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

/// Formats the sha256 of `bytes` the way OCI descriptors spell digests: `sha256:<hex>`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    let mut context = Sha256::new();
    context.update(bytes);
    format!("sha256:{}", hex::encode(context.finalize()))
}

/// Splits an OCI digest string into its algorithm and hex-encoded value.
///
/// Only the form `<algorithm>:<hex>` with a non-empty lowercase hex part is accepted.
pub fn split_digest(digest: &str) -> Option<(&str, &str)> {
    let (algorithm, encoded) = digest.split_once(':')?;
    let valid = !algorithm.is_empty()
        && !encoded.is_empty()
        && encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    valid.then_some((algorithm, encoded))
}

/// The path of a blob inside an OCI image layout.
pub fn blob_path(digest: &str) -> Option<String> {
    let (algorithm, encoded) = split_digest(digest)?;
    Some(format!("blobs/{algorithm}/{encoded}"))
}

/// Turns a path from a layer archive into the relative form used as a union view key.
///
/// Leading `/` and `.` components are dropped, so `/etc/a`, `./etc/a` and `etc/a/` all become
/// `etc/a`.  The root itself becomes the empty path.  Returns `None` for paths that try to
/// escape the root with `..`.
pub fn normalize_path(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => normalized.push(name),
            Component::ParentDir | Component::Prefix(..) => return None,
        }
    }
    Some(normalized)
}

/// A writer that computes the sha256 and length of everything passing through it.
pub struct Sha256Writer<W> {
    inner: W,
    context: Sha256,
    written: u64,
}

impl<W: Write> Sha256Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            context: Sha256::new(),
            written: 0,
        }
    }

    /// Returns the inner writer along with the `sha256:<hex>` digest and byte count.
    pub fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.context.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.context.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A reader that starts failing once `cancel` fires, so that long copies stop between reads.
pub struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<'a, R: Read> CancellableReader<'a, R> {
    pub fn new(inner: R, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            // not ErrorKind::Interrupted, which io::copy retries
            return Err(io::Error::other("cancelled"));
        }
        self.inner.read(buf)
    }
}
