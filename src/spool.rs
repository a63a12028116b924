//! Temporary storage for file content read out of layers.
//!
//! Layer archives can only be read front to back, but the squashed layer needs the content of
//! whichever entry wins at each path, long after the layer stream has moved on.  File bodies
//! larger than [`crate::INLINE_CONTENT_MAX`] are appended to an anonymous temporary file and
//! referenced by offset, so memory use stays independent of the image size.  The file has no
//! name on disk and disappears when the [`Spool`] is dropped.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

/// The location of one spooled file body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolRef {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug)]
pub struct Spool {
    file: File,
    end: u64,
}

impl Spool {
    /// Creates a spool backed by an unnamed file in `dir`.
    pub fn new_in(dir: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            file: tempfile::tempfile_in(dir)?,
            end: 0,
        })
    }

    /// Copies exactly `len` bytes from `reader` to the end of the spool.
    ///
    /// A reader that ends early is an error of kind `UnexpectedEof`; whatever was copied stays in
    /// the spool as dead space.
    pub fn store(&mut self, reader: &mut impl Read, len: u64) -> io::Result<SpoolRef> {
        let offset = self.end;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        let copied = io::copy(&mut reader.take(len), &mut file)?;
        self.end += copied;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("content ended after {copied} of {len} bytes"),
            ));
        }
        Ok(SpoolRef { offset, len })
    }

    /// Returns a reader over one spooled body.  Only one reader may be in use at a time.
    pub fn open(&self, spooled: &SpoolRef) -> io::Result<impl Read + '_> {
        let mut file = &self.file;
        file.flush()?;
        file.seek(SeekFrom::Start(spooled.offset))?;
        Ok(file.take(spooled.len))
    }

    /// Total bytes written to the spool, including bodies that were later overwritten.
    pub fn len(&self) -> u64 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }
}
