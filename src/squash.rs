//! The squash pipeline: load the source, replay its layers, write the single layer, rebuild the
//! descriptors and pack the output archive.
//!
//! Everything intermediate lives in a temporary work directory that is removed when the
//! pipeline ends, however it ends.  The destination is written under a temporary name next to
//! its final location and renamed into place only after everything succeeded.

use std::{
    fmt,
    fs::{File, Permissions},
    io::BufWriter,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::info;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    oci::{
        archive::write_archive,
        config::rebuild,
        image::compose_filesystem,
        open_source,
        tar::write_layer,
        SourceImage,
    },
    progress::{NoProgress, Progress, ProgressWriter},
    spool::Spool,
    util::{CancellableReader, Sha256Writer},
    DEFAULT_TAG_PREFIX,
};

const DEFAULT_TAG: &str = "latest";
const MAX_TAG_LEN: usize = 128;

/// The name:tag an output image is saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    name: String,
    tag: String,
}

fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    bytes.first().is_some_and(alnum)
        && bytes.last().is_some_and(alnum)
        && bytes
            .iter()
            .all(|b| alnum(b) || matches!(b, b'.' | b'_' | b'-'))
}

fn valid_registry(host: &str) -> bool {
    let (host, port) = match host.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (host, None),
    };
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-'))
        && port.is_none_or(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

fn valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    bytes.len() <= MAX_TAG_LEN
        && bytes
            .first()
            .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

impl ImageReference {
    /// Parses `name[:tag]`; a missing tag becomes `latest`.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = || Error::InvalidReference(reference.to_string());

        let last_slash = reference.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match reference[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&reference[..colon], &reference[colon + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        let components = name.split('/').collect::<Vec<_>>();
        // a registry host is recognized by a dot, a port or being localhost
        let has_registry = components.len() > 1
            && (components[0].contains(['.', ':']) || components[0] == "localhost");
        let path = if has_registry {
            if !valid_registry(components[0]) {
                return Err(invalid());
            }
            &components[1..]
        } else {
            &components[..]
        };
        if !path.iter().all(|component| valid_component(component)) || !valid_tag(tag) {
            return Err(invalid());
        }

        Ok(ImageReference {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// A fresh reference named after the current time.
    pub fn generated(now: DateTime<Utc>) -> Self {
        let nanos = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros() * 1000);
        ImageReference {
            name: format!("{DEFAULT_TAG_PREFIX}-{nanos}"),
            tag: DEFAULT_TAG.to_string(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Settings for one squash run.
#[derive(Debug, Clone, Default)]
pub struct SquashOptions {
    /// Reference for the output image; generated when `None`.
    pub tag: Option<String>,
    /// Don't report progress.
    pub quiet: bool,
    /// Where the work directory goes; the system temporary directory when `None`.
    pub tmpdir: Option<PathBuf>,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashReport {
    pub reference: String,
    pub layer_digest: String,
    pub layer_size: u64,
    pub config_digest: String,
    pub manifest_digest: String,
    /// Visible paths in the squashed layer.
    pub entries: u64,
    /// Content bytes of the visible regular files.
    pub bytes: u64,
}

fn write_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Error {
    let context = context.into();
    move |e| Error::write(context, e)
}

/// Squashes an already loaded image into an archive at `dest`.
///
/// This is the blocking part of [`run`]; `workdir` holds the spool and the squashed layer.
pub fn squash_image(
    image: &SourceImage,
    workdir: &Path,
    dest: &Path,
    reference: &ImageReference,
    created: DateTime<Utc>,
    progress: &dyn Progress,
    cancel: &CancellationToken,
) -> Result<SquashReport> {
    let mut spool = Spool::new_in(workdir).map_err(write_error("content spool"))?;
    let fs = compose_filesystem(image, &mut spool, progress, cancel)?;
    let stats = fs.stats();
    info!("union view has {} entries, {} bytes", stats.entries, stats.bytes);

    progress.stage("Writing squashed layer");
    let layer_path = workdir.join("layer.tar");
    let file = File::create(&layer_path).map_err(write_error("squashed layer"))?;
    let mut sink = Sha256Writer::new(BufWriter::new(file));
    write_layer(&fs, &spool, &mut sink, progress, cancel)?;
    let (writer, layer_digest, layer_size) = sink.finish();
    writer
        .into_inner()
        .map_err(|e| Error::write("squashed layer", e.into_error()))?;
    progress.finish();
    drop(fs);
    drop(spool);
    info!("squashed layer {layer_digest}, {layer_size} bytes");

    // stored uncompressed, so the blob digest is the diff id
    let squashed = rebuild(&image.config, &layer_digest, &layer_digest, layer_size, created)?;

    progress.stage("Writing image archive");
    let dest_dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    // same mode as a plain create would give, umask applied
    let output = tempfile::Builder::new()
        .prefix(".docker-squash-")
        .permissions(Permissions::from_mode(0o666))
        .tempfile_in(dest_dir)
        .map_err(write_error(format!("temporary file in {dest_dir:?}")))?;
    let layer = File::open(&layer_path).map_err(write_error("squashed layer"))?;
    let layer = CancellableReader::new(layer, cancel);
    let sink = ProgressWriter::new(BufWriter::new(output), progress);
    let output = write_archive(sink, reference, &squashed, layer)
        .map_err(|e| e.or_interrupted(cancel))?
        .into_inner()
        .into_inner()
        .map_err(|e| Error::write("image archive", e.into_error()))?;

    if cancel.is_cancelled() {
        return Err(Error::Interrupted);
    }
    output
        .persist(dest)
        .map_err(|e| Error::write(format!("{dest:?}"), e.error))?;
    progress.finish();
    info!("saved {reference} to {dest:?}");

    Ok(SquashReport {
        reference: reference.to_string(),
        layer_digest,
        layer_size,
        config_digest: squashed.config_digest,
        manifest_digest: squashed.manifest_digest,
        entries: stats.entries,
        bytes: stats.bytes,
    })
}

/// Squashes `source` (an archive path or a `docker://` reference) into an archive at `dest`.
///
/// Cancelling `cancel` stops the run with [`Error::Interrupted`]; the destination is only ever
/// created by a successful run.
pub async fn run(
    source: &str,
    dest: &Path,
    options: &SquashOptions,
    progress: Arc<dyn Progress>,
    cancel: CancellationToken,
) -> Result<SquashReport> {
    let now = Utc::now();
    let reference = match &options.tag {
        Some(tag) => ImageReference::parse(tag)?,
        None => ImageReference::generated(now),
    };
    let progress: Arc<dyn Progress> = if options.quiet {
        Arc::new(NoProgress)
    } else {
        progress
    };

    let mut builder = tempfile::Builder::new();
    builder.prefix("docker-squash-");
    let workdir = match &options.tmpdir {
        Some(tmpdir) => builder.tempdir_in(tmpdir),
        None => builder.tempdir(),
    }
    .map_err(write_error("work directory"))?;

    progress.stage(&format!("Loading {source}"));
    let image = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Interrupted),
        image = open_source(source, workdir.path(), &*progress) => image?,
    };
    progress.finish();

    let dest = dest.to_path_buf();
    let task = tokio::task::spawn_blocking(move || {
        let result = squash_image(
            &image,
            workdir.path(),
            &dest,
            &reference,
            now,
            &*progress,
            &cancel,
        );
        drop(workdir);
        result
    });
    match task.await {
        Ok(result) => result,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}
