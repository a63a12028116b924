//! Loading source images.
//!
//! A source is either a local image archive (Docker `save` output or an OCI layout archive) or a
//! `docker://` reference pulled through skopeo.  Both end up as a [`SourceImage`]: the parsed
//! config plus the location of every layer blob on local disk.

pub mod archive;
pub mod config;
pub mod image;
pub mod remote;
pub mod tar;

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use flate2::read::MultiGzDecoder;
use log::debug;
use oci_spec::image::MediaType;

use crate::{
    error::{Error, Result},
    oci::config::ImageConfig,
    progress::Progress,
};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Reference prefix selecting the registry transport.
pub const REGISTRY_TRANSPORT: &str = "docker://";

/// An ordered set of layers, bottom first, that can each be read as a plain tar stream.
pub trait LayerSource {
    fn layer_count(&self) -> usize;

    /// Opens the decompressed tar stream of layer `index`.
    fn open_layer(&self, index: usize) -> Result<Box<dyn Read + '_>>;
}

/// In-memory layers, possibly compressed.
impl LayerSource for Vec<Vec<u8>> {
    fn layer_count(&self) -> usize {
        self.len()
    }

    fn open_layer(&self, index: usize) -> Result<Box<dyn Read + '_>> {
        let data = self
            .get(index)
            .ok_or_else(|| Error::bad_source(format!("no layer {index}")))?;
        decompress(&data[..])
            .map_err(|e| Error::source_read(format!("decompressing layer {index}"), e))
    }
}

/// Check if a media type represents a tar-based layer.
pub fn is_tar_media_type(media_type: &MediaType) -> bool {
    matches!(
        media_type,
        MediaType::ImageLayer
            | MediaType::ImageLayerGzip
            | MediaType::ImageLayerZstd
            | MediaType::ImageLayerNonDistributable
            | MediaType::ImageLayerNonDistributableGzip
            | MediaType::ImageLayerNonDistributableZstd
    ) || media_type
        .to_string()
        .starts_with("application/vnd.docker.image.rootfs.")
}

/// Wraps `reader` with a decompressor chosen by sniffing the first bytes of the stream.
///
/// gzip and zstd are recognized; anything else is passed through unchanged.
pub fn decompress<'a>(reader: impl Read + 'a) -> io::Result<Box<dyn Read + 'a>> {
    let mut reader = BufReader::new(reader);
    let magic = reader.fill_buf()?;

    Ok(if magic.starts_with(GZIP_MAGIC) {
        Box::new(MultiGzDecoder::new(reader))
    } else if magic.starts_with(ZSTD_MAGIC) {
        Box::new(zstd::stream::read::Decoder::with_buffer(reader)?)
    } else {
        Box::new(reader)
    })
}

/// Where the bytes of one layer live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerBlob {
    /// A member of an uncompressed archive, at a byte offset.
    Member {
        archive: PathBuf,
        offset: u64,
        size: u64,
    },
    /// A standalone file.
    File(PathBuf),
}

impl LayerBlob {
    fn open(&self) -> io::Result<Box<dyn Read>> {
        Ok(match self {
            LayerBlob::Member {
                archive,
                offset,
                size,
            } => {
                let mut file = File::open(archive)?;
                file.seek(SeekFrom::Start(*offset))?;
                Box::new(file.take(*size))
            }
            LayerBlob::File(path) => Box::new(File::open(path)?),
        })
    }
}

/// A loaded single-platform image.
#[derive(Debug)]
pub struct SourceImage {
    pub config: ImageConfig,
    layers: Vec<LayerBlob>,
}

impl SourceImage {
    /// Pairs a config with its layer blobs, which must match the config's diff ids one to one.
    pub fn new(config: ImageConfig, layers: Vec<LayerBlob>) -> Result<Self> {
        let diff_ids = config.diff_ids().len();
        if diff_ids != layers.len() {
            return Err(Error::bad_source(format!(
                "config lists {diff_ids} diff ids but the image has {} layers",
                layers.len()
            )));
        }
        Ok(SourceImage { config, layers })
    }
}

impl LayerSource for SourceImage {
    fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn open_layer(&self, index: usize) -> Result<Box<dyn Read + '_>> {
        let blob = self
            .layers
            .get(index)
            .ok_or_else(|| Error::bad_source(format!("no layer {index}")))?;
        debug!("opening layer {index} from {blob:?}");
        let reader = blob
            .open()
            .map_err(|e| Error::source_read(format!("opening layer {index}"), e))?;
        decompress(reader).map_err(|e| Error::source_read(format!("decompressing layer {index}"), e))
    }
}

/// Loads `source`, which is a `docker://` reference or the path of a local image archive.
///
/// Remote layers are downloaded into `workdir`.
pub async fn open_source(
    source: &str,
    workdir: &Path,
    progress: &dyn Progress,
) -> Result<SourceImage> {
    if source.starts_with(REGISTRY_TRANSPORT) {
        return remote::pull(source, workdir, progress).await;
    }

    let path = PathBuf::from(source);
    match tokio::task::spawn_blocking(move || archive::open_archive(&path)).await {
        Ok(result) => result,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}
