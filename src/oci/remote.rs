//! Pulling source images from a registry through skopeo.
//!
//! Registry access, credentials and platform selection are all left to skopeo; this module only
//! asks the proxy for the manifest, the config and the layer blobs, and stores the blobs in the
//! work directory.

use std::path::Path;

use containers_image_proxy::{ImageProxy, ImageProxyConfig, OpenedImage};
use log::{debug, info};
use oci_spec::image::{Descriptor, ImageManifest, MediaType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    error::{Error, Result},
    oci::{config::ImageConfig, is_tar_media_type, LayerBlob, SourceImage},
    progress::Progress,
};

struct ImageOp<'a> {
    proxy: ImageProxy,
    img: OpenedImage,
    progress: &'a dyn Progress,
}

/// Manifest lists should have been resolved to one platform by skopeo; reject any that weren't.
fn check_not_index(raw_manifest: &[u8]) -> Result<()> {
    let value: serde_json::Value = serde_json::from_slice(raw_manifest)
        .map_err(|e| Error::source_read("parsing manifest", e))?;
    let media_type = value.get("mediaType").and_then(|v| v.as_str());
    if value.get("manifests").is_some()
        || media_type == Some(MediaType::ImageIndex.to_string().as_str())
    {
        return Err(Error::UnsupportedImage(
            "reference resolves to a multi-platform image index".into(),
        ));
    }
    Ok(())
}

impl<'a> ImageOp<'a> {
    async fn new(imgref: &str, progress: &'a dyn Progress) -> Result<Self> {
        let config = ImageProxyConfig::default();
        let proxy = ImageProxy::new_with_config(config)
            .await
            .map_err(|e| Error::source_read("starting skopeo", e))?;
        let img = proxy
            .open_image(imgref)
            .await
            .map_err(|e| Error::source_read(format!("opening image {imgref}"), e))?;
        Ok(ImageOp {
            proxy,
            img,
            progress,
        })
    }

    async fn fetch_config(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let context = || format!("fetching config {}", descriptor.digest());
        let (mut config, driver) = self
            .proxy
            .get_descriptor(&self.img, descriptor)
            .await
            .map_err(|e| Error::source_read(context(), e))?;
        let config = async move {
            let mut s = Vec::new();
            config.read_to_end(&mut s).await?;
            std::io::Result::Ok(s)
        };
        let (config, driver) = tokio::join!(config, driver);
        driver.map_err(|e| Error::source_read(context(), e))?;
        config.map_err(|e| Error::source_read(context(), e))
    }

    async fn fetch_layer(&self, index: usize, descriptor: &Descriptor, path: &Path) -> Result<u64> {
        let context = || format!("fetching layer {index} ({})", descriptor.digest());
        if !is_tar_media_type(descriptor.media_type()) {
            return Err(Error::UnsupportedImage(format!(
                "layer {index} has media type {}",
                descriptor.media_type()
            )));
        }

        let (blob_reader, driver) = self
            .proxy
            .get_descriptor(&self.img, descriptor)
            .await
            .map_err(|e| Error::source_read(context(), e))?;

        // See https://github.com/containers/containers-image-proxy-rs/issues/71
        let mut blob_reader = blob_reader.take(descriptor.size());

        let copy = async {
            let mut file = tokio::fs::File::create(path).await?;
            let copied = tokio::io::copy(&mut blob_reader, &mut file).await?;
            file.flush().await?;
            std::io::Result::Ok(copied)
        };
        let (copied, driver) = tokio::join!(copy, driver);
        driver.map_err(|e| Error::source_read(context(), e))?;
        let copied = copied.map_err(|e| Error::source_read(context(), e))?;

        if copied != descriptor.size() {
            return Err(Error::bad_source(format!(
                "{}: got {copied} of {} bytes",
                context(),
                descriptor.size()
            )));
        }
        Ok(copied)
    }

    async fn pull(&self, workdir: &Path) -> Result<SourceImage> {
        let (manifest_digest, raw_manifest) = self
            .proxy
            .fetch_manifest_raw_oci(&self.img)
            .await
            .map_err(|e| Error::source_read("fetching manifest", e))?;
        debug!("manifest {manifest_digest}");

        check_not_index(&raw_manifest)?;
        let manifest = ImageManifest::from_reader(raw_manifest.as_slice())
            .map_err(|e| Error::source_read("parsing manifest", e))?;

        let config = ImageConfig::from_slice(&self.fetch_config(manifest.config()).await?)?;

        let count = manifest.layers().len();
        let mut layers = vec![];
        let mut fetched = 0;
        for (index, descriptor) in manifest.layers().iter().enumerate() {
            self.progress
                .stage(&format!("Fetching layer {}/{count}", index + 1));
            let path = workdir.join(format!("layer-{index}"));
            fetched += self.fetch_layer(index, descriptor, &path).await?;
            self.progress.advance(fetched);
            layers.push(LayerBlob::File(path));
        }
        self.progress.finish();

        SourceImage::new(config, layers)
    }
}

/// Pulls `imgref` (a `docker://` reference) and stores its layers in `workdir`.
pub async fn pull(imgref: &str, workdir: &Path, progress: &dyn Progress) -> Result<SourceImage> {
    info!("pulling {imgref}");
    let op = ImageOp::new(imgref, progress).await?;
    let result = op.pull(workdir).await;

    if let Err(e) = op.proxy.close_image(&op.img).await {
        debug!("closing {imgref}: {e}");
    }
    result
}
