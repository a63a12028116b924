//! Image config and manifest rebuilding.
//!
//! The squashed image keeps every field of the source config except the root filesystem, the
//! history and the creation time.  The config is edited as a raw JSON object so that fields
//! `oci-spec` doesn't model survive untouched; it is also parsed into an [`ImageConfiguration`]
//! so malformed configs are caught up front.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use oci_spec::image::{
    DescriptorBuilder, Digest, ImageConfiguration, ImageManifestBuilder, MediaType,
    SCHEMA_VERSION,
};
use serde_json::{json, Map, Value};

use crate::{
    error::{Error, Result},
    util::sha256_digest,
};

/// An image config, kept both as its raw JSON object and in parsed form.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    raw: Map<String, Value>,
    parsed: ImageConfiguration,
}

impl ImageConfig {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: Map<String, Value> = serde_json::from_slice(bytes)
            .map_err(|e| Error::invalid_config("config is not a JSON object", e))?;
        Self::from_map(raw)
    }

    fn from_map(raw: Map<String, Value>) -> Result<Self> {
        let parsed = serde_json::from_value(Value::Object(raw.clone()))
            .map_err(|e| Error::invalid_config("parsing image config", e))?;
        Ok(ImageConfig { raw, parsed })
    }

    pub fn diff_ids(&self) -> &[String] {
        self.parsed.rootfs().diff_ids()
    }

    /// The value of one top-level field of the raw config.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// Returns a copy describing a single layer image with content `diff_id`, created at
    /// `created`, without history.
    pub fn squashed(&self, diff_id: &str, created: DateTime<Utc>) -> Result<Self> {
        let mut raw = self.raw.clone();
        raw.insert(
            "rootfs".into(),
            json!({ "type": "layers", "diff_ids": [diff_id] }),
        );
        raw.remove("history");
        raw.insert(
            "created".into(),
            Value::String(created.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        Self::from_map(raw)
    }

    /// Canonical serialization: keys in sorted order, no whitespace.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.raw).map_err(|e| Error::invalid_config("serializing config", e))
    }
}

/// The new config and manifest of a squashed image, serialized, with their digests.
#[derive(Debug, Clone)]
pub struct SquashedImage {
    pub config: Vec<u8>,
    pub config_digest: String,
    pub manifest: Vec<u8>,
    pub manifest_digest: String,
    pub layer_digest: String,
    pub layer_size: u64,
}

fn parse_digest(digest: &str) -> Result<Digest> {
    Digest::from_str(digest).map_err(|e| Error::invalid_config(format!("digest {digest:?}"), e))
}

/// Builds the config and manifest of the squashed image.
///
/// `diff_id` is the digest of the uncompressed layer, and `layer_digest`/`layer_size` describe
/// the blob as stored.  The layer is stored uncompressed, so the two digests are normally equal.
pub fn rebuild(
    original: &ImageConfig,
    diff_id: &str,
    layer_digest: &str,
    layer_size: u64,
    created: DateTime<Utc>,
) -> Result<SquashedImage> {
    let config = original.squashed(diff_id, created)?.to_vec()?;
    let config_digest = sha256_digest(&config);

    let manifest_error = |e| Error::invalid_config("building manifest", e);
    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(parse_digest(&config_digest)?)
        .size(config.len() as u64)
        .build()
        .map_err(manifest_error)?;
    let layer_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageLayer)
        .digest(parse_digest(layer_digest)?)
        .size(layer_size)
        .build()
        .map_err(manifest_error)?;
    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(vec![layer_descriptor])
        .build()
        .map_err(manifest_error)?;

    let manifest = serde_json::to_vec(&manifest)
        .map_err(|e| Error::invalid_config("serializing manifest", e))?;
    let manifest_digest = sha256_digest(&manifest);

    Ok(SquashedImage {
        config,
        config_digest,
        manifest,
        manifest_digest,
        layer_digest: layer_digest.to_string(),
        layer_size,
    })
}
