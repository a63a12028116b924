//! Image archives on disk.
//!
//! Input archives come in two layouts: the one written by `docker save` (a `manifest.json`
//! listing config and layer members) and an OCI image layout packed into a tar file
//! (`index.json` plus content-addressed blobs).  Members are located once by scanning the
//! archive headers; layers are later read straight out of the archive by offset, so nothing is
//! unpacked.
//!
//! The output archive carries both layouts at once, so it can be consumed by `docker load` and
//! by OCI tooling alike.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use log::debug;
use oci_spec::image::{
    DescriptorBuilder, Digest, ImageIndex, ImageIndexBuilder, ImageManifest, MediaType,
    OciLayoutBuilder, SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use tar::{EntryType, Header};

use crate::{
    error::{Error, Result},
    oci::{config::ImageConfig, config::SquashedImage, is_tar_media_type, LayerBlob, SourceImage},
    squash::ImageReference,
    util::{blob_path, normalize_path},
};

const DOCKER_MANIFEST: &str = "manifest.json";
const OCI_INDEX: &str = "index.json";
const OCI_LAYOUT: &str = "oci-layout";
const OCI_LAYOUT_VERSION: &str = "1.0.0";

const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
const ANNOTATION_CONTAINERD_NAME: &str = "io.containerd.image.name";

/// Symlinks between members are followed at most this many times.
const MAX_MEMBER_LINKS: usize = 8;

/// One image in a `docker save` manifest.json.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerManifest {
    pub config: String,
    pub repo_tags: Option<Vec<String>>,
    pub layers: Vec<String>,
}

#[derive(Debug, Clone)]
enum Member {
    Data { offset: u64, size: u64 },
    Symlink(PathBuf),
}

/// Resolves a symlink `target` found in directory `parent`, staying inside the archive.
fn resolve_link(parent: &Path, target: &Path) -> Option<PathBuf> {
    let mut resolved = if target.has_root() {
        PathBuf::new()
    } else {
        parent.to_path_buf()
    };
    for component in target.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::Normal(name) => resolved.push(name),
            Component::Prefix(..) => return None,
        }
    }
    Some(resolved)
}

/// The table of contents of an uncompressed tar archive.
#[derive(Debug)]
pub struct ArchiveIndex {
    path: PathBuf,
    members: HashMap<PathBuf, Member>,
}

impl ArchiveIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let context = || format!("reading archive {path:?}");
        let file = File::open(path).map_err(|e| Error::source_read(context(), e))?;
        let mut archive = tar::Archive::new(file);
        let mut members = HashMap::new();

        let entries = archive
            .entries_with_seek()
            .map_err(|e| Error::source_read(context(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::source_read(context(), e))?;
            let name = entry.path().map_err(|e| Error::source_read(context(), e))?;
            let Some(name) = normalize_path(&name) else {
                continue;
            };

            let member = match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous => Member::Data {
                    offset: entry.raw_file_position(),
                    size: entry.size(),
                },
                EntryType::Symlink => {
                    let Some(target) = entry
                        .link_name()
                        .map_err(|e| Error::source_read(context(), e))?
                    else {
                        continue;
                    };
                    let parent = name.parent().unwrap_or(Path::new(""));
                    let Some(target) = resolve_link(parent, &target) else {
                        continue;
                    };
                    Member::Symlink(target)
                }
                _ => continue,
            };
            members.insert(name, member);
        }

        debug!("{path:?}: {} members", members.len());
        Ok(ArchiveIndex {
            path: path.to_path_buf(),
            members,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(Path::new(name))
    }

    /// Finds the data of member `name`, following symlinks between members.
    fn locate(&self, name: &str) -> Result<(u64, u64)> {
        let mut current = normalize_path(Path::new(name))
            .ok_or_else(|| Error::bad_source(format!("invalid member name {name:?}")))?;

        for _ in 0..MAX_MEMBER_LINKS {
            match self.members.get(&current) {
                Some(Member::Data { offset, size }) => return Ok((*offset, *size)),
                Some(Member::Symlink(target)) => current = target.clone(),
                None => {
                    return Err(Error::bad_source(format!(
                        "{name:?} is missing from {:?}",
                        self.path
                    )))
                }
            }
        }
        Err(Error::bad_source(format!("too many symlinks resolving {name:?}")))
    }

    pub fn blob(&self, name: &str) -> Result<LayerBlob> {
        let (offset, size) = self.locate(name)?;
        Ok(LayerBlob::Member {
            archive: self.path.clone(),
            offset,
            size,
        })
    }

    /// Reads a whole member into memory.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let (offset, size) = self.locate(name)?;
        let mut data = vec![];
        File::open(&self.path)
            .and_then(|mut file| {
                file.seek(SeekFrom::Start(offset))?;
                file.take(size).read_to_end(&mut data)
            })
            .map_err(|e| Error::source_read(format!("reading {name:?}"), e))?;
        Ok(data)
    }
}

fn open_docker_archive(index: &ArchiveIndex) -> Result<SourceImage> {
    let manifest: Vec<DockerManifest> = serde_json::from_slice(&index.read(DOCKER_MANIFEST)?)
        .map_err(|e| Error::source_read("parsing manifest.json", e))?;

    let [image] = &manifest[..] else {
        return Err(Error::UnsupportedImage(format!(
            "archive contains {} images, expected exactly one",
            manifest.len()
        )));
    };

    let config = ImageConfig::from_slice(&index.read(&image.config)?)?;
    let layers = image
        .layers
        .iter()
        .map(|layer| index.blob(layer))
        .collect::<Result<Vec<_>>>()?;

    SourceImage::new(config, layers)
}

fn oci_blob(index: &ArchiveIndex, digest: &Digest) -> Result<LayerBlob> {
    let digest = digest.to_string();
    let path = blob_path(&digest)
        .ok_or_else(|| Error::bad_source(format!("invalid digest {digest:?}")))?;
    index.blob(&path)
}

fn read_oci_blob(index: &ArchiveIndex, digest: &Digest) -> Result<Vec<u8>> {
    let digest = digest.to_string();
    let path = blob_path(&digest)
        .ok_or_else(|| Error::bad_source(format!("invalid digest {digest:?}")))?;
    index.read(&path)
}

fn open_oci_archive(index: &ArchiveIndex) -> Result<SourceImage> {
    let image_index = ImageIndex::from_reader(&index.read(OCI_INDEX)?[..])
        .map_err(|e| Error::source_read("parsing index.json", e))?;

    let [descriptor] = &image_index.manifests()[..] else {
        return Err(Error::UnsupportedImage(format!(
            "index lists {} manifests, expected exactly one",
            image_index.manifests().len()
        )));
    };
    if *descriptor.media_type() == MediaType::ImageIndex {
        return Err(Error::UnsupportedImage(
            "nested image index (multi-platform image)".into(),
        ));
    }

    let manifest = ImageManifest::from_reader(&read_oci_blob(index, descriptor.digest())?[..])
        .map_err(|e| Error::source_read("parsing manifest", e))?;
    let config = ImageConfig::from_slice(&read_oci_blob(index, manifest.config().digest())?)?;

    let mut layers = vec![];
    for layer in manifest.layers() {
        if !is_tar_media_type(layer.media_type()) {
            return Err(Error::UnsupportedImage(format!(
                "layer {} has media type {}",
                layer.digest(),
                layer.media_type()
            )));
        }
        layers.push(oci_blob(index, layer.digest())?);
    }

    SourceImage::new(config, layers)
}

/// Opens a local image archive in either `docker save` or OCI layout form.
pub fn open_archive(path: &Path) -> Result<SourceImage> {
    let index = ArchiveIndex::open(path)?;

    if index.contains(DOCKER_MANIFEST) {
        debug!("{path:?}: docker archive");
        open_docker_archive(&index)
    } else if index.contains(OCI_INDEX) {
        debug!("{path:?}: OCI layout archive");
        open_oci_archive(&index)
    } else {
        Err(Error::bad_source(format!(
            "{path:?} has neither {DOCKER_MANIFEST} nor {OCI_INDEX}"
        )))
    }
}

fn append_member<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    data: impl Read,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(size);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| Error::write(format!("archive member {name}"), e))
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    append_member(builder, name, data.len() as u64, data)
}

fn member_blob_path(digest: &str) -> Result<String> {
    blob_path(digest).ok_or_else(|| Error::invalid_config(format!("digest {digest:?}"), "malformed"))
}

/// JSON with object keys in sorted order, so the same values always produce the same bytes.
fn to_sorted_json(value: &impl Serialize) -> Result<Vec<u8>> {
    serde_json::to_value(value)
        .and_then(|value| serde_json::to_vec(&value))
        .map_err(|e| Error::invalid_config("serializing archive metadata", e))
}

fn oci_index(reference: &ImageReference, image: &SquashedImage) -> Result<Vec<u8>> {
    let error = |e| Error::invalid_config("building index.json", e);
    let digest: Digest = image
        .manifest_digest
        .parse()
        .map_err(|e| Error::invalid_config("manifest digest", e))?;
    let annotations = HashMap::from([
        (ANNOTATION_REF_NAME.to_string(), reference.tag().to_string()),
        (ANNOTATION_CONTAINERD_NAME.to_string(), reference.to_string()),
    ]);
    let descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(digest)
        .size(image.manifest.len() as u64)
        .annotations(annotations)
        .build()
        .map_err(error)?;
    let index = ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageIndex)
        .manifests(vec![descriptor])
        .build()
        .map_err(error)?;
    to_sorted_json(&index)
}

/// Writes the squashed image as a tar archive to `sink` and returns the sink.
///
/// `layer` must yield exactly `image.layer_size` bytes.  Every member gets mode 0644, owner 0:0
/// and mtime 0.
pub fn write_archive<W: Write>(
    sink: W,
    reference: &ImageReference,
    image: &SquashedImage,
    layer: impl Read,
) -> Result<W> {
    let layer_path = member_blob_path(&image.layer_digest)?;
    let config_path = member_blob_path(&image.config_digest)?;
    let manifest_path = member_blob_path(&image.manifest_digest)?;

    let oci_layout = OciLayoutBuilder::default()
        .image_layout_version(OCI_LAYOUT_VERSION.to_string())
        .build()
        .map_err(|e| Error::invalid_config("building oci-layout", e))?;
    let docker_manifest = vec![DockerManifest {
        config: config_path.clone(),
        repo_tags: Some(vec![reference.to_string()]),
        layers: vec![layer_path.clone()],
    }];

    let mut builder = tar::Builder::new(sink);
    append_bytes(&mut builder, OCI_LAYOUT, &to_sorted_json(&oci_layout)?)?;
    append_member(&mut builder, &layer_path, image.layer_size, layer)?;
    append_bytes(&mut builder, &config_path, &image.config)?;
    append_bytes(&mut builder, &manifest_path, &image.manifest)?;
    append_bytes(&mut builder, OCI_INDEX, &oci_index(reference, image)?)?;
    append_bytes(&mut builder, DOCKER_MANIFEST, &to_sorted_json(&docker_manifest)?)?;

    let mut sink = builder
        .into_inner()
        .map_err(|e| Error::write("end of image archive", e))?;
    sink.flush()
        .map_err(|e: io::Error| Error::write("image archive", e))?;
    Ok(sink)
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        oci::{config::rebuild, LayerSource},
        util::sha256_digest,
    };

    fn config_json(layers: usize) -> Vec<u8> {
        let diff_ids: Vec<String> = (0..layers)
            .map(|i| sha256_digest(format!("{i}").as_bytes()))
            .collect();
        json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        })
        .to_string()
        .into_bytes()
    }

    fn build_archive(members: &[(&str, &[u8])], symlinks: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(vec![]);
        for (name, data) in members {
            append_bytes(&mut builder, name, data).unwrap();
        }
        for (name, target) in symlinks {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_mode(0o777);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_size(0);
            builder
                .append_link(&mut header, name, target)
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn save(dir: &Path, data: &[u8]) -> PathBuf {
        let path = dir.join("image.tar");
        std::fs::write(&path, data).unwrap();
        path
    }

    fn read_layer(image: &SourceImage, index: usize) -> Vec<u8> {
        let mut data = vec![];
        image
            .open_layer(index)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        data
    }

    #[test]
    fn test_docker_archive() {
        let manifest = json!([{
            "Config": "abc.json",
            "RepoTags": null,
            "Layers": ["one/layer.tar", "./two/layer.tar", "three/layer.tar"],
        }])
        .to_string();
        let config = config_json(3);
        let data = build_archive(
            &[
                ("manifest.json", manifest.as_bytes()),
                ("abc.json", &config[..]),
                ("one/layer.tar", &b"first"[..]),
                ("two/layer.tar", &b"second"[..]),
            ],
            // deduplicated layers are stored as symlinks
            &[("three/layer.tar", "../one/layer.tar")],
        );

        let dir = tempfile::tempdir().unwrap();
        let image = open_archive(&save(dir.path(), &data)).unwrap();
        assert_eq!(image.layer_count(), 3);
        assert_eq!(read_layer(&image, 0), b"first");
        assert_eq!(read_layer(&image, 1), b"second");
        assert_eq!(read_layer(&image, 2), b"first");
        assert_eq!(image.config.diff_ids().len(), 3);
    }

    #[test]
    fn test_rejects_multiple_images() {
        let entry = json!({ "Config": "abc.json", "RepoTags": ["a:b"], "Layers": [] });
        let manifest = json!([entry, entry]).to_string();
        let config = config_json(0);
        let data = build_archive(
            &[("manifest.json", manifest.as_bytes()), ("abc.json", &config[..])],
            &[],
        );

        let dir = tempfile::tempdir().unwrap();
        let err = open_archive(&save(dir.path(), &data)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedImage(..)), "{err}");
    }

    #[test]
    fn test_layer_count_mismatch() {
        let manifest = json!([{ "Config": "abc.json", "Layers": ["one"] }]).to_string();
        let config = config_json(2);
        let data = build_archive(
            &[
                ("manifest.json", manifest.as_bytes()),
                ("abc.json", &config[..]),
                ("one", &b""[..]),
            ],
            &[],
        );

        let dir = tempfile::tempdir().unwrap();
        let err = open_archive(&save(dir.path(), &data)).unwrap_err();
        assert!(matches!(err, Error::SourceRead { .. }), "{err}");
    }

    #[test]
    fn test_missing_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let data = build_archive(&[("hello", &b"world"[..])], &[]);
        let err = open_archive(&save(dir.path(), &data)).unwrap_err();
        assert!(matches!(err, Error::SourceRead { .. }), "{err}");

        let err = open_archive(&dir.path().join("nonexistent")).unwrap_err();
        assert!(matches!(err, Error::SourceRead { .. }), "{err}");
    }

    fn oci_descriptor(media_type: MediaType, data: &[u8]) -> oci_spec::image::Descriptor {
        DescriptorBuilder::default()
            .media_type(media_type)
            .digest(sha256_digest(data).parse::<Digest>().unwrap())
            .size(data.len() as u64)
            .build()
            .unwrap()
    }

    fn blob_member(data: &[u8]) -> String {
        blob_path(&sha256_digest(data)).unwrap()
    }

    #[test]
    fn test_oci_archive() {
        use oci_spec::image::ImageManifestBuilder;

        let layer = b"layer bytes".to_vec();
        let config = config_json(1);
        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(oci_descriptor(MediaType::ImageConfig, &config))
            .layers(vec![oci_descriptor(MediaType::ImageLayerGzip, &layer)])
            .build()
            .unwrap();
        let manifest = serde_json::to_vec(&manifest).unwrap();

        let index = |descriptors: Vec<oci_spec::image::Descriptor>| {
            ImageIndexBuilder::default()
                .schema_version(SCHEMA_VERSION)
                .manifests(descriptors)
                .build()
                .unwrap()
                .to_string()
                .unwrap()
        };
        let manifest_descriptor = oci_descriptor(MediaType::ImageManifest, &manifest);

        let (layer_name, config_name, manifest_name) =
            (blob_member(&layer), blob_member(&config), blob_member(&manifest));
        let blobs: [(&str, &[u8]); 3] = [
            (layer_name.as_str(), &layer[..]),
            (config_name.as_str(), &config[..]),
            (manifest_name.as_str(), &manifest[..]),
        ];

        let dir = tempfile::tempdir().unwrap();

        let single = index(vec![manifest_descriptor.clone()]);
        let mut members = blobs.to_vec();
        members.push(("index.json", single.as_bytes()));
        let image = open_archive(&save(dir.path(), &build_archive(&members, &[]))).unwrap();
        assert_eq!(image.layer_count(), 1);
        assert_eq!(read_layer(&image, 0), layer);

        let double = index(vec![manifest_descriptor.clone(), manifest_descriptor]);
        let mut members = blobs.to_vec();
        members.push(("index.json", double.as_bytes()));
        let err = open_archive(&save(dir.path(), &build_archive(&members, &[]))).unwrap_err();
        assert!(matches!(err, Error::UnsupportedImage(..)), "{err}");

        let nested = index(vec![oci_descriptor(MediaType::ImageIndex, &manifest)]);
        let mut members = blobs.to_vec();
        members.push(("index.json", nested.as_bytes()));
        let err = open_archive(&save(dir.path(), &build_archive(&members, &[]))).unwrap_err();
        assert!(matches!(err, Error::UnsupportedImage(..)), "{err}");
    }

    #[test]
    fn test_write_archive() {
        let layer = build_archive(&[("etc/hostname", &b"squashed\n"[..])], &[]);
        let layer_digest = sha256_digest(&layer);
        let original = ImageConfig::from_slice(&config_json(4)).unwrap();
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let image = rebuild(
            &original,
            &layer_digest,
            &layer_digest,
            layer.len() as u64,
            created,
        )
        .unwrap();
        let reference = ImageReference::parse("example.com/app").unwrap();

        let output = write_archive(vec![], &reference, &image, &layer[..]).unwrap();

        // every member is normalized
        let mut archive = tar::Archive::new(&output[..]);
        let mut names = vec![];
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mode().unwrap(), 0o644);
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            assert_eq!(header.mtime().unwrap(), 0);
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
        }
        assert_eq!(
            names,
            [
                "oci-layout".to_string(),
                blob_member(&layer),
                blob_member(&image.config),
                blob_member(&image.manifest),
                "index.json".to_string(),
                "manifest.json".to_string(),
            ]
        );

        // and it reads back as a one layer image through both layouts
        let dir = tempfile::tempdir().unwrap();
        let path = save(dir.path(), &output);
        let reread = open_archive(&path).unwrap();
        assert_eq!(reread.layer_count(), 1);
        assert_eq!(read_layer(&reread, 0), layer);
        assert_eq!(reread.config.diff_ids(), [layer_digest.clone()]);

        let index = ArchiveIndex::open(&path).unwrap();
        let reread = open_oci_archive(&index).unwrap();
        assert_eq!(reread.layer_count(), 1);

        let index = ImageIndex::from_reader(&index.read("index.json").unwrap()[..]).unwrap();
        let annotations = index.manifests()[0].annotations().clone().unwrap();
        assert_eq!(annotations[ANNOTATION_REF_NAME], "latest");
        assert_eq!(annotations[ANNOTATION_CONTAINERD_NAME], "example.com/app:latest");

        // same inputs, same bytes
        let again = write_archive(vec![], &reference, &image, &layer[..]).unwrap();
        assert_eq!(again, output);
    }
}
