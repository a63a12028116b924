use std::{
    collections::BTreeMap,
    io::Read,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{TimeZone, Utc};
use oci_spec::image::ImageManifest;
use serde_json::json;
use similar_asserts::assert_eq;
use tar::{EntryType, Header};
use tokio_util::sync::CancellationToken;

use docker_squash::{
    oci::{archive::open_archive, LayerSource},
    progress::{NoProgress, Progress},
    squash::{run, squash_image, ImageReference, SquashOptions},
    util::sha256_digest,
    Error,
};

fn layer(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(vec![]);
    for (name, data) in files {
        let mut header = Header::new_gnu();
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(1_600_000_000);
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, name, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap()
}

fn append(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, name, data).unwrap();
}

/// A `docker save` style archive holding `images` copies of one image made of `layers`.
fn docker_archive(layers: &[Vec<u8>], images: usize) -> Vec<u8> {
    let diff_ids: Vec<String> = layers.iter().map(|l| sha256_digest(l)).collect();
    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "config": { "Env": ["PATH=/bin"], "Cmd": ["/bin/sh"] },
        "rootfs": { "type": "layers", "diff_ids": diff_ids },
        "history": diff_ids.iter().map(|_| json!({ "created_by": "test" })).collect::<Vec<_>>(),
    })
    .to_string();
    let layer_names: Vec<String> = (0..layers.len()).map(|i| format!("{i}/layer.tar")).collect();
    let entry = json!({ "Config": "config.json", "RepoTags": ["src:1"], "Layers": layer_names });
    let manifest = serde_json::Value::Array(vec![entry; images]).to_string();

    let mut builder = tar::Builder::new(vec![]);
    append(&mut builder, "manifest.json", manifest.as_bytes());
    append(&mut builder, "config.json", config.as_bytes());
    for (name, data) in layer_names.iter().zip(layers) {
        append(&mut builder, name, data);
    }
    builder.into_inner().unwrap()
}

fn write_source(dir: &Path, data: &[u8]) -> PathBuf {
    let path = dir.join("source.tar");
    std::fs::write(&path, data).unwrap();
    path
}

fn two_layer_source(dir: &Path) -> PathBuf {
    let layers = [
        layer(&[("etc/a", "1")]),
        layer(&[("etc/a", "2"), ("etc/b", "3")]),
    ];
    write_source(dir, &docker_archive(&layers, 1))
}

/// Type and content of every entry in a layer, keyed by path without trailing slash.
fn layer_contents(data: &[u8]) -> BTreeMap<String, (EntryType, String)> {
    let mut contents = BTreeMap::new();
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
        let entry_type = entry.header().entry_type();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        contents.insert(path, (entry_type, content));
    }
    contents
}

fn member(archive: &Path, name: &str) -> Vec<u8> {
    let mut archive = tar::Archive::new(std::fs::File::open(archive).unwrap());
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap() == Path::new(name) {
            let mut data = vec![];
            entry.read_to_end(&mut data).unwrap();
            return data;
        }
    }
    panic!("{name} not in archive");
}

fn read_layer(source: &impl LayerSource, index: usize) -> Vec<u8> {
    let mut data = vec![];
    source
        .open_layer(index)
        .unwrap()
        .read_to_end(&mut data)
        .unwrap();
    data
}

#[derive(Default)]
struct Recorder {
    stages: Mutex<Vec<String>>,
    last: Mutex<u64>,
}

impl Progress for Recorder {
    fn stage(&self, message: &str) {
        self.stages.lock().unwrap().push(message.to_string());
        *self.last.lock().unwrap() = 0;
    }

    fn advance(&self, total: u64) {
        let mut last = self.last.lock().unwrap();
        assert!(total >= *last, "progress went backwards");
        *last = total;
    }
}

#[tokio::test]
async fn test_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let source = two_layer_source(dir.path());
    let dest = dir.path().join("out.tar");
    let options = SquashOptions {
        tag: Some("example.com/squashed:v1".into()),
        quiet: false,
        tmpdir: Some(dir.path().to_path_buf()),
    };
    let recorder = Arc::new(Recorder::default());

    let report = run(
        source.to_str().unwrap(),
        &dest,
        &options,
        recorder.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.reference, "example.com/squashed:v1");
    assert_eq!(report.entries, 3);
    assert_eq!(report.bytes, 2);

    let output = open_archive(&dest).unwrap();
    assert_eq!(output.layer_count(), 1);

    let squashed = read_layer(&output, 0);
    assert_eq!(squashed.len() as u64, report.layer_size);
    assert_eq!(sha256_digest(&squashed), report.layer_digest);
    assert_eq!(
        layer_contents(&squashed),
        BTreeMap::from([
            ("etc".to_string(), (EntryType::Directory, String::new())),
            ("etc/a".to_string(), (EntryType::Regular, "2".to_string())),
            ("etc/b".to_string(), (EntryType::Regular, "3".to_string())),
        ])
    );

    // the manifest describes exactly the bytes written
    let manifest_path = format!("blobs/sha256/{}", &report.manifest_digest["sha256:".len()..]);
    let manifest = member(&dest, &manifest_path);
    assert_eq!(sha256_digest(&manifest), report.manifest_digest);
    let manifest = ImageManifest::from_reader(&manifest[..]).unwrap();
    assert_eq!(manifest.layers().len(), 1);
    assert_eq!(manifest.layers()[0].size(), squashed.len() as u64);
    assert_eq!(manifest.layers()[0].digest().to_string(), report.layer_digest);

    assert_eq!(output.config.diff_ids(), [report.layer_digest.clone()]);
    assert_eq!(output.config.get("history"), None);
    assert_eq!(
        output.config.get("config"),
        Some(&json!({ "Env": ["PATH=/bin"], "Cmd": ["/bin/sh"] }))
    );

    let stages = recorder.stages.lock().unwrap().clone();
    assert!(stages.iter().any(|s| s == "Writing squashed layer"), "{stages:?}");

    // only the output is left behind
    let mut leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    leftovers.sort();
    assert_eq!(leftovers, ["out.tar", "source.tar"]);

    // same permissions as any other newly created file
    let plain = dir.path().join("plain");
    std::fs::File::create(&plain).unwrap();
    let mode = |path: &Path| std::fs::metadata(path).unwrap().permissions().mode();
    assert_eq!(mode(&dest), mode(&plain));
}

#[test]
fn test_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let source = open_archive(&two_layer_source(dir.path())).unwrap();
    let reference = ImageReference::parse("squashed").unwrap();
    let created = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap();

    let mut outputs = vec![];
    for name in ["one.tar", "two.tar"] {
        let workdir = tempfile::tempdir().unwrap();
        let dest = dir.path().join(name);
        let report = squash_image(
            &source,
            workdir.path(),
            &dest,
            &reference,
            created,
            &NoProgress,
            &CancellationToken::new(),
        )
        .unwrap();
        outputs.push((report, std::fs::read(&dest).unwrap()));
    }

    assert_eq!(outputs[0].0, outputs[1].0);
    assert!(outputs[0].1 == outputs[1].1, "archives differ");
}

#[tokio::test]
async fn test_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let source = two_layer_source(dir.path());
    let dest = dir.path().join("out.tar");
    let options = SquashOptions {
        quiet: true,
        ..Default::default()
    };
    let recorder = Arc::new(Recorder::default());

    let report = run(
        source.to_str().unwrap(),
        &dest,
        &options,
        recorder.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(report.reference.starts_with("docker-squash-"));
    assert!(report.reference.ends_with(":latest"));
    assert!(recorder.stages.lock().unwrap().is_empty());
    assert!(dest.exists());
}

#[tokio::test]
async fn test_rejects_multi_image_archive() {
    let dir = tempfile::tempdir().unwrap();
    let layers = [layer(&[("a", "1")])];
    let source = write_source(dir.path(), &docker_archive(&layers, 2));
    let dest = dir.path().join("out.tar");

    let err = run(
        source.to_str().unwrap(),
        &dest,
        &SquashOptions::default(),
        Arc::new(NoProgress),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::UnsupportedImage(..)), "{err}");
    assert_eq!(err.stage(), "load");
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_invalid_tag() {
    let dir = tempfile::tempdir().unwrap();
    let source = two_layer_source(dir.path());
    let dest = dir.path().join("out.tar");
    let options = SquashOptions {
        tag: Some("Not A Tag".into()),
        ..Default::default()
    };

    let err = run(
        source.to_str().unwrap(),
        &dest,
        &options,
        Arc::new(NoProgress),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidReference(..)), "{err}");
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let source = two_layer_source(dir.path());
    let dest = dir.path().join("out.tar");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = run(
        source.to_str().unwrap(),
        &dest,
        &SquashOptions::default(),
        Arc::new(NoProgress),
        cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Interrupted), "{err}");
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_broken_layer() {
    let dir = tempfile::tempdir().unwrap();
    let mut truncated = layer(&[("big", "x".repeat(4096).as_str())]);
    truncated.truncate(1024);
    let source = write_source(dir.path(), &docker_archive(&[truncated], 1));
    let dest = dir.path().join("out.tar");

    let err = run(
        source.to_str().unwrap(),
        &dest,
        &SquashOptions::default(),
        Arc::new(NoProgress),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::SourceRead { .. }), "{err}");
    assert!(!dest.exists());
}
