use std::{ffi::OsStr, os::unix::ffi::OsStrExt, path::Path, rc::Rc};

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    image::{Directory, FileSystem, ImageError, Inode, Leaf, LeafContent},
    oci::{
        tar::{for_each_entry, TarEntry, TarItem},
        LayerSource,
    },
    progress::Progress,
    spool::Spool,
    util::{normalize_path, CancellableReader},
};

const WHITEOUT_PREFIX: &[u8] = b".wh.";
const OPAQUE_MARKER: &[u8] = b".wh..opq";
const AUFS_METADATA_PREFIX: &[u8] = b".wh..wh.";

/// Applies one entry of layer `layer` to the union view.
///
/// Layers must be applied bottom to top, and the entries of a layer in archive order.
pub fn process_entry(filesystem: &mut FileSystem, layer: usize, entry: TarEntry) -> Result<()> {
    let Some(path) = normalize_path(&entry.path) else {
        return Err(Error::resolution(
            layer,
            entry.path,
            "path escapes the image root",
        ));
    };

    let Some(filename) = path.file_name() else {
        // an entry for the root directory itself, like "./"
        return match entry.item {
            TarItem::Directory => {
                filesystem.root.stat = entry.stat;
                filesystem.explicit_root = true;
                Ok(())
            }
            _ => Err(Error::resolution(layer, path, "image root is not a directory")),
        };
    };
    let aufs_metadata = path
        .iter()
        .next()
        .is_some_and(|first| first.as_bytes().starts_with(AUFS_METADATA_PREFIX));
    if aufs_metadata && path != Path::new(".wh..wh..opq") {
        debug!("layer {layer}: skipping aufs metadata {path:?}");
        return Ok(());
    }

    let parent = path.parent().unwrap_or(Path::new(""));
    let invalid = |e: ImageError| Error::resolution(layer, &path, e.to_string());

    if let Some(whiteout) = filename.as_bytes().strip_prefix(WHITEOUT_PREFIX) {
        if !matches!(entry.item, TarItem::Leaf(LeafContent::Regular(..))) {
            return Err(Error::resolution(
                layer,
                &path,
                "whiteout is not a regular file",
            ));
        }

        if whiteout == OPAQUE_MARKER {
            // complete name is '.wh..wh..opq'
            let dir = filesystem
                .root
                .make_directories(parent, layer)
                .map_err(invalid)?;
            dir.clear_below(layer);
        } else if whiteout.starts_with(WHITEOUT_PREFIX) {
            debug!("layer {layer}: skipping whiteout metadata {path:?}");
        } else if whiteout.is_empty() {
            return Err(Error::resolution(layer, &path, "empty whiteout name"));
        } else if let Some(dir) = filesystem
            .root
            .get_directory_mut_opt(parent)
            .map_err(invalid)?
        {
            dir.whiteout(OsStr::from_bytes(whiteout), layer);
        }

        return Ok(());
    }

    let inode = match entry.item {
        TarItem::Directory => Inode::Directory(Box::new(Directory::new(entry.stat, layer))),
        TarItem::Leaf(content) => Inode::Leaf {
            leaf: Rc::new(Leaf {
                stat: entry.stat,
                content,
            }),
            layer,
        },
        TarItem::Hardlink(target) => {
            let Some(target_path) = normalize_path(&target) else {
                return Err(Error::resolution(
                    layer,
                    &path,
                    "hardlink target escapes the image root",
                ));
            };
            match filesystem.ref_leaf(&target_path) {
                Ok(leaf) => Inode::Leaf { leaf, layer },
                Err(ImageError::IsADirectory(..)) => {
                    return Err(Error::resolution(
                        layer,
                        &path,
                        format!("hardlink to directory {target_path:?}"),
                    ))
                }
                Err(_) => {
                    return Err(Error::BrokenLink {
                        layer,
                        path,
                        target: target_path,
                    })
                }
            }
        }
    };

    let dir = filesystem
        .root
        .make_directories(parent, layer)
        .map_err(invalid)?;
    dir.merge(filename, inode);

    Ok(())
}

/// Replays every layer of `source`, bottom to top, into a new union view.
pub fn compose_filesystem(
    source: &dyn LayerSource,
    spool: &mut Spool,
    progress: &dyn Progress,
    cancel: &CancellationToken,
) -> Result<FileSystem> {
    let mut filesystem = FileSystem::new();
    let count = source.layer_count();

    for layer in 0..count {
        progress.stage(&format!("Applying layer {}/{count}", layer + 1));
        let reader = CancellableReader::new(source.open_layer(layer)?, cancel);
        for_each_entry(reader, layer, spool, |entry| {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            process_entry(&mut filesystem, layer, entry)
        })
        .map_err(|e| e.or_interrupted(cancel))?;
        progress.advance(spool.len());
    }
    progress.finish();

    Ok(filesystem)
}
