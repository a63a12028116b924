//! Tar handling for layers: reading the entries of an input layer, and writing the squashed
//! layer back out.
//!
//! Reading turns every archive member into a [`TarEntry`], spooling large file bodies so that
//! the layer stream can move on.  Writing walks a resolved [`FileSystem`] depth first, in name
//! order, and produces the same bytes every time for the same view.

use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsString,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    rc::Rc,
};

use log::trace;
use tar::{EntryType, Header};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    image::{Directory, FileSystem, Inode, Leaf, LeafContent, RegularFile, Stat},
    progress::{Progress, ProgressWriter},
    spool::Spool,
    util::CancellableReader,
    INLINE_CONTENT_MAX,
};

const PAX_SCHILYXATTR: &str = "SCHILY.xattr.";

#[derive(Debug)]
pub enum TarItem {
    Directory,
    Leaf(LeafContent),
    /// Contains the target of the link
    /// The actual link path should be in TarEntry.path
    Hardlink(PathBuf),
}

#[derive(Debug)]
pub struct TarEntry {
    pub path: PathBuf,
    pub stat: Stat,
    pub item: TarItem,
}

fn stat_from_tar_header(header: &Header) -> io::Result<Stat> {
    Ok(Stat {
        st_uid: header.uid()?,
        st_gid: header.gid()?,
        st_mode: header.mode()?,
        st_mtim_sec: header.mtime()?,
        uname: header.username().ok().flatten().map(Box::from),
        gname: header.groupname().ok().flatten().map(Box::from),
        xattrs: BTreeMap::new(),
    })
}

fn update_xattrs<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    xattrs: &mut BTreeMap<Box<str>, Box<[u8]>>,
) -> io::Result<()> {
    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            let Ok(key) = extension.key() else {
                continue;
            };
            if let Some(xattr) = key.strip_prefix(PAX_SCHILYXATTR) {
                xattrs.insert(Box::from(xattr), Box::from(extension.value_bytes()));
            }
        }
    }
    Ok(())
}

fn parse_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    layer: usize,
    spool: &mut Spool,
) -> Result<Option<TarEntry>> {
    let read_error = |e| Error::source_read(format!("reading layer {layer}"), e);

    let entry_type = entry.header().entry_type();
    if entry_type == EntryType::XGlobalHeader {
        return Ok(None);
    }

    // entry.path() contains the untruncated path, while entry.header().path() contains the
    // path truncated to 100 bytes
    let path = entry.path().map_err(read_error)?.into_owned();
    let mut stat = stat_from_tar_header(entry.header()).map_err(read_error)?;
    update_xattrs(entry, &mut stat.xattrs).map_err(read_error)?;

    let item = match entry_type {
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
            let size = entry.size();
            let file = if size <= INLINE_CONTENT_MAX as u64 {
                let mut content = Vec::with_capacity(size as usize);
                entry.read_to_end(&mut content).map_err(read_error)?;
                RegularFile::Inline(content.into())
            } else {
                RegularFile::External(spool.store(entry, size).map_err(|e| {
                    Error::source_read(format!("reading layer {layer}: content of {path:?}"), e)
                })?)
            };
            TarItem::Leaf(LeafContent::Regular(file))
        }

        EntryType::Link | EntryType::Symlink => {
            let Some(link_name) = entry.link_name().map_err(read_error)? else {
                return Err(Error::resolution(layer, path, "link without a target"));
            };
            let link_name = link_name.into_owned();

            if entry_type == EntryType::Link {
                TarItem::Hardlink(link_name)
            } else {
                TarItem::Leaf(LeafContent::Symlink(
                    OsString::from(link_name).into_boxed_os_str(),
                ))
            }
        }

        EntryType::Char | EntryType::Block => {
            let header = entry.header();
            let (major, minor) = match (
                header.device_major().map_err(read_error)?,
                header.device_minor().map_err(read_error)?,
            ) {
                (Some(major), Some(minor)) => (major, minor),
                _ => {
                    return Err(Error::resolution(
                        layer,
                        path,
                        "device entry without device numbers",
                    ))
                }
            };

            if entry_type == EntryType::Char {
                TarItem::Leaf(LeafContent::CharacterDevice(major, minor))
            } else {
                TarItem::Leaf(LeafContent::BlockDevice(major, minor))
            }
        }

        EntryType::Fifo => TarItem::Leaf(LeafContent::Fifo),

        EntryType::Directory => TarItem::Directory,

        other => {
            return Err(Error::resolution(
                layer,
                path,
                format!("unsupported tar entry type {other:?}"),
            ))
        }
    };

    Ok(Some(TarEntry { path, stat, item }))
}

/// Reads the layer archive in `reader` and hands every entry to `f`, in archive order.
///
/// The reader must already be decompressed.  Regular file bodies larger than
/// [`INLINE_CONTENT_MAX`] are copied into `spool`.
pub fn for_each_entry<R: Read>(
    reader: R,
    layer: usize,
    spool: &mut Spool,
    mut f: impl FnMut(TarEntry) -> Result<()>,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| Error::source_read(format!("reading layer {layer}"), e))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::source_read(format!("reading layer {layer}"), e))?;
        if let Some(tar_entry) = parse_entry(&mut entry, layer, spool)? {
            trace!("layer {layer}: {:?}", tar_entry.path);
            f(tar_entry)?;
        }
    }

    Ok(())
}

fn header_for(stat: &Stat, entry_type: EntryType) -> io::Result<Header> {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(stat.st_mode);
    header.set_uid(stat.st_uid);
    header.set_gid(stat.st_gid);
    header.set_mtime(stat.st_mtim_sec);
    header.set_size(0);
    if let Some(uname) = &stat.uname {
        header.set_username(uname)?;
    }
    if let Some(gname) = &stat.gname {
        header.set_groupname(gname)?;
    }
    Ok(header)
}

struct LayerWriter<'a, W: Write> {
    builder: tar::Builder<W>,
    spool: &'a Spool,
    cancel: &'a CancellationToken,
    /// First path written for each leaf that has more than one name.
    links: HashMap<*const Leaf, PathBuf>,
}

impl<W: Write> LayerWriter<'_, W> {
    fn append_xattrs(&mut self, stat: &Stat) -> io::Result<()> {
        if stat.xattrs.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = stat
            .xattrs
            .keys()
            .map(|key| format!("{PAX_SCHILYXATTR}{key}"))
            .collect();
        self.builder.append_pax_extensions(
            keys.iter()
                .map(String::as_str)
                .zip(stat.xattrs.values().map(|value| &value[..])),
        )
    }

    fn append_directory(&mut self, path: &Path, dir: &Directory) -> io::Result<()> {
        self.append_xattrs(&dir.stat)?;
        let mut header = header_for(&dir.stat, EntryType::Directory)?;
        let mut name = path.as_os_str().to_owned();
        name.push("/");
        self.builder.append_data(&mut header, name, io::empty())
    }

    fn append_leaf(&mut self, path: &Path, leaf: &Rc<Leaf>) -> io::Result<()> {
        if Rc::strong_count(leaf) > 1 {
            let key = Rc::as_ptr(leaf);
            if let Some(first) = self.links.get(&key) {
                let mut header = header_for(&leaf.stat, EntryType::Link)?;
                return self.builder.append_link(&mut header, path, first);
            }
            self.links.insert(key, path.to_path_buf());
        }

        self.append_xattrs(&leaf.stat)?;
        match &leaf.content {
            LeafContent::Regular(file) => {
                let mut header = header_for(&leaf.stat, EntryType::Regular)?;
                header.set_size(file.size());
                match file {
                    RegularFile::Inline(data) => {
                        self.builder.append_data(&mut header, path, &data[..])
                    }
                    RegularFile::External(spooled) => {
                        let reader = self.spool.open(spooled)?;
                        let reader = CancellableReader::new(reader, self.cancel);
                        self.builder.append_data(&mut header, path, reader)
                    }
                }
            }
            LeafContent::Symlink(target) => {
                let mut header = header_for(&leaf.stat, EntryType::Symlink)?;
                self.builder
                    .append_link(&mut header, path, Path::new(&**target))
            }
            LeafContent::CharacterDevice(major, minor) | LeafContent::BlockDevice(major, minor) => {
                let entry_type = match leaf.content {
                    LeafContent::CharacterDevice(..) => EntryType::Char,
                    _ => EntryType::Block,
                };
                let mut header = header_for(&leaf.stat, entry_type)?;
                header.set_device_major(*major)?;
                header.set_device_minor(*minor)?;
                self.builder.append_data(&mut header, path, io::empty())
            }
            LeafContent::Fifo => {
                let mut header = header_for(&leaf.stat, EntryType::Fifo)?;
                self.builder.append_data(&mut header, path, io::empty())
            }
        }
    }

    fn write_directory(&mut self, dir: &Directory, prefix: &Path) -> Result<()> {
        let cancel = self.cancel;
        for (name, inode) in dir.sorted_entries() {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }

            let path = prefix.join(name);
            let write_error = |e| {
                Error::write(format!("squashed layer entry {path:?}"), e).or_interrupted(cancel)
            };
            match inode {
                Inode::Directory(subdir) => {
                    self.append_directory(&path, subdir).map_err(write_error)?;
                    self.write_directory(subdir, &path)?;
                }
                Inode::Leaf { leaf, .. } => {
                    self.append_leaf(&path, leaf).map_err(write_error)?;
                }
            }
        }
        Ok(())
    }
}

/// Serializes the visible entries of `fs` into a single tar stream on `sink`.
///
/// Entries are written depth first with siblings in byte order of their names, so the output is
/// a pure function of the view.  The root directory is written as `./` only when some layer
/// declared it.  Returns the number of bytes written, including the end-of-archive marker.
pub fn write_layer<W: Write>(
    fs: &FileSystem,
    spool: &Spool,
    sink: W,
    progress: &dyn Progress,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut writer = LayerWriter {
        builder: tar::Builder::new(ProgressWriter::new(sink, progress)),
        spool,
        cancel,
        links: HashMap::new(),
    };

    if fs.explicit_root {
        writer
            .append_directory(Path::new("."), &fs.root)
            .map_err(|e| Error::write("squashed layer root", e))?;
    }
    writer.write_directory(&fs.root, Path::new(""))?;

    let mut sink = writer
        .builder
        .into_inner()
        .map_err(|e| Error::write("end of squashed layer", e))?;
    sink.flush()
        .map_err(|e| Error::write("squashed layer", e))?;
    Ok(sink.written())
}
