use std::{
    collections::{BTreeMap, HashSet},
    ffi::OsStr,
    path::{Component, Path},
    rc::Rc,
};

use thiserror::Error;

use crate::spool::SpoolRef;

/// Metadata carried by every entry of the union view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub st_mode: u32,
    pub st_uid: u64,
    pub st_gid: u64,
    pub st_mtim_sec: u64,
    pub uname: Option<Box<str>>,
    pub gname: Option<Box<str>>,
    pub xattrs: BTreeMap<Box<str>, Box<[u8]>>,
}

impl Stat {
    /// The metadata given to directories that exist only because something was put inside them.
    pub fn implicit_directory() -> Self {
        Stat {
            st_mode: 0o755,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegularFile {
    Inline(Box<[u8]>),
    External(SpoolRef),
}

impl RegularFile {
    pub fn size(&self) -> u64 {
        match self {
            RegularFile::Inline(data) => data.len() as u64,
            RegularFile::External(spooled) => spooled.len,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafContent {
    Regular(RegularFile),
    BlockDevice(u32, u32),
    CharacterDevice(u32, u32),
    Fifo,
    Symlink(Box<OsStr>),
}

#[derive(Debug)]
pub struct Leaf {
    pub stat: Stat,
    pub content: LeafContent,
}

#[derive(Debug)]
pub struct Directory {
    pub stat: Stat,
    /// Index of the layer that most recently declared this directory.
    pub layer: usize,
    entries: BTreeMap<Box<OsStr>, Inode>,
}

/// A node in the union view.  Leaves are reference counted so that hardlinks can share them.
#[derive(Debug)]
pub enum Inode {
    Directory(Box<Directory>),
    Leaf { leaf: Rc<Leaf>, layer: usize },
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Invalid filename {0:?}")]
    InvalidFilename(Box<OsStr>),
    #[error("Directory entry {0:?} does not exist")]
    NotFound(Box<OsStr>),
    #[error("Directory entry {0:?} is not a subdirectory")]
    NotADirectory(Box<OsStr>),
    #[error("Directory entry {0:?} is a directory")]
    IsADirectory(Box<OsStr>),
}

impl Inode {
    pub fn stat(&self) -> &Stat {
        match self {
            Inode::Directory(dir) => &dir.stat,
            Inode::Leaf { leaf, .. } => &leaf.stat,
        }
    }

    /// The index of the layer that contributed this inode.
    pub fn layer(&self) -> usize {
        match self {
            Inode::Directory(dir) => dir.layer,
            Inode::Leaf { layer, .. } => *layer,
        }
    }
}

impl Directory {
    pub fn new(stat: Stat, layer: usize) -> Self {
        Self {
            stat,
            layer,
            entries: BTreeMap::new(),
        }
    }

    /// A directory created on demand as the parent of some other entry.
    pub fn implicit(layer: usize) -> Self {
        Self::new(Stat::implicit_directory(), layer)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries in the current directory, in asciibetical order of name.  The
    /// iterator returns pairs of `(&OsStr, &Inode)`.
    ///
    /// The squashed layer is written in exactly this order, so it must stay stable.
    pub fn sorted_entries(&self) -> impl Iterator<Item = (&OsStr, &Inode)> + use<'_> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// Gets a reference to a subdirectory of this directory, or `None` if some component of the
    /// path does not exist.
    ///
    /// The given path may be absolute or relative and it makes no difference.  It may not contain
    /// any Windows-like prefixes or ".." components.
    pub fn get_directory_opt(&self, pathname: &Path) -> Result<Option<&Directory>, ImageError> {
        let mut dir = self;

        for component in pathname.components() {
            dir = match component {
                Component::RootDir | Component::CurDir => dir,
                Component::Prefix(..) | Component::ParentDir => {
                    return Err(ImageError::InvalidFilename(pathname.as_os_str().into()))
                }
                Component::Normal(filename) => match dir.entries.get(filename) {
                    Some(Inode::Directory(subdir)) => subdir,
                    Some(_) => return Err(ImageError::NotADirectory(filename.into())),
                    None => return Ok(None),
                },
            }
        }

        Ok(Some(dir))
    }

    /// The mutable version of `Directory::get_directory_opt()`.  A path that runs through a
    /// non-directory is reported as `None`, since there is nothing below it to modify.
    pub fn get_directory_mut_opt(
        &mut self,
        pathname: &Path,
    ) -> Result<Option<&mut Directory>, ImageError> {
        let mut dir = self;

        for component in pathname.components() {
            dir = match component {
                Component::RootDir | Component::CurDir => dir,
                Component::Prefix(..) | Component::ParentDir => {
                    return Err(ImageError::InvalidFilename(pathname.as_os_str().into()))
                }
                Component::Normal(filename) => match dir.entries.get_mut(filename) {
                    Some(Inode::Directory(subdir)) => subdir,
                    Some(_) | None => return Ok(None),
                },
            };
        }

        Ok(Some(dir))
    }

    /// Gets a mutable reference to a subdirectory, creating any missing directories on the way,
    /// like `mkdir -p`.
    ///
    /// Missing directories are created with `Stat::implicit_directory()` and attributed to
    /// `layer`.  A non-directory in the way is replaced: an entry inside it can only exist if the
    /// layer turned it into a directory.
    pub fn make_directories(
        &mut self,
        pathname: &Path,
        layer: usize,
    ) -> Result<&mut Directory, ImageError> {
        let mut dir = self;

        for component in pathname.components() {
            dir = match component {
                Component::RootDir | Component::CurDir => dir,
                Component::Prefix(..) | Component::ParentDir => {
                    return Err(ImageError::InvalidFilename(pathname.as_os_str().into()))
                }
                Component::Normal(filename) => {
                    let slot = dir
                        .entries
                        .entry(Box::from(filename))
                        .or_insert_with(|| Inode::Directory(Box::new(Directory::implicit(layer))));
                    if !matches!(slot, Inode::Directory(..)) {
                        *slot = Inode::Directory(Box::new(Directory::implicit(layer)));
                    }
                    match slot {
                        Inode::Directory(subdir) => subdir,
                        Inode::Leaf { .. } => unreachable!("replaced by a directory above"),
                    }
                }
            };
        }

        Ok(dir)
    }

    /// Takes a reference to the "leaf" file (not directory) with the given filename directly
    /// contained in this directory.  This is done in preparation for creating a hardlink.
    ///
    /// # Return value
    ///
    /// On success (the entry exists and is not a directory) the Rc is cloned and a new reference
    /// is returned.
    ///
    /// On failure, can return any number of errors from ImageError.
    pub fn ref_leaf(&self, filename: &OsStr) -> Result<Rc<Leaf>, ImageError> {
        match self.entries.get(filename) {
            Some(Inode::Leaf { leaf, .. }) => Ok(Rc::clone(leaf)),
            Some(Inode::Directory(..)) => Err(ImageError::IsADirectory(Box::from(filename))),
            None => Err(ImageError::NotFound(Box::from(filename))),
        }
    }

    pub fn get(&self, filename: &OsStr) -> Option<&Inode> {
        self.entries.get(filename)
    }

    /// Inserts the given inode into the directory with special handling for directories.  In case
    /// the inode is a directory and there is already a subdirectory with the given filename, the
    /// `stat` and `layer` fields will be updated with the values from the provided `inode` but the
    /// old directory entries will be left in place.
    ///
    /// In all other cases, this function is equivalent to `Directory::insert()`.
    pub fn merge(&mut self, filename: &OsStr, inode: Inode) {
        if let Inode::Directory(new_dir) = inode {
            if let Some(Inode::Directory(old_dir)) = self.entries.get_mut(filename) {
                old_dir.stat = new_dir.stat;
                old_dir.layer = new_dir.layer;
            } else {
                self.insert(filename, Inode::Directory(new_dir));
            }
        } else {
            self.insert(filename, inode);
        }
    }

    /// Inserts the given inode into the directory.
    ///
    /// If the `filename` existed previously, the content is completely overwritten, including the
    /// case that it was a directory.
    pub fn insert(&mut self, filename: &OsStr, inode: Inode) {
        self.entries.insert(Box::from(filename), inode);
    }

    /// Applies a whiteout from `layer` to the named entry.
    ///
    /// Only content contributed by lower layers is removed.  Entries that `layer` itself
    /// provided stay, along with any directory needed to hold them.
    pub fn whiteout(&mut self, filename: &OsStr, layer: usize) {
        let remove = match self.entries.get_mut(filename) {
            Some(Inode::Directory(dir)) => {
                dir.clear_below(layer);
                dir.layer < layer && dir.is_empty()
            }
            Some(inode) => inode.layer() < layer,
            None => false,
        };
        if remove {
            self.entries.remove(filename);
        }
    }

    /// Removes everything below this directory that was contributed by a layer lower than
    /// `layer`.  This is the effect of an opaque-directory marker.  The `stat` data remains
    /// unmodified.
    pub fn clear_below(&mut self, layer: usize) {
        self.entries.retain(|_, inode| match inode {
            Inode::Directory(dir) => {
                dir.clear_below(layer);
                dir.layer >= layer || !dir.is_empty()
            }
            Inode::Leaf { layer: leaf_layer, .. } => *leaf_layer >= layer,
        });
    }

    fn collect_stats(&self, stats: &mut UnionStats, seen: &mut HashSet<*const Leaf>) {
        for inode in self.entries.values() {
            stats.entries += 1;
            match inode {
                Inode::Directory(dir) => dir.collect_stats(stats, seen),
                Inode::Leaf { leaf, .. } => {
                    if let LeafContent::Regular(file) = &leaf.content {
                        if seen.insert(Rc::as_ptr(leaf)) {
                            stats.bytes += file.size();
                        }
                    }
                }
            }
        }
    }
}

/// Totals over the visible entries of a union view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnionStats {
    /// Number of visible paths, not counting the root.
    pub entries: u64,
    /// Content bytes of visible regular files, counting hardlinked content once.
    pub bytes: u64,
}

/// The union view: the flattened filesystem that results from replaying every layer.
#[derive(Debug)]
pub struct FileSystem {
    pub root: Directory,
    /// Set once a layer carried an entry for the root itself, like `./`.
    pub explicit_root: bool,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    pub fn new() -> Self {
        Self {
            root: Directory::implicit(0),
            explicit_root: false,
        }
    }

    /// Looks up the inode at `pathname`.  The root itself is not addressable.
    pub fn lookup(&self, pathname: &Path) -> Option<&Inode> {
        let filename = pathname.file_name()?;
        let dir = match pathname.parent() {
            Some(parent) => self.root.get_directory_opt(parent).ok()??,
            None => &self.root,
        };
        dir.get(filename)
    }

    /// Takes a new reference to the leaf at `pathname`, for binding a hardlink to it.
    pub fn ref_leaf(&self, pathname: &Path) -> Result<Rc<Leaf>, ImageError> {
        let Some(filename) = pathname.file_name() else {
            return Err(ImageError::InvalidFilename(pathname.as_os_str().into()));
        };
        let dir = match pathname.parent() {
            Some(parent) => self
                .root
                .get_directory_opt(parent)?
                .ok_or_else(|| ImageError::NotFound(parent.as_os_str().into()))?,
            None => &self.root,
        };
        dir.ref_leaf(filename)
    }

    pub fn stats(&self) -> UnionStats {
        let mut stats = UnionStats::default();
        self.root.collect_stats(&mut stats, &mut HashSet::new());
        stats
    }
}
