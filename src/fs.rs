use std::{
    ffi::OsStr,
    fs::File,
    io,
    num::NonZeroUsize,
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

use rustix::{
    fd::{AsFd, BorrowedFd, OwnedFd},
    fs::{chmodat, chownat, mkdirat, openat, openat2, statat, unlinkat},
    fs::{AtFlags, Gid, Mode, OFlags, ResolveFlags, Uid},
    io::Errno,
    path::Arg,
};

/// Directory used as the root to resolve paths.
///
/// Paths are resolved with `RESOLVE_IN_ROOT`, so `..` components and
/// absolute symlinks can't reach anything outside the directory.
pub(crate) struct Directory {
    fd: OwnedFd,
}

impl AsFd for Directory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

const PATH_FLAGS: OFlags = OFlags::PATH.union(OFlags::DIRECTORY).union(OFlags::CLOEXEC);

const IN_ROOT: ResolveFlags = ResolveFlags::IN_ROOT.union(ResolveFlags::NO_MAGICLINKS);

impl Directory {
    pub fn new<P: Arg>(path: P) -> Result<Self, Errno> {
        let fd = openat(rustix::fs::CWD, path, PATH_FLAGS, Mode::empty())?;
        Ok(Directory { fd })
    }

    /// Open the directory `path`. If it does not exist and `create` is
    /// `true`, it is created, with its missing parents.
    pub fn open_directory<P: AsRef<Path>>(&self, path: P, create: bool) -> Result<OwnedFd, Errno> {
        let path = path.as_ref();

        match openat2(self, path, PATH_FLAGS, Mode::empty(), IN_ROOT) {
            Err(Errno::NOENT) if create => (),
            result => return result,
        }

        let Some(name) = path.file_name() else {
            return Err(Errno::NOENT);
        };

        // `mkdirat` needs a descriptor for the parent, so the new
        // directory is created under the same root.
        match path.parent() {
            Some(parent) if parent != Path::new("/") && parent != Path::new("") => {
                let parent = self.open_directory(parent, true)?;
                mkdirat(&parent, name, Mode::from_raw_mode(0o755))?;
            }

            _ => mkdirat(self, name, Mode::from_raw_mode(0o755))?,
        }

        openat2(self, path, PATH_FLAGS, Mode::empty(), IN_ROOT)
    }

    /// Open a file to read it.
    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> Result<File, Errno> {
        let flags = OFlags::RDONLY | OFlags::CLOEXEC;
        let fd = openat2(self, path.as_ref(), flags, Mode::empty(), IN_ROOT)?;
        Ok(File::from(fd))
    }

    /// Return `true` if `path` exists. A symlink in the last component
    /// is not followed.
    pub fn contains<P: AsRef<Path>>(&self, path: P) -> Result<bool, Errno> {
        let flags = OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC;

        match openat2(self, path.as_ref(), flags, Mode::empty(), IN_ROOT) {
            Ok(_) => Ok(true),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create an empty file, and its missing parent directories.
    pub fn create_file<P: AsRef<Path>>(&self, path: P) -> Result<File, Errno> {
        let path = path.as_ref();
        let name = path.file_name().ok_or(Errno::INVAL)?;

        let parent = match path.parent() {
            Some(p) if p != Path::new("") => self.open_directory(p, true)?,
            _ => self.open_directory(".", false)?,
        };

        let fd = openat2(
            &parent,
            name,
            OFlags::CREATE | OFlags::WRONLY | OFlags::TRUNC | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o644),
            ResolveFlags::BENEATH | ResolveFlags::NO_SYMLINKS,
        )?;

        Ok(File::from(fd))
    }
}

/// Descriptors for the most recently used directories in a [`Directory`].
pub(crate) struct DirFdCache<'a> {
    root: &'a Directory,
    fds: lru::LruCache<PathBuf, OwnedFd>,
}

impl<'a> DirFdCache<'a> {
    /// Number of descriptors kept open.
    const CAPACITY: NonZeroUsize = match NonZeroUsize::new(16) {
        Some(n) => n,
        None => NonZeroUsize::MIN,
    };

    pub fn new(root: &'a Directory) -> Self {
        DirFdCache {
            root,
            fds: lru::LruCache::new(Self::CAPACITY),
        }
    }

    pub fn get<P: AsRef<Path>>(&mut self, path: P, create: bool) -> Result<BorrowedFd<'_>, Errno> {
        let path = path.as_ref();
        let root = self.root;

        self.fds
            .try_get_or_insert_ref(path, || root.open_directory(path, create))
            .map(|fd| fd.as_fd())
    }

    /// Close all descriptors. Needed after removing directories.
    pub fn clear(&mut self) {
        self.fds.clear();
    }
}

/// Convert a path from an archive entry to the expected path inside
/// a container.
///
/// The path is returned in a `(parent, file_name)` pair.
///
/// The parent is always prefixed with `/`.
pub fn normalize_path<T: AsRef<Path>>(path: T) -> io::Result<(PathBuf, PathBuf)> {
    let mut parent_path = PathBuf::from("/");
    let mut file_name = None;

    // Similar to `tar::Entry::unpack_in`.
    for component in path.as_ref().components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => continue,

            // Don't trust entries with `..` in the path.
            Component::ParentDir => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Found '..' in the path.",
                ));
            }

            Component::Normal(part) => {
                if let Some(previous) = file_name.take() {
                    parent_path.push(previous);
                }

                file_name = Some(part)
            }
        }
    }

    let file_name = match file_name {
        Some(file_name) => PathBuf::from(file_name),

        None => PathBuf::from("."),
    };

    Ok((parent_path, file_name))
}

/// Kind of entry deleted by [`remove_entry`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RemovedEntry {
    Directory,
    Other,
}

/// Return `true` if `st_mode` describes a directory.
pub fn is_dir_mode(st_mode: u32) -> bool {
    st_mode & libc::S_IFMT == libc::S_IFDIR
}

/// Remove `file_name` from `parent`. Directories are removed recursively.
pub fn remove_entry(parent: BorrowedFd, file_name: &Path) -> io::Result<RemovedEntry> {
    if matches!(file_name.as_os_str().as_bytes(), b"" | b"." | b"..") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Can't remove {file_name:?}."),
        ));
    }

    let stat = statat(parent, file_name, AtFlags::SYMLINK_NOFOLLOW)?;

    if is_dir_mode(stat.st_mode) {
        remove_subtree(parent, file_name)?;
        unlinkat(parent, file_name, AtFlags::REMOVEDIR)?;
        Ok(RemovedEntry::Directory)
    } else {
        unlinkat(parent, file_name, AtFlags::empty())?;
        Ok(RemovedEntry::Other)
    }
}

/// Remove all entries in the directory `path`, but keep the directory.
pub fn remove_subtree(parent: BorrowedFd, path: &Path) -> io::Result<()> {
    let fd = openat(
        parent,
        path,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )?;

    // Collect the names before removing anything, so the directory
    // stream is not modified while it is read.
    let mut names = Vec::new();
    let mut dir = rustix::fs::Dir::read_from(&fd)?;
    while let Some(entry) = dir.read() {
        let entry = entry?;
        let name = entry.file_name().to_bytes();
        if name != b"." && name != b".." {
            names.push(name.to_owned());
        }
    }

    for name in names {
        remove_entry(fd.as_fd(), Path::new(OsStr::from_bytes(&name)))?;
    }

    Ok(())
}

/// Change the owner of an entry, if `uid` or `gid` are set.
///
/// Failures from `fchownat` are ignored: an unprivileged process can't
/// give files to other users.
///
/// Changing the owner clears the SUID/SGID bits. If `preserve_mode` is
/// `true`, they are restored.
pub fn change_owner(
    dir: BorrowedFd,
    name: &Path,
    uid: Option<u32>,
    gid: Option<u32>,
    preserve_mode: bool,
) -> io::Result<()> {
    if (uid, gid) == (None, None) {
        return Ok(());
    }

    let special_bits = if preserve_mode {
        statat(dir, name, AtFlags::SYMLINK_NOFOLLOW)?.st_mode & 0o7777
    } else {
        0
    };

    // SAFETY: IDs come from the archive; any value is accepted by the kernel.
    let owner = uid.map(|id| unsafe { Uid::from_raw(id) });
    let group = gid.map(|id| unsafe { Gid::from_raw(id) });

    let changed = chownat(dir, name, owner, group, AtFlags::SYMLINK_NOFOLLOW).is_ok();

    if changed && special_bits & 0o7000 != 0 {
        chmodat(dir, name, Mode::from_bits_retain(special_bits), AtFlags::empty())?;
    }

    Ok(())
}

#[test]
fn reject_parent_components() {
    assert!(normalize_path("a/../../b").is_err());

    let (parent, name) = normalize_path("./usr/bin/env").unwrap();
    assert_eq!(parent, Path::new("/usr/bin"));
    assert_eq!(name, Path::new("env"));
}

#[test]
fn remove_directory_tree() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("a/b/c")).unwrap();
    std::fs::write(root.path().join("a/b/file"), "x").unwrap();
    std::fs::write(root.path().join("other"), "y").unwrap();

    let dir = Directory::new(root.path()).unwrap();

    let removed = remove_entry(dir.as_fd(), Path::new("a")).unwrap();
    assert_eq!(removed, RemovedEntry::Directory);
    assert!(!root.path().join("a").exists());
    assert!(root.path().join("other").exists());

    assert!(remove_entry(dir.as_fd(), Path::new("..")).is_err());
}
