//! Extract a single layer.
//!
//! Entries are created with descriptor-relative calls (`openat2`,
//! `mkdirat`, `linkat`, ...), so symlinks in the layer are always resolved
//! inside the destination directory.

use std::{
    cell::Cell,
    ffi::OsStr,
    fmt,
    fs::File,
    io::{self, BufReader, ErrorKind, Read, Seek},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    rc::Rc,
};

use rustix::{
    fd::{AsFd, BorrowedFd, OwnedFd},
    fs::{AtFlags, Mode, OFlags, ResolveFlags},
    io::Errno,
};

use crate::{
    error::try_io,
    fs::{normalize_path, DirFdCache, Directory, RemovedEntry},
    Error, EventHandler, MediaType,
};

use super::{BlobFile, DirectoryMetadata, DirectoryMetadataEntry};

/// Prefix for entries that remove a file from lower layers.
const WHITEOUT: &[u8] = b".wh.";

/// Whiteout to remove all entries of a directory.
const OPAQUE_WHITEOUT: &[u8] = b".wh..wh..opq";

/// Extract the entries of `layer` into `target`.
///
/// Metadata for directories is collected in `dirs_metadata`, to be
/// applied when all layers are extracted.
pub(super) fn unpack_layer<E: EventHandler>(
    event_handler: &E,
    target: &Directory,
    layer: &BlobFile,
    mut tarball: File,
    dirs_metadata: &mut DirectoryMetadata,
) -> Result<(), Error> {
    let archive_len = try_io!(&layer.path, tarball.seek(io::SeekFrom::End(0)));
    try_io!(&layer.path, tarball.rewind());

    let position = Rc::new(Cell::new(0));
    let tarball = CountingReader {
        count: position.clone(),
        inner: tarball,
    };

    let decoder: Box<dyn Read> = match layer.blob.media_type {
        MediaType::OciFsTar => Box::new(BufReader::new(tarball)),

        MediaType::OciFsTarGzip | MediaType::DockerFsTarGzip => {
            Box::new(flate2::read::GzDecoder::new(tarball))
        }

        #[cfg(feature = "zstd")]
        MediaType::OciFsTarZstd => Box::new(try_io!(
            &layer.path,
            zstd::stream::read::Decoder::new(tarball)
        )),

        // Not a filesystem layer.
        MediaType::OciConfig | MediaType::DockerImageV1 => return Ok(()),

        other => return Err(Error::InvalidContentType(other)),
    };

    event_handler.layer_start(archive_len);

    let mut writer = LayerWriter {
        event_handler,
        layer_path: &layer.path,
        target,
        dirs_cache: DirFdCache::new(target),
        dirs_metadata,
        link_source: None,
    };

    let mut archive = tar::Archive::new(decoder);
    for entry in try_io!(&layer.path, archive.entries()) {
        let entry = try_io!(&layer.path, entry);
        writer.write_entry(entry)?;
        event_handler.layer_progress(position.get());
    }

    Ok(())
}

pub(super) fn make_timestamps(mtime: u64) -> rustix::fs::Timestamps {
    let time = rustix::fs::Timespec {
        tv_sec: i64::try_from(mtime).unwrap_or(i64::MAX),
        tv_nsec: 0,
    };

    rustix::fs::Timestamps {
        last_access: time,
        last_modification: time,
    }
}

/// `Read` adapter to track the position in the compressed stream.
struct CountingReader<R> {
    count: Rc<Cell<usize>>,
    inner: R,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.set(self.count.get() + n);
        Ok(n)
    }
}

struct UnsupportedEntry(tar::EntryType);

impl fmt::Display for UnsupportedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported entry type {:?}", self.0)
    }
}

struct LayerWriter<'a, E> {
    event_handler: &'a E,
    layer_path: &'a Path,
    target: &'a Directory,
    dirs_cache: DirFdCache<'a>,
    dirs_metadata: &'a mut DirectoryMetadata,

    /// Last directory used as the source of a hard link. Layers
    /// usually have many links in the same directory.
    link_source: Option<(PathBuf, OwnedFd)>,
}

impl<E: EventHandler> LayerWriter<'_, E> {
    fn write_entry<R: Read>(&mut self, entry: tar::Entry<R>) -> Result<(), Error> {
        let path = try_io!(self.layer_path, entry.path()).into_owned();
        let (parent, name) = try_io!(&path, normalize_path(&path));

        if let Some(whiteout) = name.as_os_str().as_bytes().strip_prefix(WHITEOUT) {
            let result = self.whiteout(&parent, &name, whiteout);
            try_io!(&path, result);
            return Ok(());
        }

        let result = match entry.header().entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                self.regular_file(&parent, &name, entry)
            }

            tar::EntryType::Directory => self.directory(&parent, &name, entry.header()),

            tar::EntryType::Symlink => self.symlink(&parent, &name, entry.header()),

            tar::EntryType::Link => self.hard_link(&parent, &name, entry.header()),

            other => {
                self.event_handler
                    .layer_entry_skipped(&path, &UnsupportedEntry(other));
                Ok(())
            }
        };

        try_io!(&path, result);

        Ok(())
    }

    /// Remove entries from lower layers.
    ///
    /// Whiteouts are expected before the regular entries of the layer,
    /// as recommended in the [OCI specification][1]. Missing files are
    /// ignored.
    ///
    /// [1]: https://github.com/opencontainers/image-spec/blob/v1.0/layer.md#whiteouts
    fn whiteout(&mut self, parent: &Path, name: &Path, removed: &[u8]) -> io::Result<()> {
        let dir = self.dirs_cache.get(parent, true)?;

        let result = if name.as_os_str().as_bytes() == OPAQUE_WHITEOUT {
            crate::fs::remove_subtree(dir, Path::new("."))
        } else {
            crate::fs::remove_entry(dir, Path::new(OsStr::from_bytes(removed))).map(drop)
        };

        // Descriptors may point to removed directories.
        self.dirs_cache.clear();

        match result {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            r => r,
        }
    }

    fn directory(&mut self, parent: &Path, name: &Path, header: &tar::Header) -> io::Result<()> {
        let dir = self.dirs_cache.get(parent, true)?;

        match rustix::fs::mkdirat(dir, name, Mode::from_raw_mode(0o700)) {
            Ok(()) => (),

            // Directories from lower layers are reused. Other entries
            // are replaced.
            Err(Errno::EXIST) => {
                if !is_directory(dir, name)? {
                    crate::fs::remove_entry(dir, name)?;
                    rustix::fs::mkdirat(dir, name, Mode::from_raw_mode(0o700))?;
                }
            }

            Err(e) => return Err(e.into()),
        }

        let (uid, gid) = entry_owner(header);

        self.dirs_metadata.insert(
            DirectoryMetadataEntry::key(parent.join(name)),
            DirectoryMetadataEntry {
                mode: entry_mode(header)?,
                mtime: header.mtime().unwrap_or_default(),
                uid,
                gid,
            },
        );

        Ok(())
    }

    fn regular_file(
        &mut self,
        parent: &Path,
        name: &Path,
        mut entry: tar::Entry<impl Read>,
    ) -> io::Result<()> {
        let mode = entry_mode(entry.header())?;
        let dir = self.dirs_cache.get(parent, true)?;

        let (fd, removed) = create_replacing(dir, name, || {
            rustix::fs::openat2(
                dir,
                name,
                OFlags::CREATE | OFlags::EXCL | OFlags::WRONLY | OFlags::CLOEXEC,
                mode | Mode::WUSR,
                ResolveFlags::BENEATH,
            )
        })?;

        // A directory replaced by a file.
        if removed == Some(RemovedEntry::Directory) {
            self.dirs_metadata
                .remove(&DirectoryMetadataEntry::key(parent.join(name)));
        }

        let mut output = File::from(fd);
        io::copy(&mut entry, &mut output)?;
        drop(output);

        // Mode without `u+w`, if the archive says so.
        rustix::fs::chmodat(dir, name, mode, AtFlags::empty())?;

        set_metadata(dir, name, entry.header())
    }

    fn symlink(&mut self, parent: &Path, name: &Path, header: &tar::Header) -> io::Result<()> {
        let target = link_target(header)?;
        let dir = self.dirs_cache.get(parent, true)?;

        create_replacing(dir, name, || rustix::fs::symlinkat(&target, dir, name))?;

        set_metadata(dir, name, header)
    }

    fn hard_link(&mut self, parent: &Path, name: &Path, header: &tar::Header) -> io::Result<()> {
        let (source_dir, source_name) = normalize_path(link_target(header)?)?;

        let source_fd = match self.link_source.take() {
            Some((path, fd)) if path == source_dir => fd,

            _ => rustix::fs::openat2(
                self.target.as_fd(),
                &source_dir,
                OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
                Mode::empty(),
                ResolveFlags::IN_ROOT | ResolveFlags::NO_MAGICLINKS,
            )?,
        };

        let dir = self.dirs_cache.get(parent, true)?;

        let result = create_replacing(dir, name, || {
            rustix::fs::linkat(&source_fd, &source_name, dir, name, AtFlags::empty())
        });

        self.link_source = Some((source_dir, source_fd));

        result.map(drop)
    }
}

/// Run `create`. If it fails because `name` already exists, remove the
/// existing entry and try again.
fn create_replacing<T>(
    dir: BorrowedFd,
    name: &Path,
    mut create: impl FnMut() -> Result<T, Errno>,
) -> io::Result<(T, Option<RemovedEntry>)> {
    let mut removed = None;

    loop {
        match create() {
            Ok(value) => return Ok((value, removed)),

            Err(Errno::EXIST) if removed.is_none() => {
                removed = Some(crate::fs::remove_entry(dir, name)?);
            }

            Err(e) => return Err(e.into()),
        }
    }
}

fn is_directory(dir: BorrowedFd, name: &Path) -> io::Result<bool> {
    let stat = rustix::fs::statat(dir, name, AtFlags::SYMLINK_NOFOLLOW)?;
    Ok(crate::fs::is_dir_mode(stat.st_mode))
}

fn link_target(header: &tar::Header) -> io::Result<PathBuf> {
    match header.link_name()? {
        Some(target) => Ok(target.into_owned()),
        None => Err(io::Error::new(ErrorKind::InvalidData, "missing link target")),
    }
}

fn entry_mode(header: &tar::Header) -> io::Result<Mode> {
    Ok(Mode::from_bits_retain(header.mode()? & 0o7777))
}

/// Owner of the entry. `root` (`0`) is ignored, since it is the owner
/// of new files in an unprivileged container.
fn entry_owner(header: &tar::Header) -> (Option<u32>, Option<u32>) {
    fn non_root(id: io::Result<u64>) -> Option<u32> {
        id.ok()
            .and_then(|id| u32::try_from(id).ok())
            .filter(|id| *id > 0)
    }

    (non_root(header.uid()), non_root(header.gid()))
}

/// Apply owner and mtime to a file or symlink.
fn set_metadata(dir: BorrowedFd, name: &Path, header: &tar::Header) -> io::Result<()> {
    let (uid, gid) = entry_owner(header);
    crate::fs::change_owner(dir, name, uid, gid, true)?;

    let mtime = make_timestamps(header.mtime()?);
    rustix::fs::utimensat(dir, name, &mtime, AtFlags::SYMLINK_NOFOLLOW)?;

    Ok(())
}
