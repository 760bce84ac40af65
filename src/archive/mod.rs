//! Archive collaborator: unpack layers into a directory, and pack a
//! directory into a transportable image.

mod layers;
mod staging;

use std::{
    cmp::Reverse,
    collections::BTreeMap,
    fs::File,
    io,
    path::{Path, PathBuf},
};

use rustix::fs::Mode;

use crate::{
    error::try_io,
    fs::{normalize_path, DirFdCache, Directory},
    manifests::Blob,
    Error, EventHandler, NoEventHandler,
};

/// A blob stored in a local file.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobFile {
    pub blob: Blob,
    pub path: PathBuf,
}

/// Image packed by [`Archiver::archive`], ready to be uploaded.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub config: BlobFile,
    pub layers: Vec<BlobFile>,
}

impl Artifact {
    /// Config and layers, in upload order.
    pub fn blobs(&self) -> impl Iterator<Item = &BlobFile> {
        self.layers.iter().chain([&self.config])
    }
}

/// Convert between image layers and unpacked directories.
pub trait Archiver {
    /// Extract `layers`, in order, into `destination`.
    ///
    /// `destination` must exist, and it is expected to be empty.
    fn unpack(&self, layers: &[BlobFile], destination: &Path) -> Result<(), Error>;

    /// Pack the directory `source` into blobs written to `staging`.
    fn archive(&self, source: &Path, staging: &Path) -> Result<Artifact, Error>;
}

/// [`Archiver`] implementation for tarballs (plain, gzip, or zstd).
pub struct TarArchiver<E = NoEventHandler> {
    event_handler: E,
}

impl TarArchiver {
    pub fn new() -> Self {
        TarArchiver {
            event_handler: NoEventHandler,
        }
    }
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventHandler> TarArchiver<E> {
    pub fn with_event_handler(event_handler: E) -> Self {
        TarArchiver { event_handler }
    }
}

impl<E: EventHandler> Archiver for TarArchiver<E> {
    fn unpack(&self, layers: &[BlobFile], destination: &Path) -> Result<(), Error> {
        let rootfs = try_io!(destination, Directory::new(destination));

        // Disable umask, so modes from the archive are used as they are.
        let _umask_guard = UmaskGuard(rustix::process::umask(Mode::empty()));

        let mut dirs_metadata = DirectoryMetadata::new();

        for layer in layers {
            let tarball = try_io!(&layer.path, File::open(&layer.path));
            layers::unpack_layer(
                &self.event_handler,
                &rootfs,
                layer,
                tarball,
                &mut dirs_metadata,
            )?;
        }

        // Update the metadata of the directories after all files are extracted.
        //
        // This can't be done before because extracting new files updates
        // the mtime of the parent directory. Deeper directories come first,
        // so a read-only parent does not block its children.

        let mut dirs_cache = DirFdCache::new(&rootfs);
        for ((_, path), entry) in dirs_metadata {
            let mut update = || -> io::Result<()> {
                use rustix::fs;

                let (parent_path, file_name) = normalize_path(&path)?;

                let parent = dirs_cache.get(&parent_path, false)?;

                let mtime = layers::make_timestamps(entry.mtime);

                crate::fs::change_owner(parent, &file_name, entry.uid, entry.gid, false)?;
                fs::chmodat(parent, &file_name, entry.mode, fs::AtFlags::empty())?;
                fs::utimensat(parent, &file_name, &mtime, fs::AtFlags::SYMLINK_NOFOLLOW)?;

                Ok(())
            };

            // Ignore NotFound errors. Those may happen because whiteout entries
            // removed directories created by lower layers.
            if let Err(e) = update() {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(Error::Filesystem(e, path));
                }
            }
        }

        self.event_handler.finished();

        Ok(())
    }

    fn archive(&self, source: &Path, staging: &Path) -> Result<Artifact, Error> {
        staging::archive(source, staging)
    }
}

/// Metadata to apply to directories after extracting all layers.
type DirectoryMetadata = BTreeMap<(Reverse<usize>, PathBuf), DirectoryMetadataEntry>;

struct DirectoryMetadataEntry {
    mode: Mode,
    mtime: u64,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl DirectoryMetadataEntry {
    /// Key for [`DirectoryMetadata`]. `path` must be normalized.
    fn key(path: PathBuf) -> (Reverse<usize>, PathBuf) {
        (Reverse(path.components().count()), path)
    }
}

/// Store the previous value for umask, to restore it on drop.
struct UmaskGuard(Mode);

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        rustix::process::umask(self.0);
    }
}
