//! Transfer orchestrator: pull images from registries into directories,
//! and push directories to registries.

mod pull;
mod push;

#[cfg(test)]
mod tests;

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    archive::Archiver,
    error::try_io,
    registry::{Registry, RegistryError},
    Error, EventHandler, ImageRef, NoEventHandler, Phase, Storage,
};

/// Everything needed to pull an image.
#[derive(Clone, Debug)]
pub struct PullPlan {
    pub reference: ImageRef,

    /// Directory for manifests and blobs.
    pub dlcache: PathBuf,

    /// Directory to unpack the image. Its previous contents are removed.
    pub destination: PathBuf,

    /// Reuse manifests and blobs found in `dlcache`.
    pub use_cache: bool,
}

impl PullPlan {
    /// Pull `reference` into its default directory in `storage`.
    pub fn new(storage: &Storage, reference: &str) -> Result<Self, Error> {
        let reference = ImageRef::parse(reference)?;

        Ok(PullPlan {
            dlcache: storage.dlcache(),
            destination: storage.image_path(&reference),
            reference,
            use_cache: true,
        })
    }

    /// Unpack to `path`, instead of a subdirectory of the storage.
    pub fn image_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = path.into();
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }
}

/// Everything needed to push an image.
#[derive(Clone, Debug)]
pub struct PushPlan {
    /// Unpacked image to send.
    pub source: PathBuf,

    /// Directory for the blobs and manifest built from `source`.
    pub staging: PathBuf,

    pub source_ref: ImageRef,

    /// Reference in the registry. If it is `None`, `source_ref` is used.
    pub destination: Option<ImageRef>,
}

impl PushPlan {
    /// Push the image for `reference` in `storage`.
    pub fn new(storage: &Storage, reference: &str) -> Result<Self, Error> {
        let source_ref = ImageRef::parse(reference)?;

        Ok(PushPlan {
            source: storage.image_path(&source_ref),
            staging: storage.dlcache(),
            source_ref,
            destination: None,
        })
    }

    /// Send the image in `path`, instead of the one in the storage.
    pub fn image_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = path.into();
        self
    }

    pub fn destination(mut self, reference: &str) -> Result<Self, Error> {
        self.destination = Some(ImageRef::parse(reference)?);
        Ok(self)
    }
}

/// Result of a successful pull.
#[derive(Clone, Debug, PartialEq)]
pub struct UnpackedImageHandle {
    /// Normalized reference of the image.
    pub reference: ImageRef,

    pub unpack_path: PathBuf,

    /// Cached manifest.
    pub manifest_path: PathBuf,

    /// Number of layers unpacked.
    pub layers: usize,

    /// `true` if the manifest was not requested to the registry.
    pub from_cache: bool,
}

/// Run pulls and pushes with the given collaborators.
///
/// ```no_run
/// # use ch_image::*;
/// # fn main() -> Result<(), Error> {
/// let storage = Storage::from_env();
/// let registry = HttpRegistry::new();
/// let archiver = TarArchiver::new();
///
/// let transfer = Transfer::new(&registry, &archiver);
/// let image = transfer.pull(&PullPlan::new(&storage, "debian:10")?)?;
/// println!("{}", image.unpack_path.display());
/// # Ok(())
/// # }
/// ```
pub struct Transfer<'a> {
    registry: &'a dyn Registry,
    archiver: &'a dyn Archiver,
    event_handler: Box<dyn EventHandler>,
}

impl<'a> Transfer<'a> {
    pub fn new(registry: &'a dyn Registry, archiver: &'a dyn Archiver) -> Self {
        Transfer {
            registry,
            archiver,
            event_handler: Box::new(NoEventHandler),
        }
    }

    pub fn event_handler(mut self, event_handler: impl EventHandler) -> Self {
        self.event_handler = Box::new(event_handler);
        self
    }
}

fn transfer_error(reference: &ImageRef, phase: Phase) -> impl Fn(RegistryError) -> Error + '_ {
    move |source| Error::Transfer {
        reference: reference.to_string(),
        phase,
        source,
    }
}

/// Write `data` to a temporary file, and then rename it to `path`.
fn write_file(path: &Path, data: &[u8]) -> Result<(), Error> {
    let partial = partial_path(path);
    try_io!(&partial, fs::write(&partial, data));
    try_io!(path, fs::rename(&partial, path));
    Ok(())
}

/// Temporary name for a file until it is complete.
fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    PathBuf::from(partial)
}
