use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    archive::BlobFile,
    error::try_io,
    manifests::{Blob, Manifest},
    registry::RegistryError,
    storage::{blob_path, manifest_path},
    Error, ImageRef, Phase,
};

use super::{partial_path, transfer_error, write_file, PullPlan, Transfer, UnpackedImageHandle};

/// Size of the buffer to copy blobs from the registry.
const BUFFER_SIZE: usize = 64 * 1024;

impl Transfer<'_> {
    /// Download the image in `plan`, and unpack it.
    ///
    /// The manifest and blobs are stored in the download cache. With
    /// [`use_cache`](PullPlan::use_cache), existing entries are used
    /// instead of requesting them again.
    pub fn pull(&self, plan: &PullPlan) -> Result<UnpackedImageHandle, Error> {
        let reference = plan.reference.normalized();

        info!(
            reference = %reference,
            destination = %plan.destination.display(),
            use_cache = plan.use_cache,
            "pulling image"
        );

        try_io!(&plan.dlcache, fs::create_dir_all(&plan.dlcache));

        let manifest_path = manifest_path(&plan.dlcache, &reference.for_path());

        let cached = if plan.use_cache {
            read_cached_manifest(&manifest_path)?
        } else {
            None
        };

        let from_cache = cached.is_some();

        let manifest = match cached {
            Some(manifest) => {
                debug!(path = %manifest_path.display(), "using cached manifest");
                manifest
            }

            None => {
                let manifest = self
                    .registry
                    .fetch_manifest(&reference)
                    .map_err(transfer_error(&reference, Phase::Manifest))?;

                write_file(&manifest_path, &serde_json::to_vec_pretty(&manifest)?)?;
                manifest
            }
        };

        self.event_handler
            .download_start(manifest.layers.len() + 1, manifest.blobs_size());

        let mut layers = Vec::with_capacity(manifest.layers.len());

        for blob in std::iter::once(&manifest.config).chain(&manifest.layers) {
            let path = self.fetch_blob(&reference, blob, &plan.dlcache, plan.use_cache)?;

            // The config is only stored in the cache.
            if blob.media_type.is_layer() {
                layers.push(BlobFile {
                    blob: blob.clone(),
                    path,
                });
            }
        }

        replace_directory(&plan.destination)?;

        info!(
            layers = layers.len(),
            destination = %plan.destination.display(),
            "unpacking"
        );

        self.archiver.unpack(&layers, &plan.destination)?;

        self.event_handler.finished();

        Ok(UnpackedImageHandle {
            reference,
            unpack_path: plan.destination.clone(),
            manifest_path,
            layers: layers.len(),
            from_cache,
        })
    }

    /// Return the path of `blob` in the cache, downloading it if needed.
    ///
    /// Data is verified against the digest before it is renamed to the
    /// final path.
    fn fetch_blob(
        &self,
        reference: &ImageRef,
        blob: &Blob,
        dlcache: &Path,
        use_cache: bool,
    ) -> Result<PathBuf, Error> {
        let path = blob_path(dlcache, &blob.digest);

        if use_cache && try_io!(&path, path.try_exists()) {
            self.event_handler.blob_cached(&blob.digest);
            return Ok(path);
        }

        debug!(digest = %blob.digest, size = blob.size, "downloading blob");

        let layer_error = transfer_error(reference, Phase::Layer);

        let response = match self.registry.fetch_layer(reference, &blob.digest) {
            Ok(r) => r,
            Err(e) => return Err(layer_error(e)),
        };

        let mut input = blob.digest.wrap_reader(response);

        let partial = partial_path(&path);
        let mut output = try_io!(&partial, File::create(&partial));

        let mut buffer = vec![0; BUFFER_SIZE];

        loop {
            let n = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(output);
                    if let Err(e) = fs::remove_file(&partial) {
                        warn!(path = %partial.display(), "can't remove partial blob: {e}");
                    }

                    return Err(layer_error(RegistryError::Io(e)));
                }
            };

            try_io!(&partial, output.write_all(&buffer[..n]));
            self.event_handler.download_progress_bytes(n);
        }

        try_io!(&partial, output.flush());
        drop(output);

        try_io!(&path, fs::rename(&partial, &path));

        Ok(path)
    }
}

/// Read a manifest from the cache.
///
/// Missing or invalid files are ignored, so the manifest is requested
/// again.
fn read_cached_manifest(path: &Path) -> Result<Option<Manifest>, Error> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Filesystem(e, path.into())),
    };

    match serde_json::from_slice(&data) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(e) => {
            warn!(path = %path.display(), "ignoring invalid cached manifest: {e}");
            Ok(None)
        }
    }
}

/// Remove `path`, if it exists, and create an empty directory.
fn replace_directory(path: &Path) -> Result<(), Error> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => try_io!(path, fs::remove_dir_all(path)),
        Ok(_) => try_io!(path, fs::remove_file(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => return Err(Error::Filesystem(e, path.into())),
    }

    try_io!(path, fs::create_dir_all(path));

    Ok(())
}
