use std::{fs, io};

use tracing::info;

use crate::{error::try_io, manifests::Manifest, storage::manifest_path, Error, Phase};

use super::{transfer_error, write_file, PushPlan, Transfer};

impl Transfer<'_> {
    /// Pack the image in `plan`, and upload it.
    ///
    /// The manifest is written to the staging directory, with the name of
    /// the source reference. If that file already exists, the push is
    /// aborted with [`Error::PreconditionConflict`]: it is not reused,
    /// and it is not replaced.
    pub fn push(&self, plan: &PushPlan) -> Result<(), Error> {
        match fs::metadata(&plan.source) {
            Ok(m) if m.is_dir() => (),
            Ok(_) => return Err(Error::ImageNotFound(plan.source.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ImageNotFound(plan.source.clone()))
            }
            Err(e) => return Err(Error::Filesystem(e, plan.source.clone())),
        }

        let source_ref = plan.source_ref.normalized();

        let manifest_path = manifest_path(&plan.staging, &source_ref.for_path());
        if try_io!(&manifest_path, manifest_path.try_exists()) {
            return Err(Error::PreconditionConflict(manifest_path));
        }

        let destination = plan
            .destination
            .as_ref()
            .unwrap_or(&plan.source_ref)
            .normalized();

        info!(
            source = %plan.source.display(),
            destination = %destination,
            "pushing image"
        );

        let artifact = self.archiver.archive(&plan.source, &plan.staging)?;

        let manifest = Manifest::new(
            artifact.config.blob.clone(),
            artifact.layers.iter().map(|l| l.blob.clone()).collect(),
        )
        .encode()?;

        write_file(&manifest_path, &manifest.data)?;

        info!(
            manifest = %manifest_path.display(),
            blobs = artifact.layers.len() + 1,
            "uploading"
        );

        self.registry
            .upload(&destination, &artifact, &manifest)
            .map_err(transfer_error(&destination, Phase::Upload))?;

        self.event_handler.finished();

        Ok(())
    }
}
