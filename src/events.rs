use std::{fmt::Display, path::Path};

use crate::digest::Digest;

/// Notifications sent while images are transferred or unpacked.
///
/// Every method has an empty default implementation, so handlers only
/// implement the events they need. [`tracing`] is used for diagnostics;
/// this trait is meant for progress reports.
#[expect(unused_variables)]
pub trait EventHandler: Send + Sync + 'static {
    /// A request is about to be sent to a registry.
    fn registry_request(&self, method: &str, url: &str) {}

    /// The registry answered with `401`, and a token is requested
    /// to `url`.
    fn registry_auth(&self, url: &str) {}

    /// The manifest is available. The image has `blobs` blobs (layers
    /// plus config), with a total size of `bytes`.
    fn download_start(&self, blobs: usize, bytes: u64) {}

    /// `bytes` were written to the download cache.
    fn download_progress_bytes(&self, bytes: usize) {}

    /// The blob is in the download cache, and it is not requested.
    fn blob_cached(&self, digest: &Digest) {}

    /// A layer is going to be extracted. `archive_length` is the size
    /// of the (compressed) archive.
    fn layer_start(&self, archive_length: u64) {}

    /// An entry was extracted. `archive_position` is the number of bytes
    /// read from the archive.
    fn layer_progress(&self, archive_position: usize) {}

    /// An entry of the layer was not extracted, because of `cause`.
    fn layer_entry_skipped(&self, path: &Path, cause: &dyn Display) {}

    /// A blob is pushed. If `exists` is `true`, the registry already
    /// had it, so it was not sent again.
    fn upload_blob(&self, digest: &Digest, exists: bool) {}

    /// A pull, push, or unpack operation is complete.
    fn finished(&self) {}
}

/// Ignore all events.
pub struct NoEventHandler;

impl EventHandler for NoEventHandler {}
