//! Location of the persistent state: download cache and unpacked images.

use std::{
    env,
    path::{Path, PathBuf},
};

use crate::{digest::Digest, ImageRef};

/// Environment variable to override the storage root.
pub const STORAGE_ENV: &str = "CH_GROW_STORAGE";

/// Root directory for downloaded blobs and unpacked images.
///
/// ```text
/// <root>/dlcache/<reference>.manifest.json
/// <root>/dlcache/<hex digest>.blob
/// <root>/img/<reference>/
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Storage { root: root.into() }
    }

    /// Use the directory in `$CH_GROW_STORAGE`, or
    /// `/var/tmp/<username>/ch-grow` if the variable is not set.
    pub fn from_env() -> Self {
        match env::var_os(STORAGE_ENV) {
            Some(root) if !root.is_empty() => Storage::new(root),
            _ => Storage::new(Path::new("/var/tmp").join(whoami::username()).join("ch-grow")),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Download and staging cache.
    pub fn dlcache(&self) -> PathBuf {
        self.root.join("dlcache")
    }

    /// Parent directory of the unpacked images.
    pub fn image_dir(&self) -> PathBuf {
        self.root.join("img")
    }

    /// Default directory to unpack the image of `reference`. The
    /// subdirectory name is the path form of the normalized reference.
    pub fn image_path(&self, reference: &ImageRef) -> PathBuf {
        self.image_dir().join(reference.normalized().for_path())
    }
}

/// Path of the cached file for a manifest.
pub(crate) fn manifest_path(cache: &Path, for_path: &str) -> PathBuf {
    cache.join(format!("{for_path}.manifest.json"))
}

/// Path of the cached file for a blob.
pub(crate) fn blob_path(cache: &Path, digest: &Digest) -> PathBuf {
    cache.join(format!("{}.blob", digest.hash_value()))
}

#[test]
fn storage_layout() {
    let storage = Storage::new("/srv/ch");
    assert_eq!(storage.dlcache(), Path::new("/srv/ch/dlcache"));
    assert_eq!(storage.image_dir(), Path::new("/srv/ch/img"));

    let reference = ImageRef::parse("debian:10").unwrap();
    assert_eq!(
        storage.image_path(&reference),
        Path::new("/srv/ch/img/registry-1.docker.io%library%debian:10")
    );

    assert_eq!(
        manifest_path(&storage.dlcache(), "example.com%foo:1"),
        Path::new("/srv/ch/dlcache/example.com%foo:1.manifest.json")
    );

    let digest = Digest::sha256([0xab; 32]);
    assert_eq!(
        blob_path(&storage.dlcache(), &digest),
        Path::new("/srv/ch/dlcache").join(format!("{}.blob", "ab".repeat(32)))
    );
}
