use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use sha2::Digest as _;

use crate::{
    archive::{Archiver, Artifact, BlobFile},
    digest::Digest,
    manifests::{Blob, EncodedManifest, Manifest},
    registry::{Registry, RegistryError},
    Error, ImageRef, MediaType, Phase, Storage,
};

use super::{PullPlan, PushPlan, Transfer};

fn make_blob(media_type: MediaType, data: &[u8]) -> Blob {
    Blob {
        media_type,
        digest: Digest::sha256(sha2::Sha256::digest(data)),
        size: data.len() as u64,
    }
}

#[derive(Default)]
struct MockRegistry {
    manifest: Option<Manifest>,
    blobs: HashMap<Digest, Vec<u8>>,
    fail_manifest: AtomicBool,
    manifest_fetches: AtomicUsize,
    layer_fetches: AtomicUsize,
    uploads: Mutex<Vec<(String, EncodedManifest)>>,
}

impl MockRegistry {
    /// Registry with an image of two layers.
    fn with_image() -> Self {
        let mut registry = MockRegistry::default();

        let config = registry.add(MediaType::OciConfig, b"{}");
        let layers = vec![
            registry.add(MediaType::OciFsTarGzip, b"layer 1"),
            registry.add(MediaType::OciFsTarGzip, b"layer 2"),
        ];

        registry.manifest = Some(Manifest::new(config, layers));
        registry
    }

    fn add(&mut self, media_type: MediaType, data: &[u8]) -> Blob {
        let blob = make_blob(media_type, data);
        self.blobs.insert(blob.digest.clone(), data.to_vec());
        blob
    }

    fn manifest(&self) -> &Manifest {
        self.manifest.as_ref().unwrap()
    }

    fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    fn layer_fetches(&self) -> usize {
        self.layer_fetches.load(Ordering::SeqCst)
    }
}

impl Registry for MockRegistry {
    fn fetch_manifest(&self, _: &ImageRef) -> Result<Manifest, RegistryError> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);

        if self.fail_manifest.load(Ordering::SeqCst) {
            return Err(RegistryError::MissingArchitecture);
        }

        Ok(self.manifest().clone())
    }

    fn fetch_layer(
        &self,
        _: &ImageRef,
        digest: &Digest,
    ) -> Result<Box<dyn Read + Send>, RegistryError> {
        self.layer_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(std::io::Cursor::new(self.blobs[digest].clone())))
    }

    fn upload(
        &self,
        reference: &ImageRef,
        artifact: &Artifact,
        manifest: &EncodedManifest,
    ) -> Result<(), RegistryError> {
        for blob in artifact.blobs() {
            assert!(blob.path.exists());
        }

        self.uploads
            .lock()
            .unwrap()
            .push((reference.to_string(), manifest.clone()));

        Ok(())
    }
}

#[derive(Default)]
struct MockArchiver {
    unpacked: Mutex<Vec<(Vec<BlobFile>, PathBuf)>>,
    archives: AtomicUsize,
}

impl Archiver for MockArchiver {
    fn unpack(&self, layers: &[BlobFile], destination: &Path) -> Result<(), Error> {
        fs::write(destination.join("unpacked"), "").unwrap();

        self.unpacked
            .lock()
            .unwrap()
            .push((layers.to_vec(), destination.to_owned()));

        Ok(())
    }

    fn archive(&self, _source: &Path, staging: &Path) -> Result<Artifact, Error> {
        self.archives.fetch_add(1, Ordering::SeqCst);

        fs::create_dir_all(staging).unwrap();

        let blob_file = |media_type, data: &[u8]| {
            let blob = make_blob(media_type, data);
            let path = staging.join(format!("{}.blob", blob.digest.hash_value()));
            fs::write(&path, data).unwrap();
            BlobFile { blob, path }
        };

        Ok(Artifact {
            layers: vec![blob_file(MediaType::OciFsTarGzip, b"tarball")],
            config: blob_file(MediaType::OciConfig, b"{}"),
        })
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();

    names.sort();
    names
}

#[test]
fn pull_reuses_cached_manifest() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(storage_dir.path());

    let registry = MockRegistry::with_image();
    let archiver = MockArchiver::default();
    let transfer = Transfer::new(&registry, &archiver);

    let plan = PullPlan::new(&storage, "example.com/foo/bar:1").unwrap();

    let image = transfer.pull(&plan).unwrap();

    assert!(!image.from_cache);
    assert_eq!(image.layers, 2);
    assert_eq!(image.reference.to_string(), "example.com/foo/bar:1");
    assert_eq!(
        image.unpack_path,
        storage_dir.path().join("img/example.com%foo%bar:1")
    );
    assert_eq!(
        image.manifest_path,
        storage_dir.path().join("dlcache/example.com%foo%bar:1.manifest.json")
    );
    assert!(image.manifest_path.exists());
    assert_eq!(registry.manifest_fetches(), 1);
    assert_eq!(registry.layer_fetches(), 3);

    // Only layers are unpacked, in the order of the manifest.
    {
        let unpacked = archiver.unpacked.lock().unwrap();
        let digests: Vec<_> = unpacked[0].0.iter().map(|l| &l.blob.digest).collect();
        let expected: Vec<_> = registry.manifest().layers.iter().map(|l| &l.digest).collect();
        assert_eq!(digests, expected);
        assert_eq!(unpacked[0].1, image.unpack_path);
    }

    // Second pull uses the cache.
    let image = transfer.pull(&plan).unwrap();
    assert!(image.from_cache);
    assert_eq!(registry.manifest_fetches(), 1);
    assert_eq!(registry.layer_fetches(), 3);

    // Without cache, everything is downloaded again.
    let image = transfer.pull(&plan.clone().use_cache(false)).unwrap();
    assert!(!image.from_cache);
    assert_eq!(registry.manifest_fetches(), 2);
    assert_eq!(registry.layer_fetches(), 6);

    assert_eq!(archiver.unpacked.lock().unwrap().len(), 3);
}

#[test]
fn pull_ignores_invalid_cached_manifest() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(storage_dir.path());

    let registry = MockRegistry::with_image();
    let archiver = MockArchiver::default();
    let transfer = Transfer::new(&registry, &archiver);

    let dlcache = storage.dlcache();
    fs::create_dir_all(&dlcache).unwrap();
    fs::write(
        dlcache.join("registry-1.docker.io%library%debian:10.manifest.json"),
        "{ not json",
    )
    .unwrap();

    let image = transfer
        .pull(&PullPlan::new(&storage, "debian:10").unwrap())
        .unwrap();

    assert!(!image.from_cache);
    assert_eq!(registry.manifest_fetches(), 1);

    let cached: Manifest = serde_json::from_slice(&fs::read(&image.manifest_path).unwrap()).unwrap();
    assert_eq!(&cached, registry.manifest());
}

#[test]
fn pull_replaces_destination() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(storage_dir.path().join("storage"));
    let destination = storage_dir.path().join("rootfs");

    fs::create_dir_all(destination.join("old/dir")).unwrap();
    fs::write(destination.join("stale"), "x").unwrap();

    let registry = MockRegistry::with_image();
    let archiver = MockArchiver::default();
    let transfer = Transfer::new(&registry, &archiver);

    let plan = PullPlan::new(&storage, "alpine")
        .unwrap()
        .image_dir(&destination);

    let image = transfer.pull(&plan).unwrap();

    assert_eq!(image.unpack_path, destination);
    assert_eq!(file_names(&destination), ["unpacked"]);
    assert!(!storage.image_dir().exists());
}

#[test]
fn pull_rejects_corrupted_blobs() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(storage_dir.path());

    let mut registry = MockRegistry::with_image();
    let corrupted = registry.manifest().layers[1].digest.clone();
    registry.blobs.insert(corrupted.clone(), b"something else".to_vec());

    let archiver = MockArchiver::default();
    let transfer = Transfer::new(&registry, &archiver);

    let err = transfer
        .pull(&PullPlan::new(&storage, "alpine:3").unwrap())
        .unwrap_err();

    match err {
        Error::Transfer {
            reference,
            phase,
            source: RegistryError::Io(e),
        } => {
            assert_eq!(reference, "registry-1.docker.io/library/alpine:3");
            assert_eq!(phase, Phase::Layer);
            assert_eq!(e.kind(), std::io::ErrorKind::InvalidData);
        }

        e => panic!("unexpected error: {e:?}"),
    }

    // Valid blobs are kept, and no partial files are left.
    let names = file_names(&storage.dlcache());
    assert_eq!(names.len(), 3, "{names:?}");
    assert!(!names.iter().any(|n| n.contains(corrupted.hash_value())));
    assert!(!names.iter().any(|n| n.ends_with(".partial")));

    assert!(archiver.unpacked.lock().unwrap().is_empty());
}

#[test]
fn pull_reports_manifest_failures() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(storage_dir.path());

    let registry = MockRegistry::with_image();
    registry.fail_manifest.store(true, Ordering::SeqCst);

    let archiver = MockArchiver::default();
    let transfer = Transfer::new(&registry, &archiver);

    let err = transfer
        .pull(&PullPlan::new(&storage, "alpine:3").unwrap())
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Transfer {
            phase: Phase::Manifest,
            source: RegistryError::MissingArchitecture,
            ..
        }
    ));

    assert_eq!(registry.layer_fetches(), 0);
    assert!(archiver.unpacked.lock().unwrap().is_empty());
}

#[test]
fn invalid_references() {
    let storage = Storage::new("/tmp/unused");

    assert!(matches!(
        PullPlan::new(&storage, "Alpine"),
        Err(Error::InvalidReference(_))
    ));

    assert!(matches!(
        PushPlan::new(&storage, "alpine").unwrap().destination("foo:"),
        Err(Error::InvalidReference(_))
    ));
}

#[test]
fn push_missing_source() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(storage_dir.path());

    let registry = MockRegistry::default();
    let archiver = MockArchiver::default();
    let transfer = Transfer::new(&registry, &archiver);

    let plan = PushPlan::new(&storage, "foo/bar:1").unwrap();

    match transfer.push(&plan) {
        Err(Error::ImageNotFound(path)) => assert_eq!(path, plan.source),
        r => panic!("unexpected result: {r:?}"),
    }

    // A file is not an image.
    fs::write(storage_dir.path().join("file"), "").unwrap();
    let plan = plan.image_dir(storage_dir.path().join("file"));
    assert!(matches!(transfer.push(&plan), Err(Error::ImageNotFound(_))));

    assert_eq!(archiver.archives.load(Ordering::SeqCst), 0);
    assert!(registry.uploads.lock().unwrap().is_empty());
}

#[test]
fn push_to_default_destination() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(storage_dir.path());

    let registry = MockRegistry::default();
    let archiver = MockArchiver::default();
    let transfer = Transfer::new(&registry, &archiver);

    let plan = PushPlan::new(&storage, "foo/bar:1").unwrap();
    fs::create_dir_all(&plan.source).unwrap();

    transfer.push(&plan).unwrap();

    let uploads = registry.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "registry-1.docker.io/foo/bar:1");
    assert_eq!(uploads[0].1.manifest.layers.len(), 1);
    assert_eq!(uploads[0].1.media_type, MediaType::OciManifestV1);

    let manifest_path = storage
        .dlcache()
        .join("registry-1.docker.io%foo%bar:1.manifest.json");

    // The registry receives the same bytes written to the cache.
    assert_eq!(fs::read(&manifest_path).unwrap(), uploads[0].1.data);

    let staged: Manifest = serde_json::from_slice(&uploads[0].1.data).unwrap();
    assert_eq!(staged, uploads[0].1.manifest);

    // The staged manifest is not replaced.
    match transfer.push(&plan) {
        Err(Error::PreconditionConflict(path)) => assert_eq!(path, manifest_path),
        r => panic!("unexpected result: {r:?}"),
    }

    assert_eq!(archiver.archives.load(Ordering::SeqCst), 1);
    assert_eq!(registry.uploads.lock().unwrap().len(), 1);
}

#[test]
fn push_to_explicit_destination() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(storage_dir.path());
    let source = storage_dir.path().join("rootfs");
    fs::create_dir(&source).unwrap();

    let registry = MockRegistry::default();
    let archiver = MockArchiver::default();
    let transfer = Transfer::new(&registry, &archiver);

    let plan = PushPlan::new(&storage, "foo")
        .unwrap()
        .image_dir(&source)
        .destination("localhost:5000/mirror/foo")
        .unwrap();

    transfer.push(&plan).unwrap();

    let uploads = registry.uploads.lock().unwrap();
    assert_eq!(uploads[0].0, "localhost:5000/mirror/foo:latest");

    // The manifest is staged with the name of the source.
    assert!(storage
        .dlcache()
        .join("registry-1.docker.io%library%foo:latest.manifest.json")
        .exists());
}
