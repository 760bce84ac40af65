//! Registry collaborator: fetch manifests and blobs, and upload images.

use std::{
    borrow::Cow,
    env::consts,
    fs, io,
    io::{BufReader, Read},
    num::NonZeroUsize,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    archive::Artifact,
    digest::{Digest, DigestError},
    http::{Client, HttpError},
    manifests::{EncodedManifest, Manifest},
    EventHandler, ImageRef, MediaType, NoEventHandler,
};

/// Number of HTTP clients (one per repository) kept by [`HttpRegistry`].
const CLIENTS_CACHE: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] HttpError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid digest: {0}")]
    InvalidDigest(#[from] DigestError),

    #[error("Missing or invalid Content-Type.")]
    MissingContentType,

    #[error("Invalid Content-Type: {0}")]
    InvalidContentType(MediaType),

    #[error("No image for the architecture.")]
    MissingArchitecture,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Access to images in a remote registry.
///
/// References are expected to be normalized (see
/// [`ImageRef::normalize_defaults`]).
pub trait Registry {
    /// Get the manifest of the image for the current platform.
    fn fetch_manifest(&self, reference: &ImageRef) -> Result<Manifest, RegistryError>;

    /// Open a stream to read the contents of a blob.
    ///
    /// The data is not verified against `digest`; this is done by the
    /// caller.
    fn fetch_layer(
        &self,
        reference: &ImageRef,
        digest: &Digest,
    ) -> Result<Box<dyn Read + Send>, RegistryError>;

    /// Send the blobs in `artifact`, and then the manifest.
    ///
    /// The manifest is sent with the bytes in `manifest.data`, without
    /// serializing it again.
    fn upload(
        &self,
        reference: &ImageRef,
        artifact: &Artifact,
        manifest: &EncodedManifest,
    ) -> Result<(), RegistryError>;
}

/// [`Registry`] implementation using the HTTP API described in the
/// [distribution specification][spec].
///
/// [spec]: https://github.com/opencontainers/distribution-spec/blob/main/spec.md
pub struct HttpRegistry {
    architecture: Option<String>,
    os: Option<String>,
    event_handler: Arc<dyn EventHandler>,
    clients: Mutex<lru::LruCache<String, Arc<Client>>>,
}

impl Default for HttpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRegistry {
    pub fn new() -> Self {
        let clients = NonZeroUsize::new(CLIENTS_CACHE).unwrap_or(NonZeroUsize::MIN);

        HttpRegistry {
            architecture: None,
            os: None,
            event_handler: Arc::new(NoEventHandler),
            clients: Mutex::new(lru::LruCache::new(clients)),
        }
    }

    /// CPU architecture to select in manifest lists. The default value is
    /// the architecture of the current host, with the names used by Go.
    pub fn architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    /// Operating system to select in manifest lists.
    pub fn os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn event_handler(mut self, event_handler: impl EventHandler) -> Self {
        self.event_handler = Arc::new(event_handler);
        self.clients
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self
    }

    /// Get a client for the repository of `reference`.
    fn client(&self, reference: &ImageRef) -> Arc<Client> {
        let key = format!("{}/{}", reference.registry(), reference.repository);

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        clients
            .get_or_insert(key, || {
                Arc::new(Client::new(reference, self.event_handler.clone()))
            })
            .clone()
    }
}

impl Registry for HttpRegistry {
    /// Download the manifest for the `reference`.
    ///
    /// If the registry returns a manifest list (or an OCI image index),
    /// it is used to locate the image for the architecture/OS pair.
    ///
    /// When `reference` contains a digest (like `@sha256:...`), the data
    /// received from the registry is verified against it.
    fn fetch_manifest(&self, reference: &ImageRef) -> Result<Manifest, RegistryError> {
        let architecture = self.architecture.as_deref().unwrap_or(host_architecture());
        let os = self.os.as_deref().unwrap_or(consts::OS);

        let client = self.client(reference);

        enum Tag<'a> {
            S(&'a str),
            D(Cow<'a, Digest>),
        }

        let accept = MediaType::ALL.join(", ");

        let mut tag = match reference.digest.as_ref() {
            Some(d) => Tag::D(Cow::Borrowed(d)),
            None => Tag::S(reference.manifest_selector()),
        };

        loop {
            let path = match &tag {
                Tag::S(s) => *s,
                Tag::D(d) => d.source(),
            };

            let response = client.get(&format!("manifests/{}", path), Some(&accept))?;

            let content_type = response
                .header("Content-Type")
                .and_then(|h| MediaType::from_str(h.split(';').next()?.trim()).ok())
                .ok_or(RegistryError::MissingContentType)?;

            let mut body: Box<dyn Read> = {
                let response = response.into_reader();
                match &tag {
                    Tag::D(d) => Box::new(BufReader::new(d.wrap_reader(response))),
                    Tag::S(_) => Box::new(response),
                }
            };

            tag = match content_type {
                MediaType::DockerManifestList | MediaType::OciImageIndex => {
                    Tag::D(Cow::Owned(parse_index(architecture, os, &mut body)?))
                }

                MediaType::DockerManifestV2 | MediaType::OciManifestV1 => {
                    // The parser reads until EOF, so the digest (if any)
                    // is verified before returning.
                    let mut manifest: Manifest = serde_json::from_reader(&mut body)?;
                    manifest.media_type.get_or_insert(content_type);
                    return Ok(manifest);
                }

                unknown => {
                    return Err(RegistryError::InvalidContentType(unknown));
                }
            }
        }
    }

    fn fetch_layer(
        &self,
        reference: &ImageRef,
        digest: &Digest,
    ) -> Result<Box<dyn Read + Send>, RegistryError> {
        Ok(self.client(reference).download_blob(digest)?)
    }

    fn upload(
        &self,
        reference: &ImageRef,
        artifact: &Artifact,
        manifest: &EncodedManifest,
    ) -> Result<(), RegistryError> {
        let client = self.client(reference);

        for staged in artifact.blobs() {
            let digest = &staged.blob.digest;
            let exists = client.has_blob(digest)?;

            self.event_handler.upload_blob(digest, exists);

            if !exists {
                client.upload_blob(digest, &fs::read(&staged.path)?)?;
            }
        }

        client.put_manifest(
            reference.manifest_selector(),
            manifest.media_type,
            &manifest.data,
        )?;

        Ok(())
    }
}

/// Architecture of the current host, with the names used by Go.
pub(crate) fn host_architecture() -> &'static str {
    match consts::ARCH {
        "aarch64" => "arm64",
        "x86" => "386",
        "x86_64" => "amd64",
        other => other,
    }
}

/// Parse an image index to get the digest for the specified architecture and
/// operating system.
///
/// Refs:
///
/// * https://distribution.github.io/distribution/spec/manifest-v2-2/#manifest-list
/// * https://github.com/opencontainers/image-spec/blob/main/image-index.md
fn parse_index(
    architecture: &str,
    os: &str,
    response: &mut dyn Read,
) -> Result<Digest, RegistryError> {
    #[derive(serde::Deserialize, Debug)]
    struct List {
        manifests: Vec<Item>,
    }

    #[derive(serde::Deserialize, Debug)]
    struct Item {
        digest: String,
        platform: Platform,
    }

    #[derive(serde::Deserialize, Debug)]
    struct Platform {
        architecture: String,
        os: String,
    }

    let List { manifests } = serde_json::from_reader(response)?;
    let item = manifests
        .into_iter()
        .find(|i| i.platform.architecture == architecture && i.platform.os == os)
        .ok_or(RegistryError::MissingArchitecture)?;

    Ok(Digest::try_from(item.digest)?)
}

#[test]
fn select_platform_from_index() {
    let index = r#"{
        "manifests": [
            {
                "digest": "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
                "platform": { "architecture": "arm64", "os": "linux" }
            },
            {
                "digest": "sha256:7571ce1f8e21c6b13dd7ec2c5ec7c9e4dd9852e209869511853f2f1f74b17927",
                "platform": { "architecture": "amd64", "os": "linux" }
            }
        ]
    }"#;

    let digest = parse_index("amd64", "linux", &mut index.as_bytes()).unwrap();
    assert!(digest.source().starts_with("sha256:7571ce1f"));

    assert!(matches!(
        parse_index("riscv64", "linux", &mut index.as_bytes()),
        Err(RegistryError::MissingArchitecture)
    ));
}
